use crate::Error;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Line rate the device firmware assumes.
pub const BAUD_RATE: u32 = 9600;

/// Every command frame and device response ends with this terminator.
pub const EOL: &str = "\r\n";

/// Number of cells in the pack. A voltage readout with any other count is a
/// protocol error.
pub const CELL_COUNT: usize = 8;

/// Highest assignable unit address. 0 is the broadcast address.
pub const MAX_ADDRESS: u8 = 250;

// The device needs time to process a command before its response is complete.
// These are firmware latencies, measured, not negotiated.
pub const SETTLE_QUERY: Duration = Duration::from_millis(500);
pub const SETTLE_SET_ADDRESS: Duration = Duration::from_millis(200);
pub const SETTLE_OFF: Duration = Duration::from_secs(1);
pub const SETTLE_SLEEP: Duration = Duration::from_secs(3);

/// A unit address on the RS485 bus.
///
/// The wire form is a two character lowercase hex token, zero padded.
/// Address 0 is the documented broadcast value and maps to the literal
/// token "00".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address(u8);

impl Address {
    pub const BROADCAST: Address = Address(0);

    pub fn new(address: u8) -> std::result::Result<Self, Error> {
        if address > MAX_ADDRESS {
            return Err(Error::InvalidAddress(address));
        }
        Ok(Self(address))
    }

    /// The decimal value of the address.
    pub fn value(self) -> u8 {
        self.0
    }

    /// The two character hex token used in command frames.
    pub fn token(self) -> String {
        format!("{:02x}", self.0)
    }

    /// Parses an address echoed by the device back into its decimal value.
    pub fn from_token(token: &str) -> std::result::Result<Self, Error> {
        let value = u8::from_str_radix(token, 16)
            .map_err(|_| Error::Parse(format!("bad address token '{token}'")))?;
        Self::new(value)
    }
}

fn frame(address: Address, body: &str) -> String {
    format!("#{}{}{}", address.token(), body, EOL)
}

/// Matches the decimal float lexical form the device emits: optional sign,
/// digits with an optional fraction, or a leading dot followed by digits.
/// No exponent, no grouping separators.
fn is_numeric(token: &str) -> bool {
    let unsigned = token.strip_prefix(['+', '-']).unwrap_or(token);
    if unsigned.is_empty() {
        return false;
    }
    match unsigned.split_once('.') {
        Some((int_part, frac_part)) => {
            !frac_part.is_empty()
                && int_part.bytes().all(|b| b.is_ascii_digit())
                && frac_part.bytes().all(|b| b.is_ascii_digit())
        }
        None => unsigned.bytes().all(|b| b.is_ascii_digit()),
    }
}

fn is_integer(token: &str) -> bool {
    let unsigned = token.strip_prefix(['+', '-']).unwrap_or(token);
    !unsigned.is_empty() && unsigned.bytes().all(|b| b.is_ascii_digit())
}

fn parse_f32(token: &str, field: &str) -> std::result::Result<f32, Error> {
    if !is_numeric(token) {
        log::warn!("Bad numeric token - field={} token={:?}", field, token);
        return Err(Error::Parse(format!("{field}: bad numeric token '{token}'")));
    }
    token
        .parse()
        .map_err(|_| Error::Parse(format!("{field}: bad numeric token '{token}'")))
}

fn parse_int<T: std::str::FromStr>(token: &str, field: &str) -> std::result::Result<T, Error> {
    if !is_integer(token) {
        log::warn!("Bad integer token - field={} token={:?}", field, token);
        return Err(Error::Parse(format!("{field}: bad integer token '{token}'")));
    }
    token
        .parse()
        .map_err(|_| Error::Parse(format!("{field}: bad integer token '{token}'")))
}

fn single_char(token: &str, field: &str) -> std::result::Result<char, Error> {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(Error::Parse(format!("{field}: expected a single character, got '{token}'"))),
    }
}

/// Record tags look like `$02q0`: a dollar sign, two digits, one lowercase
/// letter and one digit.
fn is_record_tag(token: &str) -> bool {
    let b = token.as_bytes();
    b.len() == 5
        && b[0] == b'$'
        && b[1].is_ascii_digit()
        && b[2].is_ascii_digit()
        && b[3].is_ascii_lowercase()
        && b[4].is_ascii_digit()
}

/// Finds the single line of the response that carries a record. The command
/// echo precedes the record on a half duplex bus, so the record is located by
/// its tag. Zero or multiple record lines are an error.
fn record_line<'a>(text: &'a str, what: &str) -> std::result::Result<&'a str, Error> {
    let mut found = None;
    for line in text.lines() {
        if line.split_whitespace().next().is_some_and(is_record_tag) {
            if found.is_some() {
                log::warn!("Multiple {} records in response {:?}", what, text);
                return Err(Error::Parse(format!("multiple {what} records in response")));
            }
            found = Some(line);
        }
    }
    found.ok_or_else(|| Error::Parse(format!("no {what} record in response")))
}

/// Splits `n` leading whitespace-delimited tokens off a line, returning them
/// together with the untokenized remainder.
fn split_leading_tokens(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut rest = line.trim_start();
    let mut tokens = Vec::with_capacity(n);
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        tokens.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((tokens, rest))
}

/// First contiguous token bounded by whitespace on both sides. Used for bare
/// single-value responses such as the address echo, where the leading
/// unbounded token is the command echo.
fn delimited_token(text: &str) -> std::result::Result<&str, Error> {
    let start = text
        .find(char::is_whitespace)
        .ok_or_else(|| Error::Parse("no delimited token in response".into()))?;
    let rest = text[start..].trim_start();
    let end = rest
        .find(char::is_whitespace)
        .ok_or_else(|| Error::Parse("no delimited token in response".into()))?;
    Ok(&rest[..end])
}

/// The balancing acknowledgement is the last whitespace-bounded single digit
/// in the response; `1` means the discharge command was accepted.
fn ack_flag(text: &str) -> std::result::Result<bool, Error> {
    text.split_whitespace()
        .filter(|t| t.len() == 1 && t.as_bytes()[0].is_ascii_digit())
        .next_back()
        .map(|t| t == "1")
        .ok_or_else(|| Error::Parse("no balancing acknowledgement in response".into()))
}

fn is_runtime(token: &str) -> bool {
    let mut parts = token.split(':');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some(h), Some(m), Some(s), None) if is_numeric(h) && is_numeric(m) && is_numeric(s)
    )
}

/// Operating state reported in the battery summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum State {
    Off,
    Discharging,
    Charging,
    Balancing,
    /// A code this crate does not know about. Carried verbatim.
    Unknown(char),
}

impl State {
    pub fn from_code(code: char) -> Self {
        match code {
            'f' => State::Off,
            'd' => State::Discharging,
            'c' => State::Charging,
            'b' => State::Balancing,
            other => State::Unknown(other),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Off => write!(f, "OFF"),
            State::Discharging => write!(f, "DISCHARGING"),
            State::Charging => write!(f, "CHARGING"),
            State::Balancing => write!(f, "BALANCING"),
            State::Unknown(code) => write!(f, "unknown state '{code}'"),
        }
    }
}

/// Error state reported in the battery summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceError {
    None,
    OverVoltage,
    UnderVoltage,
    OverCurrent,
    CellOverVoltage,
    CellUnderVoltage,
    /// Minimum cell below the 2.0V fault threshold
    CellFaultVoltage,
    OverTemperature,
    Moisture,
    Hardware,
    Watchdog,
    /// A code this crate does not know about. Carried verbatim.
    Unknown(char),
}

impl DeviceError {
    pub fn from_code(code: char) -> Self {
        match code {
            '-' => DeviceError::None,
            'V' => DeviceError::OverVoltage,
            'v' => DeviceError::UnderVoltage,
            'I' => DeviceError::OverCurrent,
            'C' => DeviceError::CellOverVoltage,
            'c' => DeviceError::CellUnderVoltage,
            'x' => DeviceError::CellFaultVoltage,
            'T' => DeviceError::OverTemperature,
            'W' => DeviceError::Moisture,
            'H' | 'h' => DeviceError::Hardware,
            'm' => DeviceError::Watchdog,
            other => DeviceError::Unknown(other),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceError::None => write!(f, "no error"),
            DeviceError::OverVoltage => write!(f, "battery over voltage"),
            DeviceError::UnderVoltage => write!(f, "battery under voltage"),
            DeviceError::OverCurrent => write!(f, "battery over current"),
            DeviceError::CellOverVoltage => write!(f, "max cell over voltage"),
            DeviceError::CellUnderVoltage => write!(f, "min cell under voltage"),
            DeviceError::CellFaultVoltage => write!(f, "min cell under fault voltage (2.0V)"),
            DeviceError::OverTemperature => write!(f, "battery over temperature"),
            DeviceError::Moisture => write!(f, "moisture intrusion detected by H2O sensors"),
            DeviceError::Hardware => write!(f, "internal hardware fault"),
            DeviceError::Watchdog => write!(f, "watchdog timeout"),
            DeviceError::Unknown(code) => write!(f, "unknown error '{code}'"),
        }
    }
}

/// One-shot snapshot of the battery, response to the `q0` query.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatterySummary {
    pub state: State,
    pub error: DeviceError,
    pub voltage: f32,
    pub current: f32,
    pub max_temperature: f32,
    pub min_cell_voltage: f32,
    pub max_cell_voltage: f32,
    pub water_leak_detect: u8,
    pub power: f32,
    /// Time since power-on, verbatim `H:MM:SS` as sent by the device.
    pub runtime: String,
    pub mode: char,
    pub discharge_status_1: u16,
    pub discharge_status_2: u16,
    /// Seconds until sleep, 0 when the timer is disabled.
    pub sleep_timer: u32,
}

impl BatterySummary {
    pub fn request(address: Address) -> String {
        frame(address, "q0")
    }

    pub fn decode(text: &str) -> std::result::Result<Self, Error> {
        let line = record_line(text, "battery summary")?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 14 {
            log::warn!(
                "Invalid battery summary - expected 14 fields, found {} in {:?}",
                tokens.len(),
                line
            );
            return Err(Error::Parse(format!(
                "battery summary: expected 14 fields, found {}",
                tokens.len()
            )));
        }
        // The state and error codes are adjacent with no separator.
        let codes: Vec<char> = tokens[1].chars().collect();
        if codes.len() != 2 {
            return Err(Error::Parse(format!(
                "battery summary: bad state/error codes '{}'",
                tokens[1]
            )));
        }
        if !is_runtime(tokens[9]) {
            return Err(Error::Parse(format!(
                "battery summary: bad runtime token '{}'",
                tokens[9]
            )));
        }
        let mode = single_char(tokens[10], "battery summary mode")?;
        if !mode.is_ascii_lowercase() {
            return Err(Error::Parse(format!(
                "battery summary: bad mode '{mode}'"
            )));
        }
        Ok(Self {
            state: State::from_code(codes[0]),
            error: DeviceError::from_code(codes[1]),
            voltage: parse_f32(tokens[2], "voltage")?,
            current: parse_f32(tokens[3], "current")?,
            max_temperature: parse_f32(tokens[4], "max temperature")?,
            min_cell_voltage: parse_f32(tokens[5], "min cell voltage")?,
            max_cell_voltage: parse_f32(tokens[6], "max cell voltage")?,
            water_leak_detect: parse_int(tokens[7], "water leak flag")?,
            power: parse_f32(tokens[8], "power")?,
            runtime: tokens[9].to_string(),
            mode,
            discharge_status_1: parse_int(tokens[11], "discharge status 1")?,
            discharge_status_2: parse_int(tokens[12], "discharge status 2")?,
            sleep_timer: parse_int(tokens[13], "sleep timer")?,
        })
    }
}

/// Identity record, response to the `z0` query. Effectively immutable per
/// device, usually queried once per session.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VersionSummary {
    /// Address echo, verbatim hex token.
    pub address: String,
    pub mode: char,
    pub board_sn: u32,
    /// The battery's identity. Keys the balancing log file.
    pub sn: u32,
    pub voltage_rating: f32,
    pub current_rating: f32,
    pub firmware_info: String,
}

impl VersionSummary {
    pub fn request(address: Address) -> String {
        frame(address, "z0")
    }

    pub fn decode(text: &str) -> std::result::Result<Self, Error> {
        let line = record_line(text, "version summary")?;
        let (tokens, rest) = split_leading_tokens(line, 7)
            .ok_or_else(|| Error::Parse("version summary: truncated record".into()))?;
        let address = tokens[1];
        if address.is_empty()
            || address.len() > 2
            || !address.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(Error::Parse(format!(
                "version summary: bad address echo '{address}'"
            )));
        }
        let firmware_info = rest.trim_end();
        if firmware_info.is_empty() {
            return Err(Error::Parse("version summary: missing firmware string".into()));
        }
        Ok(Self {
            address: address.to_string(),
            mode: single_char(tokens[2], "version summary mode")?,
            board_sn: parse_int(tokens[3], "board serial number")?,
            sn: parse_int(tokens[4], "serial number")?,
            voltage_rating: parse_f32(tokens[5], "voltage rating")?,
            current_rating: parse_f32(tokens[6], "current rating")?,
            firmware_info: firmware_info.to_string(),
        })
    }
}

/// Per-cell voltage readout, response to the `q1` query.
pub struct CellVoltages;

impl CellVoltages {
    pub fn request(address: Address) -> String {
        frame(address, "q1")
    }

    /// Collects the numeric tokens of the response in cell position order.
    /// Exactly 8 are required.
    pub fn decode(text: &str) -> std::result::Result<[f32; CELL_COUNT], Error> {
        let mut cells = [0.0f32; CELL_COUNT];
        let mut count = 0;
        for token in text.split_whitespace().filter(|t| is_numeric(t)) {
            if count < CELL_COUNT {
                cells[count] = parse_f32(token, "cell voltage")?;
            }
            count += 1;
        }
        if count != CELL_COUNT {
            log::warn!("Incomplete voltage set - expected {} found {}", CELL_COUNT, count);
            return Err(Error::IncompleteVoltageSet(count));
        }
        Ok(cells)
    }
}

/// Broadcast query for the unit address. Only meaningful when a single unit
/// is on the bus.
pub struct AddressQuery;

impl AddressQuery {
    pub fn request() -> String {
        frame(Address::BROADCAST, "?0")
    }

    pub fn decode(text: &str) -> std::result::Result<Address, Error> {
        Address::from_token(delimited_token(text)?)
    }
}

/// Broadcast command assigning a new unit address.
pub struct SetAddress;

impl SetAddress {
    pub fn request(new_address: Address) -> String {
        frame(Address::BROADCAST, &format!("?8 {}", new_address.token()))
    }
}

/// Puts the battery to sleep after an optional delay.
pub struct Sleep;

impl Sleep {
    pub fn request(address: Address, seconds: u32) -> String {
        frame(address, &format!("bs {seconds}"))
    }
}

/// Turns the battery off. The firmware also clears any latched error state
/// as a side effect of this command.
pub struct PowerOff;

impl PowerOff {
    pub fn request(address: Address) -> String {
        frame(address, "bf")
    }
}

/// Discharges a single cell for balancing.
pub struct BalanceCell;

impl BalanceCell {
    pub fn request(address: Address, cell: u8) -> String {
        frame(address, &format!("b{cell}"))
    }

    pub fn decode(text: &str) -> std::result::Result<bool, Error> {
        ack_flag(text)
    }
}

/// Lets the firmware pick the cell to discharge.
pub struct BalanceBestCell;

impl BalanceBestCell {
    pub fn request(address: Address) -> String {
        frame(address, "bb")
    }

    pub fn decode(text: &str) -> std::result::Result<bool, Error> {
        ack_flag(text)
    }
}
