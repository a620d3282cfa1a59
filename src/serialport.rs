use crate::protocol::*;
use crate::{Error, Result};
use std::time::{Duration, Instant};

/// Default read timeout on the underlying port. The device runs a fixed
/// 9600 baud line with up to a second of inter-byte silence.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval for the quiesced read mode.
pub const QUIESCE_POLL: Duration = Duration::from_millis(50);

/// Hard ceiling on the quiescence poll. A device that never stops sending
/// within this window is treated as a connection fault.
pub const QUIESCE_CEILING: Duration = Duration::from_secs(30);

/// Synchronous client for a SmallBattMod on an RS485 serial bus.
///
/// The client owns the port for its whole lifetime. The protocol has no
/// message framing beyond textual patterns, so stale bytes are the main
/// correctness hazard: the input and output buffers are purged when the
/// session opens and again when it is dropped, on every exit path.
pub struct SmallBattMod {
    serial: Box<dyn serialport::SerialPort>,
    address: Address,
}

impl std::fmt::Debug for SmallBattMod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmallBattMod")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl SmallBattMod {
    pub fn new(port: &str, address: u8) -> Result<Self> {
        let serial = serialport::new(port, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        Self::from_port(serial, address)
    }

    /// Builds a session on an already opened port.
    pub fn from_port(serial: Box<dyn serialport::SerialPort>, address: u8) -> Result<Self> {
        let mut sbm = Self {
            serial,
            address: Address::new(address)?,
        };
        sbm.clear_buffers()?;
        Ok(sbm)
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.serial.set_timeout(timeout)?;
        Ok(())
    }

    /// The address this session resolves command frames against.
    pub fn address(&self) -> Address {
        self.address
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    fn write_frame(&mut self, frame: &str) -> Result<()> {
        log::trace!("write_frame: {:?}", frame);
        self.serial.write_all(frame.as_bytes())?;
        Ok(())
    }

    /// Immediate read mode: drains whatever is currently buffered without
    /// waiting for more.
    fn read_immediate(&mut self) -> Result<String> {
        let pending = self.serial.bytes_to_read()? as usize;
        let mut buffer = vec![0; pending];
        if pending > 0 {
            self.serial.read_exact(&mut buffer)?;
        }
        let text = String::from_utf8(buffer)?;
        log::trace!("read_immediate: {:?}", text);
        Ok(text)
    }

    /// Quiesced read mode: polls the buffered byte count until two
    /// consecutive polls agree, taking that as end of response, then drains
    /// the buffer. Gives up after [`QUIESCE_CEILING`].
    fn read_quiesced(&mut self) -> Result<String> {
        let start = Instant::now();
        let mut buffered = self.serial.bytes_to_read()?;
        loop {
            if start.elapsed() >= QUIESCE_CEILING {
                log::warn!("Buffer check is reading continuous data");
                return Err(Error::ContinuousData);
            }
            std::thread::sleep(QUIESCE_POLL);
            let incoming = self.serial.bytes_to_read()?;
            if incoming == buffered {
                break;
            }
            buffered = incoming;
        }
        self.read_immediate()
    }

    fn settle(duration: Duration) {
        std::thread::sleep(duration);
    }

    pub fn get_summary(&mut self) -> Result<BatterySummary> {
        self.write_frame(&BatterySummary::request(self.address))?;
        Self::settle(SETTLE_QUERY);
        BatterySummary::decode(&self.read_quiesced()?)
    }

    pub fn get_version_summary(&mut self) -> Result<VersionSummary> {
        self.write_frame(&VersionSummary::request(self.address))?;
        Self::settle(SETTLE_QUERY);
        VersionSummary::decode(&self.read_immediate()?)
    }

    pub fn get_cell_voltages(&mut self) -> Result<[f32; CELL_COUNT]> {
        self.write_frame(&CellVoltages::request(self.address))?;
        Self::settle(SETTLE_QUERY);
        CellVoltages::decode(&self.read_immediate()?)
    }

    /// Gets the unit address, as a broadcast query. Only meaningful when
    /// this battery is the only unit on the bus.
    pub fn get_address(&mut self) -> Result<Address> {
        self.clear_buffers()?;
        self.write_frame(&AddressQuery::request())?;
        Self::settle(SETTLE_QUERY);
        AddressQuery::decode(&self.read_immediate()?)
    }

    /// Assigns a new unit address.
    ///
    /// The command is broadcast, so the caller must guarantee this battery
    /// is the only unit on the RS485 bus. The session keeps resolving
    /// frames against the address it was opened with.
    pub fn set_address(&mut self, new_address: Address) -> Result<()> {
        self.write_frame(&SetAddress::request(new_address))?;
        self.clear_buffers()?;
        Self::settle(SETTLE_SET_ADDRESS);
        Ok(())
    }

    /// Puts the battery to sleep after `seconds` (0 sleeps immediately).
    pub fn sleep(&mut self, seconds: u32) -> Result<()> {
        self.write_frame(&Sleep::request(self.address, seconds))?;
        Self::settle(SETTLE_SLEEP);
        Ok(())
    }

    /// Turns the battery off. The firmware clears any latched error state
    /// as a side effect; this layer does not re-verify that.
    pub fn off(&mut self) -> Result<()> {
        self.write_frame(&PowerOff::request(self.address))?;
        Self::settle(SETTLE_OFF);
        Ok(())
    }

    /// Power-cycles the error state: off, wait, re-query, drop the echo.
    pub fn reset(&mut self, wait: Duration) -> Result<()> {
        self.off()?;
        Self::settle(wait);
        let _ = self.get_summary()?;
        self.clear_buffers()
    }

    /// Starts discharging one cell. Returns whether the device accepted the
    /// command; rejection is reported through the summary error code.
    pub fn balance_cell(&mut self, cell: u8) -> Result<bool> {
        if cell as usize >= CELL_COUNT {
            return Err(Error::InvalidCell(cell));
        }
        self.write_frame(&BalanceCell::request(self.address, cell))?;
        Self::settle(SETTLE_QUERY);
        BalanceCell::decode(&self.read_immediate()?)
    }

    /// Lets the firmware pick and discharge its own best candidate cell.
    pub fn balance_best_cell(&mut self) -> Result<bool> {
        self.write_frame(&BalanceBestCell::request(self.address))?;
        Self::settle(SETTLE_QUERY);
        BalanceBestCell::decode(&self.read_immediate()?)
    }

    pub fn get_state(&mut self) -> Result<State> {
        Ok(self.get_summary()?.state)
    }

    pub fn get_error_state(&mut self) -> Result<DeviceError> {
        Ok(self.get_summary()?.error)
    }

    pub fn get_voltage(&mut self) -> Result<f32> {
        Ok(self.get_summary()?.voltage)
    }

    pub fn get_current(&mut self) -> Result<f32> {
        Ok(self.get_summary()?.current)
    }

    pub fn get_max_temperature(&mut self) -> Result<f32> {
        Ok(self.get_summary()?.max_temperature)
    }

    pub fn get_min_max_cell_voltage(&mut self) -> Result<(f32, f32)> {
        let summary = self.get_summary()?;
        Ok((summary.min_cell_voltage, summary.max_cell_voltage))
    }

    pub fn water_detected(&mut self) -> Result<bool> {
        Ok(self.get_summary()?.water_leak_detect != 0)
    }

    pub fn get_power(&mut self) -> Result<f32> {
        Ok(self.get_summary()?.power)
    }

    /// Time since power-on, split into whole hours, minutes and seconds.
    pub fn get_runtime(&mut self) -> Result<(u32, u32, u32)> {
        let summary = self.get_summary()?;
        let mut parts = summary.runtime.split(':').map(|part| {
            part.parse::<u32>()
                .map_err(|_| Error::Parse(format!("bad runtime component '{part}'")))
        });
        match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(m), Some(s)) => Ok((h?, m?, s?)),
            _ => Err(Error::Parse(format!("bad runtime '{}'", summary.runtime))),
        }
    }

    /// Seconds until the battery goes to sleep, 0 when the timer is disabled.
    pub fn get_sleep_time(&mut self) -> Result<u32> {
        Ok(self.get_summary()?.sleep_timer)
    }

    /// Get the battery serial number.
    pub fn get_battery_sn(&mut self) -> Result<u32> {
        Ok(self.get_version_summary()?.sn)
    }

    /// Get the firmware version string.
    pub fn get_fw_version(&mut self) -> Result<String> {
        Ok(self.get_version_summary()?.firmware_info)
    }

    pub fn get_voltage_rating(&mut self) -> Result<f32> {
        Ok(self.get_version_summary()?.voltage_rating)
    }

    pub fn get_current_rating(&mut self) -> Result<f32> {
        Ok(self.get_version_summary()?.current_rating)
    }

    /// Get the battery mode character (`m` or `s`).
    pub fn get_mode(&mut self) -> Result<char> {
        Ok(self.get_version_summary()?.mode)
    }
}

impl Drop for SmallBattMod {
    fn drop(&mut self) {
        // stale bytes must not leak into the next session on this port
        let _ = self.serial.clear(serialport::ClearBuffer::All);
    }
}
