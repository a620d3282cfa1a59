use thiserror::Error;

/// Result type alias for SmallBattMod operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for SmallBattMod communication and balancing.
#[derive(Error, Debug)]
pub enum Error {
    /// Serial port error (open failure or port-level I/O fault)
    #[cfg(feature = "serialport")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// General I/O error on the underlying channel
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The quiescence poll kept seeing new bytes until the 30 second ceiling
    #[error("buffer check is reading continuous data")]
    ContinuousData,

    /// Response bytes are not valid text
    #[error("response is not valid text: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    /// Response does not match the expected grammar
    #[error("malformed response: {0}")]
    Parse(String),

    /// Cell voltage response with a token count other than 8
    #[error("response did not return all cell voltages (found {0})")]
    IncompleteVoltageSet(usize),

    /// Unit address outside the device's addressing range
    #[error("address {0} is outside the range 0-250")]
    InvalidAddress(u8),

    /// Cell index outside the pack
    #[error("cell index {0} is outside the range 0-7")]
    InvalidCell(u8),

    /// Maximum cell temperature reached the balancing cutoff
    #[error("maximum cell temperature {0:.1}\u{b0}C exceeds the balancing cutoff")]
    ThermalCutoff(f32),
}
