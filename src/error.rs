use crate::device::Status;

/// An error produced by the driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No matching receiver at the requested index.
    #[error("no matching device at index {0}")]
    NotFound(usize),

    /// The device exists but is held by someone else (usually a kernel
    /// driver on interface 0).
    #[error("device is busy")]
    Busy,

    /// An error reported by the USB transport.
    #[error("usb transport error: {0}")]
    Usb(#[from] rusb::Error),

    /// An I/O error outside the USB transport (e.g. reading a firmware
    /// image from disk).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The firmware image is structurally invalid.
    #[error("bad firmware image: {0}")]
    BadFirmware(&'static str),

    /// The firmware image checksum does not match its payload.
    #[error("firmware checksum mismatch: computed {computed:#010x}, expected {expected:#010x}")]
    BadChecksum { computed: u32, expected: u32 },

    /// The requested frequency is below what the hardware can synthesize.
    #[error("frequency too low: {0} Hz")]
    FrequencyTooLow(f64),

    /// The requested frequency is above what the hardware can synthesize.
    #[error("frequency too high: {0} Hz")]
    FrequencyTooHigh(f64),

    /// The requested frequency produces a divider outside the legal range.
    #[error("frequency out of range: {0} Hz")]
    FrequencyOutOfRange(f64),

    /// A caller-provided value is not acceptable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The tuner IF-filter calibration did not converge.
    #[error("tuner filter calibration failed")]
    CalibrationFailed,

    /// The requested value is not in the device's supported set.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The operation is not valid in the device's current state.
    #[error("operation invalid in state {0:?}")]
    State(Status),
}

pub type Result<T> = core::result::Result<T, Error>;
