//! Error taxonomy shared by every component (spec §7).

use thiserror::Error;

/// Terminal status reported for a job or a single page.
///
/// Every transport or protocol failure maps into exactly one of these;
/// unknown device conditions map to [`ScanStatus::IoError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ScanStatus {
    Good,
    Cancelled,
    DeviceBusy,
    CoverOpen,
    Jammed,
    NoDocs,
    NoMem,
    Inval,
    IoError,
    Eof,
    Unsupported,
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanStatus::Good => "GOOD",
            ScanStatus::Cancelled => "CANCELLED",
            ScanStatus::DeviceBusy => "DEVICE_BUSY",
            ScanStatus::CoverOpen => "COVER_OPEN",
            ScanStatus::Jammed => "JAMMED",
            ScanStatus::NoDocs => "NO_DOCS",
            ScanStatus::NoMem => "NO_MEM",
            ScanStatus::Inval => "INVAL",
            ScanStatus::IoError => "IO_ERROR",
            ScanStatus::Eof => "EOF",
            ScanStatus::Unsupported => "UNSUPPORTED",
        };
        f.write_str(s)
    }
}

/// Crate-wide error type. Every handler decode function and every state
/// machine transition returns this instead of panicking.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("device returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("unsupported format or capability: {0}")]
    Unsupported(String),

    #[error("invalid option or device reference: {0}")]
    Invalid(String),

    #[error("decoder error: {0}")]
    Decode(String),

    #[error("end of file")]
    Eof,

    #[error("device status: {0}")]
    Device(ScanStatus),
}

impl ScanError {
    /// Central mapping from an arbitrary error to the §7 taxonomy. Used
    /// by the job machine's `CHECK` state and by adaptor-facing code that
    /// needs the coarse status rather than the full error.
    pub fn status(&self) -> ScanStatus {
        match self {
            ScanError::Transport(_) => ScanStatus::IoError,
            ScanError::HttpStatus { .. } => ScanStatus::IoError,
            ScanError::Protocol(_) => ScanStatus::IoError,
            ScanError::Unsupported(_) => ScanStatus::Unsupported,
            ScanError::Invalid(_) => ScanStatus::Inval,
            ScanError::Decode(_) => ScanStatus::IoError,
            ScanError::Eof => ScanStatus::Eof,
            ScanError::Device(status) => *status,
        }
    }

    pub fn device(status: ScanStatus) -> Self {
        ScanError::Device(status)
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(e: reqwest::Error) -> Self {
        ScanError::Transport(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
