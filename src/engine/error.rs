/// Failures of profile storage and the durable hold store. Always recoverable:
/// only cross-reload reconstruction degrades.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Io(String),
    QuotaExceeded { needed: usize, quota: usize },
    Disabled,
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
            StoreError::QuotaExceeded { needed, quota } => {
                write!(f, "storage quota exceeded: need {needed} bytes, quota {quota}")
            }
            StoreError::Disabled => write!(f, "storage is disabled"),
            StoreError::Corrupt(e) => write!(f, "stored value is corrupt: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Transient failure of a snapshot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Transport(String),
    Status(u16),
    Decode(String),
    Timeout,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transport(e) => write!(f, "availability request failed: {e}"),
            FetchError::Status(code) => write!(f, "availability service returned HTTP {code}"),
            FetchError::Decode(e) => write!(f, "malformed availability response: {e}"),
            FetchError::Timeout => write!(f, "availability request timed out"),
        }
    }
}

impl std::error::Error for FetchError {}
