use std::io::Error as IoError;

#[derive(Debug)]
pub enum ReasmError {
    /// Invalid configuration detected at construction time.
    Config(String),
    /// The reference genome could not serve a request.
    Reference(String),
    /// An internal graph invariant was violated; indicates a bug.
    InternalInvariant(String),
    IoError(IoError),
}

impl std::fmt::Display for ReasmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReasmError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            ReasmError::Reference(msg) => write!(f, "Reference error: {}", msg),
            ReasmError::InternalInvariant(msg) => write!(f, "Internal invariant violated: {}", msg),
            ReasmError::IoError(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ReasmError {}

impl From<IoError> for ReasmError {
    fn from(e: IoError) -> Self {
        ReasmError::IoError(e)
    }
}
