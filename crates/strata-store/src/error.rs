use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A unique index rejected the write. The message carries the `E11000` text.
    DuplicateKey(String),
    /// Malformed filter, projection, sort or pipeline.
    InvalidQuery(String),
    /// An update could not be applied to a matched document.
    InvalidOperation(String),
    Storage(String),
}

impl StoreError {
    pub fn message(&self) -> &str {
        match self {
            StoreError::DuplicateKey(msg)
            | StoreError::InvalidQuery(msg)
            | StoreError::InvalidOperation(msg)
            | StoreError::Storage(msg) => msg,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DuplicateKey(msg) => write!(f, "{msg}"),
            StoreError::InvalidQuery(msg) => write!(f, "invalid query: {msg}"),
            StoreError::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            StoreError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}
