use std::fmt;

/// Errors raised while building or rendering predicates and update modifiers.
///
/// Both variants are caller bugs: they surface at chain-build time, before
/// any I/O, and are never retried.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Malformed predicate, operator or modifier.
    InvalidQuery(String),
    /// A field path could not be resolved against the schema.
    LookUp(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::InvalidQuery(msg) => write!(f, "invalid query: {msg}"),
            QueryError::LookUp(msg) => write!(f, "lookup error: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}
