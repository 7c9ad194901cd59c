use strata_query::QueryError;
use strata_schema::SchemaError;
use strata_store::StoreError;

/// Errors surfaced to callers of the document layer.
///
/// `DoesNotExist` and `MultipleObjectsReturned` carry the document type they
/// were raised for; use [`Error::does_not_exist_for`] and
/// [`Error::multiple_objects_for`] to match a specific type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Malformed predicate, projection or modifier. Raised before any I/O.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// A field path that does not resolve against the schema.
    #[error("{0}")]
    LookUp(String),
    #[error("{message}")]
    DoesNotExist { document: String, message: String },
    #[error("{message}")]
    MultipleObjectsReturned { document: String, message: String },
    /// A unique index rejected a write.
    #[error("{0}")]
    NotUnique(String),
    /// Any other failed write or delete, including refused cascades.
    #[error("{0}")]
    Operation(String),
    #[error("`{0}` has not been registered in the document registry")]
    NotRegistered(String),
    #[error(transparent)]
    Schema(SchemaError),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn does_not_exist_for(&self, document: &str) -> bool {
        matches!(self, Error::DoesNotExist { document: d, .. } if d == document)
    }

    pub fn multiple_objects_for(&self, document: &str) -> bool {
        matches!(self, Error::MultipleObjectsReturned { document: d, .. } if d == document)
    }

    /// Translate a store failure on a write path. Duplicate keys become
    /// [`Error::NotUnique`], anything else [`Error::Operation`]. Both
    /// formatters receive the store's message.
    pub(crate) fn from_write(
        err: StoreError,
        unique: impl Fn(&str) -> String,
        other: impl Fn(&str) -> String,
    ) -> Error {
        match err {
            StoreError::DuplicateKey(msg) => Error::NotUnique(unique(&msg)),
            err => Error::Operation(other(&err.to_string())),
        }
    }
}

impl From<QueryError> for Error {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidQuery(msg) => Error::InvalidQuery(msg),
            QueryError::LookUp(msg) => Error::LookUp(msg),
        }
    }
}

impl From<SchemaError> for Error {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::NotRegistered(name) => Error::NotRegistered(name),
            other => Error::Schema(other),
        }
    }
}

/// Store failures on the read path.
impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidQuery(msg) => Error::InvalidQuery(msg),
            other => Error::Operation(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
