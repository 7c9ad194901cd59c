use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaError {
    NotRegistered(String),
    AlreadyRegistered(String),
    DuplicateField { schema: String, field: String },
    DuplicateStorageName { schema: String, storage_name: String },
    PrimaryKey { schema: String, message: String },
    /// A value could not be marshalled to or from its storage form.
    Conversion { field: String, message: String },
    Invalid(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::NotRegistered(name) => {
                write!(f, "`{name}` has not been registered in the document registry")
            }
            SchemaError::AlreadyRegistered(name) => write!(f, "`{name}` is already registered"),
            SchemaError::DuplicateField { schema, field } => {
                write!(f, "{schema}: field `{field}` declared twice")
            }
            SchemaError::DuplicateStorageName {
                schema,
                storage_name,
            } => write!(f, "{schema}: storage name `{storage_name}` used by more than one field"),
            SchemaError::PrimaryKey { schema, message } => write!(f, "{schema}: {message}"),
            SchemaError::Conversion { field, message } => {
                write!(f, "cannot convert value of `{field}`: {message}")
            }
            SchemaError::Invalid(msg) => write!(f, "invalid schema: {msg}"),
        }
    }
}

impl std::error::Error for SchemaError {}
