use bson::Bson;

use crate::error::QueryError;
use crate::operator::Operator;

/// Maps logical field paths and comparison values to their storage form.
///
/// Predicates and update modifiers are written against logical names; the
/// translator is the seam where a schema renames fields and marshals values.
pub trait FieldTranslator {
    /// Translate a dotted logical path into the dotted storage path.
    fn storage_path(&self, path: &str) -> Result<String, QueryError>;

    /// Marshal a comparison value for the field at `path`.
    fn storage_value(&self, path: &str, operator: Operator, value: Bson)
    -> Result<Bson, QueryError>;
}

/// Identity translator: logical names are storage names, values pass through.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbatim;

impl FieldTranslator for Verbatim {
    fn storage_path(&self, path: &str) -> Result<String, QueryError> {
        Ok(path.to_string())
    }

    fn storage_value(&self, _path: &str, _operator: Operator, value: Bson) -> Result<Bson, QueryError> {
        Ok(value)
    }
}
