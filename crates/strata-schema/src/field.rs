use std::fmt;
use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Declared type of a field. Embedded and reference kinds name the registered
/// schema they point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    DateTime,
    ObjectId,
    Binary,
    /// Dynamic value; paths below it are not checked.
    Any,
    List(Box<FieldKind>),
    /// String-keyed map of values of the inner kind.
    Map(Box<FieldKind>),
    Embedded(String),
    Reference(String),
}

impl FieldKind {
    /// The embedded schema reached through this kind, looking through lists
    /// and maps.
    pub fn embedded_schema(&self) -> Option<&str> {
        match self {
            FieldKind::Embedded(name) => Some(name),
            FieldKind::List(inner) | FieldKind::Map(inner) => inner.embedded_schema(),
            _ => None,
        }
    }

    /// The referenced document type, looking through lists and maps.
    pub fn reference_target(&self) -> Option<&str> {
        match self {
            FieldKind::Reference(name) => Some(name),
            FieldKind::List(inner) | FieldKind::Map(inner) => inner.reference_target(),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FieldKind::List(_))
    }

    /// The element kind of a list or map; the kind itself otherwise.
    pub fn element(&self) -> &FieldKind {
        match self {
            FieldKind::List(inner) | FieldKind::Map(inner) => inner,
            other => other,
        }
    }
}

/// Marshals a field's values between their in-memory and storage forms.
pub trait Converter: Send + Sync {
    fn to_storage(&self, value: &Bson) -> Result<Bson, String>;
    fn from_storage(&self, raw: &Bson) -> Result<Bson, String>;
}

/// The built-in converter for a [`FieldKind`]. Null passes through every kind.
#[derive(Debug, Clone)]
pub struct KindConverter(pub FieldKind);

impl Converter for KindConverter {
    fn to_storage(&self, value: &Bson) -> Result<Bson, String> {
        convert(&self.0, value)
    }

    fn from_storage(&self, raw: &Bson) -> Result<Bson, String> {
        Ok(raw.clone())
    }
}

fn convert(kind: &FieldKind, value: &Bson) -> Result<Bson, String> {
    if matches!(value, Bson::Null) {
        return Ok(Bson::Null);
    }
    match (kind, value) {
        (FieldKind::Int, Bson::Int32(_) | Bson::Int64(_)) => Ok(value.clone()),
        (FieldKind::Int, Bson::Double(d)) if d.fract() == 0.0 => Ok(to_int(*d as i64)),
        (FieldKind::Int, Bson::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(to_int)
            .map_err(|_| format!("{s:?} is not an integer")),
        (FieldKind::Float, Bson::Double(_)) => Ok(value.clone()),
        (FieldKind::Float, Bson::Int32(n)) => Ok(Bson::Double(f64::from(*n))),
        (FieldKind::Float, Bson::Int64(n)) => Ok(Bson::Double(*n as f64)),
        (FieldKind::Float, Bson::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Bson::Double)
            .map_err(|_| format!("{s:?} is not a number")),
        (FieldKind::String, Bson::String(_)) => Ok(value.clone()),
        (FieldKind::Bool, Bson::Boolean(_)) => Ok(value.clone()),
        (FieldKind::DateTime, Bson::DateTime(_)) => Ok(value.clone()),
        (FieldKind::Binary, Bson::Binary(_)) => Ok(value.clone()),
        (FieldKind::ObjectId, _) => object_id(value),
        (FieldKind::Reference(_), _) => Ok(reference_id(value)),
        (FieldKind::Embedded(_), Bson::Document(_)) => Ok(value.clone()),
        (FieldKind::List(inner), Bson::Array(items)) => items
            .iter()
            .map(|item| convert(inner, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Bson::Array),
        // A scalar compared against a list field matches its elements.
        (FieldKind::List(inner), scalar) => convert(inner, scalar),
        (FieldKind::Map(inner), Bson::Document(entries)) => {
            let mut out = Document::new();
            for (k, v) in entries {
                out.insert(k.clone(), convert(inner, v)?);
            }
            Ok(Bson::Document(out))
        }
        (FieldKind::Any, _) => Ok(value.clone()),
        (kind, other) => Err(format!(
            "expected {kind:?}, found {:?}",
            other.element_type()
        )),
    }
}

fn to_int(n: i64) -> Bson {
    i32::try_from(n).map_or(Bson::Int64(n), Bson::Int32)
}

fn object_id(value: &Bson) -> Result<Bson, String> {
    match value {
        Bson::ObjectId(_) => Ok(value.clone()),
        Bson::String(s) => ObjectId::parse_str(s)
            .map(Bson::ObjectId)
            .map_err(|e| e.to_string()),
        Bson::Document(doc) => doc
            .get("_id")
            .map(object_id)
            .unwrap_or_else(|| Err("referenced document has no _id".into())),
        Bson::Array(items) => items
            .iter()
            .map(object_id)
            .collect::<Result<Vec<_>, _>>()
            .map(Bson::Array),
        other => Err(format!("{other} is not a valid ObjectId")),
    }
}

/// References hold the target's primary key. ObjectId-shaped strings and
/// referenced documents are normalised; any other key type passes through.
fn reference_id(value: &Bson) -> Bson {
    match value {
        Bson::String(s) => ObjectId::parse_str(s).map_or_else(|_| value.clone(), Bson::ObjectId),
        Bson::Document(doc) => doc.get("_id").map_or_else(|| value.clone(), reference_id),
        Bson::Array(items) => Bson::Array(items.iter().map(reference_id).collect()),
        other => other.clone(),
    }
}

/// A field's default: a fixed value or a factory called on every use.
#[derive(Clone)]
pub enum DefaultValue {
    Value(Bson),
    Factory(Arc<dyn Fn() -> Bson + Send + Sync>),
}

impl DefaultValue {
    pub fn resolve(&self) -> Bson {
        match self {
            DefaultValue::Value(v) => v.clone(),
            DefaultValue::Factory(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Value(v) => f.debug_tuple("Value").field(v).finish(),
            DefaultValue::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

/// Metadata for one declared field.
#[derive(Clone)]
pub struct FieldDescriptor {
    name: String,
    storage_name: Option<String>,
    kind: FieldKind,
    required: bool,
    unique: bool,
    primary_key: bool,
    default: Option<DefaultValue>,
    converter: Arc<dyn Converter>,
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("storage_name", &self.storage_name())
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("unique", &self.unique)
            .field("primary_key", &self.primary_key)
            .field("default", &self.default)
            .finish()
    }
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            storage_name: None,
            converter: Arc::new(KindConverter(kind.clone())),
            kind,
            required: false,
            unique: false,
            primary_key: false,
            default: None,
        }
    }

    pub fn storage(mut self, storage_name: impl Into<String>) -> Self {
        self.storage_name = Some(storage_name.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark as primary key. Primary keys are required and stored as `_id`
    /// unless given another storage name.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Bson>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    pub fn default_with(mut self, factory: impl Fn() -> Bson + Send + Sync + 'static) -> Self {
        self.default = Some(DefaultValue::Factory(Arc::new(factory)));
        self
    }

    pub fn converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_name(&self) -> &str {
        match &self.storage_name {
            Some(name) => name,
            None if self.primary_key => "_id",
            None => &self.name,
        }
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn default(&self) -> Option<&DefaultValue> {
        self.default.as_ref()
    }

    /// The default, with factories called. `None` when no default is declared.
    pub fn resolve_default(&self) -> Option<Bson> {
        self.default.as_ref().map(DefaultValue::resolve)
    }

    pub fn to_storage(&self, value: &Bson) -> Result<Bson, SchemaError> {
        self.converter
            .to_storage(value)
            .map_err(|message| SchemaError::Conversion {
                field: self.name.clone(),
                message,
            })
    }

    pub fn from_storage(&self, raw: &Bson) -> Result<Bson, SchemaError> {
        self.converter
            .from_storage(raw)
            .map_err(|message| SchemaError::Conversion {
                field: self.name.clone(),
                message,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn primary_key_defaults_to_id_storage() {
        let f = FieldDescriptor::new("email", FieldKind::String).primary_key();
        assert_eq!(f.storage_name(), "_id");
        assert!(f.is_required());
        let f = FieldDescriptor::new("code", FieldKind::String)
            .storage("c")
            .primary_key();
        assert_eq!(f.storage_name(), "c");
    }

    #[test]
    fn int_conversion() {
        let f = FieldDescriptor::new("age", FieldKind::Int);
        assert_eq!(f.to_storage(&Bson::String("42".into())).unwrap(), Bson::Int32(42));
        assert_eq!(f.to_storage(&Bson::Double(3.0)).unwrap(), Bson::Int32(3));
        assert_eq!(
            f.to_storage(&Bson::Int64(1 << 40)).unwrap(),
            Bson::Int64(1 << 40)
        );
        let err = f.to_storage(&Bson::String("x".into())).unwrap_err();
        assert!(matches!(err, SchemaError::Conversion { ref field, .. } if field == "age"));
    }

    #[test]
    fn object_id_from_hex_and_document() {
        let oid = ObjectId::new();
        let f = FieldDescriptor::new("author", FieldKind::Reference("Author".into()));
        assert_eq!(
            f.to_storage(&Bson::String(oid.to_hex())).unwrap(),
            Bson::ObjectId(oid)
        );
        assert_eq!(
            f.to_storage(&Bson::Document(doc! { "_id": oid, "name": "x" }))
                .unwrap(),
            Bson::ObjectId(oid)
        );
    }

    #[test]
    fn reference_keeps_custom_keys() {
        let f = FieldDescriptor::new("owner", FieldKind::Reference("User".into()));
        assert_eq!(
            f.to_storage(&Bson::String("bob@example.com".into())).unwrap(),
            Bson::String("bob@example.com".into())
        );
        let bad = FieldDescriptor::new("id", FieldKind::ObjectId);
        assert!(bad.to_storage(&Bson::String("nope".into())).is_err());
    }

    #[test]
    fn list_converts_elements_and_scalars() {
        let f = FieldDescriptor::new("scores", FieldKind::List(Box::new(FieldKind::Float)));
        assert_eq!(
            f.to_storage(&Bson::Array(vec![Bson::Int32(1), Bson::Double(2.5)]))
                .unwrap(),
            Bson::Array(vec![Bson::Double(1.0), Bson::Double(2.5)])
        );
        assert_eq!(f.to_storage(&Bson::Int32(3)).unwrap(), Bson::Double(3.0));
    }

    #[test]
    fn factory_default_is_called() {
        let f = FieldDescriptor::new("tags", FieldKind::List(Box::new(FieldKind::String)))
            .default_with(|| Bson::Array(Vec::new()));
        assert_eq!(f.resolve_default(), Some(Bson::Array(Vec::new())));
        assert_eq!(FieldDescriptor::new("x", FieldKind::Any).resolve_default(), None);
    }

    #[test]
    fn nested_kinds() {
        let kind = FieldKind::List(Box::new(FieldKind::Embedded("Comment".into())));
        assert_eq!(kind.embedded_schema(), Some("Comment"));
        assert_eq!(kind.reference_target(), None);
        let kind = FieldKind::Map(Box::new(FieldKind::Reference("User".into())));
        assert_eq!(kind.reference_target(), Some("User"));
    }
}
