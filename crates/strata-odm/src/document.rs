use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bson::Bson;
use bson::oid::ObjectId;
use strata_schema::{
    CLS_KEY, Converter, FieldDescriptor, FieldKind, KindConverter, Registry, Schema, SchemaError,
};
use tracing::trace;

use crate::changes::{self, ChangeSet};
use crate::error::Error;

/// An in-memory field value.
///
/// Embedded documents are shared handles: cloning a `Value` that holds one
/// clones the handle, not the document.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bson(Bson),
    Embedded(EmbeddedDocument),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn as_bson(&self) -> Option<&Bson> {
        match self {
            Value::Bson(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bson().and_then(Bson::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.as_bson()? {
            Bson::Int32(n) => Some(i64::from(*n)),
            Bson::Int64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<&EmbeddedDocument> {
        match self {
            Value::Embedded(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Bson(Bson::Null))
    }
}

impl From<Bson> for Value {
    fn from(b: Bson) -> Self {
        Value::Bson(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bson(Bson::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bson(Bson::String(s))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Bson(Bson::Int32(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Bson(Bson::Int64(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Bson(Bson::Double(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bson(Bson::Boolean(b))
    }
}

impl From<ObjectId> for Value {
    fn from(oid: ObjectId) -> Self {
        Value::Bson(Bson::ObjectId(oid))
    }
}

impl From<EmbeddedDocument> for Value {
    fn from(e: EmbeddedDocument) -> Self {
        Value::Embedded(e)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Field values and change set of one document instance.
#[derive(Debug, Clone)]
pub(crate) struct DocumentData {
    pub(crate) schema: Arc<Schema>,
    pub(crate) values: HashMap<String, Value>,
    pub(crate) changes: ChangeSet,
}

impl DocumentData {
    fn new(registry: &Registry, schema: Arc<Schema>) -> Result<Self, Error> {
        let mut values = HashMap::new();
        for field in schema.fields() {
            if let Some(default) = field.resolve_default() {
                values.insert(field.name().to_string(), decode(registry, field.kind(), default)?);
            }
        }
        Ok(Self {
            schema,
            values,
            changes: ChangeSet::default(),
        })
    }

    /// Declared field for a logical name, with the `pk` alias.
    pub(crate) fn field(&self, name: &str) -> Result<&FieldDescriptor, Error> {
        let field = match name {
            "pk" => self.schema.primary_key(),
            _ => self.schema.field(name),
        };
        field.ok_or_else(|| {
            Error::LookUp(format!(
                "Cannot resolve field \"{name}\" on {}",
                self.schema.name()
            ))
        })
    }

    fn set(&mut self, name: &str, value: Value) -> Result<(), Error> {
        let field = self.field(name)?.name().to_string();
        self.values.insert(field.clone(), value);
        self.changes.mark(&field);
        Ok(())
    }

    fn unset(&mut self, name: &str) -> Result<(), Error> {
        let field = self.field(name)?.name().to_string();
        self.values.remove(&field);
        self.changes.mark(&field);
        Ok(())
    }

    /// Storage form: primary key first, then the discriminator, then fields
    /// in declaration order. Null values are omitted.
    fn to_storage(&self, stack: &mut HashSet<usize>) -> Result<bson::Document, Error> {
        let mut out = bson::Document::new();
        let pk = self.schema.primary_key();
        if let Some(pk) = pk
            && let Some(value) = self.values.get(pk.name())
            && !value.is_null()
        {
            out.insert(pk.storage_name(), encode_field(value, pk, stack)?);
        }
        if self.schema.allows_inheritance() {
            out.insert(CLS_KEY, self.schema.class_name());
        }
        for field in self.schema.fields() {
            if field.is_primary_key() {
                continue;
            }
            match self.values.get(field.name()) {
                Some(value) if !value.is_null() => {
                    let encoded = encode_field(value, field, stack)?;
                    if encoded != Bson::Null {
                        out.insert(field.storage_name(), encoded);
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn from_storage(
        registry: &Registry,
        schema: Arc<Schema>,
        raw: bson::Document,
    ) -> Result<Self, Error> {
        let mut data = DocumentData::new(registry, schema)?;
        for (key, raw_value) in raw {
            if key == CLS_KEY {
                continue;
            }
            let Some(field) = data.schema.field_by_storage_name(&key) else {
                trace!(schema = data.schema.name(), key, "ignoring undeclared stored key");
                continue;
            };
            let converted = field.from_storage(&raw_value)?;
            let value = decode(registry, field.kind(), converted)?;
            data.values.insert(field.name().to_string(), value);
        }
        Ok(data)
    }
}

/// Handle to an embedded document. Handles are shared: every clone sees the
/// same fields and change set. Equality is identity.
#[derive(Clone)]
pub struct EmbeddedDocument(Arc<RwLock<DocumentData>>);

impl EmbeddedDocument {
    pub(crate) fn new(registry: &Registry, schema: Arc<Schema>) -> Result<Self, Error> {
        Ok(Self::wrap(DocumentData::new(registry, schema)?))
    }

    fn wrap(data: DocumentData) -> Self {
        EmbeddedDocument(Arc::new(RwLock::new(data)))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, DocumentData> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, DocumentData> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stable identity for cycle detection.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn type_name(&self) -> String {
        self.read().schema.name().to_string()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.read().values.get(name).cloned()
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        self.write().set(name, value.into())
    }

    pub fn unset(&self, name: &str) -> Result<(), Error> {
        self.write().unset(name)
    }

    pub fn mark_changed(&self, path: &str) {
        self.write().changes.mark(path);
    }

    /// Changed paths of this document and everything embedded below it.
    pub fn changed_fields(&self) -> Vec<String> {
        let mut visited = HashSet::from([self.identity()]);
        changes::changed_fields(&self.read(), &mut visited)
    }
}

impl PartialEq for EmbeddedDocument {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for EmbeddedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Identity only: the graph may be cyclic.
        f.debug_tuple("EmbeddedDocument")
            .field(&format_args!("{:#x}", self.identity()))
            .finish()
    }
}

/// A top-level document: typed field values, a change set, and whether it
/// has been persisted.
///
/// Cloning copies field values but shares embedded document handles.
#[derive(Debug, Clone)]
pub struct Document {
    pub(crate) data: DocumentData,
    pub(crate) saved: bool,
}

impl Document {
    pub(crate) fn new(registry: &Registry, schema: Arc<Schema>) -> Result<Self, Error> {
        Ok(Self {
            data: DocumentData::new(registry, schema)?,
            saved: false,
        })
    }

    /// Decode a stored document. A `_cls` key selects the concrete
    /// registered subtype of `schema`.
    pub(crate) fn from_storage(
        registry: &Registry,
        schema: &Arc<Schema>,
        raw: bson::Document,
        saved: bool,
    ) -> Result<Self, Error> {
        let schema = concrete_schema(registry, schema, &raw);
        Ok(Self {
            data: DocumentData::from_storage(registry, schema, raw)?,
            saved,
        })
    }

    pub fn type_name(&self) -> &str {
        self.data.schema.name()
    }

    pub fn schema(&self) -> &Schema {
        &self.data.schema
    }

    pub(crate) fn schema_arc(&self) -> &Arc<Schema> {
        &self.data.schema
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let field = self.data.field(name).ok()?;
        self.data.values.get(field.name())
    }

    /// Assign a field and mark it changed.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        self.data.set(name, value.into())
    }

    pub fn unset(&mut self, name: &str) -> Result<(), Error> {
        self.data.unset(name)
    }

    /// The primary key value, once assigned.
    pub fn pk(&self) -> Option<Bson> {
        let pk = self.data.schema.primary_key()?;
        match self.data.values.get(pk.name())? {
            Value::Bson(Bson::Null) => None,
            Value::Bson(b) => Some(b.clone()),
            _ => None,
        }
    }

    pub(crate) fn set_pk(&mut self, id: Bson) {
        if let Some(pk) = self.data.schema.primary_key() {
            self.data.values.insert(pk.name().to_string(), Value::Bson(id));
        }
    }

    /// Whether the document has been written to or loaded from storage.
    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn mark_changed(&mut self, path: &str) {
        self.data.changes.mark(path);
    }

    /// Logical paths changed since load or the last save, including changes
    /// inside embedded documents.
    pub fn changed_fields(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        changes::changed_fields(&self.data, &mut visited)
    }

    /// The `($set, $unset)` pair that brings the stored document in line with
    /// this instance.
    pub fn delta(&self) -> Result<(bson::Document, bson::Document), Error> {
        changes::delta(&self.data, &self.changed_fields())
    }

    /// Forget tracked changes here and in every embedded document.
    pub fn clear_changes(&mut self) {
        let mut visited = HashSet::new();
        changes::clear(&mut self.data, &mut visited);
    }

    pub fn to_storage(&self) -> Result<bson::Document, Error> {
        self.data.to_storage(&mut HashSet::new())
    }
}

fn concrete_schema(registry: &Registry, schema: &Arc<Schema>, raw: &bson::Document) -> Arc<Schema> {
    match raw.get_str(CLS_KEY) {
        Ok(class) => registry
            .by_class_name(class)
            .cloned()
            .unwrap_or_else(|| schema.clone()),
        Err(_) => schema.clone(),
    }
}

/// Build the in-memory shape of a stored value of `kind`.
pub(crate) fn decode(registry: &Registry, kind: &FieldKind, raw: Bson) -> Result<Value, Error> {
    Ok(match (kind, raw) {
        (FieldKind::Embedded(name), Bson::Document(doc)) => {
            let schema = registry.schema(name)?;
            let schema = concrete_schema(registry, schema, &doc);
            Value::Embedded(EmbeddedDocument::wrap(DocumentData::from_storage(
                registry, schema, doc,
            )?))
        }
        (FieldKind::List(inner), Bson::Array(items)) => Value::List(
            items
                .into_iter()
                .map(|item| decode(registry, inner, item))
                .collect::<Result<_, _>>()?,
        ),
        (FieldKind::Map(inner), Bson::Document(entries)) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, decode(registry, inner, v)?)))
                .collect::<Result<_, Error>>()?,
        ),
        (_, raw) => Value::Bson(raw),
    })
}

/// Storage form of a top-level field value. Plain values go through the
/// field's converter.
pub(crate) fn encode_field(
    value: &Value,
    field: &FieldDescriptor,
    stack: &mut HashSet<usize>,
) -> Result<Bson, Error> {
    match value {
        Value::Bson(b) => Ok(field.to_storage(b)?),
        other => encode(other, field.kind(), field.name(), stack),
    }
}

/// Storage form of a value nested at any depth under the field `owner`.
/// `stack` holds the embedded documents being encoded, to reject cycles.
pub(crate) fn encode(
    value: &Value,
    kind: &FieldKind,
    owner: &str,
    stack: &mut HashSet<usize>,
) -> Result<Bson, Error> {
    match value {
        Value::Bson(b) => KindConverter(kind.clone()).to_storage(b).map_err(|message| {
            SchemaError::Conversion {
                field: owner.to_string(),
                message,
            }
            .into()
        }),
        Value::Embedded(e) => {
            let id = e.identity();
            if !stack.insert(id) {
                return Err(Error::Serialization(format!(
                    "embedded document under `{owner}` contains itself"
                )));
            }
            let out = e.read().to_storage(stack);
            stack.remove(&id);
            Ok(Bson::Document(out?))
        }
        Value::List(items) => items
            .iter()
            .map(|item| encode(item, kind.element(), owner, stack))
            .collect::<Result<Vec<_>, _>>()
            .map(Bson::Array),
        Value::Map(entries) => {
            let mut out = bson::Document::new();
            for (k, v) in entries {
                out.insert(k.clone(), encode(v, kind.element(), owner, stack)?);
            }
            Ok(Bson::Document(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use strata_schema::SchemaBuilder;

    fn registry() -> Registry {
        Registry::builder()
            .register(
                SchemaBuilder::embedded("Address")
                    .field(FieldDescriptor::new("zipcode", FieldKind::String).storage("zip")),
            )
            .unwrap()
            .register(
                SchemaBuilder::new("Person")
                    .allow_inheritance()
                    .field(FieldDescriptor::new("name", FieldKind::String).storage("n"))
                    .field(FieldDescriptor::new("age", FieldKind::Int).default_value(0))
                    .field(FieldDescriptor::new("address", FieldKind::Embedded("Address".into())))
                    .field(FieldDescriptor::new(
                        "tags",
                        FieldKind::List(Box::new(FieldKind::String)),
                    )),
            )
            .unwrap()
            .register(
                SchemaBuilder::new("Employee")
                    .extends("Person")
                    .field(FieldDescriptor::new("salary", FieldKind::Int)),
            )
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn new_document_holds_defaults_without_changes() {
        let reg = registry();
        let doc = Document::new(&reg, reg.schema("Person").unwrap().clone()).unwrap();
        assert_eq!(doc.get("age").and_then(Value::as_i64), Some(0));
        assert!(doc.changed_fields().is_empty());
        assert!(!doc.is_saved());
    }

    #[test]
    fn storage_form_orders_id_then_cls() {
        let reg = registry();
        let mut doc = Document::new(&reg, reg.schema("Person").unwrap().clone()).unwrap();
        let oid = ObjectId::new();
        doc.set("name", "ann").unwrap();
        doc.set("pk", oid).unwrap();
        let address = EmbeddedDocument::new(&reg, reg.schema("Address").unwrap().clone()).unwrap();
        address.set("zipcode", "02134").unwrap();
        doc.set("address", address).unwrap();

        let stored = doc.to_storage().unwrap();
        let keys: Vec<&String> = stored.keys().collect();
        assert_eq!(keys, ["_id", "_cls", "n", "age", "address"]);
        assert_eq!(stored.get_str("_cls").unwrap(), "Person");
        assert_eq!(stored.get_document("address").unwrap(), &doc! { "zip": "02134" });
    }

    #[test]
    fn decoding_picks_subclass_from_discriminator() {
        let reg = registry();
        let raw = doc! {
            "_id": ObjectId::new(),
            "_cls": "Person.Employee",
            "n": "bo",
            "salary": 10,
            "address": { "zip": "1" },
            "legacy": true,
        };
        let doc = Document::from_storage(&reg, reg.schema("Person").unwrap(), raw, true).unwrap();
        assert_eq!(doc.type_name(), "Employee");
        assert_eq!(doc.get("salary").and_then(Value::as_i64), Some(10));
        let address = doc.get("address").and_then(Value::as_embedded).unwrap();
        assert_eq!(address.get("zipcode").unwrap().as_str(), Some("1"));
        assert!(doc.changed_fields().is_empty());
    }

    #[test]
    fn unknown_field_assignment_fails() {
        let reg = registry();
        let mut doc = Document::new(&reg, reg.schema("Person").unwrap().clone()).unwrap();
        assert!(matches!(doc.set("nope", 1), Err(Error::LookUp(_))));
    }

    #[test]
    fn cyclic_embedded_graph_does_not_encode() {
        let reg = Registry::builder()
            .register(
                SchemaBuilder::embedded("Node")
                    .field(FieldDescriptor::new("next", FieldKind::Embedded("Node".into()))),
            )
            .unwrap()
            .register(
                SchemaBuilder::new("Graph")
                    .field(FieldDescriptor::new("head", FieldKind::Embedded("Node".into()))),
            )
            .unwrap()
            .build()
            .unwrap();
        let node = EmbeddedDocument::new(&reg, reg.schema("Node").unwrap().clone()).unwrap();
        node.set("next", node.clone()).unwrap();
        let mut graph = Document::new(&reg, reg.schema("Graph").unwrap().clone()).unwrap();
        graph.set("head", node).unwrap();
        assert!(matches!(graph.to_storage(), Err(Error::Serialization(_))));
    }
}
