use std::collections::HashMap;

use bson::Bson;

use crate::error::SchemaError;
use crate::field::{FieldDescriptor, FieldKind};

/// Storage key holding the concrete class name of polymorphic documents.
pub const CLS_KEY: &str = "_cls";
/// Storage key holding the primary key.
pub const ID_KEY: &str = "_id";

/// Resolved field metadata for one document type.
///
/// Built through [`SchemaBuilder`] and registered with a
/// [`RegistryBuilder`](crate::RegistryBuilder), which resolves inheritance.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    class_name: String,
    collection: Option<String>,
    parent: Option<String>,
    embedded: bool,
    allow_inheritance: bool,
    ordering: Vec<String>,
    fields: Vec<FieldDescriptor>,
    by_name: HashMap<String, usize>,
    by_storage: HashMap<String, usize>,
    primary_key: Option<usize>,
}

impl Schema {
    /// Type name, as used to look the schema up.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted class path from the root type, e.g. `Animal.Dog`. This is the
    /// value stored under `_cls`.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    /// Whether documents of this type share storage with subclasses and
    /// carry a `_cls` discriminator.
    pub fn allows_inheritance(&self) -> bool {
        self.allow_inheritance
    }

    pub fn default_ordering(&self) -> &[String] {
        &self.ordering
    }

    /// Fields in declaration order, inherited fields first.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_by_storage_name(&self, storage_name: &str) -> Option<&FieldDescriptor> {
        self.by_storage.get(storage_name).map(|&i| &self.fields[i])
    }

    /// The primary-key field. Embedded schemas have none.
    pub fn primary_key(&self) -> Option<&FieldDescriptor> {
        self.primary_key.map(|i| &self.fields[i])
    }
}

/// Declares a document type.
///
/// ```
/// use strata_schema::{FieldDescriptor, FieldKind, SchemaBuilder};
///
/// let person = SchemaBuilder::new("Person")
///     .collection("people")
///     .field(FieldDescriptor::new("name", FieldKind::String).storage("n"))
///     .ordering(["-name"]);
/// ```
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    collection: Option<String>,
    parent: Option<String>,
    embedded: bool,
    allow_inheritance: bool,
    ordering: Vec<String>,
    fields: Vec<FieldDescriptor>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: None,
            parent: None,
            embedded: false,
            allow_inheritance: false,
            ordering: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// An embedded document type: stored inside its parent, no primary key.
    pub fn embedded(name: impl Into<String>) -> Self {
        Self {
            embedded: true,
            ..Self::new(name)
        }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Inherit from a registered type. The parent must allow inheritance.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn allow_inheritance(mut self) -> Self {
        self.allow_inheritance = true;
        self
    }

    pub fn ordering<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordering = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Resolve against the already-built parent schema, if any.
    pub(crate) fn build(self, parent: Option<&Schema>) -> Result<Schema, SchemaError> {
        let mut fields = Vec::new();
        let mut class_name = self.name.clone();
        let mut collection = self.collection;
        let mut ordering = self.ordering;
        let mut embedded = self.embedded;
        let mut allow_inheritance = self.allow_inheritance;

        if let Some(parent) = parent {
            if !parent.allow_inheritance {
                return Err(SchemaError::Invalid(format!(
                    "{} cannot extend {}: inheritance is not allowed",
                    self.name, parent.name
                )));
            }
            fields.extend(parent.fields.iter().cloned());
            class_name = format!("{}.{}", parent.class_name, self.name);
            if collection.is_some() && collection.as_deref() != parent.collection() {
                return Err(SchemaError::Invalid(format!(
                    "{} must share the collection of {}",
                    self.name, parent.name
                )));
            }
            collection = parent.collection.clone();
            if ordering.is_empty() {
                ordering = parent.ordering.clone();
            }
            embedded = parent.embedded;
            allow_inheritance = true;
        }

        let declares_pk = self.fields.iter().any(FieldDescriptor::is_primary_key);
        let inherits_pk = fields.iter().any(FieldDescriptor::is_primary_key);
        if declares_pk && inherits_pk {
            return Err(SchemaError::PrimaryKey {
                schema: self.name,
                message: "a subclass cannot redeclare the primary key".into(),
            });
        }
        if !embedded && !declares_pk && !inherits_pk {
            fields.insert(0, FieldDescriptor::new("id", FieldKind::ObjectId).primary_key());
        }
        fields.extend(self.fields);

        if embedded && collection.is_some() {
            return Err(SchemaError::Invalid(format!(
                "embedded type {} cannot have a collection",
                self.name
            )));
        }
        if !embedded && collection.is_none() {
            collection = Some(default_collection(&self.name));
        }

        let mut by_name = HashMap::new();
        let mut by_storage = HashMap::new();
        let mut primary_key = None;
        for (i, field) in fields.iter().enumerate() {
            if by_name.insert(field.name().to_string(), i).is_some() {
                return Err(SchemaError::DuplicateField {
                    schema: self.name,
                    field: field.name().to_string(),
                });
            }
            if by_storage.insert(field.storage_name().to_string(), i).is_some() {
                return Err(SchemaError::DuplicateStorageName {
                    schema: self.name,
                    storage_name: field.storage_name().to_string(),
                });
            }
            if field.is_primary_key() {
                if embedded {
                    return Err(SchemaError::PrimaryKey {
                        schema: self.name,
                        message: "embedded documents have no primary key".into(),
                    });
                }
                if primary_key.replace(i).is_some() {
                    return Err(SchemaError::PrimaryKey {
                        schema: self.name,
                        message: "more than one primary key declared".into(),
                    });
                }
            }
        }
        if allow_inheritance && by_storage.contains_key(CLS_KEY) {
            return Err(SchemaError::DuplicateStorageName {
                schema: self.name,
                storage_name: CLS_KEY.into(),
            });
        }

        Ok(Schema {
            name: self.name,
            class_name,
            collection,
            parent: self.parent,
            embedded,
            allow_inheritance,
            ordering,
            fields,
            by_name,
            by_storage,
            primary_key,
        })
    }
}

/// `BlogPost` → `blog_post`.
fn default_collection(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Defaults for every field that declares one, keyed by logical name.
pub fn defaults(schema: &Schema) -> Vec<(String, Bson)> {
    schema
        .fields()
        .iter()
        .filter_map(|f| f.resolve_default().map(|v| (f.name().to_string(), v)))
        .collect()
}
