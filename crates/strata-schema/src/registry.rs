use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::SchemaError;
use crate::field::FieldDescriptor;
use crate::rules::{DeleteRule, DeleteRuleEntry};
use crate::schema::{Schema, SchemaBuilder};

/// Collects schemas in dependency order: a parent must be registered before
/// its subclasses.
#[derive(Default)]
pub struct RegistryBuilder {
    schemas: HashMap<String, Arc<Schema>>,
    order: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, builder: SchemaBuilder) -> Result<Self, SchemaError> {
        let name = builder.name().to_string();
        if self.schemas.contains_key(&name) {
            return Err(SchemaError::AlreadyRegistered(name));
        }
        let parent = match builder.parent_name() {
            Some(parent) => Some(
                self.schemas
                    .get(parent)
                    .cloned()
                    .ok_or_else(|| SchemaError::NotRegistered(parent.to_string()))?,
            ),
            None => None,
        };
        let schema = builder.build(parent.as_deref())?;
        debug!(schema = %name, class = schema.class_name(), "registered schema");
        self.schemas.insert(name.clone(), Arc::new(schema));
        self.order.push(name);
        Ok(self)
    }

    /// Check that every embedded and referenced type exists, then freeze.
    pub fn build(self) -> Result<Registry, SchemaError> {
        for schema in self.schemas.values() {
            for field in schema.fields() {
                let target = field
                    .kind()
                    .embedded_schema()
                    .or_else(|| field.kind().reference_target());
                if let Some(target) = target
                    && !self.schemas.contains_key(target)
                {
                    return Err(SchemaError::NotRegistered(target.to_string()));
                }
            }
        }

        let mut subclasses: HashMap<String, Vec<String>> = HashMap::new();
        for name in &self.order {
            let mut parent = self.schemas[name].parent().map(str::to_string);
            while let Some(p) = parent {
                subclasses.entry(p.clone()).or_default().push(name.clone());
                parent = self.schemas[&p].parent().map(str::to_string);
            }
        }
        let by_class = self
            .schemas
            .values()
            .map(|s| (s.class_name().to_string(), s.name().to_string()))
            .collect();

        Ok(Registry {
            schemas: self.schemas,
            by_class,
            subclasses,
            rules: RwLock::new(HashMap::new()),
        })
    }
}

/// Process-wide type registry: schemas, subclass relations and delete rules.
///
/// Schemas are fixed once built; delete rules are appended afterwards with
/// [`register_delete_rule`](Registry::register_delete_rule).
pub struct Registry {
    schemas: HashMap<String, Arc<Schema>>,
    by_class: HashMap<String, String>,
    subclasses: HashMap<String, Vec<String>>,
    rules: RwLock<HashMap<String, Vec<DeleteRuleEntry>>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn schema(&self, name: &str) -> Result<&Arc<Schema>, SchemaError> {
        self.schemas
            .get(name)
            .ok_or_else(|| SchemaError::NotRegistered(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Schema>> {
        self.schemas.get(name)
    }

    /// Look a schema up by its `_cls` value.
    pub fn by_class_name(&self, class_name: &str) -> Option<&Arc<Schema>> {
        self.by_class
            .get(class_name)
            .and_then(|name| self.schemas.get(name))
    }

    /// All registered descendants of `name`, in registration order.
    pub fn subclasses(&self, name: &str) -> &[String] {
        self.subclasses.get(name).map_or(&[], Vec::as_slice)
    }

    /// `_cls` values that a query on `name` must match: its own and every
    /// descendant's.
    pub fn subclass_discriminators(&self, name: &str) -> Result<Vec<String>, SchemaError> {
        let mut out = vec![self.schema(name)?.class_name().to_string()];
        for sub in self.subclasses(name) {
            out.push(self.schema(sub)?.class_name().to_string());
        }
        Ok(out)
    }

    pub fn fields_of(&self, name: &str) -> Result<&[FieldDescriptor], SchemaError> {
        Ok(self.schema(name)?.fields())
    }

    pub fn default_ordering(&self, name: &str) -> Result<&[String], SchemaError> {
        Ok(self.schema(name)?.default_ordering())
    }

    pub fn primary_key_field(&self, name: &str) -> Result<Option<&FieldDescriptor>, SchemaError> {
        Ok(self.schema(name)?.primary_key())
    }

    pub fn is_polymorphic(&self, name: &str) -> Result<bool, SchemaError> {
        Ok(self.schema(name)?.allows_inheritance())
    }

    /// Record that documents of `related` refer to `owner` through `field`.
    ///
    /// The rule is stored for `owner` and each of its subclasses, against
    /// `related` and each of its subclasses. Registering the same pair again
    /// replaces the rule.
    pub fn register_delete_rule(
        &self,
        owner: &str,
        related: &str,
        field: &str,
        rule: DeleteRule,
    ) -> Result<(), SchemaError> {
        self.schema(owner)?;
        let related_schema = self.schema(related)?;
        if related_schema.field(field).is_none() {
            return Err(SchemaError::Invalid(format!(
                "{related} has no field `{field}`"
            )));
        }

        let owners: Vec<&str> = std::iter::once(owner)
            .chain(self.subclasses(owner).iter().map(String::as_str))
            .collect();
        let relateds: Vec<&str> = std::iter::once(related)
            .chain(self.subclasses(related).iter().map(String::as_str))
            .collect();

        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        for owner in &owners {
            let table = rules.entry(owner.to_string()).or_default();
            for related in &relateds {
                match table
                    .iter_mut()
                    .find(|e| e.related == *related && e.field == field)
                {
                    Some(entry) => entry.rule = rule,
                    None => table.push(DeleteRuleEntry {
                        related: related.to_string(),
                        field: field.to_string(),
                        rule,
                    }),
                }
            }
        }
        debug!(owner, related, field, ?rule, "registered delete rule");
        Ok(())
    }

    /// Delete rules that apply when a document of `owner` is deleted.
    pub fn delete_rules(&self, owner: &str) -> Vec<DeleteRuleEntry> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules.get(owner).cloned().unwrap_or_default()
    }
}
