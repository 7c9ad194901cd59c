use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bson::{Bson, doc};
use strata_schema::{DeleteRule, Registry, Schema, SchemaError};
use strata_store::{DataSource, FindOptions, StoreError};
use tracing::debug;

use crate::cascade::CascadeContext;
use crate::config::DatabaseConfig;
use crate::cursor::QueryCursor;
use crate::document::{Document, EmbeddedDocument};
use crate::error::Error;
use crate::observer::Observer;

/// Entry point tying a data source to a schema registry.
///
/// Cursors and documents borrow the database; it owns no background work.
pub struct Database<S: DataSource> {
    source: S,
    registry: Arc<Registry>,
    config: DatabaseConfig,
    observers: RwLock<HashMap<String, Vec<Arc<dyn Observer>>>>,
}

impl<S: DataSource> Database<S> {
    pub fn new(source: S, registry: Arc<Registry>) -> Self {
        Self::with_config(source, registry, DatabaseConfig::default())
    }

    pub fn with_config(source: S, registry: Arc<Registry>, config: DatabaseConfig) -> Self {
        Self {
            source,
            registry,
            config,
            observers: RwLock::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Register lifecycle hooks for `type_name`. Documents of its subclasses
    /// notify them too.
    pub fn observe(&self, type_name: &str, observer: Arc<dyn Observer>) -> Result<(), Error> {
        self.registry.schema(type_name)?;
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(type_name.to_string())
            .or_default()
            .push(observer);
        Ok(())
    }

    /// Record a delete rule: documents of `related` refer to `owner` through
    /// `field`.
    pub fn register_delete_rule(
        &self,
        owner: &str,
        related: &str,
        field: &str,
        rule: DeleteRule,
    ) -> Result<(), Error> {
        Ok(self.registry.register_delete_rule(owner, related, field, rule)?)
    }

    /// Observers of `type_name` and its ancestors.
    pub(crate) fn observers_for(&self, type_name: &str) -> Vec<Arc<dyn Observer>> {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        let mut current = Some(type_name.to_string());
        while let Some(name) = current {
            if let Some(list) = observers.get(&name) {
                out.extend(list.iter().cloned());
            }
            current = self
                .registry
                .get(&name)
                .and_then(|s| s.parent())
                .map(str::to_string);
        }
        out
    }

    /// Whether deleting documents of `type_name`, or of any subclass, must
    /// notify observers one document at a time.
    pub fn has_delete_observers(&self, type_name: &str) -> bool {
        let wants = |name: &str| {
            self.observers_for(name)
                .iter()
                .any(|o| o.wants_delete_events())
        };
        wants(type_name) || self.registry.subclasses(type_name).iter().any(|s| wants(s))
    }

    /// A cursor over every document of `type_name` and its subclasses.
    pub fn objects(&self, type_name: &str) -> Result<QueryCursor<'_, S>, Error> {
        QueryCursor::new(self, type_name)
    }

    /// An unsaved document holding its schema's defaults.
    pub fn new_document(&self, type_name: &str) -> Result<Document, Error> {
        let schema = self.registry.schema(type_name)?;
        if schema.is_embedded() {
            return Err(SchemaError::Invalid(format!(
                "{type_name} is an embedded type; use new_embedded"
            ))
            .into());
        }
        Document::new(&self.registry, schema.clone())
    }

    pub fn new_embedded(&self, type_name: &str) -> Result<EmbeddedDocument, Error> {
        let schema = self.registry.schema(type_name)?;
        if !schema.is_embedded() {
            return Err(SchemaError::Invalid(format!("{type_name} is not an embedded type")).into());
        }
        EmbeddedDocument::new(&self.registry, schema.clone())
    }

    /// Insert a new document, or write the changes of a saved one.
    ///
    /// The first save stores the full document and assigns the primary key
    /// the store returns. Later saves send the `$set`/`$unset` delta, never
    /// touching the primary key. Tracked changes are cleared on success.
    pub fn save(&self, document: &mut Document) -> Result<(), Error> {
        let observers = self.observers_for(document.type_name());
        for observer in &observers {
            observer.pre_save(document)?;
        }

        let collection = collection_of(document.schema())?.to_string();
        let created = !document.is_saved();
        let save_error = |err: StoreError| {
            Error::from_write(
                err,
                |msg| format!("Tried to save duplicate unique keys ({msg})"),
                |msg| format!("Could not save document ({msg})"),
            )
        };

        if created {
            let stored = document.to_storage()?;
            let id = self
                .source
                .insert_one(&collection, stored)
                .map_err(save_error)?;
            debug!(collection = collection.as_str(), %id, "inserted document");
            document.set_pk(id);
            document.saved = true;
        } else {
            let (filter, pk_key) = identity_filter(document)?;
            let (mut set, unset) = document.delta()?;
            set.remove(&pk_key);
            let mut update = bson::Document::new();
            if !set.is_empty() {
                update.insert("$set", set);
            }
            if !unset.is_empty() {
                update.insert("$unset", unset);
            }
            if !update.is_empty() {
                debug!(collection = collection.as_str(), ?update, "saving document delta");
                self.source
                    .update_one(&collection, &filter, &update, false)
                    .map_err(save_error)?;
            }
        }

        document.clear_changes();
        for observer in &observers {
            observer.post_save(document, created);
        }
        Ok(())
    }

    /// Replace `document` with its stored state.
    pub fn reload(&self, document: &mut Document) -> Result<(), Error> {
        let type_name = document.type_name().to_string();
        let deleted = || Error::DoesNotExist {
            document: type_name.clone(),
            message: "Document has been deleted.".into(),
        };
        if document.pk().is_none() {
            return Err(deleted());
        }
        let (filter, _) = identity_filter(document)?;
        let collection = collection_of(document.schema())?;
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        let raw = self
            .source
            .find(collection, &filter, &options)?
            .next()
            .transpose()?
            .ok_or_else(deleted)?;
        let schema = document.schema_arc().clone();
        *document = Document::from_storage(&self.registry, &schema, raw, true)?;
        Ok(())
    }

    /// Delete one saved document, running its delete rules and observers.
    pub fn delete_document(&self, document: &Document) -> Result<u64, Error> {
        self.delete_document_in(document, &mut CascadeContext::new(&self.config))
    }

    pub(crate) fn delete_document_in(
        &self,
        document: &Document,
        context: &mut CascadeContext,
    ) -> Result<u64, Error> {
        let pk = document.pk().ok_or_else(|| {
            Error::Operation("attempt to delete a document not yet saved".into())
        })?;
        let observers = self.observers_for(document.type_name());
        for observer in &observers {
            observer.pre_delete(document)?;
        }
        let mut cursor = self
            .objects(document.type_name())?
            .filter([("pk", pk)])?;
        let deleted = cursor.delete_in(true, context)?;
        for observer in &observers {
            observer.post_delete(document);
        }
        Ok(deleted)
    }

    /// Apply modifiers to the stored copy of `document`.
    pub fn update_document<I, K, V>(&self, document: &Document, modifiers: I) -> Result<u64, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        let pk = document.pk().ok_or_else(|| {
            Error::Operation("attempt to update a document not yet saved".into())
        })?;
        self.objects(document.type_name())?
            .filter([("pk", pk)])?
            .update_one(modifiers)
    }
}

pub(crate) fn collection_of(schema: &Schema) -> Result<&str, Error> {
    schema.collection().ok_or_else(|| {
        Error::InvalidQuery(format!("{} is embedded and has no collection", schema.name()))
    })
}

/// `{<pk storage name>: pk}` for a saved document.
fn identity_filter(document: &Document) -> Result<(bson::Document, String), Error> {
    let pk_field = document
        .schema()
        .primary_key()
        .ok_or_else(|| Error::Operation(format!("{} has no primary key", document.type_name())))?;
    let pk = document
        .pk()
        .ok_or_else(|| Error::Operation("attempt to update a document not yet saved".into()))?;
    let key = pk_field.storage_name().to_string();
    Ok((doc! { key.clone(): pk }, key))
}
