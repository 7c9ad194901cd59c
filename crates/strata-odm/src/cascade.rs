use std::collections::HashSet;

use bson::{Bson, doc};
use strata_schema::{DeleteRule, ID_KEY, Schema};
use strata_store::{DataSource, FindOptions};
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::database::Database;
use crate::error::Error;

/// State shared by one delete and every delete it cascades into.
///
/// Documents already handled are skipped, so reference cycles terminate.
#[derive(Debug)]
pub(crate) struct CascadeContext {
    visited: HashSet<(String, String)>,
    depth: usize,
    max_depth: usize,
}

impl CascadeContext {
    pub(crate) fn new(config: &DatabaseConfig) -> Self {
        Self {
            visited: HashSet::new(),
            depth: 0,
            max_depth: config.max_cascade_depth,
        }
    }

    /// Record `id` of `collection`; false when it was already recorded.
    fn visit(&mut self, collection: &str, id: &Bson) -> bool {
        self.visited.insert((collection.to_string(), id.to_string()))
    }
}

/// Apply the delete rules registered against `schema` to the documents
/// matching `filter`, before they are deleted.
///
/// Every DENY rule is checked before any rule modifies data.
pub(crate) fn apply<S: DataSource>(
    db: &Database<S>,
    schema: &Schema,
    collection: &str,
    filter: &bson::Document,
    context: &mut CascadeContext,
) -> Result<(), Error> {
    let rules = db.registry().delete_rules(schema.name());
    if rules.iter().all(|entry| entry.rule == DeleteRule::DoNothing) {
        return Ok(());
    }

    let ids = matched_ids(db, schema, collection, filter)?;
    let ids: Vec<Bson> = ids
        .into_iter()
        .filter(|id| context.visit(collection, id))
        .collect();
    if ids.is_empty() {
        return Ok(());
    }

    for entry in rules.iter().filter(|e| e.rule == DeleteRule::Deny) {
        let refs = db
            .objects(&entry.related)?
            .filter([(format!("{}__in", entry.field), ids.clone())])?
            .count(true)?;
        if refs > 0 {
            return Err(Error::Operation(format!(
                "Could not delete document ({}.{} refers to it)",
                entry.related, entry.field
            )));
        }
    }

    for entry in &rules {
        let related = db
            .objects(&entry.related)?
            .filter([(format!("{}__in", entry.field), ids.clone())])?;
        match entry.rule {
            DeleteRule::DoNothing | DeleteRule::Deny => continue,
            DeleteRule::Cascade => {
                if context.depth >= context.max_depth {
                    return Err(Error::Operation(format!(
                        "cascade depth limit of {} exceeded deleting {}",
                        context.max_depth,
                        schema.name()
                    )));
                }
                context.depth += 1;
                let mut related = related;
                let deleted = related.delete_in(false, context)?;
                context.depth -= 1;
                debug!(
                    related = entry.related.as_str(),
                    field = entry.field.as_str(),
                    deleted,
                    "cascaded delete"
                );
            }
            DeleteRule::Nullify => {
                let updated =
                    related.update([(format!("unset__{}", entry.field), Bson::Int32(1))])?;
                debug!(
                    related = entry.related.as_str(),
                    field = entry.field.as_str(),
                    updated,
                    "nullified references"
                );
            }
            DeleteRule::Pull => {
                let updated = related.update([(
                    format!("pull_all__{}", entry.field),
                    Bson::Array(ids.clone()),
                )])?;
                debug!(
                    related = entry.related.as_str(),
                    field = entry.field.as_str(),
                    updated,
                    "pulled references"
                );
            }
        }
    }
    Ok(())
}

fn matched_ids<S: DataSource>(
    db: &Database<S>,
    schema: &Schema,
    collection: &str,
    filter: &bson::Document,
) -> Result<Vec<Bson>, Error> {
    let pk = schema
        .primary_key()
        .map_or(ID_KEY, |field| field.storage_name())
        .to_string();
    let options = FindOptions {
        projection: Some(doc! { pk.as_str(): 1 }),
        ..FindOptions::default()
    };
    let mut ids = Vec::new();
    for raw in db.source().find(collection, filter, &options)? {
        if let Some(id) = raw?.remove(&pk) {
            ids.push(id);
        }
    }
    Ok(ids)
}
