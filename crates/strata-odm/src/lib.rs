mod cascade;
mod changes;
mod config;
mod cursor;
pub(crate) mod database;
mod document;
mod error;
mod fields;
mod observer;
mod projection;

pub use bson::{Bson, doc, oid::ObjectId};
pub use changes::ChangeSet;
pub use config::DatabaseConfig;
pub use cursor::{Documents, ModifyOptions, Phase, QueryCursor, RawCursor, ScalarCursor};
pub use database::Database;
pub use document::{Document, EmbeddedDocument, Value};
pub use error::Error;
pub use fields::{SchemaTranslator, Segment, resolve, translate};
pub use observer::Observer;
pub use projection::{ProjectionMode, ProjectionSet};
pub use strata_query::{Condition, Criterion, CriterionNode, Mutation, MutationOp, Operator};
pub use strata_schema::{
    DeleteRule, FieldDescriptor, FieldKind, Registry, Schema, SchemaBuilder, SchemaError,
};
pub use strata_store::{DataSource, ReadPreference};
