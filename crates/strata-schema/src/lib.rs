mod error;
mod field;
mod registry;
mod rules;
mod schema;

pub use error::SchemaError;
pub use field::{Converter, DefaultValue, FieldDescriptor, FieldKind, KindConverter};
pub use registry::{Registry, RegistryBuilder};
pub use rules::{DeleteRule, DeleteRuleEntry};
pub use schema::{CLS_KEY, ID_KEY, Schema, SchemaBuilder, defaults};
