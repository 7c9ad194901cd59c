mod criterion;
mod error;
pub mod mutation;
mod operator;
mod sort;
mod translate;

pub use criterion::{Condition, Criterion, CriterionNode};
pub use error::QueryError;
pub use mutation::{FieldMutation, Mutation, MutationOp, parse_mutation};
pub use operator::Operator;
pub use sort::{Sort, SortDirection, sort_document};
pub use translate::{FieldTranslator, Verbatim};
