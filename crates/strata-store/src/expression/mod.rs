mod eval;
mod parse;

use bson::{Bson, Document};
use regex::Regex;

use crate::error::StoreError;

pub(crate) use eval::{matches, test_values};
pub(crate) use parse::{parse_filter, parse_predicates};

/// A compiled filter document.
///
/// Owns its values so it can be evaluated against any number of documents
/// after a single parse.
#[derive(Debug, Clone)]
pub(crate) enum Expression {
    /// Empty filter; matches everything.
    True,
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Nor(Vec<Expression>),
    /// Conjunction of predicates on the values found at one path.
    Field(String, Vec<Predicate>),
}

#[derive(Debug, Clone)]
pub(crate) enum Predicate {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    All(Vec<Bson>),
    Size(usize),
    Exists(bool),
    Regex(Regex),
    Not(Vec<Predicate>),
    ElemMatch(ElemMatch),
}

#[derive(Debug, Clone)]
pub(crate) enum ElemMatch {
    /// `{"$elemMatch": {"field": ...}}` against document elements.
    Document(Box<Expression>),
    /// `{"$elemMatch": {"$gt": 3}}` against the elements themselves.
    Value(Vec<Predicate>),
}

/// Parse and evaluate a filter against one document.
pub fn filter_matches(doc: &Document, filter: &Document) -> Result<bool, StoreError> {
    let expr = parse_filter(filter)?;
    Ok(matches(doc, &expr))
}
