use bson::{Bson, Document};
use regex::Regex;

use super::{ElemMatch, Expression, Predicate};
use crate::error::StoreError;

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::InvalidQuery(msg.into())
}

/// Parse a filter document into an [`Expression`] tree.
///
/// Follows MongoDB query semantics:
/// - Top-level document is an implicit AND of all entries
/// - `{ "field": value }` is implicit `$eq`; a regex value is a `$regex` match
/// - `{ "field": { "$gt": v } }` uses operator sub-documents
/// - `{ "$or": [...] }` / `{ "$and": [...] }` / `{ "$nor": [...] }` for logical ops
/// - An empty document matches everything
pub(crate) fn parse_filter(doc: &Document) -> Result<Expression, StoreError> {
    let mut children = Vec::new();

    for (key, value) in doc {
        match key.as_str() {
            "$and" => children.push(Expression::And(parse_logical_array(key, value)?)),
            "$or" => children.push(Expression::Or(parse_logical_array(key, value)?)),
            "$nor" => children.push(Expression::Nor(parse_logical_array(key, value)?)),
            k if k.starts_with('$') => {
                return Err(invalid(format!("unknown top-level operator: {k}")));
            }
            _ => children.push(parse_field_condition(key, value)?),
        }
    }

    Ok(match children.len() {
        0 => Expression::True,
        1 => children.remove(0),
        _ => Expression::And(children),
    })
}

fn parse_logical_array(op: &str, value: &Bson) -> Result<Vec<Expression>, StoreError> {
    let Bson::Array(items) = value else {
        return Err(invalid(format!("{op} value must be an array")));
    };
    if items.is_empty() {
        return Err(invalid(format!("{op} array must not be empty")));
    }
    items
        .iter()
        .map(|item| match item {
            Bson::Document(sub) => parse_filter(sub),
            _ => Err(invalid(format!("{op} array elements must be documents"))),
        })
        .collect()
}

fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn parse_field_condition(field: &str, value: &Bson) -> Result<Expression, StoreError> {
    let predicates = match value {
        Bson::Document(sub) if is_operator_doc(sub) => parse_predicates(sub)?,
        Bson::RegularExpression(re) => vec![Predicate::Regex(compile(&re.pattern, &re.options)?)],
        other => vec![Predicate::Eq(other.clone())],
    };
    Ok(Expression::Field(field.to_string(), predicates))
}

/// Parse an operator sub-document like `{ "$gt": 21, "$lte": 100 }`.
pub(crate) fn parse_predicates(doc: &Document) -> Result<Vec<Predicate>, StoreError> {
    let mut predicates = Vec::new();

    for (op, value) in doc {
        let predicate = match op.as_str() {
            "$eq" => Predicate::Eq(value.clone()),
            "$ne" => Predicate::Ne(value.clone()),
            "$gt" => Predicate::Gt(value.clone()),
            "$gte" => Predicate::Gte(value.clone()),
            "$lt" => Predicate::Lt(value.clone()),
            "$lte" => Predicate::Lte(value.clone()),
            "$in" => Predicate::In(list(op, value)?),
            "$nin" => Predicate::Nin(list(op, value)?),
            "$all" => Predicate::All(list(op, value)?),
            "$size" => match value {
                Bson::Int32(n) if *n >= 0 => Predicate::Size(*n as usize),
                Bson::Int64(n) if *n >= 0 => Predicate::Size(*n as usize),
                _ => return Err(invalid("$size value must be a non-negative integer")),
            },
            "$exists" => match value {
                Bson::Boolean(b) => Predicate::Exists(*b),
                Bson::Int32(n) => Predicate::Exists(*n != 0),
                Bson::Int64(n) => Predicate::Exists(*n != 0),
                _ => return Err(invalid("$exists value must be a boolean")),
            },
            "$regex" => {
                let options = match doc.get("$options") {
                    None => "",
                    Some(Bson::String(s)) => s.as_str(),
                    Some(_) => return Err(invalid("$options value must be a string")),
                };
                match value {
                    Bson::String(pattern) => Predicate::Regex(compile(pattern, options)?),
                    Bson::RegularExpression(re) => {
                        Predicate::Regex(compile(&re.pattern, &re.options)?)
                    }
                    _ => return Err(invalid("$regex value must be a string")),
                }
            }
            "$options" => {
                if !doc.contains_key("$regex") {
                    return Err(invalid("$options without $regex"));
                }
                continue;
            }
            "$not" => match value {
                Bson::Document(sub) if is_operator_doc(sub) => {
                    Predicate::Not(parse_predicates(sub)?)
                }
                Bson::RegularExpression(re) => {
                    Predicate::Not(vec![Predicate::Regex(compile(&re.pattern, &re.options)?)])
                }
                _ => return Err(invalid("$not value must be an operator document or regex")),
            },
            "$elemMatch" => match value {
                Bson::Document(sub) if is_operator_doc(sub) => {
                    Predicate::ElemMatch(ElemMatch::Value(parse_predicates(sub)?))
                }
                Bson::Document(sub) => {
                    Predicate::ElemMatch(ElemMatch::Document(Box::new(parse_filter(sub)?)))
                }
                _ => return Err(invalid("$elemMatch value must be a document")),
            },
            k => return Err(invalid(format!("unknown field operator: {k}"))),
        };
        predicates.push(predicate);
    }

    if predicates.is_empty() {
        return Err(invalid("empty operator document"));
    }
    Ok(predicates)
}

fn list(op: &str, value: &Bson) -> Result<Vec<Bson>, StoreError> {
    match value {
        Bson::Array(items) => Ok(items.clone()),
        _ => Err(invalid(format!("{op} value must be an array"))),
    }
}

fn compile(pattern: &str, options: &str) -> Result<Regex, StoreError> {
    let mut full = String::with_capacity(pattern.len() + options.len() + 4);
    if !options.is_empty() {
        full.push_str("(?");
        for ch in options.chars() {
            match ch {
                'i' | 's' | 'm' | 'x' => full.push(ch),
                c => return Err(invalid(format!("unknown regex option: {c}"))),
            }
        }
        full.push(')');
    }
    full.push_str(pattern);
    Regex::new(&full).map_err(|e| invalid(format!("invalid regex pattern: {e}")))
}
