use std::cmp::Ordering;

use bson::{Bson, Document};

use super::{ElemMatch, Expression, Predicate};
use crate::values::{compare, lookup, value_eq};

/// Evaluate whether a document matches the given expression.
pub(crate) fn matches(doc: &Document, expr: &Expression) -> bool {
    match expr {
        Expression::True => true,
        Expression::And(children) => children.iter().all(|c| matches(doc, c)),
        Expression::Or(children) => children.iter().any(|c| matches(doc, c)),
        Expression::Nor(children) => !children.iter().any(|c| matches(doc, c)),
        Expression::Field(path, predicates) => {
            let values = lookup(doc, path);
            predicates.iter().all(|p| test_values(&values, p))
        }
    }
}

/// Test one predicate against every value found at a path.
///
/// A predicate holds when any value satisfies it; array values are tried as
/// a whole and element by element.
pub(crate) fn test_values(values: &[&Bson], predicate: &Predicate) -> bool {
    match predicate {
        Predicate::Eq(expected) => eq_any(values, expected),
        Predicate::Ne(expected) => !eq_any(values, expected),
        Predicate::Gt(bound) => cmp_any(values, bound, |o| o == Ordering::Greater),
        Predicate::Gte(bound) => cmp_any(values, bound, |o| o != Ordering::Less),
        Predicate::Lt(bound) => cmp_any(values, bound, |o| o == Ordering::Less),
        Predicate::Lte(bound) => cmp_any(values, bound, |o| o != Ordering::Greater),
        Predicate::In(options) => options.iter().any(|o| eq_any(values, o)),
        Predicate::Nin(options) => !options.iter().any(|o| eq_any(values, o)),
        Predicate::All(required) => {
            !required.is_empty() && required.iter().all(|r| eq_any(values, r))
        }
        Predicate::Size(n) => values
            .iter()
            .any(|v| matches!(v, Bson::Array(items) if items.len() == *n)),
        Predicate::Exists(expected) => values.is_empty() != *expected,
        Predicate::Regex(re) => any_scalar(values, |v| match v {
            Bson::String(s) => re.is_match(s),
            _ => false,
        }),
        Predicate::Not(inner) => !inner.iter().all(|p| test_values(values, p)),
        Predicate::ElemMatch(elem) => values.iter().any(|v| {
            let Bson::Array(items) = v else {
                return false;
            };
            items.iter().any(|item| match (elem, item) {
                (ElemMatch::Document(expr), Bson::Document(sub)) => matches(sub, expr),
                (ElemMatch::Value(preds), _) => preds.iter().all(|p| test_values(&[item], p)),
                _ => false,
            })
        }),
    }
}

/// `$eq: null` matches both missing fields and explicit null values.
fn eq_any(values: &[&Bson], expected: &Bson) -> bool {
    if matches!(expected, Bson::Null) && values.is_empty() {
        return true;
    }
    values.iter().any(|v| {
        value_eq(v, expected)
            || matches!(v, Bson::Array(items) if items.iter().any(|i| value_eq(i, expected)))
    })
}

fn cmp_any(values: &[&Bson], bound: &Bson, predicate: fn(Ordering) -> bool) -> bool {
    any_scalar(values, |v| compare(v, bound).is_some_and(predicate))
}

fn any_scalar(values: &[&Bson], test: impl Fn(&Bson) -> bool) -> bool {
    values.iter().any(|v| match v {
        Bson::Array(items) => items.iter().any(&test),
        other => test(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parse_filter;
    use bson::doc;

    fn check(doc: &Document, filter: Document) -> bool {
        matches(doc, &parse_filter(&filter).unwrap())
    }

    #[test]
    fn eq_traverses_arrays() {
        let d = doc! { "tags": ["a", "b"] };
        assert!(check(&d, doc! { "tags": "b" }));
        assert!(check(&d, doc! { "tags": ["a", "b"] }));
        assert!(!check(&d, doc! { "tags": "c" }));
    }

    #[test]
    fn eq_null_matches_missing() {
        let d = doc! { "a": 1 };
        assert!(check(&d, doc! { "b": Bson::Null }));
        assert!(!check(&d, doc! { "a": Bson::Null }));
    }

    #[test]
    fn ne_and_nin_negate() {
        let d = doc! { "status": "active" };
        assert!(check(&d, doc! { "status": { "$ne": "pending" } }));
        assert!(!check(&d, doc! { "status": { "$nin": ["active"] } }));
        assert!(check(&d, doc! { "missing": { "$ne": 1 } }));
    }

    #[test]
    fn range_respects_type_bracket() {
        let d = doc! { "age": 30 };
        assert!(check(&d, doc! { "age": { "$gte": 30, "$lt": 31.5 } }));
        assert!(!check(&d, doc! { "age": { "$gt": "a" } }));
    }

    #[test]
    fn exists_counts_null_as_present() {
        let d = doc! { "a": Bson::Null };
        assert!(check(&d, doc! { "a": { "$exists": true } }));
        assert!(check(&d, doc! { "b": { "$exists": false } }));
    }

    #[test]
    fn size_all_and_elem_match() {
        let d = doc! { "items": [{ "sku": "x", "qty": 2 }, { "sku": "y", "qty": 9 }], "n": [1, 5] };
        assert!(check(&d, doc! { "items": { "$size": 2 } }));
        assert!(check(&d, doc! { "n": { "$all": [5, 1] } }));
        assert!(check(&d, doc! { "items": { "$elemMatch": { "sku": "y", "qty": { "$gt": 5 } } } }));
        assert!(!check(&d, doc! { "items": { "$elemMatch": { "sku": "x", "qty": { "$gt": 5 } } } }));
        assert!(check(&d, doc! { "n": { "$elemMatch": { "$gt": 4 } } }));
    }

    #[test]
    fn not_and_nor() {
        let d = doc! { "name": "Alice" };
        assert!(check(&d, doc! { "name": { "$not": { "$regex": "^B" } } }));
        assert!(!check(&d, doc! { "$nor": [{ "name": "Alice" }] }));
    }

    #[test]
    fn dotted_paths_fan_out() {
        let d = doc! { "authors": [{ "name": "a" }, { "name": "b" }] };
        assert!(check(&d, doc! { "authors.name": "b" }));
        assert!(check(&d, doc! { "authors.1.name": "b" }));
        assert!(!check(&d, doc! { "authors.0.name": "b" }));
    }
}
