use std::cmp::Ordering;

use bson::{Bson, Document};

/// Collect every value reachable at a dotted path.
///
/// Numeric segments index into arrays; any other segment applied to an array
/// fans out over its document elements. A path that doesn't exist yields
/// nothing, so `$exists` and `$eq: null` can tell missing from present.
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first()
        && let Some(value) = doc.get(*head)
    {
        lookup_in(value, rest, &mut out);
    }
    out
}

fn lookup_in<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Bson::Document(doc) => {
            if let Some(next) = doc.get(*head) {
                lookup_in(next, rest, out);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    lookup_in(item, rest, out);
                }
                return;
            }
            for item in items {
                if let Bson::Document(_) = item {
                    lookup_in(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// First value at a dotted path, used for sort keys and index keys.
pub(crate) fn first_at<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    lookup(doc, path).into_iter().next()
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Equality with numeric cross-type coercion (`Int32(1) == Double(1.0)`).
pub(crate) fn value_eq(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => x == y,
        (Bson::Int64(x), Bson::Int64(y)) => x == y,
        (Bson::Int32(x), Bson::Int64(y)) | (Bson::Int64(y), Bson::Int32(x)) => {
            (*x as i64) == *y
        }
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis() == y.timestamp_millis(),
        (Bson::Array(x), Bson::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| value_eq(a, b))
        }
        (Bson::Document(x), Bson::Document(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && value_eq(va, vb))
        }
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

/// Ordering between two values of comparable type, `None` across types.
///
/// Range operators only match within a type bracket, so `{"$gt": 3}` never
/// matches a string.
pub(crate) fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            Some(x.timestamp_millis().cmp(&y.timestamp_millis()))
        }
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::Int32(x), Bson::Int32(y)) => Some(x.cmp(y)),
        (Bson::Int64(x), Bson::Int64(y)) => Some(x.cmp(y)),
        (Bson::Int32(x), Bson::Int64(y)) => Some((*x as i64).cmp(y)),
        (Bson::Int64(x), Bson::Int32(y)) => Some(x.cmp(&(*y as i64))),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

/// Total order used by sort: missing sorts with null, then values are ordered
/// by type bracket and within a bracket by [`compare`].
pub(crate) fn sort_cmp(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let a = a.unwrap_or(&Bson::Null);
    let b = b.unwrap_or(&Bson::Null);
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| compare(a, b).unwrap_or(Ordering::Equal))
}

/// Append `value` unless an equal value is already present.
pub(crate) fn push_unique(values: &mut Vec<Bson>, value: Bson) {
    if !values.iter().any(|v| value_eq(v, &value)) {
        values.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn lookup_nested_and_indexed() {
        let doc = doc! { "a": { "b": [10, 20] }, "items": [{ "x": 1 }, { "x": 2 }, 5] };
        assert_eq!(lookup(&doc, "a.b.1"), vec![&Bson::Int32(20)]);
        assert_eq!(
            lookup(&doc, "items.x"),
            vec![&Bson::Int32(1), &Bson::Int32(2)]
        );
        assert!(lookup(&doc, "a.c").is_empty());
    }

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(value_eq(&Bson::Int32(5), &Bson::Double(5.0)));
        assert!(value_eq(&Bson::Int64(5), &Bson::Int32(5)));
        assert!(!value_eq(&Bson::Int32(5), &Bson::String("5".into())));
    }

    #[test]
    fn compare_only_within_bracket() {
        assert_eq!(
            compare(&Bson::Int32(1), &Bson::Double(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(compare(&Bson::Int32(1), &Bson::String("a".into())), None);
    }

    #[test]
    fn sort_puts_missing_first() {
        assert_eq!(sort_cmp(None, Some(&Bson::Int32(0))), Ordering::Less);
        assert_eq!(sort_cmp(None, Some(&Bson::Null)), Ordering::Equal);
    }
}
