use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::error::StoreError;
use crate::expression::{matches, parse_filter, parse_predicates, test_values};
use crate::values::{compare, push_unique, value_eq};

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::InvalidOperation(msg.into())
}

/// A mutable location inside a document: a named field or an array element.
pub(crate) enum Slot<'a> {
    Field(&'a mut Document, String),
    Element(&'a mut Vec<Bson>, usize),
}

impl Slot<'_> {
    fn get(&self) -> Option<&Bson> {
        match self {
            Slot::Field(doc, key) => doc.get(key.as_str()),
            Slot::Element(items, index) => items.get(*index),
        }
    }

    fn get_mut(&mut self) -> Option<&mut Bson> {
        match self {
            Slot::Field(doc, key) => doc.get_mut(key.as_str()),
            Slot::Element(items, index) => items.get_mut(*index),
        }
    }

    fn set(self, value: Bson) {
        match self {
            Slot::Field(doc, key) => {
                doc.insert(key, value);
            }
            Slot::Element(items, index) => {
                if items.len() <= index {
                    items.resize(index + 1, Bson::Null);
                }
                items[index] = value;
            }
        }
    }

    /// Removing an array element leaves a null in its place, as MongoDB does.
    fn remove(self) -> Option<Bson> {
        match self {
            Slot::Field(doc, key) => doc.remove(&key),
            Slot::Element(items, index) => items
                .get_mut(index)
                .map(|item| std::mem::replace(item, Bson::Null)),
        }
    }
}

/// Resolve a dotted path to its slot. With `create`, missing intermediate
/// documents are created; without it, a missing intermediate yields `None`.
pub(crate) fn resolve_slot<'a>(
    doc: &'a mut Document,
    path: &str,
    create: bool,
) -> Result<Option<Slot<'a>>, StoreError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(invalid(format!("invalid field path '{path}'")));
    }
    slot_in_doc(doc, &segments, create, path)
}

fn slot_in_doc<'a>(
    doc: &'a mut Document,
    segments: &[&str],
    create: bool,
    path: &str,
) -> Result<Option<Slot<'a>>, StoreError> {
    let Some((head, rest)) = segments.split_first() else {
        return Err(invalid("empty field path"));
    };
    if rest.is_empty() {
        return Ok(Some(Slot::Field(doc, head.to_string())));
    }
    let missing = matches!(doc.get(*head), None | Some(Bson::Null));
    if missing {
        if !create {
            return Ok(None);
        }
        doc.insert(head.to_string(), Document::new());
    }
    match doc.get_mut(*head) {
        Some(Bson::Document(sub)) => slot_in_doc(sub, rest, create, path),
        Some(Bson::Array(items)) => slot_in_array(items, rest, create, path),
        _ => Err(invalid(format!(
            "field path '{path}': intermediate '{head}' is not a document"
        ))),
    }
}

fn slot_in_array<'a>(
    items: &'a mut Vec<Bson>,
    segments: &[&str],
    create: bool,
    path: &str,
) -> Result<Option<Slot<'a>>, StoreError> {
    let Some((head, rest)) = segments.split_first() else {
        return Err(invalid("empty field path"));
    };
    let index: usize = head
        .parse()
        .map_err(|_| invalid(format!("field path '{path}': '{head}' is not an array index")))?;
    if rest.is_empty() {
        return Ok(Some(Slot::Element(items, index)));
    }
    if index >= items.len() {
        if !create {
            return Ok(None);
        }
        items.resize(index + 1, Bson::Null);
    }
    if create && items[index] == Bson::Null {
        items[index] = Bson::Document(Document::new());
    }
    match items.get_mut(index) {
        Some(Bson::Document(sub)) => slot_in_doc(sub, rest, create, path),
        Some(Bson::Array(inner)) => slot_in_array(inner, rest, create, path),
        _ => Ok(None),
    }
}

/// Whether an update document is a full replacement (no `$` operators).
pub(crate) fn is_replacement(update: &Document) -> bool {
    !update.keys().any(|k| k.starts_with('$'))
}

/// Apply an update document in place. Returns whether anything changed.
pub(crate) fn apply_update(doc: &mut Document, update: &Document) -> Result<bool, StoreError> {
    apply(doc, update, false)
}

/// Apply an update to a freshly seeded upsert document; `$setOnInsert`
/// takes effect only here.
pub(crate) fn apply_upsert(doc: &mut Document, update: &Document) -> Result<bool, StoreError> {
    apply(doc, update, true)
}

fn apply(doc: &mut Document, update: &Document, inserting: bool) -> Result<bool, StoreError> {
    if update.is_empty() {
        return Err(invalid("update document must not be empty"));
    }
    if is_replacement(update) {
        let id = doc.get("_id").cloned();
        let mut replaced = Document::new();
        if let Some(id) = id {
            replaced.insert("_id", id);
        }
        for (k, v) in update {
            if k != "_id" {
                replaced.insert(k.clone(), v.clone());
            }
        }
        let changed = replaced != *doc;
        *doc = replaced;
        return Ok(changed);
    }

    let mut changed = false;
    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(invalid(format!("{op} value must be a document")));
        };
        if op == "$setOnInsert" && !inserting {
            continue;
        }
        for (path, value) in fields {
            if path == "_id" && op != "$setOnInsert" {
                return Err(invalid("performing an update on the path '_id' would modify the immutable field '_id'"));
            }
            changed |= match op.as_str() {
                "$set" | "$setOnInsert" => op_set(doc, path, value)?,
                "$unset" => op_unset(doc, path)?,
                "$inc" => op_arith(doc, path, value, "$inc")?,
                "$mul" => op_arith(doc, path, value, "$mul")?,
                "$min" => op_bound(doc, path, value, Ordering::Less)?,
                "$max" => op_bound(doc, path, value, Ordering::Greater)?,
                "$rename" => op_rename(doc, path, value)?,
                "$push" => op_push(doc, path, value, false)?,
                "$addToSet" => op_push(doc, path, value, true)?,
                "$pop" => op_pop(doc, path, value)?,
                "$pull" => op_pull(doc, path, value)?,
                "$pullAll" => op_pull_all(doc, path, value)?,
                other => return Err(invalid(format!("unknown update operator: {other}"))),
            };
        }
    }
    Ok(changed)
}

/// `$set`: Set field to value. Creates the field and missing parents.
fn op_set(doc: &mut Document, path: &str, value: &Bson) -> Result<bool, StoreError> {
    let Some(slot) = resolve_slot(doc, path, true)? else {
        return Ok(false);
    };
    if slot.get() == Some(value) {
        return Ok(false);
    }
    slot.set(value.clone());
    Ok(true)
}

/// `$unset`: Remove field from document.
fn op_unset(doc: &mut Document, path: &str) -> Result<bool, StoreError> {
    match resolve_slot(doc, path, false)? {
        Some(slot) => Ok(slot.remove().is_some()),
        None => Ok(false),
    }
}

/// `$inc` / `$mul` with integer overflow promotion to i64, and any double
/// operand promoting to f64. A missing field starts at 0.
fn op_arith(doc: &mut Document, path: &str, amount: &Bson, op: &str) -> Result<bool, StoreError> {
    let Some(slot) = resolve_slot(doc, path, true)? else {
        return Ok(false);
    };
    let zero = match amount {
        Bson::Int32(_) => Bson::Int32(0),
        Bson::Int64(_) => Bson::Int64(0),
        Bson::Double(_) => Bson::Double(0.0),
        _ => return Err(invalid(format!("{op}: cannot apply a non-numeric amount to '{path}'"))),
    };
    let current = slot.get().cloned().unwrap_or(zero);
    let multiply = op == "$mul";

    let result = match (&current, amount) {
        (Bson::Int32(a), Bson::Int32(b)) => {
            let checked = if multiply { a.checked_mul(*b) } else { a.checked_add(*b) };
            match checked {
                Some(n) => Bson::Int32(n),
                None if multiply => Bson::Int64(*a as i64 * *b as i64),
                None => Bson::Int64(*a as i64 + *b as i64),
            }
        }
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let a = as_i64(&current);
            let b = as_i64(amount);
            Bson::Int64(if multiply { a.wrapping_mul(b) } else { a.wrapping_add(b) })
        }
        (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_), _) => {
            let a = as_f64(&current);
            let b = as_f64(amount);
            Bson::Double(if multiply { a * b } else { a + b })
        }
        _ => {
            return Err(invalid(format!("{op}: field '{path}' is not numeric")));
        }
    };

    slot.set(result);
    Ok(true)
}

fn as_i64(value: &Bson) -> i64 {
    match value {
        Bson::Int32(n) => *n as i64,
        Bson::Int64(n) => *n,
        Bson::Double(n) => *n as i64,
        _ => 0,
    }
}

fn as_f64(value: &Bson) -> f64 {
    match value {
        Bson::Int32(n) => *n as f64,
        Bson::Int64(n) => *n as f64,
        Bson::Double(n) => *n,
        _ => 0.0,
    }
}

/// `$min` / `$max`: Replace the field when `value` compares `wanted` to it.
fn op_bound(doc: &mut Document, path: &str, value: &Bson, wanted: Ordering) -> Result<bool, StoreError> {
    let Some(slot) = resolve_slot(doc, path, true)? else {
        return Ok(false);
    };
    let replace = match slot.get() {
        None => true,
        Some(current) => compare(value, current) == Some(wanted),
    };
    if replace {
        slot.set(value.clone());
    }
    Ok(replace)
}

/// `$rename`: Move a field to a new path.
fn op_rename(doc: &mut Document, path: &str, target: &Bson) -> Result<bool, StoreError> {
    let Bson::String(target) = target else {
        return Err(invalid(format!("$rename target for '{path}' must be a string")));
    };
    let value = match resolve_slot(doc, path, false)? {
        Some(slot @ Slot::Field(..)) => slot.remove(),
        Some(Slot::Element(..)) => {
            return Err(invalid(format!("$rename source '{path}' may not be an array element")));
        }
        None => None,
    };
    let Some(value) = value else {
        return Ok(false);
    };
    if let Some(slot) = resolve_slot(doc, target, true)? {
        slot.set(value);
    }
    Ok(true)
}

fn each_values(value: &Bson) -> Vec<Bson> {
    match value {
        Bson::Document(d) => match d.get("$each") {
            Some(Bson::Array(items)) => items.clone(),
            _ => vec![value.clone()],
        },
        other => vec![other.clone()],
    }
}

/// `$push` / `$addToSet`: Append to an array field, creating it if missing.
/// Both accept `{"$each": [...]}`.
fn op_push(doc: &mut Document, path: &str, value: &Bson, unique: bool) -> Result<bool, StoreError> {
    let Some(mut slot) = resolve_slot(doc, path, true)? else {
        return Ok(false);
    };
    let values = each_values(value);
    let op = if unique { "$addToSet" } else { "$push" };
    match slot.get_mut() {
        Some(Bson::Array(items)) => {
            let before = items.len();
            for v in values {
                if unique {
                    push_unique(items, v);
                } else {
                    items.push(v);
                }
            }
            Ok(items.len() != before)
        }
        Some(_) => Err(invalid(format!("{op}: field '{path}' is not an array"))),
        None => {
            let mut items = Vec::new();
            for v in values {
                if unique {
                    push_unique(&mut items, v);
                } else {
                    items.push(v);
                }
            }
            slot.set(Bson::Array(items));
            Ok(true)
        }
    }
}

/// `$pop`: Remove the last (`1`) or first (`-1`) element.
fn op_pop(doc: &mut Document, path: &str, direction: &Bson) -> Result<bool, StoreError> {
    let from_front = match direction {
        Bson::Int32(-1) | Bson::Int64(-1) => true,
        Bson::Int32(1) | Bson::Int64(1) => false,
        _ => return Err(invalid(format!("$pop: value for '{path}' must be 1 or -1"))),
    };
    let Some(mut slot) = resolve_slot(doc, path, false)? else {
        return Ok(false);
    };
    match slot.get_mut() {
        Some(Bson::Array(items)) if items.is_empty() => Ok(false),
        Some(Bson::Array(items)) => {
            if from_front {
                items.remove(0);
            } else {
                items.pop();
            }
            Ok(true)
        }
        Some(_) => Err(invalid(format!("$pop: field '{path}' is not an array"))),
        None => Ok(false),
    }
}

/// `$pull`: Remove elements equal to a value or matching a condition.
fn op_pull(doc: &mut Document, path: &str, condition: &Bson) -> Result<bool, StoreError> {
    let test: Box<dyn Fn(&Bson) -> bool> = match condition {
        Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')) => {
            let preds = parse_predicates(d)?;
            Box::new(move |item: &Bson| preds.iter().all(|p| test_values(&[item], p)))
        }
        Bson::Document(d) => {
            let expr = parse_filter(d)?;
            Box::new(move |item: &Bson| matches!(item, Bson::Document(sub) if matches(sub, &expr)))
        }
        other => {
            let other = other.clone();
            Box::new(move |item: &Bson| value_eq(item, &other))
        }
    };
    retain_array(doc, path, "$pull", |item| !test(item))
}

/// `$pullAll`: Remove every element equal to one of the listed values.
fn op_pull_all(doc: &mut Document, path: &str, values: &Bson) -> Result<bool, StoreError> {
    let Bson::Array(values) = values else {
        return Err(invalid(format!("$pullAll: value for '{path}' must be an array")));
    };
    retain_array(doc, path, "$pullAll", |item| {
        !values.iter().any(|v| value_eq(item, v))
    })
}

fn retain_array(
    doc: &mut Document,
    path: &str,
    op: &str,
    keep: impl Fn(&Bson) -> bool,
) -> Result<bool, StoreError> {
    let Some(mut slot) = resolve_slot(doc, path, false)? else {
        return Ok(false);
    };
    match slot.get_mut() {
        Some(Bson::Array(items)) => {
            let before = items.len();
            items.retain(|item| keep(item));
            Ok(items.len() != before)
        }
        Some(_) => Err(invalid(format!("{op}: field '{path}' is not an array"))),
        None => Ok(false),
    }
}

/// Seed a document for an upsert from the equality terms of a filter.
pub(crate) fn upsert_seed(filter: &Document) -> Result<Document, StoreError> {
    let mut seed = Document::new();
    collect_equalities(filter, &mut seed)?;
    Ok(seed)
}

fn collect_equalities(filter: &Document, seed: &mut Document) -> Result<(), StoreError> {
    for (key, value) in filter {
        if key == "$and" {
            if let Bson::Array(items) = value {
                for item in items {
                    if let Bson::Document(sub) = item {
                        collect_equalities(sub, seed)?;
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        let eq = match value {
            Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')) => {
                d.get("$eq").cloned()
            }
            Bson::RegularExpression(_) => None,
            other => Some(other.clone()),
        };
        if let Some(eq) = eq {
            op_set(seed, key, &eq)?;
        }
    }
    Ok(())
}
