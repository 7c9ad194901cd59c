use std::collections::HashSet;

use bson::{Bson, Document};
use strata_schema::FieldKind;

use crate::document::{DocumentData, Value, encode, encode_field};
use crate::error::Error;

/// Logical paths assigned since load or the last save, in marking order.
///
/// Marking `a` drops tracked `a.*` paths; marking `a.b` while `a` is tracked
/// changes nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    paths: Vec<String>,
}

impl ChangeSet {
    pub fn mark(&mut self, path: &str) {
        if self.covers(path) {
            return;
        }
        self.paths.retain(|p| !is_below(p, path));
        self.paths.push(path.to_string());
    }

    /// Whether `path` or one of its ancestors is tracked.
    pub fn covers(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path || is_below(path, p))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }

    pub fn into_vec(self) -> Vec<String> {
        self.paths
    }
}

/// `path` lies strictly below `ancestor`.
fn is_below(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'.'
}

/// Own changes plus those of embedded documents reachable through fields,
/// lists and maps. Reference fields are not followed. `visited` holds the
/// identities of embedded documents already walked.
pub(crate) fn changed_fields(data: &DocumentData, visited: &mut HashSet<usize>) -> Vec<String> {
    let mut changed = data.changes.clone();
    for field in data.schema.fields() {
        let name = field.name();
        if changed.covers(name) || field.kind().reference_target().is_some() {
            continue;
        }
        if let Some(value) = data.values.get(name) {
            nested_changes(value, name, visited, &mut changed);
        }
    }
    changed.into_vec()
}

fn nested_changes(value: &Value, prefix: &str, visited: &mut HashSet<usize>, out: &mut ChangeSet) {
    match value {
        Value::Embedded(embedded) => {
            // Checked before locking: a cycle would otherwise re-enter the lock.
            if !visited.insert(embedded.identity()) {
                return;
            }
            let inner = embedded.read();
            for path in changed_fields(&inner, visited) {
                out.mark(&format!("{prefix}.{path}"));
            }
        }
        Value::List(items) => {
            for (i, item) in items.iter().enumerate() {
                nested_changes(item, &format!("{prefix}.{i}"), visited, out);
            }
        }
        Value::Map(entries) => {
            for (key, item) in entries {
                nested_changes(item, &format!("{prefix}.{key}"), visited, out);
            }
        }
        Value::Bson(_) => {}
    }
}

pub(crate) fn clear(data: &mut DocumentData, visited: &mut HashSet<usize>) {
    data.changes.clear();
    for value in data.values.values() {
        clear_nested(value, visited);
    }
}

fn clear_nested(value: &Value, visited: &mut HashSet<usize>) {
    match value {
        Value::Embedded(embedded) => {
            if !visited.insert(embedded.identity()) {
                return;
            }
            let mut inner = embedded.write();
            inner.changes.clear();
            for value in inner.values.values() {
                clear_nested(value, visited);
            }
        }
        Value::List(items) => items.iter().for_each(|item| clear_nested(item, visited)),
        Value::Map(entries) => entries
            .iter()
            .for_each(|(_, item)| clear_nested(item, visited)),
        Value::Bson(_) => {}
    }
}

/// The current value at a changed path, read from the live object graph.
struct Found {
    storage_path: Vec<String>,
    value: Bson,
    /// Declared default when the path ends on a field.
    default: Option<Bson>,
}

/// Compute `($set, $unset)` for `paths`.
///
/// Values that are empty (null, `""`, `[]`, `{}`) become `$unset` when they
/// equal the field's resolved default, or when they are null and no default
/// is declared. Numbers and booleans are always set.
pub(crate) fn delta(data: &DocumentData, paths: &[String]) -> Result<(Document, Document), Error> {
    let mut set = Document::new();
    let mut unset = Document::new();
    for path in paths {
        let segments: Vec<&str> = path.split('.').collect();
        let mut found = Found {
            storage_path: Vec::with_capacity(segments.len()),
            value: Bson::Null,
            default: None,
        };
        find_in_document(data, &segments, &mut found)?;
        let key = found.storage_path.join(".");

        if !is_empty(&found.value) {
            set.insert(key, found.value);
            continue;
        }
        let default = found.default.unwrap_or(Bson::Null);
        if found.value == default {
            unset.insert(key, 1);
        } else {
            set.insert(key, found.value);
        }
    }
    Ok((set, unset))
}

fn is_empty(value: &Bson) -> bool {
    match value {
        Bson::Null => true,
        Bson::String(s) => s.is_empty(),
        Bson::Array(items) => items.is_empty(),
        Bson::Document(doc) => doc.is_empty(),
        _ => false,
    }
}

fn find_in_document(data: &DocumentData, segments: &[&str], found: &mut Found) -> Result<(), Error> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(());
    };
    let field = data.field(head)?;
    found.storage_path.push(field.storage_name().to_string());
    let value = data.values.get(field.name());
    if rest.is_empty() {
        found.default = field.resolve_default();
        if let Some(value) = value {
            found.value = encode_field(value, field, &mut HashSet::new())?;
        }
        return Ok(());
    }
    match value {
        Some(value) => find_in_value(value, field.kind(), field.name(), rest, found),
        None => {
            push_verbatim(rest, found);
            Ok(())
        }
    }
}

fn find_in_value(
    value: &Value,
    kind: &FieldKind,
    owner: &str,
    segments: &[&str],
    found: &mut Found,
) -> Result<(), Error> {
    let Some((head, rest)) = segments.split_first() else {
        found.value = encode(value, kind, owner, &mut HashSet::new())?;
        return Ok(());
    };
    let element = kind.element();
    match value {
        Value::Embedded(embedded) => {
            let inner = embedded.read();
            find_in_document(&inner, segments, found)
        }
        Value::List(items) => {
            found.storage_path.push(head.to_string());
            match head.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(item) => find_in_value(item, element, owner, rest, found),
                None => {
                    push_verbatim(rest, found);
                    Ok(())
                }
            }
        }
        Value::Map(entries) => {
            found.storage_path.push(head.to_string());
            match entries.iter().find(|(k, _)| k.as_str() == *head) {
                Some((_, item)) => find_in_value(item, element, owner, rest, found),
                None => {
                    push_verbatim(rest, found);
                    Ok(())
                }
            }
        }
        Value::Bson(raw) => {
            found.storage_path.extend(segments.iter().map(|s| s.to_string()));
            found.value = raw_at(raw, segments).cloned().unwrap_or(Bson::Null);
            Ok(())
        }
    }
}

fn push_verbatim(segments: &[&str], found: &mut Found) {
    found
        .storage_path
        .extend(segments.iter().map(|s| s.to_string()));
}

fn raw_at<'a>(value: &'a Bson, segments: &[&str]) -> Option<&'a Bson> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value);
    };
    let next = match value {
        Bson::Document(doc) => doc.get(*head)?,
        Bson::Array(items) => items.get(head.parse::<usize>().ok()?)?,
        _ => return None,
    };
    raw_at(next, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_is_idempotent() {
        let mut set = ChangeSet::default();
        set.mark("name");
        set.mark("name");
        assert_eq!(set.iter().collect::<Vec<_>>(), ["name"]);
    }

    #[test]
    fn parent_supersedes_children() {
        let mut set = ChangeSet::default();
        set.mark("address.city");
        set.mark("address.zip");
        set.mark("addressbook");
        set.mark("address");
        assert_eq!(set.iter().collect::<Vec<_>>(), ["addressbook", "address"]);

        set.mark("address.city");
        assert_eq!(set.iter().count(), 2);
        assert!(set.covers("address.city"));
        assert!(!set.contains("address.city"));
    }

    #[test]
    fn emptiness() {
        assert!(is_empty(&Bson::Null));
        assert!(is_empty(&Bson::String(String::new())));
        assert!(is_empty(&Bson::Array(vec![])));
        assert!(!is_empty(&Bson::Int32(0)));
        assert!(!is_empty(&Bson::Boolean(false)));
    }

    #[test]
    fn cyclic_embedded_changes_are_collected_once() {
        use strata_schema::{FieldDescriptor, Registry, SchemaBuilder};

        use crate::document::{Document as Instance, EmbeddedDocument};

        let reg = Registry::builder()
            .register(
                SchemaBuilder::embedded("Node")
                    .field(FieldDescriptor::new("label", FieldKind::String))
                    .field(FieldDescriptor::new("next", FieldKind::Embedded("Node".into()))),
            )
            .unwrap()
            .register(
                SchemaBuilder::new("Ring")
                    .field(FieldDescriptor::new("head", FieldKind::Embedded("Node".into()))),
            )
            .unwrap()
            .build()
            .unwrap();
        let node = reg.schema("Node").unwrap();
        let a = EmbeddedDocument::new(&reg, node.clone()).unwrap();
        let b = EmbeddedDocument::new(&reg, node.clone()).unwrap();
        a.set("next", b.clone()).unwrap();
        b.set("next", a.clone()).unwrap();
        let mut ring = Instance::new(&reg, reg.schema("Ring").unwrap().clone()).unwrap();
        ring.set("head", a).unwrap();
        ring.clear_changes();
        assert!(ring.changed_fields().is_empty());

        b.set("label", "x").unwrap();
        assert_eq!(ring.changed_fields(), ["head.next.label"]);
        let (set, unset) = ring.delta().unwrap();
        assert_eq!(set, bson::doc! { "head.next.label": "x" });
        assert!(unset.is_empty());
    }
}
