use std::collections::HashMap;

use bson::{Bson, Document};

use crate::error::StoreError;

/// A pre-built tree of dot-notation field paths.
///
/// Given `["foo.bar.baz", "foo.bar.bux", "name"]`, builds:
/// ```text
/// { "foo": Branch({ "bar": Branch({ "baz": Leaf, "bux": Leaf }) }),
///   "name": Leaf }
/// ```
///
/// Built once per query, reused across all documents.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldTree {
    /// Take (or drop) the entire field value.
    Leaf,
    /// Recurse into sub-fields.
    Branch(HashMap<String, FieldTree>),
}

impl FieldTree {
    pub(crate) fn from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> HashMap<String, FieldTree> {
        let mut root = HashMap::new();
        for path in paths {
            insert_path(&mut root, path);
        }
        root
    }
}

fn insert_path(map: &mut HashMap<String, FieldTree>, remaining: &str) {
    match remaining.split_once('.') {
        // A leaf takes the whole field and overrides any existing branch
        // ("foo" and "foo.bar" together keep all of "foo").
        None => {
            map.insert(remaining.to_string(), FieldTree::Leaf);
        }
        Some((top, rest)) => {
            let entry = map
                .entry(top.to_string())
                .or_insert_with(|| FieldTree::Branch(HashMap::new()));
            if let FieldTree::Branch(children) = entry {
                insert_path(children, rest);
            }
        }
    }
}

fn include(doc: &Document, tree: &HashMap<String, FieldTree>) -> Document {
    let mut out = Document::new();
    for (key, value) in doc {
        match tree.get(key.as_str()) {
            Some(FieldTree::Leaf) => {
                out.insert(key.clone(), value.clone());
            }
            Some(FieldTree::Branch(children)) => match value {
                Bson::Document(sub) => {
                    out.insert(key.clone(), include(sub, children));
                }
                Bson::Array(items) => {
                    let projected: Vec<Bson> = items
                        .iter()
                        .filter_map(|item| match item {
                            Bson::Document(sub) => Some(Bson::Document(include(sub, children))),
                            _ => None,
                        })
                        .collect();
                    out.insert(key.clone(), projected);
                }
                _ => {}
            },
            None => {}
        }
    }
    out
}

fn exclude(doc: &mut Document, tree: &HashMap<String, FieldTree>) {
    for (key, node) in tree {
        match node {
            FieldTree::Leaf => {
                doc.remove(key);
            }
            FieldTree::Branch(children) => match doc.get_mut(key) {
                Some(Bson::Document(sub)) => exclude(sub, children),
                Some(Bson::Array(items)) => {
                    for item in items.iter_mut() {
                        if let Bson::Document(sub) = item {
                            exclude(sub, children);
                        }
                    }
                }
                _ => {}
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slice {
    Head(i64),
    Range(i64, i64),
}

fn apply_slice(doc: &mut Document, path: &str, slice: Slice) {
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, Some(r)),
        None => (path, None),
    };
    match (doc.get_mut(head), rest) {
        (Some(Bson::Array(items)), None) => {
            let len = items.len() as i64;
            let (start, count) = match slice {
                Slice::Head(n) if n >= 0 => (0, n),
                Slice::Head(n) => ((len + n).max(0), -n),
                Slice::Range(skip, n) if skip >= 0 => (skip.min(len), n),
                Slice::Range(skip, n) => ((len + skip).max(0), n),
            };
            let end = (start + count.max(0)).min(len);
            *items = items[start as usize..end as usize].to_vec();
        }
        (Some(Bson::Document(sub)), Some(rest)) => apply_slice(sub, rest, slice),
        _ => {}
    }
}

fn parse_slice(path: &str, value: &Bson) -> Result<Slice, StoreError> {
    let bad = || StoreError::InvalidQuery(format!("invalid $slice for '{path}'"));
    match value {
        Bson::Int32(n) => Ok(Slice::Head(*n as i64)),
        Bson::Int64(n) => Ok(Slice::Head(*n)),
        Bson::Array(pair) => match pair.as_slice() {
            [skip, limit] => {
                let skip = skip.as_i64().or_else(|| skip.as_i32().map(i64::from)).ok_or_else(bad)?;
                let limit = limit.as_i64().or_else(|| limit.as_i32().map(i64::from)).ok_or_else(bad)?;
                if limit <= 0 {
                    return Err(bad());
                }
                Ok(Slice::Range(skip, limit))
            }
            _ => Err(bad()),
        },
        _ => Err(bad()),
    }
}

fn truthy(value: &Bson) -> Option<bool> {
    match value {
        Bson::Boolean(b) => Some(*b),
        Bson::Int32(n) => Some(*n != 0),
        Bson::Int64(n) => Some(*n != 0),
        Bson::Double(n) => Some(*n != 0.0),
        _ => None,
    }
}

/// A compiled projection document.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Projection {
    inclusion: bool,
    tree: HashMap<String, FieldTree>,
    keep_id: bool,
    slices: Vec<(String, Slice)>,
}

impl Projection {
    /// Compile a projection. Inclusion and exclusion can't be mixed, except
    /// that `_id` may be excluded from an inclusion projection. `$slice`
    /// entries work with either mode.
    pub(crate) fn parse(spec: &Document) -> Result<Projection, StoreError> {
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut slices = Vec::new();
        let mut keep_id = true;
        let mut id_only = false;

        for (path, value) in spec {
            if let Bson::Document(op) = value {
                match op.get("$slice") {
                    Some(slice) => {
                        slices.push((path.clone(), parse_slice(path, slice)?));
                        continue;
                    }
                    None => {
                        return Err(StoreError::InvalidQuery(format!(
                            "unsupported projection operator for '{path}'"
                        )));
                    }
                }
            }
            let on = truthy(value).ok_or_else(|| {
                StoreError::InvalidQuery(format!("invalid projection value for '{path}'"))
            })?;
            if path == "_id" {
                keep_id = on;
                id_only = on;
                continue;
            }
            if on {
                included.push(path.as_str());
            } else {
                excluded.push(path.as_str());
            }
        }

        if !included.is_empty() && !excluded.is_empty() {
            return Err(StoreError::InvalidQuery(
                "cannot mix inclusion and exclusion in a projection".into(),
            ));
        }
        // `{_id: 1}` on its own projects down to the id.
        let inclusion =
            !included.is_empty() || (id_only && excluded.is_empty() && slices.is_empty());
        let tree = FieldTree::from_paths(if inclusion { included } else { excluded });

        Ok(Projection {
            inclusion,
            tree,
            keep_id,
            slices,
        })
    }

    pub(crate) fn apply(&self, doc: &Document) -> Document {
        let mut out = if self.inclusion {
            let mut projected = include(doc, &self.tree);
            if self.keep_id
                && let Some(id) = doc.get("_id")
            {
                let mut with_id = Document::new();
                with_id.insert("_id", id.clone());
                with_id.extend(projected);
                projected = with_id;
            }
            projected
        } else {
            let mut copy = doc.clone();
            exclude(&mut copy, &self.tree);
            copy
        };
        if !self.keep_id {
            out.remove("_id");
        }
        for (path, slice) in &self.slices {
            apply_slice(&mut out, path, *slice);
        }
        out
    }
}
