use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::error::StoreError;
use crate::expression::{matches, parse_filter};
use crate::projection::Projection;
use crate::sort::{parse_sort, sort_documents};
use crate::values::{first_at, push_unique, sort_cmp, value_eq};

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::InvalidQuery(msg.into())
}

/// Run a pipeline over an in-memory document set.
///
/// Supported stages: `$match`, `$group`, `$sort`, `$skip`, `$limit`,
/// `$unwind`, `$project`, `$count`.
pub(crate) fn run_pipeline(
    mut docs: Vec<Document>,
    pipeline: &[Document],
) -> Result<Vec<Document>, StoreError> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, spec)), None) = (entries.next(), entries.next()) else {
            return Err(invalid("each pipeline stage must have exactly one key"));
        };
        docs = match (name.as_str(), spec) {
            ("$match", Bson::Document(filter)) => {
                let expr = parse_filter(filter)?;
                docs.into_iter().filter(|d| matches(d, &expr)).collect()
            }
            ("$group", Bson::Document(spec)) => group(docs, spec)?,
            ("$sort", Bson::Document(spec)) => {
                let sorts = parse_sort(spec)?;
                sort_documents(&mut docs, &sorts);
                docs
            }
            ("$skip", n) => {
                let n = count_arg(name, n)?;
                docs.into_iter().skip(n).collect()
            }
            ("$limit", n) => {
                let n = count_arg(name, n)?;
                docs.truncate(n);
                docs
            }
            ("$unwind", Bson::String(path)) => unwind(docs, path)?,
            ("$project", Bson::Document(spec)) => {
                let projection = Projection::parse(spec)?;
                docs.iter().map(|d| projection.apply(d)).collect()
            }
            ("$count", Bson::String(field)) => {
                let mut out = Document::new();
                out.insert(field.clone(), docs.len() as i64);
                vec![out]
            }
            (other, _) => return Err(invalid(format!("unsupported pipeline stage: {other}"))),
        };
    }
    Ok(docs)
}

fn count_arg(stage: &str, value: &Bson) -> Result<usize, StoreError> {
    match value {
        Bson::Int32(n) if *n >= 0 => Ok(*n as usize),
        Bson::Int64(n) if *n >= 0 => Ok(*n as usize),
        _ => Err(invalid(format!("{stage} expects a non-negative integer"))),
    }
}

fn unwind(docs: Vec<Document>, path: &str) -> Result<Vec<Document>, StoreError> {
    let field = path
        .strip_prefix('$')
        .ok_or_else(|| invalid("$unwind path must start with '$'"))?;
    if field.contains('.') {
        return Err(invalid("$unwind supports top-level fields only"));
    }
    let mut out = Vec::new();
    for doc in docs {
        match doc.get(field) {
            Some(Bson::Array(items)) => {
                for item in items.clone() {
                    let mut copy = doc.clone();
                    copy.insert(field, item);
                    out.push(copy);
                }
            }
            Some(Bson::Null) | None => {}
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

/// Evaluate a group expression: `"$path"` reads a field, documents evaluate
/// member-wise, anything else is a literal.
fn eval(doc: &Document, expr: &Bson) -> Bson {
    match expr {
        Bson::String(s) if s.starts_with('$') => {
            first_at(doc, &s[1..]).cloned().unwrap_or(Bson::Null)
        }
        Bson::Document(spec) => {
            let mut out = Document::new();
            for (k, v) in spec {
                out.insert(k.clone(), eval(doc, v));
            }
            Bson::Document(out)
        }
        other => other.clone(),
    }
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum { int: i64, float: f64, has_float: bool },
    Avg { total: f64, count: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Last(Bson),
    Push(Vec<Bson>),
    AddToSet(Vec<Bson>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Accumulator, StoreError> {
        Ok(match op {
            "$sum" => Accumulator::Sum {
                int: 0,
                float: 0.0,
                has_float: false,
            },
            "$avg" => Accumulator::Avg { total: 0.0, count: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(Bson::Null),
            "$push" => Accumulator::Push(Vec::new()),
            "$addToSet" => Accumulator::AddToSet(Vec::new()),
            other => return Err(invalid(format!("unsupported accumulator: {other}"))),
        })
    }

    fn feed(&mut self, value: Bson) {
        match self {
            Accumulator::Sum {
                int,
                float,
                has_float,
            } => match value {
                Bson::Int32(n) => *int = int.wrapping_add(n as i64),
                Bson::Int64(n) => *int = int.wrapping_add(n),
                Bson::Double(n) => {
                    *float += n;
                    *has_float = true;
                }
                _ => {}
            },
            Accumulator::Avg { total, count } => {
                let n = match value {
                    Bson::Int32(n) => n as f64,
                    Bson::Int64(n) => n as f64,
                    Bson::Double(n) => n,
                    _ => return,
                };
                *total += n;
                *count += 1;
            }
            Accumulator::Min(_) | Accumulator::Max(_) => {
                if matches!(value, Bson::Null) {
                    return;
                }
                let (current, wanted) = match self {
                    Accumulator::Min(current) => (current, Ordering::Less),
                    Accumulator::Max(current) => (current, Ordering::Greater),
                    _ => return,
                };
                let replace = match current.as_ref() {
                    None => true,
                    Some(existing) => sort_cmp(Some(&value), Some(existing)) == wanted,
                };
                if replace {
                    *current = Some(value);
                }
            }
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Accumulator::Last(current) => *current = value,
            Accumulator::Push(items) => items.push(value),
            Accumulator::AddToSet(items) => push_unique(items, value),
        }
    }

    fn finish(self) -> Bson {
        match self {
            Accumulator::Sum {
                int,
                float,
                has_float,
            } => {
                if has_float {
                    Bson::Double(float + int as f64)
                } else if let Ok(small) = i32::try_from(int) {
                    Bson::Int32(small)
                } else {
                    Bson::Int64(int)
                }
            }
            Accumulator::Avg { total, count } => {
                if count == 0 {
                    Bson::Null
                } else {
                    Bson::Double(total / count as f64)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) => {
                v.unwrap_or(Bson::Null)
            }
            Accumulator::Last(v) => v,
            Accumulator::Push(items) | Accumulator::AddToSet(items) => Bson::Array(items),
        }
    }
}

fn group(docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>, StoreError> {
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| invalid("$group requires an _id expression"))?;

    let mut fields: Vec<(&str, &str, &Bson)> = Vec::new();
    for (name, acc) in spec {
        if name == "_id" {
            continue;
        }
        let Bson::Document(acc) = acc else {
            return Err(invalid(format!("$group field '{name}' must be an accumulator")));
        };
        let mut entries = acc.iter();
        let (Some((op, expr)), None) = (entries.next(), entries.next()) else {
            return Err(invalid(format!("$group field '{name}' must have one accumulator")));
        };
        Accumulator::new(op)?;
        fields.push((name.as_str(), op.as_str(), expr));
    }

    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();
    for doc in &docs {
        let key = eval(doc, id_expr);
        let index = match groups.iter().position(|(k, _)| value_eq(k, &key)) {
            Some(i) => i,
            None => {
                let accs = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>, _>>()?;
                groups.push((key, accs));
                groups.len() - 1
            }
        };
        for ((_, _, expr), acc) in fields.iter().zip(groups[index].1.iter_mut()) {
            acc.feed(eval(doc, expr));
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for ((name, _, _), acc) in fields.iter().zip(accs) {
                out.insert(*name, acc.finish());
            }
            out
        })
        .collect())
}
