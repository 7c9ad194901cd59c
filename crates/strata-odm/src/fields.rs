use bson::Bson;
use strata_query::{FieldTranslator, Operator, QueryError};
use strata_schema::{Converter, FieldDescriptor, FieldKind, KindConverter, Registry, Schema};

use crate::error::Error;

/// One resolved step of a field path.
#[derive(Debug, Clone)]
pub enum Segment<'r> {
    Field(&'r FieldDescriptor),
    /// Numeric list index or the positional `$`, passed through unresolved.
    Index(String),
    /// Map key, or any segment below a dynamic field.
    Key(String),
}

impl Segment<'_> {
    pub fn storage_name(&self) -> &str {
        match self {
            Segment::Field(field) => field.storage_name(),
            Segment::Index(s) | Segment::Key(s) => s,
        }
    }

    pub fn field(&self) -> Option<&FieldDescriptor> {
        match self {
            Segment::Field(field) => Some(field),
            _ => None,
        }
    }
}

/// Where the walk stands after consuming a segment.
#[derive(Clone, Copy)]
enum Position<'r> {
    Schema(&'r Schema),
    Kind(&'r FieldKind),
    Dynamic,
}

struct Walk<'r> {
    segments: Vec<Segment<'r>>,
    tail: Position<'r>,
}

/// Resolve path segments of `type_name` into field descriptors.
///
/// `pk` names the primary key. List positions accept a numeric index or `$`;
/// any other segment looks into the element type. Traversing a reference
/// field fails: stores cannot join.
pub fn resolve<'r>(
    registry: &'r Registry,
    type_name: &str,
    segments: &[&str],
) -> Result<Vec<Segment<'r>>, Error> {
    let schema = registry.schema(type_name)?;
    Ok(walk(registry, schema.as_ref(), segments)?.segments)
}

/// Translate a dotted logical path (`address.zipcode`) to its storage path.
pub fn translate(registry: &Registry, type_name: &str, path: &str) -> Result<String, Error> {
    let segments: Vec<&str> = path.split('.').collect();
    let resolved = resolve(registry, type_name, &segments)?;
    Ok(storage_path(&resolved))
}

fn storage_path(segments: &[Segment<'_>]) -> String {
    segments
        .iter()
        .map(Segment::storage_name)
        .collect::<Vec<_>>()
        .join(".")
}

fn walk<'r>(
    registry: &'r Registry,
    root: &'r Schema,
    segments: &[&str],
) -> Result<Walk<'r>, QueryError> {
    let path = segments.join(".");
    let mut out = Vec::with_capacity(segments.len());
    let mut position = Position::Schema(root);
    let mut i = 0;

    while i < segments.len() {
        let segment = segments[i];
        if segment.is_empty() {
            return Err(QueryError::LookUp(format!("empty segment in field path {path:?}")));
        }
        match position {
            Position::Dynamic => {
                out.push(Segment::Key(segment.to_string()));
            }
            Position::Schema(schema) => {
                let field = lookup_field(registry, schema, segment).ok_or_else(|| {
                    QueryError::LookUp(format!(
                        "Cannot resolve field \"{segment}\" on {} (path {path:?})",
                        schema.name()
                    ))
                })?;
                out.push(Segment::Field(field));
                position = Position::Kind(field.kind());
            }
            Position::Kind(kind) => match kind {
                FieldKind::List(inner) => {
                    position = Position::Kind(inner);
                    if is_index(segment) {
                        out.push(Segment::Index(segment.to_string()));
                    } else {
                        // Implicit traversal: the same segment applies to the elements.
                        continue;
                    }
                }
                FieldKind::Map(inner) => {
                    out.push(Segment::Key(segment.to_string()));
                    position = Position::Kind(inner);
                }
                FieldKind::Embedded(name) => {
                    let schema = registry.get(name).ok_or_else(|| {
                        QueryError::LookUp(format!("embedded type {name} is not registered"))
                    })?;
                    position = Position::Schema(schema.as_ref());
                    continue;
                }
                FieldKind::Reference(target) => {
                    return Err(QueryError::LookUp(format!(
                        "Cannot perform join in mongoDB: {path} ({target} is a reference)"
                    )));
                }
                FieldKind::Any => {
                    out.push(Segment::Key(segment.to_string()));
                    position = Position::Dynamic;
                }
                scalar => {
                    return Err(QueryError::LookUp(format!(
                        "Cannot resolve field \"{segment}\": {scalar:?} has no sub-fields (path {path:?})"
                    )));
                }
            },
        }
        i += 1;
    }

    Ok(Walk {
        segments: out,
        tail: position,
    })
}

fn is_index(segment: &str) -> bool {
    segment == "$" || segment.bytes().all(|b| b.is_ascii_digit())
}

/// Field lookup with the `pk` alias, falling back to subclass fields.
fn lookup_field<'r>(
    registry: &'r Registry,
    schema: &'r Schema,
    name: &str,
) -> Option<&'r FieldDescriptor> {
    if name == "pk" {
        if let Some(pk) = schema.primary_key() {
            return Some(pk);
        }
    }
    if let Some(field) = schema.field(name) {
        return Some(field);
    }
    registry
        .subclasses(schema.name())
        .iter()
        .filter_map(|sub| registry.get(sub))
        .find_map(|sub| sub.field(name))
}

/// [`FieldTranslator`] backed by a registered schema.
pub struct SchemaTranslator<'r> {
    registry: &'r Registry,
    schema: &'r Schema,
}

impl<'r> SchemaTranslator<'r> {
    pub fn new(registry: &'r Registry, type_name: &str) -> Result<Self, Error> {
        let schema = registry.schema(type_name)?.as_ref();
        Ok(Self { registry, schema })
    }

    fn walk_path(&self, path: &str) -> Result<Walk<'r>, QueryError> {
        let segments: Vec<&str> = path.split('.').collect();
        walk(self.registry, self.schema, &segments)
    }
}

impl FieldTranslator for SchemaTranslator<'_> {
    fn storage_path(&self, path: &str) -> Result<String, QueryError> {
        Ok(storage_path(&self.walk_path(path)?.segments))
    }

    fn storage_value(
        &self,
        path: &str,
        operator: Operator,
        value: Bson,
    ) -> Result<Bson, QueryError> {
        let walk = self.walk_path(path)?;
        let invalid = |message: String| QueryError::InvalidQuery(message);

        // A path ending on a declared field goes through that field's converter.
        if let Some(Segment::Field(field)) = walk.segments.last() {
            return match value {
                Bson::Array(items) if operator.takes_list() && !field.kind().is_list() => items
                    .iter()
                    .map(|item| field.to_storage(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Bson::Array)
                    .map_err(|e| invalid(e.to_string())),
                value => field.to_storage(&value).map_err(|e| invalid(e.to_string())),
            };
        }

        let kind = match walk.tail {
            Position::Kind(kind) => kind,
            Position::Schema(_) | Position::Dynamic => return Ok(value),
        };
        let converter = KindConverter(kind.clone());
        let convert = |v: &Bson| {
            converter
                .to_storage(v)
                .map_err(|message| invalid(format!("{path}: {message}")))
        };
        match value {
            Bson::Array(items) if operator.takes_list() && !kind.is_list() => items
                .iter()
                .map(convert)
                .collect::<Result<Vec<_>, _>>()
                .map(Bson::Array),
            value => convert(&value),
        }
    }
}
