use bson::{Bson, Document};

use crate::error::QueryError;
use crate::operator::Operator;
use crate::translate::FieldTranslator;

/// Update modifier applied to one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Set,
    Unset,
    Inc,
    Dec,
    Mul,
    Max,
    Min,
    Rename,
    Push,
    PushAll,
    AddToSet,
    Pop,
    Pull,
    PullAll,
}

impl MutationOp {
    pub fn from_name(name: &str) -> Option<MutationOp> {
        Some(match name {
            "set" => MutationOp::Set,
            "unset" => MutationOp::Unset,
            "inc" => MutationOp::Inc,
            "dec" => MutationOp::Dec,
            "mul" => MutationOp::Mul,
            "max" => MutationOp::Max,
            "min" => MutationOp::Min,
            "rename" => MutationOp::Rename,
            "push" => MutationOp::Push,
            "push_all" => MutationOp::PushAll,
            "add_to_set" => MutationOp::AddToSet,
            "pop" => MutationOp::Pop,
            "pull" => MutationOp::Pull,
            "pull_all" => MutationOp::PullAll,
            _ => return None,
        })
    }

    /// The storage-level update operator this modifier renders to.
    pub fn storage_key(self) -> &'static str {
        match self {
            MutationOp::Set => "$set",
            MutationOp::Unset => "$unset",
            MutationOp::Inc | MutationOp::Dec => "$inc",
            MutationOp::Mul => "$mul",
            MutationOp::Max => "$max",
            MutationOp::Min => "$min",
            MutationOp::Rename => "$rename",
            MutationOp::Push | MutationOp::PushAll => "$push",
            MutationOp::AddToSet => "$addToSet",
            MutationOp::Pop => "$pop",
            MutationOp::Pull => "$pull",
            MutationOp::PullAll => "$pullAll",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldMutation {
    /// Dotted logical path.
    pub field: String,
    pub op: MutationOp,
    pub value: Bson,
}

/// An ordered list of field modifiers, rendered into one update document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mutation {
    pub ops: Vec<FieldMutation>,
}

impl Mutation {
    pub fn new() -> Self {
        Mutation::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn op(mut self, op: MutationOp, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(FieldMutation {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn set(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.op(MutationOp::Set, field, value)
    }

    pub fn unset(self, field: impl Into<String>) -> Self {
        self.op(MutationOp::Unset, field, 1)
    }

    /// Whether any modifier targets `field` with a `$set`.
    pub fn sets(&self, field: &str) -> bool {
        self.ops
            .iter()
            .any(|m| m.op == MutationOp::Set && m.field == field)
    }

    /// Render to a storage update document (`{"$set": {...}, "$inc": {...}}`).
    pub fn to_document(&self, translator: &dyn FieldTranslator) -> Result<Document, QueryError> {
        let mut update = Document::new();
        for m in &self.ops {
            let path = translator.storage_path(&m.field)?;
            let value = render_value(m, translator)?;
            let section = update
                .entry(m.op.storage_key().to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            if let Bson::Document(section) = section {
                section.insert(path, value);
            }
        }
        Ok(update)
    }
}

fn render_value(m: &FieldMutation, translator: &dyn FieldTranslator) -> Result<Bson, QueryError> {
    let marshal = |v: Bson| translator.storage_value(&m.field, Operator::Eq, v);
    match m.op {
        MutationOp::Set | MutationOp::Max | MutationOp::Min | MutationOp::Pull => {
            marshal(m.value.clone())
        }
        MutationOp::Unset => Ok(Bson::Int32(1)),
        MutationOp::Inc | MutationOp::Mul => numeric(m).map(|_| m.value.clone()),
        MutationOp::Dec => match numeric(m)? {
            Bson::Int32(n) => Ok(Bson::Int32(-n)),
            Bson::Int64(n) => Ok(Bson::Int64(-n)),
            Bson::Double(n) => Ok(Bson::Double(-n)),
            other => Ok(other),
        },
        MutationOp::Rename => match &m.value {
            Bson::String(target) => Ok(Bson::String(translator.storage_path(target)?)),
            other => Err(QueryError::InvalidQuery(format!(
                "rename target for {} must be a field name, got {other}",
                m.field
            ))),
        },
        MutationOp::Push => marshal(m.value.clone()),
        MutationOp::PushAll | MutationOp::AddToSet => match &m.value {
            Bson::Array(_) => {
                let mut each = Document::new();
                each.insert("$each", marshal(m.value.clone())?);
                Ok(Bson::Document(each))
            }
            _ if m.op == MutationOp::AddToSet => marshal(m.value.clone()),
            other => Err(QueryError::InvalidQuery(format!(
                "push_all on {} expects a list, got {other}",
                m.field
            ))),
        },
        MutationOp::Pop => match m.value {
            Bson::Int32(n) if n == 1 || n == -1 => Ok(Bson::Int32(n)),
            Bson::Int64(n) if n == 1 || n == -1 => Ok(Bson::Int32(n as i32)),
            ref other => Err(QueryError::InvalidQuery(format!(
                "pop on {} expects 1 or -1, got {other}",
                m.field
            ))),
        },
        MutationOp::PullAll => match &m.value {
            Bson::Array(_) => marshal(m.value.clone()),
            other => Err(QueryError::InvalidQuery(format!(
                "pull_all on {} expects a list, got {other}",
                m.field
            ))),
        },
    }
}

fn numeric(m: &FieldMutation) -> Result<Bson, QueryError> {
    match m.value {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => Ok(m.value.clone()),
        ref other => Err(QueryError::InvalidQuery(format!(
            "{:?} on {} expects a number, got {other}",
            m.op, m.field
        ))),
    }
}

/// Parse keyword-style modifiers: `"inc__views"`, `"push__tags"`,
/// `"set__address__city"`. A key without a modifier prefix means `set`.
pub fn parse_mutation<I, K, V>(pairs: I) -> Result<Mutation, QueryError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<Bson>,
{
    let mut mutation = Mutation::new();
    for (key, value) in pairs {
        let key = key.as_ref();
        let mut parts: Vec<&str> = key.split("__").collect();
        let op = match MutationOp::from_name(parts[0]) {
            Some(op) if parts.len() > 1 => {
                parts.remove(0);
                op
            }
            _ => MutationOp::Set,
        };
        if parts.iter().any(|p| p.is_empty() || p.starts_with('$')) {
            return Err(QueryError::InvalidQuery(format!(
                "invalid update key: {key:?}"
            )));
        }
        mutation.ops.push(FieldMutation {
            field: parts.join("."),
            op,
            value: value.into(),
        });
    }
    Ok(mutation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::Verbatim;
    use bson::doc;

    #[test]
    fn bare_key_is_set() {
        let m = parse_mutation([("name", "x")]).unwrap();
        assert_eq!(m.ops[0].op, MutationOp::Set);
        assert_eq!(m.ops[0].field, "name");
    }

    #[test]
    fn modifiers_group_by_operator() {
        let m = parse_mutation([
            ("set__name", Bson::from("x")),
            ("inc__views", Bson::from(2)),
            ("dec__stock", Bson::from(3)),
            ("set__address__city", Bson::from("Oslo")),
        ])
        .unwrap();
        let rendered = m.to_document(&Verbatim).unwrap();
        assert_eq!(
            rendered,
            doc! {
                "$set": { "name": "x", "address.city": "Oslo" },
                "$inc": { "views": 2, "stock": -3 },
            }
        );
    }

    #[test]
    fn push_all_uses_each() {
        let m = parse_mutation([("push_all__tags", vec!["a", "b"])]).unwrap();
        let rendered = m.to_document(&Verbatim).unwrap();
        assert_eq!(rendered, doc! { "$push": { "tags": { "$each": ["a", "b"] } } });
    }

    #[test]
    fn inc_rejects_non_numbers() {
        let m = parse_mutation([("inc__views", "x")]).unwrap();
        assert!(matches!(
            m.to_document(&Verbatim),
            Err(QueryError::InvalidQuery(_))
        ));
    }

    #[test]
    fn dollar_keys_rejected() {
        assert!(parse_mutation([("$set", 1)]).is_err());
    }
}
