use std::collections::HashSet;
use std::ops::{BitAnd, BitOr, Not};

use bson::{Bson, Document, doc};

use crate::error::QueryError;
use crate::operator::Operator;
use crate::translate::FieldTranslator;

/// A single predicate leaf: `path op value`, optionally negated.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Dotted logical path (`"address.zipcode"`).
    pub path: String,
    pub operator: Operator,
    pub negated: bool,
    pub value: Bson,
}

impl Condition {
    pub fn new(path: impl Into<String>, operator: Operator, value: impl Into<Bson>) -> Self {
        Condition {
            path: path.into(),
            operator,
            negated: false,
            value: value.into(),
        }
    }

    /// Parse a keyword-style key such as `"age__gte"`, `"address__zipcode"`,
    /// `"tags.0"` or `"name__not__istartswith"`.
    ///
    /// A trailing segment naming an operator selects it, otherwise equality.
    /// A `not` segment right before the operator negates the condition.
    pub fn parse(key: &str, value: impl Into<Bson>) -> Result<Condition, QueryError> {
        let mut parts: Vec<&str> = key.split("__").flat_map(|p| p.split('.')).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(QueryError::InvalidQuery(format!(
                "empty segment in query key: {key:?}"
            )));
        }

        let mut operator = Operator::Eq;
        if parts.len() > 1 {
            let last = parts[parts.len() - 1];
            if last.starts_with('$') {
                operator = Operator::parse(last)?;
                parts.pop();
            } else if let Some(op) = Operator::from_name(last) {
                operator = op;
                parts.pop();
            }
        } else if parts[0].starts_with('$') {
            return Err(QueryError::InvalidQuery(format!("unknown operator: {key}")));
        }

        let mut negated = false;
        if parts.len() > 1 && parts[parts.len() - 1] == "not" {
            negated = true;
            parts.pop();
        }

        Ok(Condition {
            path: parts.join("."),
            operator,
            negated,
            value: value.into(),
        })
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    fn render(&self, translator: &dyn FieldTranslator) -> Result<(String, Bson), QueryError> {
        let storage_path = translator.storage_path(&self.path)?;
        let value = if self.operator.marshals_value() {
            translator.storage_value(&self.path, self.operator, self.value.clone())?
        } else {
            self.value.clone()
        };
        Ok((storage_path, self.operator.render(value, self.negated)?))
    }
}

/// A conjunction of conditions built from one keyword-style call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criterion {
    conditions: Vec<Condition>,
}

impl Criterion {
    pub fn new() -> Self {
        Criterion::default()
    }

    /// Build from `(key, value)` pairs, e.g. `[("age__gte", 18), ("name", "bob")]`.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Criterion, QueryError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        let mut criterion = Criterion::new();
        for (key, value) in pairs {
            criterion
                .conditions
                .push(Condition::parse(key.as_ref(), value)?);
        }
        Ok(criterion)
    }

    /// Add one keyword-style condition.
    pub fn with(mut self, key: &str, value: impl Into<Bson>) -> Result<Criterion, QueryError> {
        self.conditions.push(Condition::parse(key, value)?);
        Ok(self)
    }

    pub fn condition(mut self, condition: Condition) -> Criterion {
        self.conditions.push(condition);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn render(
        &self,
        translator: &dyn FieldTranslator,
        flatten: bool,
    ) -> Result<Document, QueryError> {
        let mut docs: Vec<Document> = Vec::new();
        for condition in &self.conditions {
            let (key, value) = condition.render(translator)?;
            if flatten {
                merge_condition(&mut docs, key, value);
            } else {
                let mut single = Document::new();
                single.insert(key, value);
                docs.push(single);
            }
        }
        Ok(conjoin(docs, false))
    }
}

/// Immutable predicate tree.
///
/// Combinators take `&self` and build a new tree; neither operand changes.
/// `Empty` matches every document and is the identity of [`and`](Self::and)
/// and [`or`](Self::or).
#[derive(Debug, Clone, Default, PartialEq)]
pub enum CriterionNode {
    #[default]
    Empty,
    Leaf(Criterion),
    /// A storage-level filter passed through untranslated.
    Raw(Document),
    And(Vec<CriterionNode>),
    Or(Vec<CriterionNode>),
    Not(Box<CriterionNode>),
}

impl CriterionNode {
    pub fn is_empty(&self) -> bool {
        matches!(self, CriterionNode::Empty)
    }

    pub fn and(&self, other: &CriterionNode) -> CriterionNode {
        match (self, other) {
            (CriterionNode::Empty, _) => other.clone(),
            (_, CriterionNode::Empty) => self.clone(),
            (CriterionNode::And(left), CriterionNode::And(right)) => {
                CriterionNode::And(left.iter().chain(right.iter()).cloned().collect())
            }
            (CriterionNode::And(left), _) => {
                let mut children = left.clone();
                children.push(other.clone());
                CriterionNode::And(children)
            }
            _ => CriterionNode::And(vec![self.clone(), other.clone()]),
        }
    }

    pub fn or(&self, other: &CriterionNode) -> CriterionNode {
        match (self, other) {
            (CriterionNode::Empty, _) => other.clone(),
            (_, CriterionNode::Empty) => self.clone(),
            (CriterionNode::Or(left), CriterionNode::Or(right)) => {
                CriterionNode::Or(left.iter().chain(right.iter()).cloned().collect())
            }
            (CriterionNode::Or(left), _) => {
                let mut children = left.clone();
                children.push(other.clone());
                CriterionNode::Or(children)
            }
            _ => CriterionNode::Or(vec![self.clone(), other.clone()]),
        }
    }

    pub fn negate(&self) -> CriterionNode {
        match self {
            CriterionNode::Not(inner) => (**inner).clone(),
            _ => CriterionNode::Not(Box::new(self.clone())),
        }
    }

    /// Every condition in the tree, depth first.
    pub fn conditions(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            CriterionNode::Empty | CriterionNode::Raw(_) => {}
            CriterionNode::Leaf(c) => out.extend(c.conditions()),
            CriterionNode::And(children) | CriterionNode::Or(children) => {
                for child in children {
                    child.collect_conditions(out);
                }
            }
            CriterionNode::Not(inner) => inner.collect_conditions(out),
        }
    }

    /// Render the storage filter, merging conjunctions whose top-level keys
    /// do not collide into a single document.
    pub fn to_filter(&self, translator: &dyn FieldTranslator) -> Result<Document, QueryError> {
        self.render(translator, true)
    }

    /// Render the storage filter with every conjunction kept as an explicit `$and`.
    pub fn to_nested_filter(
        &self,
        translator: &dyn FieldTranslator,
    ) -> Result<Document, QueryError> {
        self.render(translator, false)
    }

    fn render(
        &self,
        translator: &dyn FieldTranslator,
        flatten: bool,
    ) -> Result<Document, QueryError> {
        match self {
            CriterionNode::Empty => Ok(Document::new()),
            CriterionNode::Raw(raw) => Ok(raw.clone()),
            CriterionNode::Leaf(criterion) => criterion.render(translator, flatten),
            CriterionNode::And(children) => {
                let docs = children
                    .iter()
                    .map(|c| c.render(translator, flatten))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(conjoin(docs, flatten))
            }
            CriterionNode::Or(children) => {
                let docs = children
                    .iter()
                    .map(|c| c.render(translator, flatten))
                    .collect::<Result<Vec<_>, _>>()?;
                if docs.len() == 1 {
                    return Ok(docs.into_iter().next().unwrap_or_default());
                }
                Ok(doc! { "$or": docs })
            }
            CriterionNode::Not(inner) => {
                let rendered = inner.render(translator, flatten)?;
                Ok(doc! { "$nor": [rendered] })
            }
        }
    }
}

impl From<Criterion> for CriterionNode {
    fn from(criterion: Criterion) -> Self {
        if criterion.is_empty() {
            CriterionNode::Empty
        } else {
            CriterionNode::Leaf(criterion)
        }
    }
}

impl From<Condition> for CriterionNode {
    fn from(condition: Condition) -> Self {
        CriterionNode::Leaf(Criterion::new().condition(condition))
    }
}

impl BitAnd for CriterionNode {
    type Output = CriterionNode;

    fn bitand(self, rhs: CriterionNode) -> CriterionNode {
        self.and(&rhs)
    }
}

impl BitOr for CriterionNode {
    type Output = CriterionNode;

    fn bitor(self, rhs: CriterionNode) -> CriterionNode {
        self.or(&rhs)
    }
}

impl Not for CriterionNode {
    type Output = CriterionNode;

    fn not(self) -> CriterionNode {
        self.negate()
    }
}

fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

/// Fold one rendered condition into the conjunction being built. Operator
/// documents on the same key merge when their operators don't overlap;
/// anything else opens a new conjunct.
fn merge_condition(docs: &mut Vec<Document>, key: String, value: Bson) {
    for doc in docs.iter_mut() {
        if !doc.contains_key(&key) {
            doc.insert(key, value);
            return;
        }
        if let (Some(Bson::Document(existing)), Bson::Document(incoming)) =
            (doc.get_mut(&key), &value)
        {
            if is_operator_doc(existing)
                && is_operator_doc(incoming)
                && incoming.keys().all(|k| !existing.contains_key(k))
            {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
                return;
            }
        }
    }
    let mut doc = Document::new();
    doc.insert(key, value);
    docs.push(doc);
}

fn conjoin(docs: Vec<Document>, flatten: bool) -> Document {
    let mut docs: Vec<Document> = docs.into_iter().filter(|d| !d.is_empty()).collect();
    match docs.len() {
        0 => return Document::new(),
        1 => return docs.pop().unwrap_or_default(),
        _ => {}
    }

    if flatten {
        let mut seen: HashSet<&str> = HashSet::new();
        let disjoint = docs
            .iter()
            .flat_map(|d| d.keys())
            .all(|k| seen.insert(k.as_str()));
        if disjoint {
            let mut merged = Document::new();
            for doc in docs {
                merged.extend(doc);
            }
            return merged;
        }
    }
    doc! { "$and": docs }
}
