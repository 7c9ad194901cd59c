use bson::{Bson, Document, doc};
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Comparison operator of a single predicate leaf (`field op value`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    All,
    Size,
    Exists,
    ElemMatch,
    Regex,
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
}

impl Operator {
    const NAMES: [(&'static str, Operator); 21] = [
        ("eq", Operator::Eq),
        ("ne", Operator::Ne),
        ("gt", Operator::Gt),
        ("gte", Operator::Gte),
        ("lt", Operator::Lt),
        ("lte", Operator::Lte),
        ("in", Operator::In),
        ("nin", Operator::Nin),
        ("all", Operator::All),
        ("size", Operator::Size),
        ("exists", Operator::Exists),
        ("elem_match", Operator::ElemMatch),
        ("regex", Operator::Regex),
        ("exact", Operator::Exact),
        ("iexact", Operator::IExact),
        ("contains", Operator::Contains),
        ("icontains", Operator::IContains),
        ("startswith", Operator::StartsWith),
        ("istartswith", Operator::IStartsWith),
        ("endswith", Operator::EndsWith),
        ("iendswith", Operator::IEndsWith),
    ];

    /// Look up an operator by its key-suffix name (`"gte"`, `"icontains"`, ...).
    pub fn from_name(name: &str) -> Option<Operator> {
        if name == "match" {
            return Some(Operator::ElemMatch);
        }
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, op)| *op)
    }

    /// Like [`from_name`](Self::from_name) but fails on unknown names.
    pub fn parse(name: &str) -> Result<Operator, QueryError> {
        let bare = name.strip_prefix('$').unwrap_or(name);
        Self::from_name(bare)
            .ok_or_else(|| QueryError::InvalidQuery(format!("unknown operator: {name}")))
    }

    pub fn name(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(n, _)| *n)
            .unwrap_or("eq")
    }

    /// Operators whose value is a list of comparison values.
    pub fn takes_list(self) -> bool {
        matches!(self, Operator::In | Operator::Nin | Operator::All)
    }

    /// Operators compiled to a regular expression over a string field.
    pub fn is_string_match(self) -> bool {
        matches!(
            self,
            Operator::Regex
                | Operator::Exact
                | Operator::IExact
                | Operator::Contains
                | Operator::IContains
                | Operator::StartsWith
                | Operator::IStartsWith
                | Operator::EndsWith
                | Operator::IEndsWith
        )
    }

    /// Whether the comparison value goes through the field's storage converter.
    ///
    /// `size` and `exists` compare against structural facts, string matches
    /// against a pattern, and `elem_match` carries its own sub-filter.
    pub fn marshals_value(self) -> bool {
        !(self.is_string_match()
            || matches!(self, Operator::Size | Operator::Exists | Operator::ElemMatch))
    }

    /// Render the storage-level condition for one field.
    pub(crate) fn render(self, value: Bson, negated: bool) -> Result<Bson, QueryError> {
        let expr = match self {
            Operator::Eq => {
                if negated {
                    return Ok(Bson::Document(doc! { "$ne": value }));
                }
                return Ok(match value {
                    Bson::Document(d) if starts_with_operator(&d) => {
                        Bson::Document(doc! { "$eq": d })
                    }
                    other => other,
                });
            }
            Operator::Ne => doc! { "$ne": value },
            Operator::Gt => doc! { "$gt": value },
            Operator::Gte => doc! { "$gte": value },
            Operator::Lt => doc! { "$lt": value },
            Operator::Lte => doc! { "$lte": value },
            Operator::In | Operator::Nin | Operator::All => {
                let Bson::Array(values) = value else {
                    return Err(QueryError::InvalidQuery(format!(
                        "'{}' expects a list of values",
                        self.name()
                    )));
                };
                let key = match self {
                    Operator::In => "$in",
                    Operator::Nin => "$nin",
                    _ => "$all",
                };
                doc! { key: values }
            }
            Operator::Size => match value {
                Bson::Int32(n) if n >= 0 => doc! { "$size": n },
                Bson::Int64(n) if n >= 0 => doc! { "$size": n },
                other => {
                    return Err(QueryError::InvalidQuery(format!(
                        "'size' expects a non-negative integer, got {other}"
                    )));
                }
            },
            Operator::Exists => {
                let flag = match value {
                    Bson::Boolean(b) => b,
                    Bson::Int32(n) => n != 0,
                    Bson::Int64(n) => n != 0,
                    other => {
                        return Err(QueryError::InvalidQuery(format!(
                            "'exists' expects a boolean, got {other}"
                        )));
                    }
                };
                doc! { "$exists": flag }
            }
            Operator::ElemMatch => match value {
                Bson::Document(sub) => doc! { "$elemMatch": sub },
                other => {
                    return Err(QueryError::InvalidQuery(format!(
                        "'elem_match' expects a document, got {other}"
                    )));
                }
            },
            _ => self.render_pattern(value)?,
        };

        if negated {
            Ok(Bson::Document(doc! { "$not": expr }))
        } else {
            Ok(Bson::Document(expr))
        }
    }

    fn render_pattern(self, value: Bson) -> Result<Document, QueryError> {
        let text = match value {
            Bson::String(s) => s,
            Bson::RegularExpression(re) if self == Operator::Regex => {
                return Ok(doc! { "$regex": re.pattern, "$options": re.options });
            }
            other => {
                return Err(QueryError::InvalidQuery(format!(
                    "'{}' expects a string, got {other}",
                    self.name()
                )));
            }
        };
        let escaped = regex::escape(&text);
        let (pattern, options) = match self {
            Operator::Regex => (text, ""),
            Operator::Exact => (format!("^{escaped}$"), ""),
            Operator::IExact => (format!("^{escaped}$"), "i"),
            Operator::Contains => (escaped, ""),
            Operator::IContains => (escaped, "i"),
            Operator::StartsWith => (format!("^{escaped}"), ""),
            Operator::IStartsWith => (format!("^{escaped}"), "i"),
            Operator::EndsWith => (format!("{escaped}$"), ""),
            Operator::IEndsWith => (format!("{escaped}$"), "i"),
            _ => unreachable!("render_pattern called for a non-pattern operator"),
        };
        Ok(doc! { "$regex": pattern, "$options": options })
    }
}

fn starts_with_operator(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}
