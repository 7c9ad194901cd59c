use bson::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Sort {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Sort {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }

    /// Parse an ordering key: `"-age"` descending, `"+age"` or `"age"` ascending.
    /// Double underscores are read as path separators. Blank keys yield `None`.
    pub fn parse(key: &str) -> Option<Sort> {
        let key = key.trim();
        let (direction, rest) = match key.as_bytes().first() {
            Some(b'-') => (SortDirection::Desc, &key[1..]),
            Some(b'+') => (SortDirection::Asc, &key[1..]),
            _ => (SortDirection::Asc, key),
        };
        if rest.is_empty() {
            return None;
        }
        Some(Sort {
            field: rest.replace("__", "."),
            direction,
        })
    }
}

/// Render ordering keys as a `{field: 1 | -1}` document, preserving order.
pub fn sort_document(keys: &[Sort]) -> Document {
    let mut doc = Document::new();
    for key in keys {
        doc.insert(key.field.clone(), key.direction.as_i32());
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefixes() {
        assert_eq!(Sort::parse("-age"), Some(Sort::desc("age")));
        assert_eq!(Sort::parse("+age"), Some(Sort::asc("age")));
        assert_eq!(Sort::parse("address__city"), Some(Sort::asc("address.city")));
        assert_eq!(Sort::parse("-"), None);
        assert_eq!(Sort::parse(""), None);
    }

    #[test]
    fn document_keeps_key_order() {
        let doc = sort_document(&[Sort::desc("b"), Sort::asc("a")]);
        let keys: Vec<&String> = doc.keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(doc.get_i32("b").unwrap(), -1);
    }
}
