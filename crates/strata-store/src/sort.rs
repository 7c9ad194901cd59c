use std::cmp::Ordering;

use bson::{Bson, Document};
use strata_query::{Sort, SortDirection};

use crate::error::StoreError;
use crate::values::{first_at, sort_cmp};

/// Read a `{field: 1 | -1}` sort document into ordered sort keys.
pub(crate) fn parse_sort(spec: &Document) -> Result<Vec<Sort>, StoreError> {
    spec.iter()
        .map(|(field, dir)| {
            let direction = match dir {
                Bson::Int32(1) | Bson::Int64(1) => SortDirection::Asc,
                Bson::Int32(-1) | Bson::Int64(-1) => SortDirection::Desc,
                Bson::Double(d) if *d == 1.0 => SortDirection::Asc,
                Bson::Double(d) if *d == -1.0 => SortDirection::Desc,
                other => {
                    return Err(StoreError::InvalidQuery(format!(
                        "invalid sort direction for '{field}': {other}"
                    )));
                }
            };
            Ok(Sort {
                field: field.clone(),
                direction,
            })
        })
        .collect()
}

/// Order two documents by `sorts`, first key first.
pub(crate) fn compare_documents(a: &Document, b: &Document, sorts: &[Sort]) -> Ordering {
    for sort in sorts {
        let ord = sort_cmp(first_at(a, &sort.field), first_at(b, &sort.field));
        let ord = match sort.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Stable multi-key sort. Borrows fields at comparison time.
pub(crate) fn sort_documents(records: &mut [Document], sorts: &[Sort]) {
    if sorts.is_empty() {
        return;
    }
    records.sort_by(|a, b| compare_documents(a, b, sorts));
}
