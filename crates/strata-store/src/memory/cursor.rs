use bson::Document;

use crate::error::StoreError;

use super::stats::{Counters, bump};

/// Cursor over a query result computed from a collection snapshot.
///
/// Writes issued while the cursor is open are not visible to it. Dropping
/// the cursor counts as closing it.
pub struct MemoryCursor<'a> {
    docs: std::vec::IntoIter<Document>,
    counters: &'a Counters,
}

impl<'a> MemoryCursor<'a> {
    pub(crate) fn new(docs: Vec<Document>, counters: &'a Counters) -> Self {
        bump(&counters.cursors_opened);
        Self {
            docs: docs.into_iter(),
            counters,
        }
    }

    /// Documents not yet pulled from this cursor.
    pub fn remaining(&self) -> usize {
        self.docs.len()
    }
}

impl Iterator for MemoryCursor<'_> {
    type Item = Result<Document, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let doc = self.docs.next()?;
        bump(&self.counters.documents_returned);
        Some(Ok(doc))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.docs.size_hint()
    }
}

impl Drop for MemoryCursor<'_> {
    fn drop(&mut self) {
        bump(&self.counters.cursors_closed);
    }
}
