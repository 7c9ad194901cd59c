use crate::document::Document;
use crate::error::Error;

/// Lifecycle hooks for one document type, registered with
/// [`Database::observe`](crate::Database::observe).
///
/// Every method defaults to a no-op. An error from a `pre_*` hook aborts the
/// operation before any write.
pub trait Observer: Send + Sync {
    fn pre_save(&self, _document: &mut Document) -> Result<(), Error> {
        Ok(())
    }

    fn post_save(&self, _document: &Document, _created: bool) {}

    fn pre_delete(&self, _document: &Document) -> Result<(), Error> {
        Ok(())
    }

    fn post_delete(&self, _document: &Document) {}

    fn pre_bulk_insert(&self, _documents: &mut [Document]) -> Result<(), Error> {
        Ok(())
    }

    fn post_bulk_insert(&self, _documents: &[Document]) {}

    /// Whether this observer needs per-document delete events. Cursor
    /// deletes fall back to one delete per document while any registered
    /// observer says yes.
    fn wants_delete_events(&self) -> bool {
        true
    }
}
