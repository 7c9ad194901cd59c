use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Options for [`DataSource::find`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: u64,
    /// `Some(0)` yields no documents; `None` is unbounded.
    pub limit: Option<u64>,
    pub batch_size: Option<u32>,
    /// Index name or key document the source should use.
    pub hint: Option<Bson>,
    pub no_cursor_timeout: bool,
    pub read_preference: Option<ReadPreference>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountOptions {
    pub skip: u64,
    pub limit: Option<u64>,
    pub hint: Option<Bson>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindAndModifyOptions {
    pub sort: Option<Document>,
    pub upsert: bool,
    pub return_document: ReturnDocument,
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

/// The document-store operations the ODM core drives.
///
/// Every call is synchronous. Cursors borrow the source and are released
/// when dropped.
pub trait DataSource {
    type Cursor<'a>: Iterator<Item = Result<Document, StoreError>> + Send
    where
        Self: 'a;

    fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Self::Cursor<'_>, StoreError>;

    /// Insert one document, returning its `_id`.
    fn insert_one(&self, collection: &str, document: Document) -> Result<Bson, StoreError>;

    /// Insert a batch. Either every document is written or none is.
    fn insert_many(&self, collection: &str, documents: Vec<Document>)
    -> Result<Vec<Bson>, StoreError>;

    fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult, StoreError>;

    fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult, StoreError>;

    /// Delete every matching document, returning the number removed.
    fn delete_many(&self, collection: &str, filter: &Document) -> Result<u64, StoreError>;

    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindAndModifyOptions,
    ) -> Result<Option<Document>, StoreError>;

    fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindAndModifyOptions,
    ) -> Result<Option<Document>, StoreError>;

    fn count_documents(
        &self,
        collection: &str,
        filter: &Document,
        options: &CountOptions,
    ) -> Result<u64, StoreError>;

    /// Distinct values at `field` across matching documents. Array values
    /// contribute their elements.
    fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Document,
    ) -> Result<Vec<Bson>, StoreError>;

    fn aggregate(&self, collection: &str, pipeline: &[Document])
    -> Result<Vec<Document>, StoreError>;
}
