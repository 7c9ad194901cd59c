use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use arc_swap::ArcSwap;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use imbl::OrdMap;
use tracing::{debug, trace};

use crate::aggregate::run_pipeline;
use crate::error::StoreError;
use crate::expression::{Expression, matches, parse_filter};
use crate::projection::Projection;
use crate::sort::{compare_documents, parse_sort};
use crate::source::{
    CountOptions, DataSource, FindAndModifyOptions, FindOptions, ReturnDocument, UpdateResult,
};
use crate::update::{apply_update, apply_upsert, is_replacement, upsert_seed};
use crate::values::{lookup, push_unique};

use super::cursor::MemoryCursor;
use super::index::IndexInfo;
use super::stats::{Counters, SourceStats, bump};

/// Records of one collection keyed by insertion sequence, so unsorted reads
/// come back in insertion order.
pub(crate) type Records = OrdMap<u64, Document>;

struct Collection {
    records: ArcSwap<Records>,
    // Only mutated while holding the source's write lock.
    indexes: RwLock<Vec<IndexInfo>>,
}

impl Collection {
    fn new() -> Self {
        Self {
            records: ArcSwap::from_pointee(OrdMap::new()),
            indexes: RwLock::new(vec![IndexInfo::id_index()]),
        }
    }
}

/// In-memory [`DataSource`].
///
/// Collections are copy-on-write snapshots: readers load the current map
/// without locking, writers are serialized by a mutex, build the next
/// version, check unique indexes, then swap it in. A failed write leaves
/// the collection untouched.
pub struct MemorySource {
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    write_lock: Mutex<()>,
    next_seq: AtomicU64,
    counters: Counters,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Create an index, returning its name. Unique indexes reject existing
    /// duplicates and every later write that would introduce one.
    pub fn create_index(
        &self,
        collection: &str,
        keys: Document,
        unique: bool,
    ) -> Result<String, StoreError> {
        if keys.is_empty() {
            return Err(StoreError::InvalidQuery("index keys must not be empty".into()));
        }
        let _guard = self.lock_writes()?;
        let coll = self.collection_or_create(collection)?;
        let name = IndexInfo::name_for(&keys);
        let index = IndexInfo {
            name: name.clone(),
            keys,
            unique,
        };

        let records = coll.records.load_full();
        let all: Vec<u64> = records.keys().copied().collect();
        index.check(collection, &records, &all)?;

        let mut indexes = coll
            .indexes
            .write()
            .map_err(|e| StoreError::Storage(format!("index lock poisoned: {e}")))?;
        indexes.retain(|i| i.name != name);
        indexes.push(index);
        debug!(collection, index = %name, unique, "created index");
        Ok(name)
    }

    pub fn index_information(&self, collection: &str) -> Result<Vec<IndexInfo>, StoreError> {
        match self.collection(collection)? {
            Some(coll) => Ok(coll
                .indexes
                .read()
                .map_err(|e| StoreError::Storage(format!("index lock poisoned: {e}")))?
                .clone()),
            None => Ok(Vec::new()),
        }
    }

    pub fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        let _guard = self.lock_writes()?;
        self.collections
            .write()
            .map_err(|e| StoreError::Storage(format!("collection map poisoned: {e}")))?
            .remove(collection);
        Ok(())
    }

    /// Every document of a collection in insertion order.
    pub fn documents(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        Ok(self.snapshot(collection)?.values().cloned().collect())
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|e| StoreError::Storage(format!("write lock poisoned: {e}")))
    }

    fn collection(&self, name: &str) -> Result<Option<Arc<Collection>>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|e| StoreError::Storage(format!("collection map poisoned: {e}")))?;
        Ok(collections.get(name).cloned())
    }

    fn collection_or_create(&self, name: &str) -> Result<Arc<Collection>, StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|e| StoreError::Storage(format!("collection map poisoned: {e}")))?;
        Ok(collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Collection::new()))
            .clone())
    }

    fn snapshot(&self, name: &str) -> Result<Arc<Records>, StoreError> {
        Ok(match self.collection(name)? {
            Some(coll) => coll.records.load_full(),
            None => Arc::new(OrdMap::new()),
        })
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn check_indexes(
        &self,
        collection: &str,
        coll: &Collection,
        records: &Records,
        changed: &[u64],
    ) -> Result<(), StoreError> {
        let indexes = coll
            .indexes
            .read()
            .map_err(|e| StoreError::Storage(format!("index lock poisoned: {e}")))?;
        for index in indexes.iter() {
            index.check(collection, records, changed)?;
        }
        Ok(())
    }

    fn check_hint(&self, collection: &str, hint: &Bson) -> Result<(), StoreError> {
        let indexes = self.index_information(collection)?;
        let found = match hint {
            Bson::String(name) => indexes.iter().any(|i| &i.name == name),
            Bson::Document(keys) => indexes.iter().any(|i| &i.keys == keys),
            _ => false,
        };
        if found {
            Ok(())
        } else {
            Err(StoreError::InvalidQuery(
                "hint provided does not correspond to an existing index".into(),
            ))
        }
    }

    /// Matching records in sort order (insertion order when unsorted).
    fn select(
        records: &Records,
        expr: &Expression,
        sort: Option<&Document>,
    ) -> Result<Vec<(u64, Document)>, StoreError> {
        let mut hits: Vec<(u64, Document)> = records
            .iter()
            .filter(|(_, doc)| matches(doc, expr))
            .map(|(seq, doc)| (*seq, doc.clone()))
            .collect();
        if let Some(sort) = sort {
            let sorts = parse_sort(sort)?;
            hits.sort_by(|(_, a), (_, b)| compare_documents(a, b, &sorts));
        }
        Ok(hits)
    }

    fn ensure_id(doc: &mut Document) -> Bson {
        match doc.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                let mut with_id = Document::new();
                with_id.insert("_id", id.clone());
                with_id.extend(std::mem::take(doc));
                *doc = with_id;
                id
            }
        }
    }

    fn update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> Result<UpdateResult, StoreError> {
        bump(&self.counters.updates);
        let expr = parse_filter(filter)?;
        let _guard = self.lock_writes()?;
        let coll = self.collection_or_create(collection)?;
        let mut records = (*coll.records.load_full()).clone();

        let targets: Vec<u64> = records
            .iter()
            .filter(|(_, doc)| matches(doc, &expr))
            .map(|(seq, _)| *seq)
            .take(if multi { usize::MAX } else { 1 })
            .collect();

        let mut result = UpdateResult::default();
        let mut changed = Vec::new();
        for seq in targets {
            let Some(mut doc) = records.get(&seq).cloned() else {
                continue;
            };
            result.matched += 1;
            if apply_update(&mut doc, update)? {
                records.insert(seq, doc);
                changed.push(seq);
                result.modified += 1;
            }
        }

        if result.matched == 0 && upsert {
            let mut doc = upsert_seed(filter)?;
            if is_replacement(update) {
                let id = doc.get("_id").cloned();
                doc = update.clone();
                if let Some(id) = id {
                    doc.insert("_id", id);
                }
            } else {
                apply_upsert(&mut doc, update)?;
            }
            result.upserted_id = Some(Self::ensure_id(&mut doc));
            let seq = self.next_seq();
            records.insert(seq, doc);
            changed.push(seq);
        }

        self.check_indexes(collection, &coll, &records, &changed)?;
        coll.records.store(Arc::new(records));
        trace!(
            collection,
            matched = result.matched,
            modified = result.modified,
            upserted = result.upserted_id.is_some(),
            "update"
        );
        Ok(result)
    }
}

impl DataSource for MemorySource {
    type Cursor<'a> = MemoryCursor<'a>;

    fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<MemoryCursor<'_>, StoreError> {
        bump(&self.counters.finds);
        let expr = parse_filter(filter)?;
        let projection = options.projection.as_ref().map(Projection::parse).transpose()?;
        if let Some(hint) = &options.hint {
            self.check_hint(collection, hint)?;
        }

        let records = self.snapshot(collection)?;
        let hits = Self::select(&records, &expr, options.sort.as_ref())?;
        let limit = options.limit.map_or(usize::MAX, |n| n as usize);
        let docs: Vec<Document> = hits
            .into_iter()
            .skip(options.skip as usize)
            .take(limit)
            .map(|(_, doc)| match &projection {
                Some(p) => p.apply(&doc),
                None => doc,
            })
            .collect();

        trace!(collection, %filter, skip = options.skip, limit = ?options.limit, returned = docs.len(), "find");
        Ok(MemoryCursor::new(docs, &self.counters))
    }

    fn insert_one(&self, collection: &str, document: Document) -> Result<Bson, StoreError> {
        let mut ids = self.insert_many(collection, vec![document])?;
        ids.pop()
            .ok_or_else(|| StoreError::Storage("insert produced no id".into()))
    }

    fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<Bson>, StoreError> {
        bump(&self.counters.inserts);
        let _guard = self.lock_writes()?;
        let coll = self.collection_or_create(collection)?;
        let mut records = (*coll.records.load_full()).clone();

        let mut ids = Vec::with_capacity(documents.len());
        let mut changed = Vec::with_capacity(documents.len());
        for mut doc in documents {
            ids.push(Self::ensure_id(&mut doc));
            let seq = self.next_seq();
            records.insert(seq, doc);
            changed.push(seq);
        }

        self.check_indexes(collection, &coll, &records, &changed)?;
        coll.records.store(Arc::new(records));
        trace!(collection, inserted = ids.len(), "insert");
        Ok(ids)
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult, StoreError> {
        self.update(collection, filter, update, upsert, false)
    }

    fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult, StoreError> {
        self.update(collection, filter, update, upsert, true)
    }

    fn delete_many(&self, collection: &str, filter: &Document) -> Result<u64, StoreError> {
        bump(&self.counters.deletes);
        let expr = parse_filter(filter)?;
        let _guard = self.lock_writes()?;
        let Some(coll) = self.collection(collection)? else {
            return Ok(0);
        };
        let mut records = (*coll.records.load_full()).clone();
        let doomed: Vec<u64> = records
            .iter()
            .filter(|(_, doc)| matches(doc, &expr))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &doomed {
            records.remove(seq);
        }
        coll.records.store(Arc::new(records));
        trace!(collection, %filter, deleted = doomed.len(), "delete");
        Ok(doomed.len() as u64)
    }

    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        options: &FindAndModifyOptions,
    ) -> Result<Option<Document>, StoreError> {
        bump(&self.counters.find_and_modify);
        let expr = parse_filter(filter)?;
        let projection = options.projection.as_ref().map(Projection::parse).transpose()?;
        let _guard = self.lock_writes()?;
        let coll = self.collection_or_create(collection)?;
        let mut records = (*coll.records.load_full()).clone();

        let hit = Self::select(&records, &expr, options.sort.as_ref())?
            .into_iter()
            .next();
        let (seq, before, after) = match hit {
            Some((seq, before)) => {
                let mut after = before.clone();
                apply_update(&mut after, update)?;
                (seq, Some(before), after)
            }
            None if options.upsert => {
                let mut doc = upsert_seed(filter)?;
                apply_upsert(&mut doc, update)?;
                Self::ensure_id(&mut doc);
                (self.next_seq(), None, doc)
            }
            None => return Ok(None),
        };

        records.insert(seq, after.clone());
        self.check_indexes(collection, &coll, &records, &[seq])?;
        coll.records.store(Arc::new(records));

        let returned = match options.return_document {
            ReturnDocument::Before => before,
            ReturnDocument::After => Some(after),
        };
        Ok(returned.map(|doc| match &projection {
            Some(p) => p.apply(&doc),
            None => doc,
        }))
    }

    fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindAndModifyOptions,
    ) -> Result<Option<Document>, StoreError> {
        bump(&self.counters.find_and_modify);
        let expr = parse_filter(filter)?;
        let projection = options.projection.as_ref().map(Projection::parse).transpose()?;
        let _guard = self.lock_writes()?;
        let Some(coll) = self.collection(collection)? else {
            return Ok(None);
        };
        let mut records = (*coll.records.load_full()).clone();
        let Some((seq, doc)) = Self::select(&records, &expr, options.sort.as_ref())?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        records.remove(&seq);
        coll.records.store(Arc::new(records));
        Ok(Some(match &projection {
            Some(p) => p.apply(&doc),
            None => doc,
        }))
    }

    fn count_documents(
        &self,
        collection: &str,
        filter: &Document,
        options: &CountOptions,
    ) -> Result<u64, StoreError> {
        bump(&self.counters.counts);
        let expr = parse_filter(filter)?;
        if let Some(hint) = &options.hint {
            self.check_hint(collection, hint)?;
        }
        let records = self.snapshot(collection)?;
        let matched = records.values().filter(|doc| matches(doc, &expr)).count() as u64;
        let after_skip = matched.saturating_sub(options.skip);
        Ok(match options.limit {
            Some(limit) => after_skip.min(limit),
            None => after_skip,
        })
    }

    fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Document,
    ) -> Result<Vec<Bson>, StoreError> {
        bump(&self.counters.distincts);
        let expr = parse_filter(filter)?;
        let records = self.snapshot(collection)?;
        let mut values = Vec::new();
        for doc in records.values().filter(|doc| matches(doc, &expr)) {
            for value in lookup(doc, field) {
                match value {
                    Bson::Array(items) => {
                        for item in items {
                            push_unique(&mut values, item.clone());
                        }
                    }
                    other => push_unique(&mut values, other.clone()),
                }
            }
        }
        Ok(values)
    }

    fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
    ) -> Result<Vec<Document>, StoreError> {
        bump(&self.counters.aggregates);
        let records = self.snapshot(collection)?;
        run_pipeline(records.values().cloned().collect(), pipeline)
    }
}
