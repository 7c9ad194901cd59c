use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use bson::{Bson, doc};
use strata_query::{Criterion, CriterionNode, Mutation, Sort, parse_mutation, sort_document};
use strata_schema::{CLS_KEY, FieldKind, ID_KEY, Schema};
use strata_store::{
    CountOptions, DataSource, FindAndModifyOptions, FindOptions, ReadPreference, ReturnDocument,
    StoreError,
};
use tracing::{debug, trace, warn};

use crate::cascade::{self, CascadeContext};
use crate::database::{Database, collection_of};
use crate::document::{Document, Value, encode};
use crate::error::Error;
use crate::fields::{SchemaTranslator, translate};
use crate::projection::ProjectionSet;

/// Lifecycle of a [`QueryCursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Fresh from [`Database::objects`]; nothing configured, nothing fetched.
    Unbound,
    /// Built by chain calls; no I/O yet.
    Configuring,
    /// A source cursor is open but nothing has been cached.
    Executing,
    /// Results are being pulled into the cache.
    Caching,
    /// The source is drained; iteration is served from the cache.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Documents,
    /// Logical field paths to extract from each document.
    Scalar(Vec<String>),
    Raw,
}

/// Everything a chain call can change. Cloned on every chain call.
#[derive(Debug, Clone)]
struct CursorState {
    criteria: CriterionNode,
    projection: ProjectionSet,
    /// Storage-level sort keys. `None` applies the type's default ordering;
    /// an empty list asks for no ordering at all.
    ordering: Option<Vec<Sort>>,
    skip: u64,
    limit: Option<u64>,
    batch_size: Option<u32>,
    hint: Option<Bson>,
    no_cursor_timeout: bool,
    read_preference: Option<ReadPreference>,
    mode: Mode,
    none: bool,
    /// Discriminator filter restricting results to the type and its subclasses.
    cls_query: Option<bson::Document>,
    configured: bool,
}

#[derive(Debug, Clone)]
enum Materialized {
    Document(Document),
    Raw(bson::Document),
    Scalar(Bson),
}

/// Options for [`QueryCursor::modify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifyOptions {
    /// Insert a document when nothing matches.
    pub upsert: bool,
    /// Delete the matched document instead of updating it.
    pub remove: bool,
    /// Return the document as it is after the update.
    pub new: bool,
}

/// A lazily executed, chainable query over one document type.
///
/// Chain calls (`filter`, `only`, `order_by`, `limit`, ...) return a new
/// cursor and never touch the receiver. The first fetch opens a source
/// cursor; results are pulled into a private cache `iter_chunk_size` at a
/// time. Cloning keeps the configuration and drops the cache.
pub struct QueryCursor<'db, S: DataSource + 'db> {
    db: &'db Database<S>,
    schema: Arc<Schema>,
    collection: String,
    state: CursorState,
    source: Option<S::Cursor<'db>>,
    cache: Vec<Materialized>,
    position: usize,
    exhausted: bool,
    len: Option<u64>,
    per_document_taken: bool,
}

impl<'db, S: DataSource + 'db> fmt::Debug for QueryCursor<'db, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCursor")
            .field("collection", &self.collection)
            .field("state", &self.state)
            .field("position", &self.position)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl<'db, S: DataSource + 'db> Clone for QueryCursor<'db, S> {
    fn clone(&self) -> Self {
        self.derive(self.state.clone())
    }
}

impl<'db, S: DataSource + 'db> QueryCursor<'db, S> {
    pub(crate) fn new(db: &'db Database<S>, type_name: &str) -> Result<Self, Error> {
        let registry = db.registry();
        let schema = registry.schema(type_name)?.clone();
        let collection = collection_of(&schema)?.to_string();

        let (cls_query, projection) = if schema.allows_inheritance() {
            let classes = registry.subclass_discriminators(type_name)?;
            let query = match classes.as_slice() {
                [only] => doc! { CLS_KEY: only.as_str() },
                _ => doc! { CLS_KEY: { "$in": classes } },
            };
            (Some(query), ProjectionSet::with_always_include([CLS_KEY]))
        } else {
            (None, ProjectionSet::new())
        };

        Ok(Self {
            db,
            schema,
            collection,
            state: CursorState {
                criteria: CriterionNode::Empty,
                projection,
                ordering: None,
                skip: 0,
                limit: None,
                batch_size: None,
                hint: None,
                no_cursor_timeout: false,
                read_preference: None,
                mode: Mode::Documents,
                none: false,
                cls_query,
                configured: false,
            },
            source: None,
            cache: Vec::new(),
            position: 0,
            exhausted: false,
            len: None,
            per_document_taken: false,
        })
    }

    /// A cursor with this one's target and `state`, nothing fetched.
    fn derive(&self, state: CursorState) -> Self {
        Self {
            db: self.db,
            schema: self.schema.clone(),
            collection: self.collection.clone(),
            state,
            source: None,
            cache: Vec::new(),
            position: 0,
            exhausted: false,
            len: None,
            per_document_taken: false,
        }
    }

    fn chain(&self, configure: impl FnOnce(&mut CursorState)) -> Self {
        let mut state = self.state.clone();
        state.configured = true;
        configure(&mut state);
        self.derive(state)
    }

    fn try_chain(
        &self,
        configure: impl FnOnce(&mut CursorState) -> Result<(), Error>,
    ) -> Result<Self, Error> {
        let mut state = self.state.clone();
        state.configured = true;
        configure(&mut state)?;
        Ok(self.derive(state))
    }

    fn translator(&self) -> Result<SchemaTranslator<'db>, Error> {
        SchemaTranslator::new(self.db.registry(), self.schema.name())
    }

    pub fn type_name(&self) -> &str {
        self.schema.name()
    }

    pub fn phase(&self) -> Phase {
        if self.exhausted {
            Phase::Exhausted
        } else if self.source.is_some() {
            if self.cache.is_empty() {
                Phase::Executing
            } else {
                Phase::Caching
            }
        } else if self.state.configured {
            Phase::Configuring
        } else {
            Phase::Unbound
        }
    }

    // ── Chain calls ─────────────────────────────────────────────

    /// AND keyword-style conditions (`("age__gte", 18)`) onto the criteria.
    pub fn filter<I, K, V>(&self, pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        let criterion = Criterion::from_pairs(pairs)?;
        self.call(criterion)
    }

    /// AND a predicate tree onto the criteria. Paths and values are checked
    /// against the schema here, before any I/O.
    pub fn call(&self, criteria: impl Into<CriterionNode>) -> Result<Self, Error> {
        let node = criteria.into();
        node.to_filter(&self.translator()?)?;
        Ok(self.chain(|state| state.criteria = state.criteria.and(&node)))
    }

    pub fn all(&self) -> Self {
        self.chain(|_| {})
    }

    /// A cursor that matches nothing and never reaches the source.
    pub fn none(&self) -> Self {
        self.chain(|state| state.none = true)
    }

    /// Load only `fields`. Chained calls accumulate.
    pub fn only<I, F>(&self, fields: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<str>,
    {
        let paths = self.storage_paths(fields)?;
        self.try_chain(|state| state.projection.include(paths))
    }

    /// Load everything but `fields`.
    pub fn exclude<I, F>(&self, fields: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<str>,
    {
        let paths = self.storage_paths(fields)?;
        self.try_chain(|state| state.projection.exclude(paths))
    }

    /// Projection by spec: `("name", 1)`, `("bio", 0)`, or
    /// `("slice__comments", 5)` / `("slice__comments", [10, 5])`.
    pub fn fields<I, K, V>(&self, spec: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        let mut projection = ProjectionSet::new();
        for (key, value) in spec {
            let key = key.as_ref();
            let value = value.into();
            if let Some(field) = key.strip_prefix("slice__") {
                projection.slice(self.storage_path(field)?, value);
                continue;
            }
            let path = self.storage_path(key)?;
            let include = match value {
                Bson::Boolean(b) => b,
                Bson::Int32(n) => n != 0,
                Bson::Int64(n) => n != 0,
                other => {
                    return Err(Error::InvalidQuery(format!(
                        "invalid projection value for {key}: {other}"
                    )));
                }
            };
            if include {
                projection.include([path])?;
            } else {
                projection.exclude([path])?;
            }
        }
        self.try_chain(|state| {
            state.projection = state.projection.merge(&projection)?;
            Ok(())
        })
    }

    /// Drop every projection entry.
    pub fn all_fields(&self) -> Self {
        self.chain(|state| state.projection.reset())
    }

    /// Order by `keys` (`"-age"`, `"address__city"`). No keys means no
    /// ordering at all, overriding the type's default ordering.
    pub fn order_by<I, K>(&self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let ordering = keys
            .into_iter()
            .filter_map(|key| Sort::parse(key.as_ref()))
            .map(|sort| self.storage_sort(sort))
            .collect();
        self.chain(|state| state.ordering = Some(ordering))
    }

    pub fn limit(&self, n: u64) -> Self {
        self.chain(|state| state.limit = Some(n))
    }

    pub fn skip(&self, n: u64) -> Self {
        self.chain(|state| state.skip = n)
    }

    /// The `[start, stop)` window of this cursor's results. Offsets are
    /// relative to any skip and limit already applied; an empty window
    /// yields an empty cursor.
    pub fn slice(&self, start: u64, stop: u64) -> Self {
        self.chain(|state| {
            let stop = match state.limit {
                Some(limit) => stop.min(limit),
                None => stop,
            };
            state.skip += start;
            state.limit = Some(stop.saturating_sub(start));
        })
    }

    pub fn hint(&self, index: impl Into<Bson>) -> Self {
        let index = index.into();
        self.chain(|state| state.hint = Some(index))
    }

    pub fn batch_size(&self, size: u32) -> Self {
        self.chain(|state| state.batch_size = Some(size))
    }

    /// `false` asks the source to keep the cursor open indefinitely.
    pub fn timeout(&self, enabled: bool) -> Self {
        self.chain(|state| state.no_cursor_timeout = !enabled)
    }

    pub fn read_preference(&self, preference: ReadPreference) -> Self {
        self.chain(|state| state.read_preference = Some(preference))
    }

    /// Restrict results to this exact type, leaving out subclasses.
    pub fn no_sub_classes(&self) -> Self {
        let own = self
            .schema
            .allows_inheritance()
            .then(|| doc! { CLS_KEY: self.schema.class_name() });
        self.chain(|state| state.cls_query = own)
    }

    /// Restrict results to the listed types. Names that are not this type or
    /// one of its subclasses are ignored. Non-polymorphic types are returned
    /// unchanged.
    pub fn only_classes<I, T>(&self, types: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let Some(allowed) = self.allowed_classes(types)? else {
            return Ok(self.clone());
        };
        let query = match allowed.as_slice() {
            [only] => doc! { CLS_KEY: only.as_str() },
            _ => doc! { CLS_KEY: { "$in": allowed } },
        };
        Ok(self.chain(|state| state.cls_query = Some(query)))
    }

    /// Leave the listed types out of the results. Non-polymorphic types are
    /// returned unchanged.
    pub fn exclude_classes<I, T>(&self, types: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let Some(excluded) = self.allowed_classes(types)? else {
            return Ok(self.clone());
        };
        let query = match excluded.as_slice() {
            [only] => doc! { CLS_KEY: { "$ne": only.as_str() } },
            _ => doc! { CLS_KEY: { "$nin": excluded } },
        };
        Ok(self.chain(|state| state.cls_query = Some(query)))
    }

    /// Discriminators of `types` that belong to this type's hierarchy, in
    /// hierarchy order. `None` for a non-polymorphic type.
    fn allowed_classes<I, T>(&self, types: I) -> Result<Option<Vec<String>>, Error>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        if !self.schema.allows_inheritance() {
            return Ok(None);
        }
        let registry = self.db.registry();
        let wanted = types
            .into_iter()
            .map(|name| -> Result<String, Error> {
                Ok(registry.schema(name.as_ref())?.class_name().to_string())
            })
            .collect::<Result<HashSet<_>, _>>()?;
        let allowed = registry
            .subclass_discriminators(self.schema.name())?
            .into_iter()
            .filter(|class| wanted.contains(class))
            .collect();
        Ok(Some(allowed))
    }

    /// Drop the discriminator filter entirely.
    pub fn clear_cls_query(&self) -> Self {
        self.chain(|state| state.cls_query = None)
    }

    /// Yield values of `fields` instead of documents: the value itself for a
    /// single field, an array of values otherwise.
    pub fn scalar<I, F>(&self, fields: I) -> Result<ScalarCursor<'db, S>, Error>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<str>,
    {
        let paths: Vec<String> = fields
            .into_iter()
            .map(|f| f.as_ref().replace("__", "."))
            .collect();
        if paths.is_empty() {
            return Err(Error::InvalidQuery("scalar needs at least one field".into()));
        }
        let cursor = self.only(&paths)?;
        let mut state = cursor.state.clone();
        state.mode = Mode::Scalar(paths);
        Ok(ScalarCursor {
            inner: self.derive(state),
        })
    }

    pub fn values_list<I, F>(&self, fields: I) -> Result<ScalarCursor<'db, S>, Error>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<str>,
    {
        self.scalar(fields)
    }

    /// Yield stored documents without decoding them.
    pub fn as_raw(&self) -> RawCursor<'db, S> {
        let mut state = self.state.clone();
        state.configured = true;
        state.mode = Mode::Raw;
        RawCursor {
            inner: self.derive(state),
        }
    }

    fn storage_path(&self, path: &str) -> Result<String, Error> {
        translate(self.db.registry(), self.schema.name(), &path.replace("__", "."))
    }

    fn storage_paths<I, F>(&self, fields: I) -> Result<Vec<String>, Error>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<str>,
    {
        fields
            .into_iter()
            .map(|f| self.storage_path(f.as_ref()))
            .collect()
    }

    fn storage_sort(&self, sort: Sort) -> Sort {
        match translate(self.db.registry(), self.schema.name(), &sort.field) {
            Ok(field) => Sort { field, ..sort },
            Err(err) => {
                warn!(
                    document = self.schema.name(),
                    key = sort.field.as_str(),
                    %err,
                    "ordering key does not resolve; passing it through"
                );
                sort
            }
        }
    }

    // ── Query rendering ─────────────────────────────────────────

    /// The storage filter: rendered criteria plus the discriminator filter.
    fn query_filter(&self) -> Result<bson::Document, Error> {
        let mut filter = self.state.criteria.to_filter(&self.translator()?)?;
        if let Some(cls) = &self.state.cls_query {
            if filter.contains_key(CLS_KEY) {
                filter = doc! { "$and": [cls.clone(), filter] };
            } else {
                for (key, value) in cls {
                    filter.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(filter)
    }

    fn sort_keys(&self) -> Vec<Sort> {
        match &self.state.ordering {
            Some(keys) => keys.clone(),
            None => self
                .schema
                .default_ordering()
                .iter()
                .filter_map(|key| Sort::parse(key))
                .map(|sort| self.storage_sort(sort))
                .collect(),
        }
    }

    fn sort_spec(&self) -> Option<bson::Document> {
        let keys = self.sort_keys();
        (!keys.is_empty()).then(|| sort_document(&keys))
    }

    fn find_options(&self) -> FindOptions {
        FindOptions {
            projection: self.state.projection.to_document(),
            sort: self.sort_spec(),
            skip: self.state.skip,
            limit: self.state.limit,
            batch_size: self
                .state
                .batch_size
                .or(self.db.config().default_batch_size),
            hint: self.state.hint.clone(),
            no_cursor_timeout: self.state.no_cursor_timeout,
            read_preference: self.state.read_preference,
        }
    }

    /// Whether the cursor can only ever yield nothing.
    fn is_empty_by_construction(&self) -> bool {
        self.state.none || self.state.limit == Some(0)
    }

    // ── Fetching ────────────────────────────────────────────────

    fn open_source(&self) -> Result<S::Cursor<'db>, Error> {
        let db = self.db;
        let filter = self.query_filter()?;
        let options = self.find_options();
        debug!(
            collection = self.collection.as_str(),
            ?filter,
            skip = options.skip,
            limit = ?options.limit,
            "opening source cursor"
        );
        Ok(db.source().find(&self.collection, &filter, &options)?)
    }

    /// Pull the next stored document from the source, opening it if needed.
    fn pull(&mut self) -> Result<Option<bson::Document>, Error> {
        if self.exhausted {
            return Ok(None);
        }
        if self.is_empty_by_construction() {
            self.exhausted = true;
            return Ok(None);
        }
        if self.source.is_none() {
            self.source = Some(self.open_source()?);
        }
        let next = match self.source.as_mut() {
            Some(source) => source.next().transpose()?,
            None => None,
        };
        if next.is_none() {
            self.exhausted = true;
            // Dropping the source cursor releases it.
            self.source = None;
        }
        Ok(next)
    }

    /// Grow the cache by up to one chunk. Returns how many were added.
    fn populate(&mut self) -> Result<usize, Error> {
        let chunk = self.db.config().iter_chunk_size.max(1);
        let mut added = 0;
        while added < chunk {
            let Some(raw) = self.pull()? else {
                break;
            };
            let item = self.materialize(raw)?;
            self.cache.push(item);
            added += 1;
        }
        trace!(
            collection = self.collection.as_str(),
            added,
            cached = self.cache.len(),
            "populated result cache"
        );
        Ok(added)
    }

    fn populate_all(&mut self) -> Result<(), Error> {
        while !self.exhausted {
            self.populate()?;
        }
        Ok(())
    }

    fn materialize(&self, raw: bson::Document) -> Result<Materialized, Error> {
        let registry = self.db.registry();
        Ok(match &self.state.mode {
            Mode::Raw => Materialized::Raw(raw),
            Mode::Documents => {
                Materialized::Document(Document::from_storage(registry, &self.schema, raw, true)?)
            }
            Mode::Scalar(paths) => {
                let document = Document::from_storage(registry, &self.schema, raw, true)?;
                let mut values = paths
                    .iter()
                    .map(|path| scalar_value(&document, path))
                    .collect::<Result<Vec<_>, _>>()?;
                if values.len() == 1 {
                    Materialized::Scalar(values.remove(0))
                } else {
                    Materialized::Scalar(Bson::Array(values))
                }
            }
        })
    }

    fn next_materialized(&mut self) -> Option<Result<Materialized, Error>> {
        if self.position >= self.cache.len() && !self.exhausted {
            if let Err(err) = self.populate() {
                return Some(Err(err));
            }
        }
        let item = self.cache.get(self.position)?.clone();
        self.position += 1;
        Some(Ok(item))
    }

    /// Pull one document straight from the source without growing the cache
    /// by a whole chunk. Results already cached but not yet yielded are
    /// skipped; the pulled document is still cached, so a later
    /// [`rewind`](Self::rewind) replays it.
    pub fn fetch_next(&mut self) -> Option<Result<Document, Error>> {
        let raw = match self.pull() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        };
        let item = match self.materialize(raw) {
            Ok(item) => item,
            Err(err) => return Some(Err(err)),
        };
        self.cache.push(item.clone());
        self.position = self.cache.len();
        Some(expect_document(item))
    }

    /// Restart iteration. A fully fetched cursor replays its cache; otherwise
    /// the source cursor is released and reopened on the next fetch.
    pub fn rewind(&mut self) -> Result<(), Error> {
        if self.per_document_taken {
            return Err(Error::Operation(
                "cannot rewind a cursor consumed by a per-document delete".into(),
            ));
        }
        self.position = 0;
        if !self.exhausted {
            self.source = None;
            self.cache.clear();
        }
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────

    /// Number of matching documents. With `with_limit_and_skip` the cursor's
    /// window applies and the result is cached on this cursor.
    pub fn count(&mut self, with_limit_and_skip: bool) -> Result<u64, Error> {
        if self.is_empty_by_construction() {
            return Ok(0);
        }
        if with_limit_and_skip && let Some(len) = self.len {
            return Ok(len);
        }
        let options = CountOptions {
            skip: if with_limit_and_skip { self.state.skip } else { 0 },
            limit: if with_limit_and_skip { self.state.limit } else { None },
            hint: self.state.hint.clone(),
        };
        let filter = self.query_filter()?;
        let count = self
            .db
            .source()
            .count_documents(&self.collection, &filter, &options)?;
        if with_limit_and_skip {
            self.len = Some(count);
        }
        Ok(count)
    }

    /// Fetch every remaining result into the cache and return how many
    /// there are.
    pub fn len(&mut self) -> Result<u64, Error> {
        if let Some(len) = self.len {
            return Ok(len);
        }
        self.populate_all()?;
        let len = self.cache.len() as u64;
        self.len = Some(len);
        Ok(len)
    }

    pub fn is_empty(&mut self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// The result at `index`, or `None` past the end.
    pub fn nth(&self, index: u64) -> Result<Option<Document>, Error> {
        let mut window = self.slice(index, index.saturating_add(1));
        window.next_document().transpose()
    }

    pub fn first(&self) -> Result<Option<Document>, Error> {
        self.nth(0)
    }

    /// The single document matching `pairs`.
    ///
    /// Fetches at most two documents: none is [`Error::DoesNotExist`], two
    /// is [`Error::MultipleObjectsReturned`].
    pub fn get<I, K, V>(&self, pairs: I) -> Result<Document, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        self.filter(pairs)?.one()
    }

    /// The single document this cursor matches. See [`get`](Self::get).
    pub fn one(&self) -> Result<Document, Error> {
        let mut cursor = self.order_by(std::iter::empty::<&str>()).limit(2);
        let name = self.schema.name().to_string();
        let Some(first) = cursor.next_document().transpose()? else {
            return Err(Error::DoesNotExist {
                message: format!("{name} matching query does not exist."),
                document: name,
            });
        };
        if cursor.next_document().transpose()?.is_none() {
            return Ok(first);
        }
        let count = cursor.count(true)?;
        Err(Error::MultipleObjectsReturned {
            message: format!("{count} items returned, instead of 1"),
            document: name,
        })
    }

    /// Create and save a new document with `values`.
    pub fn create<I, K, V>(&self, values: I) -> Result<Document, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        let mut document = self.db.new_document(self.schema.name())?;
        for (key, value) in values {
            document.set(key.as_ref(), Value::Bson(value.into()))?;
        }
        self.db.save(&mut document)?;
        Ok(document)
    }

    /// Distinct stored values of `field` across matching documents. Ordering
    /// and paging are ignored.
    pub fn distinct(&self, field: &str) -> Result<Vec<Bson>, Error> {
        if self.state.none {
            return Ok(Vec::new());
        }
        let path = self.storage_path(field)?;
        let filter = self.query_filter()?;
        Ok(self.db.source().distinct(&self.collection, &path, &filter)?)
    }

    /// Matching documents as a relaxed extended JSON array.
    pub fn to_json(&self) -> Result<String, Error> {
        let items = self
            .as_raw()
            .map(|raw| raw.map(|d| Bson::Document(d).into_relaxed_extjson()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(serde_json::to_string(&serde_json::Value::Array(items))?)
    }

    /// Decode a JSON array of stored documents. The results are unsaved.
    pub fn from_json(&self, json: &str) -> Result<Vec<Document>, Error> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let serde_json::Value::Array(items) = value else {
            return Err(Error::Serialization("expected a JSON array of documents".into()));
        };
        items
            .into_iter()
            .map(|item| {
                let raw = match Bson::try_from(item) {
                    Ok(Bson::Document(raw)) => raw,
                    Ok(other) => {
                        return Err(Error::Serialization(format!(
                            "expected a document, found {other}"
                        )));
                    }
                    Err(err) => return Err(Error::Serialization(err.to_string())),
                };
                Document::from_storage(self.db.registry(), &self.schema, raw, false)
            })
            .collect()
    }

    /// The document whose primary key is `id`.
    pub fn with_id(&self, id: impl Into<Bson>) -> Result<Option<Document>, Error> {
        if !self.state.criteria.is_empty() {
            return Err(Error::InvalidQuery(
                "Cannot use a filter whilst using `with_id`".into(),
            ));
        }
        self.filter([("pk", id.into())])?.first()
    }

    /// Documents whose primary key is in `ids`, paired with their key. The
    /// cursor's criteria are not applied.
    pub fn in_bulk(&self, ids: &[Bson]) -> Result<Vec<(Bson, Document)>, Error> {
        let pk = self.pk_storage_name();
        let filter = doc! { pk.as_str(): { "$in": ids.to_vec() } };
        let options = FindOptions {
            projection: self.state.projection.to_document(),
            ..FindOptions::default()
        };
        let registry = self.db.registry();
        let mut out = Vec::new();
        for raw in self.db.source().find(&self.collection, &filter, &options)? {
            let raw = raw?;
            let id = raw.get(&pk).cloned().unwrap_or(Bson::Null);
            out.push((id, Document::from_storage(registry, &self.schema, raw, true)?));
        }
        Ok(out)
    }

    /// Sum of `field` over matching documents. List fields sum their
    /// elements. Zero when nothing matches.
    pub fn sum(&self, field: &str) -> Result<Bson, Error> {
        let total = self.aggregate_field(field, "$sum")?;
        Ok(match total {
            Bson::Null => Bson::Int32(0),
            other => other,
        })
    }

    /// Mean of `field` over matching documents, zero when nothing matches.
    pub fn average(&self, field: &str) -> Result<f64, Error> {
        Ok(match self.aggregate_field(field, "$avg")? {
            Bson::Double(n) => n,
            Bson::Int32(n) => f64::from(n),
            Bson::Int64(n) => n as f64,
            _ => 0.0,
        })
    }

    fn aggregate_field(&self, field: &str, accumulator: &str) -> Result<Bson, Error> {
        if self.state.none {
            return Ok(Bson::Null);
        }
        let logical = field.replace("__", ".");
        let path = self.storage_path(&logical)?;
        let mut pipeline = vec![doc! { "$match": self.query_filter()? }];
        if self.ends_on_list(&logical) {
            pipeline.push(doc! { "$unwind": format!("${path}") });
        }
        pipeline.push(doc! {
            "$group": { "_id": Bson::Null, "total": { accumulator: format!("${path}") } }
        });
        let results = self.db.source().aggregate(&self.collection, &pipeline)?;
        Ok(results
            .into_iter()
            .next()
            .and_then(|mut d| d.remove("total"))
            .unwrap_or(Bson::Null))
    }

    fn ends_on_list(&self, path: &str) -> bool {
        let segments: Vec<&str> = path.split('.').collect();
        crate::fields::resolve(self.db.registry(), self.schema.name(), &segments)
            .ok()
            .and_then(|resolved| resolved.last().and_then(|s| s.field()).map(|f| f.kind().is_list()))
            .unwrap_or(false)
    }

    fn pk_storage_name(&self) -> String {
        self.schema
            .primary_key()
            .map_or(ID_KEY, |pk| pk.storage_name())
            .to_string()
    }

    // ── Writes ──────────────────────────────────────────────────

    /// Apply keyword-style modifiers (`("inc__views", 1)`) to every matching
    /// document. Returns the number of documents matched.
    pub fn update<I, K, V>(&self, modifiers: I) -> Result<u64, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        self.update_with(parse_mutation(modifiers)?, false, true)
    }

    /// Like [`update`](Self::update) for the first matching document only.
    pub fn update_one<I, K, V>(&self, modifiers: I) -> Result<u64, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        self.update_with(parse_mutation(modifiers)?, false, false)
    }

    /// Update the first match, inserting a document when nothing matches,
    /// and return the resulting document.
    pub fn upsert_one<I, K, V>(&self, modifiers: I) -> Result<Option<Document>, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        let update = self.render_update(&parse_mutation(modifiers)?, true)?;
        let filter = self.query_filter()?;
        let result = self
            .db
            .source()
            .update_one(&self.collection, &filter, &update, true)
            .map_err(update_error)?;
        match result.upserted_id {
            Some(id) => self.all().clear_criteria().with_id(id),
            None => self.one().map(Some),
        }
    }

    /// Apply a prepared [`Mutation`]. `multi` updates every match instead of
    /// the first.
    pub fn update_with(&self, mutation: Mutation, upsert: bool, multi: bool) -> Result<u64, Error> {
        if mutation.is_empty() && !upsert {
            return Err(Error::Operation("No update parameters, would remove data".into()));
        }
        if self.state.none {
            return Ok(0);
        }
        let update = self.render_update(&mutation, upsert)?;
        let filter = self.query_filter()?;
        let source = self.db.source();
        let result = if multi {
            source.update_many(&self.collection, &filter, &update, upsert)
        } else {
            source.update_one(&self.collection, &filter, &update, upsert)
        }
        .map_err(update_error)?;
        debug!(
            collection = self.collection.as_str(),
            matched = result.matched,
            modified = result.modified,
            "applied update"
        );
        Ok(result.matched + u64::from(result.upserted_id.is_some()))
    }

    /// Render modifiers. An upsert on a polymorphic type also sets the
    /// discriminator so the inserted document decodes as this type.
    fn render_update(&self, mutation: &Mutation, upsert: bool) -> Result<bson::Document, Error> {
        let mut update = mutation.to_document(&self.translator()?)?;
        if upsert && self.state.cls_query.is_some() {
            let class = Bson::String(self.schema.class_name().to_string());
            match update.get_mut("$set") {
                Some(Bson::Document(set)) => {
                    set.insert(CLS_KEY, class);
                }
                _ => {
                    update.insert("$set", doc! { CLS_KEY: class });
                }
            }
        }
        Ok(update)
    }

    /// Atomically update or delete the first match (in this cursor's order)
    /// and return it, as it was before or, with `new`, after the update.
    pub fn modify<I, K, V>(&self, options: ModifyOptions, modifiers: I) -> Result<Option<Document>, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        if options.remove && options.new {
            return Err(Error::Operation("Conflicting parameters: remove and new".into()));
        }
        let mutation = parse_mutation(modifiers)?;
        if mutation.is_empty() && !options.upsert && !options.remove {
            return Err(Error::Operation(
                "No update parameters, must either update or remove".into(),
            ));
        }
        let filter = self.query_filter()?;
        let find_options = FindAndModifyOptions {
            sort: self.sort_spec(),
            upsert: options.upsert,
            return_document: if options.new {
                ReturnDocument::After
            } else {
                ReturnDocument::Before
            },
            projection: self.state.projection.to_document(),
        };
        let source = self.db.source();
        let raw = if options.remove {
            source.find_one_and_delete(&self.collection, &filter, &find_options)
        } else {
            let update = self.render_update(&mutation, options.upsert)?;
            source.find_one_and_update(&self.collection, &filter, &update, &find_options)
        }
        .map_err(update_error)?;
        raw.map(|raw| Document::from_storage(self.db.registry(), &self.schema, raw, true))
            .transpose()
    }

    /// Delete every matching document, applying the type's delete rules
    /// first.
    ///
    /// With a skip or limit in place, or observers that want delete events,
    /// documents are deleted one at a time through
    /// [`Database::delete_document`]. Such a cursor can no longer be rewound.
    /// Delete rules are then checked per document: a DENY hit on a later
    /// document leaves the earlier ones deleted.
    pub fn delete(&mut self) -> Result<u64, Error> {
        let mut context = CascadeContext::new(self.db.config());
        self.delete_in(false, &mut context)
    }

    pub(crate) fn delete_in(
        &mut self,
        from_document: bool,
        context: &mut CascadeContext,
    ) -> Result<u64, Error> {
        let windowed = self.state.skip > 0 || self.state.limit.is_some();
        let per_document =
            !from_document && (windowed || self.db.has_delete_observers(self.schema.name()));

        if per_document {
            debug!(
                collection = self.collection.as_str(),
                windowed, "deleting one document at a time"
            );
            self.per_document_taken = true;
            let documents = self.clone().documents().collect::<Result<Vec<_>, _>>()?;
            let mut deleted = 0;
            for document in &documents {
                deleted += self.db.delete_document_in(document, context)?;
            }
            return Ok(deleted);
        }
        if self.state.none {
            return Ok(0);
        }

        let filter = self.query_filter()?;
        cascade::apply(self.db, &self.schema, &self.collection, &filter, context)?;
        let deleted = self
            .db
            .source()
            .delete_many(&self.collection, &filter)
            .map_err(|err| Error::Operation(format!("Could not delete document ({})", err.message())))?;
        debug!(collection = self.collection.as_str(), deleted, "bulk delete");
        Ok(deleted)
    }

    /// Insert unsaved documents of this type in one batch, all or nothing.
    pub fn insert(&self, mut documents: Vec<Document>) -> Result<Vec<Document>, Error> {
        let registry = self.db.registry();
        let own = self.schema.name();
        for document in &documents {
            let name = document.type_name();
            if name != own && !registry.subclasses(own).iter().any(|s| s == name) {
                return Err(Error::Operation(format!(
                    "Some documents inserted aren't instances of {}",
                    self.schema.class_name()
                )));
            }
            if document.is_saved() && document.pk().is_some() {
                return Err(Error::Operation(
                    "Some documents have ObjectIds, use doc.update() instead".into(),
                ));
            }
        }
        if documents.is_empty() {
            return Ok(documents);
        }

        let observers = self.db.observers_for(own);
        for observer in &observers {
            observer.pre_bulk_insert(&mut documents)?;
        }
        let raws = documents
            .iter()
            .map(Document::to_storage)
            .collect::<Result<Vec<_>, _>>()?;
        let ids = self
            .db
            .source()
            .insert_many(&self.collection, raws)
            .map_err(|err| {
                Error::from_write(
                    err,
                    |msg| format!("Could not save document ({msg})"),
                    |msg| format!("Could not save document ({msg})"),
                )
            })?;
        for (document, id) in documents.iter_mut().zip(ids) {
            document.set_pk(id);
            document.saved = true;
            document.clear_changes();
        }
        debug!(
            collection = self.collection.as_str(),
            inserted = documents.len(),
            "bulk insert"
        );
        for observer in &observers {
            observer.post_bulk_insert(&documents);
        }
        Ok(documents)
    }

    fn clear_criteria(&self) -> Self {
        self.chain(|state| state.criteria = CriterionNode::Empty)
    }
}

impl<'db, S: DataSource + 'db> QueryCursor<'db, S> {
    /// The next result, served from the cache when it has one.
    pub fn next_document(&mut self) -> Option<Result<Document, Error>> {
        Some(self.next_materialized()?.and_then(expect_document))
    }

    /// Iterate the remaining results. Iteration resumes where the previous
    /// one stopped; call [`rewind`](Self::rewind) to start over.
    pub fn documents(&mut self) -> Documents<'_, 'db, S> {
        Documents { cursor: self }
    }
}

/// Borrowing iterator over a [`QueryCursor`]'s documents.
pub struct Documents<'c, 'db, S: DataSource + 'db> {
    cursor: &'c mut QueryCursor<'db, S>,
}

impl<S: DataSource> Iterator for Documents<'_, '_, S> {
    type Item = Result<Document, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_document()
    }
}

impl<'c, 'db, S: DataSource + 'db> IntoIterator for &'c mut QueryCursor<'db, S> {
    type Item = Result<Document, Error>;
    type IntoIter = Documents<'c, 'db, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents()
    }
}

fn expect_document(item: Materialized) -> Result<Document, Error> {
    match item {
        Materialized::Document(document) => Ok(document),
        _ => Err(Error::Operation("cursor is not yielding documents".into())),
    }
}

fn update_error(err: StoreError) -> Error {
    Error::from_write(
        err,
        |msg| format!("Update failed ({msg})"),
        |msg| format!("Update failed ({msg})"),
    )
}

/// The value at a logical path of a document, in storage form.
fn scalar_value(document: &Document, path: &str) -> Result<Bson, Error> {
    let mut segments = path.split('.');
    let Some(head) = segments.next() else {
        return Ok(Bson::Null);
    };
    let rest: Vec<&str> = segments.collect();
    let value = match document.get(head) {
        Some(value) => value_at(value.clone(), &rest),
        None => return Ok(Bson::Null),
    };
    encode(&value, &FieldKind::Any, path, &mut HashSet::new())
}

fn value_at(value: Value, segments: &[&str]) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return value;
    };
    let null = || Value::Bson(Bson::Null);
    match value {
        Value::Embedded(embedded) => embedded
            .get(head)
            .map_or_else(null, |inner| value_at(inner, rest)),
        Value::List(items) => match head.parse::<usize>() {
            Ok(i) => items
                .into_iter()
                .nth(i)
                .map_or_else(null, |item| value_at(item, rest)),
            Err(_) => Value::List(
                items
                    .into_iter()
                    .map(|item| value_at(item, segments))
                    .collect(),
            ),
        },
        Value::Map(entries) => entries
            .into_iter()
            .find(|(k, _)| k.as_str() == *head)
            .map_or_else(null, |(_, item)| value_at(item, rest)),
        Value::Bson(Bson::Document(mut doc)) => doc
            .remove(*head)
            .map_or_else(null, |inner| value_at(Value::Bson(inner), rest)),
        Value::Bson(_) => null(),
    }
}

/// Cursor in scalar mode; see [`QueryCursor::scalar`].
pub struct ScalarCursor<'db, S: DataSource + 'db> {
    inner: QueryCursor<'db, S>,
}

impl<S: DataSource> ScalarCursor<'_, S> {
    pub fn rewind(&mut self) -> Result<(), Error> {
        self.inner.rewind()
    }
}

impl<S: DataSource> Iterator for ScalarCursor<'_, S> {
    type Item = Result<Bson, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next_materialized()?.and_then(|item| match item {
            Materialized::Scalar(value) => Ok(value),
            _ => Err(Error::Operation("cursor is not yielding values".into())),
        }))
    }
}

/// Cursor over undecoded stored documents; see [`QueryCursor::as_raw`].
pub struct RawCursor<'db, S: DataSource + 'db> {
    inner: QueryCursor<'db, S>,
}

impl<S: DataSource> RawCursor<'_, S> {
    pub fn rewind(&mut self) -> Result<(), Error> {
        self.inner.rewind()
    }
}

impl<S: DataSource> Iterator for RawCursor<'_, S> {
    type Item = Result<bson::Document, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next_materialized()?.and_then(|item| match item {
            Materialized::Raw(raw) => Ok(raw),
            _ => Err(Error::Operation("cursor is not yielding raw documents".into())),
        }))
    }
}
