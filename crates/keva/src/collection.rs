//! Module: collection
//! Responsibility: primary record CRUD, key assignment, batch packing and
//! explosion, and index upkeep for one named record collection.
//! Boundary: reads flow through the batch cursor; writes go straight to
//! the engine (or the supplied transaction handle).

use crate::cursor::{BatchRangeCursor, Direction};
use crate::encoder::{CborEncoder, Packer, PlainPacker, ValueEncoder};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::index::{Index, IndexDef, IndexKeys};
use crate::store::{CollectionInfo, Store};
use keva_keys::{Key, encode_key, encode_keys, write_varint};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashSet;
use std::rc::Rc;
use tracing::debug;

///
/// KeyStrategy
///
/// How `put` assigns a key when the caller supplies none and the record
/// carries none it may reuse.
///

enum KeyStrategy<V> {
    /// Draw the next value from a named store counter.
    Counter(String),
    /// Derive from the value alone.
    Value(Box<dyn Fn(&V) -> Key>),
    /// Derive with access to the active transaction (or the engine).
    Txn(Box<dyn Fn(Option<&dyn Engine>, &V) -> Result<Key>>),
}

///
/// CollectionOptions
///
/// Construction-time configuration for a collection. The default is a
/// serde value codec, identity compression and counter-assigned keys.
///

pub struct CollectionOptions<V> {
    pub(crate) encoder: Rc<dyn ValueEncoder<V>>,
    packer: Rc<dyn Packer>,
    key_func: Option<Box<dyn Fn(&V) -> Key>>,
    txn_key_func: Option<Box<dyn Fn(Option<&dyn Engine>, &V) -> Result<Key>>>,
    derived_keys: bool,
    blind: bool,
    counter_name: Option<String>,
}

impl<V: Serialize + DeserializeOwned + 'static> CollectionOptions<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_encoder(Rc::new(CborEncoder))
    }
}

impl<V: Serialize + DeserializeOwned + 'static> Default for CollectionOptions<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CollectionOptions<V> {
    /// Start from an explicit value codec, for types without serde support.
    #[must_use]
    pub fn with_encoder(encoder: Rc<dyn ValueEncoder<V>>) -> Self {
        Self {
            encoder,
            packer: Rc::new(PlainPacker),
            key_func: None,
            txn_key_func: None,
            derived_keys: false,
            blind: false,
            counter_name: None,
        }
    }

    /// Default compression for physical values.
    #[must_use]
    pub fn packer(mut self, packer: Rc<dyn Packer>) -> Self {
        self.packer = packer;
        self
    }

    /// Derive record keys from values. A lone primitive return value is
    /// wrapped into a 1-tuple by the `Into<Key>` conversions.
    #[must_use]
    pub fn key_func<K: Into<Key>>(mut self, func: impl Fn(&V) -> K + 'static) -> Self {
        self.key_func = Some(Box::new(move |v| func(v).into()));
        self
    }

    /// Derive record keys with access to the active transaction handle.
    #[must_use]
    pub fn txn_key_func<K: Into<Key>>(
        mut self,
        func: impl Fn(Option<&dyn Engine>, &V) -> Result<K> + 'static,
    ) -> Self {
        self.txn_key_func = Some(Box::new(move |txn, v| func(txn, v).map(Into::into)));
        self
    }

    /// Re-invoke the key function on every save, deleting the old key and
    /// its index entries when the derived key changes.
    #[must_use]
    pub const fn derived_keys(mut self, derived: bool) -> Self {
        self.derived_keys = derived;
        self
    }

    /// Skip the stale-record check on every put. Safe when keys are never
    /// reassigned; see [`Collection::put_opts`].
    #[must_use]
    pub const fn blind(mut self, blind: bool) -> Self {
        self.blind = blind;
        self
    }

    /// Name of the store counter used for auto-assigned keys. Defaults to
    /// `"key:<collection-name>"`.
    #[must_use]
    pub fn counter_name(mut self, name: impl Into<String>) -> Self {
        self.counter_name = Some(name.into());
        self
    }

    pub(crate) fn encoder_name(&self) -> &str {
        self.encoder.name()
    }
}

///
/// Record
///
/// A value plus the key it was last saved under, the shape it was stored
/// in, and the index entries that were valid for it. Re-saving or deleting
/// a fetched record lets the collection skip rediscovery.
///

#[derive(Debug)]
pub struct Record<V> {
    pub data: V,
    pub(crate) key: Option<Key>,
    pub(crate) batch: bool,
    pub(crate) txn_id: Option<u64>,
    pub(crate) index_keys: Option<Vec<Vec<u8>>>,
    pub(crate) coll_idx: Option<u64>,
}

impl<V> Record<V> {
    #[must_use]
    pub const fn new(data: V) -> Self {
        Self {
            data,
            key: None,
            batch: false,
            txn_id: None,
            index_keys: None,
            coll_idx: None,
        }
    }

    /// Key this record was last saved under, if it has ever been saved.
    #[must_use]
    pub const fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// True when the record was read out of a batched physical entry.
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        self.batch
    }

    /// Transaction the record was read under, if the engine reported one.
    #[must_use]
    pub const fn txn_id(&self) -> Option<u64> {
        self.txn_id
    }

    #[must_use]
    pub fn into_data(self) -> V {
        self.data
    }
}

impl<V> From<V> for Record<V> {
    fn from(data: V) -> Self {
        Self::new(data)
    }
}

///
/// PutOptions
///

#[derive(Default)]
pub struct PutOptions<'t> {
    pub txn: Option<&'t dyn Engine>,
    /// Compression override for this write only.
    pub packer: Option<Rc<dyn Packer>>,
    /// Forced key, overriding the collection's key assignment.
    pub key: Option<Key>,
    /// Skip the stale-record check for this write only.
    pub blind: bool,
}

///
/// RangeQuery
///
/// Filter specification shared by the range read operations: an exact key,
/// or bounds with `include` applying to the upper one, a direction, and a
/// result cap. `txn` routes the reads through a transaction handle.
///

#[derive(Default)]
pub struct RangeQuery<'t> {
    pub key: Option<Key>,
    pub lo: Option<Key>,
    pub hi: Option<Key>,
    pub reverse: bool,
    pub max: Option<usize>,
    pub include: bool,
    pub txn: Option<&'t dyn Engine>,
}

impl<'t> RangeQuery<'t> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn lo(mut self, lo: impl Into<Key>) -> Self {
        self.lo = Some(lo.into());
        self
    }

    #[must_use]
    pub fn hi(mut self, hi: impl Into<Key>) -> Self {
        self.hi = Some(hi.into());
        self
    }

    #[must_use]
    pub const fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    #[must_use]
    pub const fn max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    #[must_use]
    pub const fn include(mut self) -> Self {
        self.include = true;
        self
    }

    #[must_use]
    pub fn txn(mut self, txn: &'t dyn Engine) -> Self {
        self.txn = Some(txn);
        self
    }
}

///
/// BatchOptions
///

pub struct BatchOptions<'t, V> {
    pub lo: Option<Key>,
    pub hi: Option<Key>,
    /// Flush the building batch when it reaches this many records.
    pub max_recs: Option<usize>,
    /// Flush before the encoded batch value would exceed this many bytes.
    pub max_bytes: Option<usize>,
    /// Leave pre-existing batches untouched instead of consuming them.
    pub preserve: bool,
    pub packer: Option<Rc<dyn Packer>>,
    pub txn: Option<&'t dyn Engine>,
    /// Physical record visit cap; lets batching proceed incrementally.
    pub max_phys: Option<usize>,
    /// Flush whenever this function's value changes between neighbours.
    pub grouper: Option<Box<dyn Fn(&V) -> Key>>,
}

impl<V> Default for BatchOptions<'_, V> {
    fn default() -> Self {
        Self {
            lo: None,
            hi: None,
            max_recs: None,
            max_bytes: None,
            preserve: true,
            packer: None,
            txn: None,
            max_phys: None,
            grouper: None,
        }
    }
}

///
/// BatchOutcome
///
/// `found` records were packed into `made` batches; `last_key` is the last
/// logical key visited, the resume point when a physical cap was set.
///

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchOutcome {
    pub found: usize,
    pub made: usize,
    pub last_key: Option<Key>,
}

///
/// Collection
///
/// A named, ordered set of records plus the secondary indices kept
/// consistent with it.
///

pub struct Collection<V> {
    store: Store,
    info: CollectionInfo,
    prefix: Vec<u8>,
    encoder: Rc<dyn ValueEncoder<V>>,
    packer: Rc<dyn Packer>,
    strategy: KeyStrategy<V>,
    derived_keys: bool,
    blind: bool,
    indices: Vec<IndexDef<V>>,
}

impl<V> Collection<V> {
    pub(crate) fn new(store: Store, info: CollectionInfo, opts: CollectionOptions<V>) -> Self {
        let prefix = store.prefix_for(info.idx);
        let mut derived_keys = opts.derived_keys;
        let mut blind = opts.blind;
        let strategy = if let Some(f) = opts.txn_key_func {
            KeyStrategy::Txn(f)
        } else if let Some(f) = opts.key_func {
            KeyStrategy::Value(f)
        } else {
            // Counter keys are never reassigned, so the stale-record check
            // would never find anything.
            derived_keys = false;
            blind = true;
            let name = opts
                .counter_name
                .unwrap_or_else(|| format!("key:{}", info.name));
            KeyStrategy::Counter(name)
        };
        Self {
            store,
            info,
            prefix,
            encoder: opts.encoder,
            packer: opts.packer,
            strategy,
            derived_keys,
            blind,
            indices: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    #[must_use]
    pub const fn info(&self) -> &CollectionInfo {
        &self.info
    }

    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    fn engine<'t>(&'t self, txn: Option<&'t dyn Engine>) -> &'t dyn Engine {
        txn.unwrap_or_else(|| self.store.engine_ref())
    }

    /// Register a secondary index. The index function may return a
    /// primitive, a tuple, or a list of either; see [`IndexKeys`]. Indices
    /// are not themselves persistent — re-register on every open, the way
    /// collections are re-opened.
    pub fn add_index<R: IndexKeys>(
        &mut self,
        name: &str,
        func: impl Fn(&V) -> R + 'static,
    ) -> Result<()> {
        if self.indices.iter().any(|def| def.name() == name) {
            return Err(Error::InvalidQuery("index name already registered"));
        }
        let info_name = format!("index:{}:{}", self.info.name, name);
        let info = self.store.collection_info(&info_name, Some(&self.info.name))?;
        let prefix = self.store.prefix_for(info.idx);
        self.indices.push(IndexDef::new(name, info, prefix, func));
        Ok(())
    }

    /// Borrowed view over one registered index.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<Index<'_, V>> {
        self.indices
            .iter()
            .find(|def| def.name() == name)
            .map(|def| Index::new(self, def))
    }

    /// Packed engine keys of every index entry this value produces.
    pub(crate) fn index_keys_for(&self, key: &Key, value: &V) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for def in &self.indices {
            for tuple in def.tuples_for(value) {
                out.push(encode_keys(def.prefix(), &[tuple, key.clone()]));
            }
        }
        out
    }

    fn assign_key(&self, rec: &Record<V>, txn: Option<&dyn Engine>) -> Result<Key> {
        if let Some(key) = &rec.key
            && !self.derived_keys
        {
            return Ok(key.clone());
        }
        match &self.strategy {
            KeyStrategy::Txn(func) => func(txn, &rec.data),
            KeyStrategy::Value(func) => Ok(func(&rec.data)),
            KeyStrategy::Counter(name) => {
                let value = self.store.count_opts(name, 1, 1, txn)?;
                Ok(Key::from(value))
            }
        }
    }

    /// Build the batch-aware cursor a query maps to. The driving loop in
    /// [`Collection::items`] is usually what you want; the raw cursor
    /// additionally exposes the physical shape of what it visits.
    pub fn cursor<'c>(&'c self, query: &RangeQuery<'c>) -> BatchRangeCursor<'c> {
        let dir = if query.reverse && query.key.is_none() {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        let mut cur =
            BatchRangeCursor::new(&self.store, self.engine(query.txn), self.prefix.clone(), dir);
        if let Some(key) = &query.key {
            cur.set_exact(key.clone());
        } else {
            if let Some(lo) = &query.lo {
                cur.set_lo(lo.clone(), true);
            }
            if let Some(hi) = &query.hi {
                cur.set_hi(hi.clone(), query.include);
            }
        }
        if let Some(max) = query.max {
            cur.set_max(max);
        }
        cur
    }

    /// Scope a range read to every key the given key tuple-prefixes.
    pub fn prefix_cursor<'c>(
        &'c self,
        key: impl Into<Key>,
        reverse: bool,
        txn: Option<&'c dyn Engine>,
    ) -> BatchRangeCursor<'c> {
        let dir = if reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        let mut cur = BatchRangeCursor::new(&self.store, self.engine(txn), self.prefix.clone(), dir);
        cur.set_prefix(key.into());
        cur
    }

    /// Create or overwrite a record with default options.
    pub fn put(&self, rec: impl Into<Record<V>>) -> Result<Record<V>> {
        self.put_opts(rec, PutOptions::default())
    }

    /// Create or overwrite a record.
    ///
    /// Key assignment: an explicit `opts.key` wins; otherwise a fetched
    /// record's own key is reused (unless keys are derived); otherwise the
    /// configured key function or counter runs. When the record replaces a
    /// batched version of itself the batch is exploded first, and index
    /// entries that are no longer produced are removed, in write order:
    /// old record, old entries, new record, new entries.
    ///
    /// Without `blind`, a put against an indexed collection first deletes
    /// whatever record already holds the target key, so its index entries
    /// cannot go stale. Blind puts skip that read; combining them with
    /// indices and key reuse leaves entries behind (`Index::items` warns
    /// when it finds one).
    pub fn put_opts(&self, rec: impl Into<Record<V>>, opts: PutOptions<'_>) -> Result<Record<V>> {
        let mut rec = rec.into();
        let obj_key = match opts.key {
            Some(key) => key,
            None => self.assign_key(&rec, opts.txn)?,
        };
        let index_keys = self.index_keys_for(&obj_key, &rec.data);
        let eng = self.engine(opts.txn);

        if rec.coll_idx == Some(self.info.idx)
            && let Some(old_key) = rec.key.clone()
        {
            if rec.batch {
                // The old version lives inside a batch: rewrite its
                // siblings as singles, dropping the old version itself.
                self.split_batch(&old_key, opts.txn)?;
            } else if old_key != obj_key {
                eng.delete(&encode_key(&self.prefix, &old_key))?;
            }
            if rec.index_keys.as_ref() != Some(&index_keys) {
                for entry in rec.index_keys.iter().flatten() {
                    eng.delete(entry)?;
                }
            }
        } else if !self.indices.is_empty() && !(opts.blind || self.blind) {
            // Unknown provenance: purge whatever sits at the target key so
            // its index entries cannot survive the overwrite.
            self.delete_opts(obj_key.clone(), opts.txn)?;
        }

        let packer = opts.packer.as_ref().unwrap_or(&self.packer);
        let packer_byte = self.store.add_encoder(Rc::clone(packer))?;
        let encoded = self.encoder.pack(&rec.data)?;
        let mut value = Vec::with_capacity(1 + encoded.len());
        value.push(packer_byte);
        value.extend_from_slice(&packer.pack(&encoded)?);
        eng.put(&encode_key(&self.prefix, &obj_key), &value)?;
        for entry in &index_keys {
            eng.put(entry, &[])?;
        }

        rec.key = Some(obj_key);
        rec.batch = false;
        rec.index_keys = Some(index_keys);
        rec.coll_idx = Some(self.info.idx);
        rec.txn_id = eng.txn_id();
        Ok(rec)
    }

    /// Put every record in the iterable; returns the number processed.
    pub fn puts<R: Into<Record<V>>>(&self, recs: impl IntoIterator<Item = R>) -> Result<usize> {
        let mut n = 0;
        for rec in recs {
            self.put(rec)?;
            n += 1;
        }
        Ok(n)
    }

    /// Put every `(key, value)` pair in the iterable with the key forced;
    /// returns the number processed.
    pub fn putitems<K: Into<Key>>(
        &self,
        items: impl IntoIterator<Item = (K, V)>,
    ) -> Result<usize> {
        let mut n = 0;
        for (key, value) in items {
            self.put_opts(
                Record::new(value),
                PutOptions {
                    key: Some(key.into()),
                    ..PutOptions::default()
                },
            )?;
            n += 1;
        }
        Ok(n)
    }

    /// Fetch a record's value by key. A lone primitive key is wrapped into
    /// a 1-tuple by the `Into<Key>` conversions.
    pub fn get(&self, key: impl Into<Key>) -> Result<Option<V>> {
        self.get_opts(&key.into(), None)
    }

    pub fn get_opts(&self, key: &Key, txn: Option<&dyn Engine>) -> Result<Option<V>> {
        Ok(self.fetch(key, txn)?.map(|(_, value)| value))
    }

    /// Fetch a record by key, retaining the bookkeeping needed to re-save
    /// or delete it cheaply.
    pub fn get_record(&self, key: impl Into<Key>) -> Result<Option<Record<V>>> {
        self.get_record_opts(&key.into(), None)
    }

    pub fn get_record_opts(
        &self,
        key: &Key,
        txn: Option<&dyn Engine>,
    ) -> Result<Option<Record<V>>> {
        let Some((batch, value)) = self.fetch(key, txn)? else {
            return Ok(None);
        };
        let index_keys = self.index_keys_for(key, &value);
        Ok(Some(Record {
            data: value,
            key: Some(key.clone()),
            batch,
            txn_id: self.engine(txn).txn_id(),
            index_keys: Some(index_keys),
            coll_idx: Some(self.info.idx),
        }))
    }

    fn fetch(&self, key: &Key, txn: Option<&dyn Engine>) -> Result<Option<(bool, V)>> {
        let mut cur = BatchRangeCursor::new(
            &self.store,
            self.engine(txn),
            self.prefix.clone(),
            Direction::Forward,
        );
        cur.set_exact(key.clone());
        if !cur.step()? {
            return Ok(None);
        }
        let value = self.encoder.unpack(cur.data())?;
        Ok(Some((cur.is_batch(), value)))
    }

    /// `get` once for every key in the iterable, in order.
    pub fn gets<K: Into<Key>>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<Vec<Option<V>>> {
        keys.into_iter().map(|key| self.get(key)).collect()
    }

    /// Yield `(key, value)` pairs in key order (reverse order when the
    /// query says so). Batched physical records are exploded on the fly.
    pub fn items<'c>(&'c self, query: RangeQuery<'c>) -> Items<'c, V> {
        Items {
            coll: self,
            cur: self.cursor(&query),
        }
    }

    /// Yield keys in scan order without decoding values.
    pub fn keys<'c>(&'c self, query: RangeQuery<'c>) -> KeysIter<'c> {
        KeysIter {
            cur: self.cursor(&query),
        }
    }

    /// Yield values in scan order.
    pub fn values<'c>(&'c self, query: RangeQuery<'c>) -> impl Iterator<Item = Result<V>> + 'c {
        self.items(query).map(|item| item.map(|(_, value)| value))
    }

    /// First matching value, or `None`.
    pub fn find(&self, query: RangeQuery<'_>) -> Result<Option<V>> {
        self.values(query).next().transpose()
    }

    /// Delete a record by key; the removed record is returned if it
    /// existed.
    pub fn delete(&self, key: impl Into<Key>) -> Result<Option<Record<V>>> {
        self.delete_opts(key.into(), None)
    }

    pub fn delete_opts(&self, key: Key, txn: Option<&dyn Engine>) -> Result<Option<Record<V>>> {
        match self.get_record_opts(&key, txn)? {
            Some(rec) => self.delete_record_opts(rec, txn).map(Some),
            None => Ok(None),
        }
    }

    /// Delete a previously fetched record. A batched record explodes its
    /// batch first; the record's own re-insertion is skipped.
    pub fn delete_record(&self, rec: Record<V>) -> Result<Record<V>> {
        self.delete_record_opts(rec, None)
    }

    pub fn delete_record_opts(
        &self,
        mut rec: Record<V>,
        txn: Option<&dyn Engine>,
    ) -> Result<Record<V>> {
        if let Some(key) = rec.key.take() {
            let eng = self.engine(txn);
            if rec.batch {
                self.split_batch(&key, txn)?;
            } else {
                eng.delete(&encode_key(&self.prefix, &key))?;
            }
            for entry in rec.index_keys.iter().flatten() {
                eng.delete(entry)?;
            }
        }
        rec.batch = false;
        rec.index_keys = None;
        Ok(rec)
    }

    /// Delete once for every key in the iterable; returns `(processed,
    /// deleted)` counts.
    pub fn deletes<K: Into<Key>>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<(usize, usize)> {
        let mut processed = 0;
        let mut deleted = 0;
        for key in keys {
            processed += 1;
            if self.delete(key)?.is_some() {
                deleted += 1;
            }
        }
        Ok((processed, deleted))
    }

    /// Delete a record by value. Only meaningful with derived keys: the
    /// key function recomputes the key the value was stored under.
    pub fn delete_value(&self, value: &V) -> Result<Option<Record<V>>> {
        if !self.derived_keys {
            return Err(Error::InvalidQuery("delete_value requires derived keys"));
        }
        let KeyStrategy::Value(func) = &self.strategy else {
            return Err(Error::InvalidQuery(
                "delete_value requires a value-only key function",
            ));
        };
        self.delete_opts(func(value), None)
    }

    pub fn delete_values<'v>(
        &self,
        values: impl IntoIterator<Item = &'v V>,
    ) -> Result<(usize, usize)>
    where
        V: 'v,
    {
        let mut processed = 0;
        let mut deleted = 0;
        for value in values {
            processed += 1;
            if self.delete_value(value)?.is_some() {
                deleted += 1;
            }
        }
        Ok((processed, deleted))
    }

    /// Pack runs of single records in `[lo, hi]` into batched physical
    /// records. At least one of `max_recs`/`max_bytes` must be set; see
    /// [`BatchOptions`] for the flush rules. Returns how many records were
    /// packed into how many batches, plus the last key visited so an
    /// incremental caller can resume from it.
    pub fn batch(&self, opts: BatchOptions<'_, V>) -> Result<BatchOutcome> {
        if opts.max_recs.is_none() && opts.max_bytes.is_none() {
            return Err(Error::InvalidQuery(
                "batch requires max_recs and/or max_bytes",
            ));
        }
        let eng = self.engine(opts.txn);
        let packer = opts
            .packer
            .clone()
            .unwrap_or_else(|| Rc::clone(&self.packer));
        let packer_byte = self.store.add_encoder(Rc::clone(&packer))?;

        let mut cur = BatchRangeCursor::new(&self.store, eng, self.prefix.clone(), Direction::Forward);
        if let Some(lo) = opts.lo.clone() {
            cur.set_lo(lo, true);
        }
        if let Some(hi) = opts.hi.clone() {
            cur.set_hi(hi, true);
        }
        if let Some(max_phys) = opts.max_phys {
            cur.set_max_phys(max_phys);
        }

        let mut outcome = BatchOutcome::default();
        let mut items: Vec<(Key, Vec<u8>)> = Vec::new();
        let mut group: Option<Key> = None;
        let mut consumed_phys: Option<Vec<u8>> = None;
        // Batches written by this very run sort just above the member the
        // cursor stopped at, so the scan meets its own output; remember it
        // and pass it over instead of consuming it again.
        let mut written: HashSet<Vec<u8>> = HashSet::new();

        while cur.step()? {
            if cur.is_batch() && written.contains(cur.phys_key()) {
                continue;
            }
            let key = cur.key().clone();
            outcome.last_key = Some(key.clone());

            if cur.is_batch() {
                if opts.preserve {
                    // Finish the group in progress and leave the found
                    // batch exactly as it is.
                    self.write_batch(eng, &mut items, &*packer, packer_byte, &mut outcome.made, &mut written)?;
                    continue;
                }
                // Consume the found batch: its members join the group and
                // its physical entry goes away (once).
                let phys = cur.phys_key().to_vec();
                if consumed_phys.as_ref() != Some(&phys) {
                    eng.delete(&phys)?;
                    consumed_phys = Some(phys);
                }
            } else {
                eng.delete(&encode_key(&self.prefix, &key))?;
            }

            let data = cur.data().to_vec();
            if let Some(grouper) = &opts.grouper {
                let value = grouper(&self.encoder.unpack(&data)?);
                if !items.is_empty() && group.as_ref() != Some(&value) {
                    self.write_batch(eng, &mut items, &*packer, packer_byte, &mut outcome.made, &mut written)?;
                }
                group = Some(value);
            }

            outcome.found += 1;
            items.push((key, data));

            if let Some(max_bytes) = opts.max_bytes {
                let (_, encoded) = self.encode_batch(&items, &*packer, packer_byte)?;
                if encoded.len() > max_bytes {
                    // Oversize: flush everything before the newest member,
                    // then start the next group with it.
                    let last = items.pop().ok_or_else(|| {
                        Error::invariant("batch group emptied while measuring")
                    })?;
                    self.write_batch(eng, &mut items, &*packer, packer_byte, &mut outcome.made, &mut written)?;
                    items.push(last);
                }
            }
            if opts.max_recs.is_some_and(|max| items.len() >= max) {
                self.write_batch(eng, &mut items, &*packer, packer_byte, &mut outcome.made, &mut written)?;
            }
        }
        self.write_batch(eng, &mut items, &*packer, packer_byte, &mut outcome.made, &mut written)?;
        Ok(outcome)
    }

    fn write_batch(
        &self,
        eng: &dyn Engine,
        items: &mut Vec<(Key, Vec<u8>)>,
        packer: &dyn Packer,
        packer_byte: u8,
        made: &mut usize,
        written: &mut HashSet<Vec<u8>>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let (phys, value) = self.encode_batch(items, packer, packer_byte)?;
        eng.put(&phys, &value)?;
        written.insert(phys);
        *made += 1;
        debug!(collection = %self.info.name, records = items.len(), "wrote batch record");
        items.clear();
        Ok(())
    }

    /// Build the physical layout for a group of records: the key packs the
    /// member keys highest-first; a lone member uses the plain single
    /// layout, otherwise the value opens with the delta-varint offset
    /// array over the forward-order concatenation.
    fn encode_batch(
        &self,
        items: &[(Key, Vec<u8>)],
        packer: &dyn Packer,
        packer_byte: u8,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let keys_rev: Vec<Key> = items.iter().rev().map(|(k, _)| k.clone()).collect();
        let phys = encode_keys(&self.prefix, &keys_rev);

        let mut value = Vec::new();
        if let [(_, data)] = items {
            value.push(packer_byte);
            value.extend_from_slice(&packer.pack(data)?);
        } else {
            write_varint(&mut value, items.len() as u64);
            for (_, data) in items {
                write_varint(&mut value, data.len() as u64);
            }
            value.push(packer_byte);
            let concat: Vec<u8> = items.iter().flat_map(|(_, d)| d.iter().copied()).collect();
            value.extend_from_slice(&packer.pack(&concat)?);
        }
        Ok((phys, value))
    }

    /// Explode the batch containing `target`: every sibling is re-written
    /// as an individual physical record (bypassing index upkeep, which is
    /// unaffected), the batch entry is removed, and `target` itself is
    /// dropped — its deletion or replacement is the caller's move.
    fn split_batch(&self, target: &Key, txn: Option<&dyn Engine>) -> Result<()> {
        let eng = self.engine(txn);
        let packer_byte = self.store.add_encoder(Rc::clone(&self.packer))?;
        let mut cur =
            BatchRangeCursor::new(&self.store, eng, self.prefix.clone(), Direction::Forward);
        cur.set_lo(target.clone(), true);

        while cur.step()? {
            if !(cur.is_batch() && cur.keys().contains(target)) {
                continue;
            }
            let phys = cur.phys_key().to_vec();
            let members: Vec<(Key, Vec<u8>)> = cur
                .batch_items()
                .map(|(k, d)| (k.clone(), d.to_vec()))
                .collect();
            for (key, data) in members {
                if &key == target {
                    continue;
                }
                let mut value = Vec::with_capacity(1 + data.len());
                value.push(packer_byte);
                value.extend_from_slice(&self.packer.pack(&data)?);
                eng.put(&encode_key(&self.prefix, &key), &value)?;
            }
            eng.delete(&phys)?;
            return Ok(());
        }
        Err(Error::invariant(format!(
            "no batch record contains key {target}"
        )))
    }
}

///
/// Items
///
/// Owning iterator over `(key, value)` pairs of one range read.
///

pub struct Items<'c, V> {
    coll: &'c Collection<V>,
    cur: BatchRangeCursor<'c>,
}

impl<V> Iterator for Items<'_, V> {
    type Item = Result<(Key, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cur.step() {
            Err(err) => Some(Err(err)),
            Ok(false) => None,
            Ok(true) => {
                let key = self.cur.key().clone();
                Some(
                    self.coll
                        .encoder
                        .unpack(self.cur.data())
                        .map(|value| (key, value)),
                )
            }
        }
    }
}

///
/// KeysIter
///

pub struct KeysIter<'c> {
    cur: BatchRangeCursor<'c>,
}

impl Iterator for KeysIter<'_> {
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cur.step() {
            Err(err) => Some(Err(err)),
            Ok(false) => None,
            Ok(true) => Some(Ok(self.cur.key().clone())),
        }
    }
}
