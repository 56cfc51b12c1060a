//! Module: store
//! Responsibility: engine ownership, the key-space namespace, the
//! persistent encoder registry, and monotonic counters.
//! Boundary: collections and cursors reach the engine through this layer.

use crate::collection::{Collection, CollectionOptions, PutOptions, RangeQuery, Record};
use crate::encoder::{EncoderTable, KeyEncoder, Packer, PlainPacker};
use crate::engine::{self, Engine};
use crate::error::{Error, Result};
use keva_keys::{Key, KeyPart, write_varint};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

// Reserved metadata collection indices. User collections and indices draw
// numbers from the collections counter, which starts past these.
pub(crate) const COLLECTIONS_IDX: u64 = 0;
pub(crate) const COUNTERS_IDX: u64 = 1;
pub(crate) const ENCODERS_IDX: u64 = 2;
pub(crate) const META_IDX: u64 = 3;
pub(crate) const FIRST_DYNAMIC_IDX: i64 = 10;

const COLLECTIONS_COUNTER: &str = "\0collections_idx";
const ENCODER_COUNTER: &str = "\0encoder_idx";

///
/// Store
///
/// Cheap-clone handle over the engine, a root byte prefix, the encoder
/// registry and the reserved metadata collections. Collections hold one,
/// so everything downstream shares the same registry state.
///

#[derive(Clone)]
pub struct Store(Rc<StoreInner>);

struct StoreInner {
    engine: Rc<dyn Engine>,
    prefix: Vec<u8>,
    encoders: RefCell<EncoderTable>,
}

///
/// CollectionInfo
///
/// Persisted identity of a collection or index: its name, its immutable
/// numeric key-space index, and — for an index — the collection it serves.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub idx: u64,
    pub index_for: Option<String>,
}

impl CollectionInfo {
    fn to_value(&self) -> Key {
        let index_for = self
            .index_for
            .as_ref()
            .map_or(KeyPart::Null, |n| KeyPart::Text(n.clone()));
        Key::new(vec![
            KeyPart::Text(self.name.clone()),
            KeyPart::Int(self.idx as i64),
            index_for,
        ])
    }

    fn from_value(value: &Key) -> Result<Self> {
        let corrupt = || Error::invariant(format!("malformed collection metadata: {value}"));
        let [KeyPart::Text(name), KeyPart::Int(idx), index_for] = value.parts() else {
            return Err(corrupt());
        };
        let index_for = match index_for {
            KeyPart::Null => None,
            KeyPart::Text(n) => Some(n.clone()),
            _ => return Err(corrupt()),
        };
        Ok(Self {
            name: name.clone(),
            idx: u64::try_from(*idx).map_err(|_| corrupt())?,
            index_for,
        })
    }
}

impl Store {
    /// Resolve an engine by name and wrap it in a store.
    pub fn open(engine_name: &str) -> Result<Self> {
        Ok(Self::new(engine::open(engine_name)?))
    }

    #[must_use]
    pub fn new(engine: Rc<dyn Engine>) -> Self {
        Self::with_prefix(engine, Vec::new())
    }

    /// Root every physical key below `prefix`, so several stores can share
    /// one engine's key space.
    #[must_use]
    pub fn with_prefix(engine: Rc<dyn Engine>, prefix: Vec<u8>) -> Self {
        Self(Rc::new(StoreInner {
            engine,
            prefix,
            encoders: RefCell::new(EncoderTable::with_builtins()),
        }))
    }

    #[must_use]
    pub fn engine(&self) -> Rc<dyn Engine> {
        Rc::clone(&self.0.engine)
    }

    pub(crate) fn engine_ref(&self) -> &dyn Engine {
        &*self.0.engine
    }

    /// Byte prefix for a collection or index key space.
    pub(crate) fn prefix_for(&self, idx: u64) -> Vec<u8> {
        let mut prefix = self.0.prefix.clone();
        write_varint(&mut prefix, idx);
        prefix
    }

    /// Open a collection with default options (serde value codec, identity
    /// compression, counter-assigned keys).
    pub fn collection<V>(&self, name: &str) -> Result<Collection<V>>
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        self.collection_opts(name, CollectionOptions::new())
    }

    pub fn collection_opts<V>(&self, name: &str, opts: CollectionOptions<V>) -> Result<Collection<V>> {
        let info = self.collection_info(name, None)?;
        self.assign_encoder_prefix(opts.encoder_name())?;
        Ok(Collection::new(self.clone(), info, opts))
    }

    /// Look up persisted identity for `name`, allocating a fresh key-space
    /// index on first sight. The index is immutable once assigned.
    pub(crate) fn collection_info(
        &self,
        name: &str,
        index_for: Option<&str>,
    ) -> Result<CollectionInfo> {
        let coll = self.collections_meta();
        if let Some(value) = coll.get(Key::from(name))? {
            let info = CollectionInfo::from_value(&value)?;
            if info.name != name || info.index_for.as_deref() != index_for {
                return Err(Error::invariant(format!(
                    "collection metadata for '{name}' does not match its registration"
                )));
            }
            return Ok(info);
        }

        let idx = self.count_opts(COLLECTIONS_COUNTER, 1, FIRST_DYNAMIC_IDX, None)?;
        let info = CollectionInfo {
            name: name.to_owned(),
            idx: u64::try_from(idx)
                .map_err(|_| Error::invariant(format!("negative collection index {idx}")))?,
            index_for: index_for.map(ToOwned::to_owned),
        };
        coll.put(info.to_value())?;
        debug!(collection = name, idx = info.idx, "registered collection");
        Ok(info)
    }

    /// Increment the counter `name` by one and return its previous value,
    /// creating it at 1 when absent.
    pub fn count(&self, name: &str) -> Result<i64> {
        self.count_opts(name, 1, 1, None)
    }

    /// Read the counter, write `current + n`, and return `current`
    /// (creating it with `init` when absent). With `n == 0` nothing is
    /// written, and an absent counter is not created. Routed through the
    /// counters collection, so a transaction handle makes it atomic.
    pub fn count_opts(
        &self,
        name: &str,
        n: i64,
        init: i64,
        txn: Option<&dyn Engine>,
    ) -> Result<i64> {
        let coll = self.counters_meta();
        let key = Key::from(name);
        let current = match coll.get_opts(&key, txn)? {
            Some(value) => match value.parts() {
                [KeyPart::Text(_), KeyPart::Int(v)] => *v,
                _ => {
                    return Err(Error::invariant(format!(
                        "malformed counter record for '{name}'"
                    )));
                }
            },
            None => init,
        };
        if n != 0 {
            let next = Key::new(vec![KeyPart::Text(name.to_owned()), KeyPart::Int(current + n)]);
            coll.put_opts(
                Record::new(next),
                PutOptions {
                    txn,
                    ..PutOptions::default()
                },
            )?;
        }
        Ok(current)
    }

    /// Register a packer, assigning (or re-reading) its persistent prefix
    /// byte. Idempotent: re-registration returns the byte assigned before,
    /// in this process or any earlier one that used the same engine.
    pub fn add_encoder(&self, packer: Rc<dyn Packer>) -> Result<u8> {
        let byte = self.assign_encoder_prefix(packer.name())?;
        self.0
            .encoders
            .borrow_mut()
            .packers
            .entry(byte)
            .or_insert(packer);
        Ok(byte)
    }

    /// Resolve a packer by its prefix byte. When the byte is unknown to
    /// this process, the persistent registry is consulted for a name to
    /// blame in the error.
    pub fn get_encoder(&self, prefix_byte: u8) -> Result<Rc<dyn Packer>> {
        if let Some(packer) = self.0.encoders.borrow().packers.get(&prefix_byte) {
            return Ok(Rc::clone(packer));
        }

        let mut name = None;
        for item in self.encoders_meta().items(RangeQuery::default()) {
            let (_, value) = item?;
            if let [KeyPart::Text(n), KeyPart::Int(idx)] = value.parts()
                && *idx == i64::from(prefix_byte)
            {
                name = Some(n.clone());
                break;
            }
        }
        Err(Error::UnknownEncoder {
            prefix: prefix_byte,
            name,
        })
    }

    /// Strip the packer prefix byte from a physical value and decompress
    /// the payload.
    pub(crate) fn decompress(&self, value: &[u8]) -> Result<Vec<u8>> {
        let (&byte, rest) = value
            .split_first()
            .ok_or_else(|| Error::invariant("empty physical record value"))?;
        self.get_encoder(byte)?.unpack(rest)
    }

    /// Assign (or recall) the persistent prefix byte for an encoder name.
    pub(crate) fn assign_encoder_prefix(&self, name: &str) -> Result<u8> {
        if let Some(&byte) = self.0.encoders.borrow().by_name.get(name) {
            return Ok(byte);
        }

        let coll = self.encoders_meta();
        let idx = match coll.get(Key::from(name))? {
            Some(value) => match value.parts() {
                [KeyPart::Text(_), KeyPart::Int(idx)] => *idx,
                _ => {
                    return Err(Error::invariant(format!(
                        "malformed encoder record for '{name}'"
                    )));
                }
            },
            None => {
                let idx = self.count_opts(ENCODER_COUNTER, 1, FIRST_DYNAMIC_IDX, None)?;
                if idx > i64::from(crate::MAX_ENCODER_PREFIX) {
                    return Err(Error::EncoderLimit { idx: idx as u64 });
                }
                coll.put(Key::new(vec![
                    KeyPart::Text(name.to_owned()),
                    KeyPart::Int(idx),
                ]))?;
                debug!(encoder = name, prefix = idx, "assigned encoder prefix");
                idx
            }
        };
        if idx < 1 || idx > i64::from(crate::MAX_ENCODER_PREFIX) {
            return Err(Error::EncoderLimit { idx: idx as u64 });
        }
        let byte = idx as u8;
        self.0
            .encoders
            .borrow_mut()
            .by_name
            .insert(name.to_owned(), byte);
        Ok(byte)
    }

    // The metadata collections are rebuilt on demand: they are cheap
    // handles, and constructing them lazily avoids a self-referential
    // store. All use the key codec for values and derive keys from the
    // leading tuple elements.
    fn meta_collection(&self, name: &str, idx: u64, key_width: usize) -> Collection<Key> {
        let info = CollectionInfo {
            name: name.to_owned(),
            idx,
            index_for: None,
        };
        let opts = CollectionOptions::with_encoder(Rc::new(KeyEncoder))
            .packer(Rc::new(PlainPacker))
            .key_func(move |value: &Key| {
                Key::new(value.parts()[..key_width.min(value.parts().len())].to_vec())
            });
        Collection::new(self.clone(), info, opts)
    }

    pub(crate) fn collections_meta(&self) -> Collection<Key> {
        self.meta_collection("\0collections", COLLECTIONS_IDX, 1)
    }

    pub(crate) fn counters_meta(&self) -> Collection<Key> {
        self.meta_collection("\0counters", COUNTERS_IDX, 1)
    }

    pub(crate) fn encoders_meta(&self) -> Collection<Key> {
        self.meta_collection("\0encoders", ENCODERS_IDX, 1)
    }

    /// Reserved store-level metadata, keyed by two leading tuple elements.
    /// Nothing in the core writes here yet, but the key-space index stays
    /// reserved so the layout is stable.
    #[must_use]
    pub fn meta(&self) -> Collection<Key> {
        self.meta_collection("\0meta", META_IDX, 2)
    }
}
