//! Module: index
//! Responsibility: secondary index definitions and the tuple-ordered query
//! view over one collection's index entries.
//! Does not own: entry maintenance — the collection writes and removes
//! entries as part of every mutation.

use crate::collection::Collection;
use crate::cursor::{Direction, RangeCursor};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::store::CollectionInfo;
use keva_keys::{Key, KeyPart};
use tracing::warn;

///
/// IndexKeys
///
/// Normalizes an index function's return value into the canonical form: a
/// (possibly empty) sequence of key tuples, each of which contributes one
/// index entry. Implemented for bare primitives, tuples, and lists of
/// either, so index functions can stay close to the data.
///

pub trait IndexKeys {
    fn into_index_keys(self) -> Vec<Key>;
}

impl IndexKeys for Key {
    fn into_index_keys(self) -> Vec<Key> {
        vec![self]
    }
}

impl IndexKeys for KeyPart {
    fn into_index_keys(self) -> Vec<Key> {
        vec![Key::from(self)]
    }
}

impl IndexKeys for Vec<Key> {
    fn into_index_keys(self) -> Vec<Key> {
        self
    }
}

impl IndexKeys for Vec<KeyPart> {
    fn into_index_keys(self) -> Vec<Key> {
        self.into_iter().map(Key::from).collect()
    }
}

impl<T: IndexKeys> IndexKeys for Option<T> {
    fn into_index_keys(self) -> Vec<Key> {
        self.map(IndexKeys::into_index_keys).unwrap_or_default()
    }
}

impl IndexKeys for String {
    fn into_index_keys(self) -> Vec<Key> {
        vec![Key::from(self)]
    }
}

impl IndexKeys for i64 {
    fn into_index_keys(self) -> Vec<Key> {
        vec![Key::from(self)]
    }
}

impl IndexKeys for bool {
    fn into_index_keys(self) -> Vec<Key> {
        vec![Key::from(self)]
    }
}

impl<A: Into<KeyPart>, B: Into<KeyPart>> IndexKeys for (A, B) {
    fn into_index_keys(self) -> Vec<Key> {
        vec![Key::from(self)]
    }
}

impl<A: Into<KeyPart>, B: Into<KeyPart>, C: Into<KeyPart>> IndexKeys for (A, B, C) {
    fn into_index_keys(self) -> Vec<Key> {
        vec![Key::from(self)]
    }
}

///
/// IndexDef
///
/// One registered index: persisted identity, key-space prefix, and the
/// user function producing index tuples from a record value.
///

pub struct IndexDef<V> {
    name: String,
    info: CollectionInfo,
    prefix: Vec<u8>,
    func: Box<dyn Fn(&V) -> Vec<Key>>,
}

impl<V> IndexDef<V> {
    pub(crate) fn new<R: IndexKeys>(
        name: &str,
        info: CollectionInfo,
        prefix: Vec<u8>,
        func: impl Fn(&V) -> R + 'static,
    ) -> Self {
        Self {
            name: name.to_owned(),
            info,
            prefix,
            func: Box::new(move |value| func(value).into_index_keys()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub(crate) fn tuples_for(&self, value: &V) -> Vec<Key> {
        (self.func)(value)
    }
}

///
/// IndexQuery
///
/// Filter specification for index reads. `args` prefix-scopes both
/// endpoints; otherwise `lo`/`hi` bound the index tuple, with `include`
/// widening `hi` to cover the bound tuple's own extensions. The same rule
/// applies in both directions.
///

#[derive(Default)]
pub struct IndexQuery<'t> {
    pub args: Option<Key>,
    pub lo: Option<Key>,
    pub hi: Option<Key>,
    pub reverse: bool,
    pub max: Option<usize>,
    pub include: bool,
    pub txn: Option<&'t dyn Engine>,
}

impl<'t> IndexQuery<'t> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn args(mut self, args: impl Into<Key>) -> Self {
        self.args = Some(args.into());
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
/// Index
///
/// Borrowed query view over one secondary index. Obtained from
/// [`Collection::index`]; entry maintenance happens inside the collection's
/// mutation paths, never here.
///

pub struct Index<'c, V> {
    coll: &'c Collection<V>,
    def: &'c IndexDef<V>,
}

impl<V> Clone for Index<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Index<'_, V> {}

impl<'c, V> Index<'c, V> {
    pub(crate) const fn new(coll: &'c Collection<V>, def: &'c IndexDef<V>) -> Self {
        Self { coll, def }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.def.name()
    }

    #[must_use]
    pub const fn info(&self) -> &CollectionInfo {
        &self.def.info
    }

    fn cursor(&self, query: &IndexQuery<'c>) -> RangeCursor<'c> {
        let eng = query
            .txn
            .unwrap_or_else(|| self.coll.store().engine_ref());
        let dir = if query.reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        let mut cur = RangeCursor::new(eng, self.def.prefix().to_vec(), dir);
        if let Some(args) = &query.args {
            cur.set_prefix(args.clone());
        } else {
            if let Some(lo) = &query.lo {
                cur.set_lo(lo.clone(), true);
            }
            if let Some(hi) = &query.hi {
                if query.include {
                    cur.set_hi_extensions(hi.clone());
                } else {
                    cur.set_hi(hi.clone(), false);
                }
            }
        }
        if let Some(max) = query.max {
            cur.set_max(max);
        }
        cur
    }

    /// Yield `(index tuple, primary key)` pairs in tuple order.
    pub fn pairs(&self, query: IndexQuery<'c>) -> Pairs<'c> {
        Pairs {
            cur: self.cursor(&query),
        }
    }

    /// Yield the index tuples alone, in tuple order.
    pub fn tuples(&self, query: IndexQuery<'c>) -> impl Iterator<Item = Result<Key>> + 'c {
        self.pairs(query).map(|pair| pair.map(|(tuple, _)| tuple))
    }

    /// Yield the referenced primary keys, in tuple order.
    pub fn keys(&self, query: IndexQuery<'c>) -> impl Iterator<Item = Result<Key>> + 'c {
        self.pairs(query).map(|pair| pair.map(|(_, key)| key))
    }

    /// Yield `(primary key, value)` for every entry, resolving records
    /// through the collection. A stale entry (its record is gone) is
    /// logged and skipped; an offline rebuild is the real fix.
    pub fn items(&self, query: IndexQuery<'c>) -> IndexItems<'c, V> {
        let txn = query.txn;
        IndexItems {
            index: *self,
            pairs: self.pairs(query),
            txn,
        }
    }

    /// Yield the referenced record values, in tuple order.
    pub fn values(&self, query: IndexQuery<'c>) -> impl Iterator<Item = Result<V>> + 'c {
        self.items(query).map(|item| item.map(|(_, value)| value))
    }

    /// First matching value, or `None`.
    pub fn find(&self, query: IndexQuery<'c>) -> Result<Option<V>> {
        self.values(query).next().transpose()
    }

    /// True when an entry with exactly the tuple `x` exists.
    pub fn has(&self, x: impl Into<Key>) -> Result<bool> {
        let x = x.into();
        match self.pairs(IndexQuery::new().args(x.clone())).next() {
            Some(pair) => Ok(pair?.0 == x),
            None => Ok(false),
        }
    }

    /// First record whose index tuple starts with `x`, in tuple order.
    pub fn get(&self, x: impl Into<Key>) -> Result<Option<V>> {
        self.find(IndexQuery::new().args(x))
    }

    /// `get` once for every tuple in the iterable, in order.
    pub fn gets<K: Into<Key>>(
        &self,
        tuples: impl IntoIterator<Item = K>,
    ) -> Result<Vec<Option<V>>> {
        tuples.into_iter().map(|x| self.get(x)).collect()
    }

    /// Count entries matching the query.
    pub fn count(&self, query: IndexQuery<'c>) -> Result<usize> {
        let mut n = 0;
        for pair in self.pairs(query) {
            pair?;
            n += 1;
        }
        Ok(n)
    }
}

///
/// Pairs
///
/// Owning iterator over decoded `(tuple, primary key)` index entries.
///

pub struct Pairs<'c> {
    cur: RangeCursor<'c>,
}

impl Iterator for Pairs<'_> {
    type Item = Result<(Key, Key)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cur.step() {
            Err(err) => Some(Err(err)),
            Ok(false) => None,
            Ok(true) => match self.cur.keys() {
                [tuple, key] => Some(Ok((tuple.clone(), key.clone()))),
                keys => Some(Err(Error::invariant(format!(
                    "index entry decoded to {} keys, expected tuple plus primary key",
                    keys.len()
                )))),
            },
        }
    }
}

///
/// IndexItems
///

pub struct IndexItems<'c, V> {
    index: Index<'c, V>,
    pairs: Pairs<'c>,
    txn: Option<&'c dyn Engine>,
}

impl<V> Iterator for IndexItems<'_, V> {
    type Item = Result<(Key, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pair = match self.pairs.next()? {
                Ok(pair) => pair,
                Err(err) => return Some(Err(err)),
            };
            let (tuple, key) = pair;
            match self.index.coll.get_opts(&key, self.txn) {
                Err(err) => return Some(Err(err)),
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => {
                    warn!(
                        index = self.index.def.name(),
                        tuple = %tuple,
                        key = %key,
                        "stale index entry, collection requires an index rebuild"
                    );
                }
            }
        }
    }
}
