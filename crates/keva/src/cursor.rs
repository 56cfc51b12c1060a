//! Module: cursor
//! Responsibility: bidirectional bounded iteration over one key-space
//! prefix, including transparent explosion of batched physical records.
//! Does not own: record value decoding or index-entry semantics.
//!
//! Both cursors are lending: a successful `step` positions the cursor and
//! the accessors borrow its buffers, so a caller cannot retain a view past
//! the next step. Copy out whatever must outlive it.

use crate::engine::{Engine, EngineCursor};
use crate::error::{Error, Result};
use crate::store::Store;
use derive_more::Display;
use keva_keys::{Key, decode_keys, next_greater, read_varint};

///
/// Direction
///

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Direction {
    #[display("forward")]
    Forward,
    #[display("reverse")]
    Reverse,
}

///
/// HiBound
///
/// Upper bound of a scan. `Extensions` keeps every key that the bound key
/// tuple-prefixes: it is how prefix scoping and `include`-style index
/// bounds are expressed without materializing a successor key.
///

#[derive(Clone, Debug)]
enum HiBound {
    Inclusive(Key),
    Exclusive(Key),
    Extensions(Key),
}

impl HiBound {
    const fn key(&self) -> &Key {
        match self {
            Self::Inclusive(k) | Self::Exclusive(k) | Self::Extensions(k) => k,
        }
    }
}

///
/// Bounds
///
/// Shared cursor bound state: lower/upper bound with closedness and the
/// remaining-result cap (`None` = unlimited).
///

#[derive(Debug, Default)]
struct Bounds {
    lo: Option<(Key, bool)>,
    hi: Option<HiBound>,
    remain: Option<i64>,
}

impl Bounds {
    fn lo_ok(&self, key: &Key) -> bool {
        match &self.lo {
            None => true,
            Some((bound, true)) => key >= bound,
            Some((bound, false)) => key > bound,
        }
    }

    fn hi_ok(&self, key: &Key) -> bool {
        match &self.hi {
            None => true,
            Some(HiBound::Inclusive(bound)) => key <= bound,
            Some(HiBound::Exclusive(bound)) => key < bound,
            Some(HiBound::Extensions(bound)) => key < bound || key.starts_with_key(bound),
        }
    }

    fn remaining(&self) -> bool {
        self.remain != Some(0)
    }

    fn consume(&mut self) {
        if let Some(r) = &mut self.remain {
            *r -= 1;
        }
    }

    fn forward_seek(&self, prefix: &[u8]) -> Vec<u8> {
        self.lo
            .as_ref()
            .map_or_else(|| prefix.to_vec(), |(k, _)| k.encode(prefix))
    }

    /// Reverse scans seek at the successor of the upper bound so that
    /// multi-key physical entries anchored at the bound (which sort just
    /// above it) are not skipped; the open/closed skip loop then discards
    /// anything past the bound. An upper bound whose encoding has no
    /// successor saturates to the end of the prefix region.
    fn reverse_seek(&self, prefix: &[u8]) -> Result<Vec<u8>> {
        let from_prefix = || next_greater(prefix);
        let start = match &self.hi {
            Some(bound) => next_greater(&bound.key().encode(prefix)).or_else(from_prefix),
            None => from_prefix(),
        };
        start.ok_or_else(|| Error::invariant("key-space prefix has no upper bound"))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    New,
    Running,
    Done,
}

///
/// RangeCursor
///
/// Flat bidirectional cursor. Used for index scans, where every physical
/// entry is one logical entry and bound predicates apply to the first
/// decoded key (the index tuple).
///

pub struct RangeCursor<'e> {
    engine: &'e dyn Engine,
    prefix: Vec<u8>,
    dir: Direction,
    bounds: Bounds,
    it: Option<Box<dyn EngineCursor + 'e>>,
    state: State,
    keys: Vec<Key>,
    data: Vec<u8>,
}

impl<'e> RangeCursor<'e> {
    #[must_use]
    pub fn new(engine: &'e dyn Engine, prefix: Vec<u8>, dir: Direction) -> Self {
        Self {
            engine,
            prefix,
            dir,
            bounds: Bounds::default(),
            it: None,
            state: State::New,
            keys: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn set_lo(&mut self, key: Key, closed: bool) {
        self.bounds.lo = Some((key, closed));
    }

    pub fn set_hi(&mut self, key: Key, closed: bool) {
        self.bounds.hi = Some(if closed {
            HiBound::Inclusive(key)
        } else {
            HiBound::Exclusive(key)
        });
    }

    /// Scope the scan to every key the given key tuple-prefixes.
    pub fn set_prefix(&mut self, key: Key) {
        self.bounds.lo = Some((key.clone(), true));
        self.bounds.hi = Some(HiBound::Extensions(key));
    }

    /// Upper-bound the scan at `key` including every key it
    /// tuple-prefixes, leaving the lower bound alone.
    pub fn set_hi_extensions(&mut self, key: Key) {
        self.bounds.hi = Some(HiBound::Extensions(key));
    }

    /// Bound both sides to exactly `key`: the scan yields 0 or 1 entries.
    pub fn set_exact(&mut self, key: Key) {
        self.bounds.lo = Some((key.clone(), true));
        self.bounds.hi = Some(HiBound::Inclusive(key));
    }

    pub fn set_max(&mut self, max: usize) {
        self.bounds.remain = Some(max as i64);
    }

    /// Advance to the next in-range entry. Returns `false` once the range,
    /// the result cap, or the prefix region is exhausted.
    pub fn step(&mut self) -> Result<bool> {
        let go = match self.state {
            State::New => self.begin()?,
            State::Running => self.fetch()?,
            State::Done => false,
        };
        if go && self.bounds.remaining() && self.in_range() {
            self.bounds.consume();
            self.state = State::Running;
            Ok(true)
        } else {
            self.state = State::Done;
            Ok(false)
        }
    }

    /// All keys decoded from the current physical entry.
    #[must_use]
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// The current bound key. Only valid after a successful `step`.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.keys[0]
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn begin(&mut self) -> Result<bool> {
        match self.dir {
            Direction::Forward => {
                let start = self.bounds.forward_seek(&self.prefix);
                self.it = Some(self.engine.scan(&start, false));
                let mut go = self.fetch()?;
                while go && !self.bounds.lo_ok(&self.keys[0]) {
                    go = self.fetch()?;
                }
                Ok(go)
            }
            Direction::Reverse => {
                let start = self.bounds.reverse_seek(&self.prefix)?;
                self.it = Some(self.engine.scan(&start, true));
                // The seek may land on the first record of the next prefix;
                // retry once before concluding the region is empty.
                let mut go = self.fetch()?;
                if !go {
                    go = self.fetch()?;
                }
                while go && !self.bounds.hi_ok(&self.keys[0]) {
                    go = self.fetch()?;
                }
                Ok(go)
            }
        }
    }

    fn in_range(&self) -> bool {
        match self.dir {
            Direction::Forward => self.bounds.hi_ok(&self.keys[0]),
            Direction::Reverse => self.bounds.lo_ok(&self.keys[0]),
        }
    }

    fn fetch(&mut self) -> Result<bool> {
        let it = self
            .it
            .as_mut()
            .ok_or_else(|| Error::invariant("cursor stepped before seek"))?;
        let Some((k, v)) = it.next()? else {
            self.keys.clear();
            return Ok(false);
        };
        let Some(keys) = decode_keys(&self.prefix, &k)? else {
            self.keys.clear();
            return Ok(false);
        };
        self.keys = keys;
        self.data = v;
        Ok(true)
    }
}

///
/// BatchRangeCursor
///
/// Collection cursor: physical entries carrying several logical records are
/// exploded during iteration, with the intra-batch order aligned to the
/// scan direction. Values are handed out decompressed. A separate physical
/// fetch cap (`set_max_phys`) limits engine reads independently of the
/// logical result cap.
///

pub struct BatchRangeCursor<'e> {
    store: &'e Store,
    engine: &'e dyn Engine,
    prefix: Vec<u8>,
    dir: Direction,
    bounds: Bounds,
    max_phys: Option<i64>,
    it: Option<Box<dyn EngineCursor + 'e>>,
    state: State,
    phys_key: Vec<u8>,
    keys: Vec<Key>,
    offsets: Vec<usize>,
    buf: Vec<u8>,
    span: (usize, usize),
    pending: usize,
    logical: usize,
}

impl<'e> BatchRangeCursor<'e> {
    #[must_use]
    pub fn new(store: &'e Store, engine: &'e dyn Engine, prefix: Vec<u8>, dir: Direction) -> Self {
        Self {
            store,
            engine,
            prefix,
            dir,
            bounds: Bounds::default(),
            max_phys: None,
            it: None,
            state: State::New,
            phys_key: Vec::new(),
            keys: Vec::new(),
            offsets: Vec::new(),
            buf: Vec::new(),
            span: (0, 0),
            pending: 0,
            logical: 0,
        }
    }

    pub fn set_lo(&mut self, key: Key, closed: bool) {
        self.bounds.lo = Some((key, closed));
    }

    pub fn set_hi(&mut self, key: Key, closed: bool) {
        self.bounds.hi = Some(if closed {
            HiBound::Inclusive(key)
        } else {
            HiBound::Exclusive(key)
        });
    }

    pub fn set_prefix(&mut self, key: Key) {
        self.bounds.lo = Some((key.clone(), true));
        self.bounds.hi = Some(HiBound::Extensions(key));
    }

    pub fn set_exact(&mut self, key: Key) {
        self.bounds.lo = Some((key.clone(), true));
        self.bounds.hi = Some(HiBound::Inclusive(key));
    }

    pub fn set_max(&mut self, max: usize) {
        self.bounds.remain = Some(max as i64);
    }

    /// Cap the number of physical records fetched from the engine.
    pub fn set_max_phys(&mut self, max_phys: usize) {
        self.max_phys = Some(max_phys as i64);
    }

    /// Advance to the next in-range logical record.
    pub fn step(&mut self) -> Result<bool> {
        let go = match self.state {
            State::New => self.begin()?,
            State::Running => self.advance()?,
            State::Done => false,
        };
        if go && self.bounds.remaining() && self.in_range() {
            self.bounds.consume();
            self.state = State::Running;
            Ok(true)
        } else {
            self.state = State::Done;
            Ok(false)
        }
    }

    /// Keys decoded from the current physical entry. For a batch these are
    /// in reverse logical order: the first is the batch's highest key.
    #[must_use]
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// The current logical key. Only valid after a successful `step`.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.keys[self.keys.len() - 1 - self.logical]
    }

    /// Decompressed bytes of the current logical value.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.span.0..self.span.1]
    }

    /// Index of the current record inside its batch (0 for singles).
    #[must_use]
    pub const fn index(&self) -> usize {
        self.logical
    }

    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.keys.len() > 1
    }

    /// Raw engine key of the current physical entry.
    #[must_use]
    pub fn phys_key(&self) -> &[u8] {
        &self.phys_key
    }

    /// `(key, value)` pairs of the current physical entry in logical order,
    /// regardless of scan direction. Used to split a batch apart.
    pub fn batch_items(&self) -> impl Iterator<Item = (&Key, &[u8])> + '_ {
        let n = self.keys.len();
        (0..n).map(move |i| {
            let (start, stop) = if n == 1 {
                (0, self.buf.len())
            } else {
                (self.offsets[i], self.offsets[i + 1])
            };
            (&self.keys[n - 1 - i], &self.buf[start..stop])
        })
    }

    fn begin(&mut self) -> Result<bool> {
        match self.dir {
            Direction::Forward => {
                let start = self.bounds.forward_seek(&self.prefix);
                self.it = Some(self.engine.scan(&start, false));
                let mut go = self.advance()?;
                while go && !self.bounds.lo_ok(self.current_key()) {
                    go = self.advance()?;
                }
                Ok(go)
            }
            Direction::Reverse => {
                let start = self.bounds.reverse_seek(&self.prefix)?;
                self.it = Some(self.engine.scan(&start, true));
                let mut go = self.advance()?;
                if !go {
                    go = self.advance()?;
                }
                while go && !self.bounds.hi_ok(self.current_key()) {
                    go = self.advance()?;
                }
                Ok(go)
            }
        }
    }

    fn in_range(&self) -> bool {
        match self.dir {
            Direction::Forward => self.bounds.hi_ok(self.current_key()),
            Direction::Reverse => self.bounds.lo_ok(self.current_key()),
        }
    }

    fn current_key(&self) -> &Key {
        &self.keys[self.keys.len() - 1 - self.logical]
    }

    /// Progress one logical step within the current batch, or fetch the
    /// next physical record once the batch is exhausted.
    fn advance(&mut self) -> Result<bool> {
        if self.pending == 0 {
            if self.max_phys == Some(0) {
                return Ok(false);
            }
            if let Some(m) = &mut self.max_phys {
                *m -= 1;
            }

            let it = self
                .it
                .as_mut()
                .ok_or_else(|| Error::invariant("cursor stepped before seek"))?;
            let Some((k, v)) = it.next()? else {
                self.keys.clear();
                return Ok(false);
            };
            let Some(keys) = decode_keys(&self.prefix, &k)? else {
                self.keys.clear();
                return Ok(false);
            };
            self.phys_key = k;
            self.keys = keys;

            if self.keys.len() == 1 {
                self.buf = self.store.decompress(&v)?;
                self.span = (0, self.buf.len());
                self.logical = 0;
                return Ok(true);
            }

            let (offsets, dstart) = decode_offsets(&v)?;
            if offsets.len() != self.keys.len() + 1 {
                return Err(Error::invariant(format!(
                    "batch record carries {} keys but {} offsets",
                    self.keys.len(),
                    offsets.len().saturating_sub(1)
                )));
            }
            self.offsets = offsets;
            self.buf = self.store.decompress(&v[dstart..])?;
            self.pending = self.keys.len();
        }

        self.pending -= 1;
        let idx = match self.dir {
            Direction::Reverse => self.pending,
            Direction::Forward => self.keys.len() - self.pending - 1,
        };
        self.logical = idx;
        self.span = (self.offsets[idx], self.offsets[idx + 1]);
        Ok(true)
    }
}

/// Decode the offset array at the front of a batch value: a varint count,
/// then one varint delta per record, prefix-summed from zero. Returns the
/// offsets and the position of the packer prefix byte.
pub(crate) fn decode_offsets(value: &[u8]) -> Result<(Vec<usize>, usize)> {
    let (count, mut pos) = read_varint(value, 0)?;
    // Every delta takes at least one byte, so a count beyond the value
    // length is corrupt; reject it before reserving anything.
    if count as usize > value.len() {
        return Err(Error::invariant(format!(
            "batch offset count {count} exceeds value size {}",
            value.len()
        )));
    }
    let mut out = Vec::with_capacity(count as usize + 1);
    out.push(0usize);
    let mut acc = 0usize;
    for _ in 0..count {
        let (delta, next) = read_varint(value, pos)?;
        pos = next;
        acc += delta as usize;
        out.push(acc);
    }
    Ok((out, pos))
}
