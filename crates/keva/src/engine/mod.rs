//! Module: engine
//! Responsibility: the byte-ordered storage boundary and its built-ins.
//! Does not own: key structure, record layout, or index semantics.

mod memory;

pub use memory::MemoryEngine;

use crate::error::{Error, Result};
use std::rc::Rc;

///
/// Engine
///
/// An ordered byte key-value engine. A transaction handle exposes the same
/// surface; store operations take `Option<&dyn Engine>` and fall back to
/// the store's own engine when no transaction is supplied.
///

pub trait Engine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Begin a scan. Forward scans yield entries with key >= `start` in
    /// ascending byte order; reverse scans yield entries with key <=
    /// `start` in descending order, including `start` itself if present.
    fn scan<'e>(&'e self, start: &[u8], reverse: bool) -> Box<dyn EngineCursor + 'e>;

    /// Identifier of the transaction this handle is bound to, if any.
    /// Records remember it so values from distinct transactions are not
    /// mixed by the caller.
    fn txn_id(&self) -> Option<u64> {
        None
    }
}

///
/// EngineCursor
///
/// One lazy scan. `next` is a blocking pull; dropping the cursor cancels
/// the scan.
///

pub trait EngineCursor {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// Resolve an engine by name. Only the built-in in-memory engine is known
/// here; external engines are constructed directly and handed to
/// [`Store::new`](crate::Store::new).
pub fn open(name: &str) -> Result<Rc<dyn Engine>> {
    match name {
        "memory" | "skiplist" => Ok(Rc::new(MemoryEngine::new())),
        other => Err(Error::UnknownEngine(other.to_owned())),
    }
}
