//! Module: engine::memory
//! Responsibility: ordered in-memory engine over one `BTreeMap`.

use crate::engine::{Engine, EngineCursor};
use crate::error::Result;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;

///
/// MemoryEngine
///
/// Thin engine over one shared `BTreeMap`. Cloning the handle shares the
/// map, which is how "reopen the same store" is exercised in tests.
///
/// Cursors re-seek from the last yielded key on every step, so deleting or
/// inserting entries mid-scan is well-defined: a step simply observes the
/// map as it is at that moment. Batch packing depends on this.
///

#[derive(Clone, Default)]
pub struct MemoryEngine {
    map: Rc<RefCell<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical entries currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }
}

impl Engine for MemoryEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.borrow_mut().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.borrow().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.borrow_mut().remove(key);
        Ok(())
    }

    fn scan<'e>(&'e self, start: &[u8], reverse: bool) -> Box<dyn EngineCursor + 'e> {
        Box::new(MemoryCursor {
            map: Rc::clone(&self.map),
            pos: Bound::Included(start.to_vec()),
            reverse,
        })
    }
}

struct MemoryCursor {
    map: Rc<RefCell<BTreeMap<Vec<u8>, Vec<u8>>>>,
    pos: Bound<Vec<u8>>,
    reverse: bool,
}

impl EngineCursor for MemoryCursor {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.borrow();
        let entry = if self.reverse {
            map.range((Bound::Unbounded, self.pos.clone())).next_back()
        } else {
            map.range((self.pos.clone(), Bound::Unbounded)).next()
        };
        let Some((k, v)) = entry.map(|(k, v)| (k.clone(), v.clone())) else {
            return Ok(None);
        };
        drop(map);
        self.pos = Bound::Excluded(k.clone());
        Ok(Some((k, v)))
    }
}
