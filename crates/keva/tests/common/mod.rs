//! Shared fixtures for the end-to-end suites.
#![allow(dead_code)]

use keva::engine::{Engine, EngineCursor};
use keva::error::Result;
use keva::{MemoryEngine, Store};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Once;

static INIT: Once = Once::new();

/// Route `tracing` output through the test harness once per process.
pub fn init() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    });
}

pub fn store() -> Store {
    init();
    Store::open("memory").expect("memory engine is built in")
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Person {
    pub name: String,
    pub age: i64,
}

pub fn person(name: &str, age: i64) -> Person {
    Person {
        name: name.to_owned(),
        age,
    }
}

///
/// CountingEngine
///
/// Engine wrapper that tallies calls, for asserting how many engine
/// touches an operation costs.
///

#[derive(Clone, Default)]
pub struct CountingEngine {
    inner: MemoryEngine,
    pub puts: Rc<Cell<usize>>,
    pub gets: Rc<Cell<usize>>,
    pub deletes: Rc<Cell<usize>>,
    pub scans: Rc<Cell<usize>>,
}

impl CountingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.puts.set(0);
        self.gets.set(0);
        self.deletes.set(0);
        self.scans.set(0);
    }
}

impl Engine for CountingEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.puts.set(self.puts.get() + 1);
        self.inner.put(key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.gets.set(self.gets.get() + 1);
        self.inner.get(key)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.deletes.set(self.deletes.get() + 1);
        self.inner.delete(key)
    }

    fn scan<'e>(&'e self, start: &[u8], reverse: bool) -> Box<dyn EngineCursor + 'e> {
        self.scans.set(self.scans.get() + 1);
        self.inner.scan(start, reverse)
    }
}
