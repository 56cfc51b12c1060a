//! Module: encoder
//! Responsibility: value serialization and physical-value compression.
//! Does not own: prefix persistence — the store keeps the name→byte map in
//! its encoders metadata collection.

use crate::error::{Error, Result};
use flate2::Compression;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use keva_keys::{Key, decode_keys, encode_key};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;

///
/// Packer
///
/// A byte-level compressor applied to the physical value payload. The name
/// is persisted in the store's registry after first use, so it must stay
/// stable across releases.
///

pub trait Packer {
    fn name(&self) -> &str;

    fn pack(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn unpack(&self, data: &[u8]) -> Result<Vec<u8>>;
}

///
/// ValueEncoder
///
/// A typed record value codec. Each collection owns one; the name is
/// registered with the store the same way packer names are.
///

pub trait ValueEncoder<V> {
    fn name(&self) -> &str;

    fn pack(&self, value: &V) -> Result<Vec<u8>>;

    fn unpack(&self, data: &[u8]) -> Result<V>;
}

///
/// PlainPacker
/// Identity compression.
///

#[derive(Clone, Copy, Debug, Default)]
pub struct PlainPacker;

impl Packer for PlainPacker {
    fn name(&self) -> &str {
        "plain"
    }

    fn pack(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn unpack(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

///
/// DeflatePacker
///

#[derive(Clone, Copy, Debug, Default)]
pub struct DeflatePacker;

impl Packer for DeflatePacker {
    fn name(&self) -> &str {
        "deflate"
    }

    fn pack(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        DeflateEncoder::new(data, Compression::default())
            .read_to_end(&mut out)
            .map_err(Error::value)?;
        Ok(out)
    }

    fn unpack(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        DeflateDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(Error::value)?;
        Ok(out)
    }
}

///
/// CborEncoder
///
/// Default record value codec for any serde-capable type.
///

#[derive(Clone, Copy, Debug, Default)]
pub struct CborEncoder;

impl<V: Serialize + DeserializeOwned> ValueEncoder<V> for CborEncoder {
    fn name(&self) -> &str {
        "cbor"
    }

    fn pack(&self, value: &V) -> Result<Vec<u8>> {
        serde_cbor::to_vec(value).map_err(Error::value)
    }

    fn unpack(&self, data: &[u8]) -> Result<V> {
        serde_cbor::from_slice(data).map_err(Error::value)
    }
}

///
/// KeyEncoder
///
/// Stores a key tuple as the record value, using the key codec itself.
/// Every store metadata collection uses this encoder.
///

#[derive(Clone, Copy, Debug, Default)]
pub struct KeyEncoder;

impl ValueEncoder<Key> for KeyEncoder {
    fn name(&self) -> &str {
        "key"
    }

    fn pack(&self, value: &Key) -> Result<Vec<u8>> {
        Ok(encode_key(&[], value))
    }

    fn unpack(&self, data: &[u8]) -> Result<Key> {
        let keys = decode_keys(&[], data)?
            .ok_or_else(|| Error::invariant("key-encoded value failed to decode"))?;
        keys.into_iter()
            .next()
            .ok_or_else(|| Error::invariant("key-encoded value is empty"))
    }
}

///
/// EncoderTable
///
/// In-process registry state: names that already have a prefix byte, and
/// packer instances reachable by byte for the read path. The built-ins seed
/// bytes 1-4; user encoders draw persisted assignments starting at 10.
///

pub(crate) struct EncoderTable {
    pub(crate) by_name: HashMap<String, u8>,
    pub(crate) packers: HashMap<u8, Rc<dyn Packer>>,
}

impl EncoderTable {
    pub(crate) fn with_builtins() -> Self {
        let mut by_name = HashMap::new();
        by_name.insert("key".to_owned(), 1);
        by_name.insert("cbor".to_owned(), 2);
        by_name.insert("plain".to_owned(), 3);
        by_name.insert("deflate".to_owned(), 4);

        let mut packers: HashMap<u8, Rc<dyn Packer>> = HashMap::new();
        packers.insert(3, Rc::new(PlainPacker));
        packers.insert(4, Rc::new(DeflatePacker));

        Self { by_name, packers }
    }
}
