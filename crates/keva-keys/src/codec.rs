//! Byte codec for structured keys.
//!
//! Each element is a kind tag followed by a payload chosen so that unsigned
//! byte-wise comparison of two encodings matches tuple comparison. Kind tags
//! ascend in domain order, and the separator used when several keys share
//! one physical entry is lower than every kind tag: a multi-key entry sorts
//! immediately after its first (highest) member rather than after that
//! member's extensions.

use crate::varint::{read_varint, write_varint};
use crate::{Key, KeyError, KeyPart};

pub(crate) const TAG_SEP: u8 = 2;
const TAG_NULL: u8 = 15;
const TAG_NEG_INT: u8 = 20;
const TAG_INT: u8 = 21;
const TAG_BOOL: u8 = 30;
const TAG_BYTES: u8 = 40;
const TAG_TEXT: u8 = 50;
const TAG_UUID: u8 = 90;
const TAG_LIST: u8 = 95;

/// Append `data` with `0x00`/`0x01` escaped, then a `0x00` terminator.
/// The escape keeps byte order: a shorter payload sorts before any payload
/// it prefixes because the terminator is lower than every escaped byte.
fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        match b {
            0x00 => out.extend_from_slice(&[0x01, 0x01]),
            0x01 => out.extend_from_slice(&[0x01, 0x02]),
            _ => out.push(b),
        }
    }
    out.push(0x00);
}

/// Read an escaped payload, consuming the terminator.
fn unescape(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>, KeyError> {
    let mut out = Vec::new();
    loop {
        let b = *bytes.get(*pos).ok_or(KeyError::Truncated { at: *pos })?;
        *pos += 1;
        match b {
            0x00 => return Ok(out),
            0x01 => {
                let next = *bytes.get(*pos).ok_or(KeyError::Truncated { at: *pos })?;
                *pos += 1;
                match next {
                    0x01 => out.push(0x00),
                    0x02 => out.push(0x01),
                    other => {
                        return Err(KeyError::InvalidTag {
                            tag: other,
                            at: *pos - 1,
                        });
                    }
                }
            }
            other => out.push(other),
        }
    }
}

fn encode_part(out: &mut Vec<u8>, part: &KeyPart) {
    match part {
        KeyPart::Null => out.push(TAG_NULL),
        KeyPart::Int(v) if *v >= 0 => {
            out.push(TAG_INT);
            write_varint(out, *v as u64);
        }
        KeyPart::Int(v) => {
            // More negative must sort first: encode the bitwise complement
            // (0 for -1, growing toward i64::MIN) and invert the bytes.
            out.push(TAG_NEG_INT);
            let start = out.len();
            write_varint(out, !(*v as u64));
            for b in &mut out[start..] {
                *b ^= 0xFF;
            }
        }
        KeyPart::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*v));
        }
        KeyPart::Bytes(b) => {
            out.push(TAG_BYTES);
            escape_into(out, b);
        }
        KeyPart::Text(s) => {
            out.push(TAG_TEXT);
            escape_into(out, s.as_bytes());
        }
        KeyPart::Uuid(u) => {
            out.push(TAG_UUID);
            out.extend_from_slice(u.as_bytes());
        }
        KeyPart::List(k) => {
            out.push(TAG_LIST);
            let inner = encode_key(&[], k);
            escape_into(out, &inner);
        }
    }
}

fn decode_part(bytes: &[u8], pos: &mut usize) -> Result<KeyPart, KeyError> {
    let tag = bytes[*pos];
    *pos += 1;
    match tag {
        TAG_NULL => Ok(KeyPart::Null),
        TAG_INT => {
            let (v, next) = read_varint(bytes, *pos)?;
            *pos = next;
            Ok(KeyPart::Int(v as i64))
        }
        TAG_NEG_INT => {
            let first = *bytes.get(*pos).ok_or(KeyError::Truncated { at: *pos })?;
            let width = varint_width(first ^ 0xFF);
            if bytes.len() < *pos + width {
                return Err(KeyError::Truncated { at: bytes.len() });
            }
            let inverted: Vec<u8> = bytes[*pos..*pos + width].iter().map(|b| b ^ 0xFF).collect();
            let (m, _) = read_varint(&inverted, 0)?;
            *pos += width;
            Ok(KeyPart::Int(!(m) as i64))
        }
        TAG_BOOL => {
            let b = *bytes.get(*pos).ok_or(KeyError::Truncated { at: *pos })?;
            *pos += 1;
            Ok(KeyPart::Bool(b != 0))
        }
        TAG_BYTES => Ok(KeyPart::Bytes(unescape(bytes, pos)?)),
        TAG_TEXT => {
            let raw = unescape(bytes, pos)?;
            let s = String::from_utf8(raw).map_err(|_| KeyError::InvalidText)?;
            Ok(KeyPart::Text(s))
        }
        TAG_UUID => {
            if bytes.len() < *pos + 16 {
                return Err(KeyError::Truncated { at: bytes.len() });
            }
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&bytes[*pos..*pos + 16]);
            *pos += 16;
            Ok(KeyPart::Uuid(uuid::Uuid::from_bytes(raw)))
        }
        TAG_LIST => {
            let inner = unescape(bytes, pos)?;
            let keys = decode_keys(&[], &inner)?.ok_or(KeyError::Truncated { at: *pos })?;
            let key = keys.into_iter().next().unwrap_or_default();
            Ok(KeyPart::List(key))
        }
        other => Err(KeyError::InvalidTag {
            tag: other,
            at: *pos - 1,
        }),
    }
}

const fn varint_width(first: u8) -> usize {
    match first {
        0..=240 => 1,
        241..=248 => 2,
        249 => 3,
        _ => (first - 250) as usize + 4,
    }
}

/// Encode one key below a byte prefix.
#[must_use]
pub fn encode_key(prefix: &[u8], key: &Key) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 8 * key.parts().len());
    out.extend_from_slice(prefix);
    for part in key.parts() {
        encode_part(&mut out, part);
    }
    out
}

/// Encode several keys into one physical entry, separator-joined in the
/// order given.
#[must_use]
pub fn encode_keys(prefix: &[u8], keys: &[Key]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 16 * keys.len());
    out.extend_from_slice(prefix);
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(TAG_SEP);
        }
        for part in key.parts() {
            encode_part(&mut out, part);
        }
    }
    out
}

/// Decode the keys stored in one physical entry. Returns `None` when
/// `bytes` does not start with `prefix` — the clean end-of-scan signal,
/// never an error.
pub fn decode_keys(prefix: &[u8], bytes: &[u8]) -> Result<Option<Vec<Key>>, KeyError> {
    if !bytes.starts_with(prefix) {
        return Ok(None);
    }
    let mut pos = prefix.len();
    let mut keys = Vec::new();
    let mut parts = Vec::new();
    while pos < bytes.len() {
        if bytes[pos] == TAG_SEP {
            pos += 1;
            keys.push(Key::new(std::mem::take(&mut parts)));
        } else {
            parts.push(decode_part(bytes, &mut pos)?);
        }
    }
    keys.push(Key::new(parts));
    Ok(Some(keys))
}

/// The most compact byte string greater than every string prefixed by
/// `bytes`, or `None` when no such successor exists (empty input, or an
/// unbroken run of `0xFF`).
#[must_use]
pub fn next_greater(bytes: &[u8]) -> Option<Vec<u8>> {
    let end = bytes.iter().rposition(|&b| b != 0xFF)?;
    let mut out = bytes[..=end].to_vec();
    out[end] += 1;
    Some(out)
}
