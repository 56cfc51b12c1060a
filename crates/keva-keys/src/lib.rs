//! Ordered tuple keys for the keva object store.
//!
//! A [`Key`] is an ordered tuple of primitive elements. The codec in this
//! crate encodes keys to byte strings whose unsigned byte-wise order matches
//! tuple order, so an engine that sorts raw bytes sorts logical keys for
//! free. The derived `Ord` on [`Key`] and [`KeyPart`] agrees with the byte
//! order of their encodings; that equivalence is property-tested.

mod codec;
mod varint;


pub use codec::{decode_keys, encode_key, encode_keys, next_greater};
pub use varint::{read_varint, write_varint};

use derive_more::{Deref, From};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

///
/// KeyError
///

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum KeyError {
    #[error("key truncated at byte {at}")]
    Truncated { at: usize },
    #[error("invalid element tag {tag} at byte {at}")]
    InvalidTag { tag: u8, at: usize },
    #[error("text element is not valid utf-8")]
    InvalidText,
}

///
/// KeyPart
///
/// One element of a structured key. Variant declaration order matches the
/// codec's tag order, so the derived `Ord` agrees with encoded byte order.
///

#[derive(
    Clone, Debug, Deserialize, Eq, From, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum KeyPart {
    Null,
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Text(String),
    Uuid(Uuid),
    List(Key),
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<i32> for KeyPart {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for KeyPart {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&[u8]> for KeyPart {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::List(k) => write!(f, "{k}"),
        }
    }
}

///
/// Key
///
/// An ordered tuple of [`KeyPart`] elements. Comparison is lexicographic by
/// element, with a shorter tuple ordering before any tuple it prefixes.
///

#[derive(
    Clone, Debug, Default, Deref, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Key(Vec<KeyPart>);

impl Key {
    #[must_use]
    pub const fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Borrow the tuple elements.
    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// True when `self` begins with every element of `prefix`.
    #[must_use]
    pub fn starts_with_key(&self, prefix: &Self) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Encode this key below a byte prefix.
    #[must_use]
    pub fn encode(&self, prefix: &[u8]) -> Vec<u8> {
        encode_key(prefix, self)
    }

    /// Exclusive upper bound of the byte range occupied by every key that
    /// has this key as a tuple prefix, or `None` when the codec has no
    /// successor (the encoding ends in an unbroken run of `0xFF`).
    #[must_use]
    pub fn prefix_bound(&self, prefix: &[u8]) -> Option<Vec<u8>> {
        next_greater(&self.encode(prefix))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

impl From<KeyPart> for Key {
    fn from(part: KeyPart) -> Self {
        Self(vec![part])
    }
}

impl From<Vec<KeyPart>> for Key {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }
}

macro_rules! key_from_scalar {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for Key {
            fn from(v: $ty) -> Self {
                Self(vec![KeyPart::from(v)])
            }
        })*
    };
}

key_from_scalar!(i64, i32, u32, bool, &str, String, Uuid);

macro_rules! key_from_tuple {
    ($(($($name:ident),+))*) => {
        $(impl<$($name: Into<KeyPart>),+> From<($($name,)+)> for Key {
            #[allow(non_snake_case)]
            fn from(($($name,)+): ($($name,)+)) -> Self {
                Self(vec![$($name.into()),+])
            }
        })*
    };
}

key_from_tuple! {
    (A)
    (A, B)
    (A, B, C)
    (A, B, C, D)
}
