use keva_keys::KeyError;
use thiserror::Error;

///
/// Error
///
/// Runtime error taxonomy for the store. Engine errors are propagated
/// unchanged in `Engine`; a scan stepping outside its collection prefix is
/// not an error at all — it terminates the scan cleanly.
///

#[derive(Debug, Error)]
pub enum Error {
    /// A stored value names an encoder prefix nobody registered in this
    /// process. `name` is the best-effort name read back from the store's
    /// persistent registry.
    #[error("unknown encoder prefix {prefix} (registered name: {name:?})")]
    UnknownEncoder { prefix: u8, name: Option<String> },

    /// The persistent registry ran out of one-byte prefixes (see
    /// [`MAX_ENCODER_PREFIX`](crate::MAX_ENCODER_PREFIX)).
    #[error("encoder registry exhausted: assignment {idx} is past the one-byte range")]
    EncoderLimit { idx: u64 },

    #[error("unknown engine '{0}'")]
    UnknownEngine(String),

    #[error("invalid query: {0}")]
    InvalidQuery(&'static str),

    /// Stored metadata contradicts itself or a scan found an impossible
    /// physical layout.
    #[error("store invariant violated: {0}")]
    Invariant(String),

    #[error("key codec: {0}")]
    Key(#[from] KeyError),

    #[error("value codec: {0}")]
    Value(String),

    #[error("engine: {0}")]
    Engine(String),
}

impl Error {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    pub(crate) fn value(err: impl std::fmt::Display) -> Self {
        Self::Value(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
