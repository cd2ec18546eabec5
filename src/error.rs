//! Error kinds surfaced by the loop core.

use std::fmt;

use crate::id::Id;

/// Everything that can go wrong while building, registering or driving a
/// [`crate::Loop`].
///
/// Every call that can fail returns one of these as an explicit `Result`.
/// Dispatch-thread callback panics propagate to the caller of `poll`/`run`
/// as ordinary panics; the one exception is a `Work` source's off-thread
/// function, which a pool worker runs inside `catch_unwind` and logs rather
/// than lets take down the whole process — that case never reaches this
/// enum at all.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A `new`-style constructor could not allocate the source.
    #[error("failed to allocate event source")]
    AllocationFailed,

    /// `start` was called on a source that is already in some loop's
    /// started list.
    #[error("source {id:?} is already started")]
    AlreadyStarted {
        /// The id of the offending source.
        id: Id,
    },

    /// `stop` was called on a source that was not started. This is
    /// reported so callers *can* match on it, but it is a benign
    /// condition: `stop` is idempotent and returns `Ok(())`-equivalent
    /// behavior to the caller through [`crate::source::stop`], not this
    /// variant, which backends use internally.
    #[error("source {id:?} is not started")]
    NotStarted {
        /// The id of the offending source.
        id: Id,
    },

    /// A backend registration call (`add_fd`, `add_signal`, ...) rejected
    /// the request.
    #[error("backend rejected registration for source {id:?}: {reason}")]
    BackendRejected {
        /// The id of the source the backend refused to register.
        id: Id,
        /// Backend-supplied explanation, usually an `io::Error` rendering.
        reason: String,
    },

    /// An operation the active backend does not implement, e.g. `get_fd`
    /// on a backend with no pollable aggregation descriptor.
    #[error("operation unsupported by the active backend: {0}")]
    Unsupported(&'static str),

    /// Wraps an I/O failure surfaced while talking to the backend (e.g. a
    /// `write` to the self-pipe, a `sigaction` call).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand used throughout the backend glue.
    pub(crate) fn backend_rejected(id: Id, reason: impl fmt::Display) -> Self {
        Error::BackendRejected {
            id,
            reason: reason.to_string(),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
