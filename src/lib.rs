//! # reactora
//!
//! A general-purpose, backend-agnostic event loop: file descriptor
//! readiness, timers, signals, off-thread work and idle callbacks, all
//! dispatched from one thread under one three-phase pass.
//!
//! This crate does not schedule coroutines or green threads. Every
//! callback registered here runs to completion on the loop's dispatch
//! thread (or, for [`Work`], once on a pool worker followed by a `done`
//! callback back on the dispatch thread) — plain callbacks, not stackful
//! tasks.
//!
//! ```no_run
//! use reactora::{Config, Loop, Ticker};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let lp = Loop::new(Config::new()).unwrap();
//! let count = Arc::new(AtomicUsize::new(0));
//! let count_cb = Arc::clone(&count);
//! let lp_cb = lp.clone();
//! let ticker = Ticker::new(1_000, move || {
//!     if count_cb.fetch_add(1, Ordering::SeqCst) + 1 >= 10 {
//!         lp_cb.exit();
//!     }
//! });
//! ticker.start(&lp).unwrap();
//! lp.run();
//! ```
//!
//! ## Object model
//!
//! Every registerable thing — [`FdHandler`], [`Timer`], [`Ticker`],
//! [`Signal`], [`Work`], [`Idle`] — is built unstarted, holds one
//! reference owned by its creator, and is explicitly [`Source::ref_`] /
//! [`Source::unref`]-counted in the C-library style: `new` hands back one
//! reference, `start` adds one the loop owns. The normal "fire and forget"
//! idiom is to just let your handle fall out of scope after `start` —
//! that releases the creation reference through ordinary `Drop`, the same
//! as an explicit `unref()` would. Call `unref()` yourself only when you
//! need the observed count back or want to release the reference before
//! the handle would otherwise go out of scope; either way a handle is
//! released exactly once, never both ways.
//!
//! ## Backends
//!
//! The loop core never assumes a specific readiness engine; it is
//! written against the [`Backend`] trait. [`backend::mio_backend::MioBackend`]
//! is the one concrete backend this crate ships.
//!
//! ## Ambient concerns
//!
//! Errors are a closed [`Error`] enum (via `thiserror`), not panics or
//! stringly-typed failures. Every non-trivial phase transition logs at
//! `trace` (via the `log` crate) so a consumer's own logger can surface
//! it; nothing in this crate initializes a logger itself.

#![warn(missing_docs)]

mod backend;
mod error;
mod id;
mod idle;
mod loop_;
mod pool;
mod queue;
mod source;
mod timerset;

pub use backend::{mio_backend::MioBackend, Backend, Capabilities};
pub use error::{Error, Result};
pub use id::Id;
pub use loop_::{Config, Loop};
pub use source::{
    EventMask, FdHandler, Idle, Signal, Source, SourceKind, Ticker, Timer, Work,
};

/// Look a previously-created source back up by [`Id`], or `None` if it has
/// already been finalized.
pub fn upgrade(id: Id) -> Option<Source> {
    source::upgrade(id)
}
