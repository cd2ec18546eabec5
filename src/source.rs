//! The event-source object model (§3, §4.1, §4.2 of the design).
//!
//! All source kinds share one representation: a common [`Inner`] header
//! (id, refcount, userdata, dispatch callback, registration bookkeeping)
//! plus a tagged [`KindData`] payload. This mirrors the "tagged variant
//! instead of inheritance" note in §9 — there is one struct, one enum tag,
//! and every kind-specific operation switches on it, rather than a
//! trait-object hierarchy per kind.
//!
//! Reference counting is the one place this crate reaches past ordinary
//! `Arc`/`Drop` ownership on purpose: the public API promises C-library
//! style `ref`/`unref` calls that return the count they observed, so a
//! caller can implement the "create, start, drop the creation reference"
//! idiom from §3. A `Source` *is* an `Arc<Inner>`, and its strong count
//! *is* the one refcount §3 describes — there is no second counter to
//! keep in sync. [`Source::ref_`] bumps that count without consuming the
//! handle, mirroring a C `ref(ptr)` call that leaves `ptr` usable but now
//! owes a balancing release from somewhere. [`Source::unref`] takes `self`
//! by value for exactly that reason: it *is* that release, so the handle
//! it consumes cannot also run its ordinary `Drop` afterwards and
//! decrement the same count a second time. Letting a handle fall out of
//! scope without calling `unref` is itself a release (ordinary `Drop`),
//! so every handle is released exactly once, by construction.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::id::{self, Id};
use crate::loop_::LoopCore;

/// Read/Write/OutOfBand readiness mask (§6 encoding: bit 0 = Read, bit 1 =
/// Write, bit 2 = Out-of-band).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct EventMask(u8);

impl EventMask {
    /// Nothing requested / nothing ready.
    pub const NONE: EventMask = EventMask(0);
    /// Readable.
    pub const READ: EventMask = EventMask(1 << 0);
    /// Writable.
    pub const WRITE: EventMask = EventMask(1 << 1);
    /// Out-of-band / urgent data.
    pub const OOB: EventMask = EventMask(1 << 2);

    pub(crate) fn from_bits(bits: u8) -> Self {
        EventMask(bits & 0b111)
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    /// True if no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Union of two masks.
    pub fn union(self, other: EventMask) -> EventMask {
        EventMask(self.0 | other.0)
    }

    /// Whether `self` contains every bit of `other`.
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        self.union(rhs)
    }
}

/// The tag distinguishing source kinds (§3).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// The loop object itself.
    Loop,
    /// A watched file descriptor.
    FdHandler,
    /// A one-shot relative timer.
    Timer,
    /// A self-rearming periodic timer.
    Ticker,
    /// A process signal.
    Signal,
    /// Off-thread work plus a done callback.
    Work,
    /// A callback run at the end of every dispatch pass.
    Idle,
}

/// A boxed, `FnMut`, run-on-the-dispatch-thread callback.
///
/// Callbacks take no arguments by design: a callback is created by moving
/// in a clone of the typed handle it belongs to (`FdHandler`, `Timer`, ...),
/// so it queries whatever it needs (`get_revents`, `get_userdata`, ...)
/// through that handle instead of through a parameter. This keeps the
/// dispatcher in [`crate::loop_`] kind-agnostic.
pub type Callback = Box<dyn FnMut() + Send + 'static>;

type ReleaseFn = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

pub(crate) struct UserData {
    data: Option<Box<dyn Any + Send>>,
    release: Option<ReleaseFn>,
}

impl UserData {
    fn empty() -> Self {
        UserData {
            data: None,
            release: None,
        }
    }
}

impl Drop for UserData {
    fn drop(&mut self) {
        if let (Some(data), Some(release)) = (self.data.take(), self.release.take()) {
            release(data);
        }
    }
}

/// Per-kind payload (§3's "additional per-kind attributes").
pub(crate) enum KindData {
    Loop(Arc<LoopCore>),
    FdHandler(FdData),
    Timer(TimerData),
    Ticker(TimerData),
    Signal(SignalData),
    Work(WorkData),
    Idle,
}

pub(crate) struct FdData {
    pub fd: RawFd,
    pub requested: Mutex<EventMask>,
    /// Accumulated readiness bits between `emit` and dispatch (§4.4/§4.5).
    /// Atomic and lock-free on purpose: the fetch-or here is the only
    /// operation `emit` performs on the fast path from a signal handler.
    pub pending: AtomicU8,
}

pub(crate) struct TimerData {
    pub duration_us: Mutex<u64>,
    pub deadline_us: AtomicU64,
}

pub(crate) struct SignalData {
    pub signo: i32,
}

pub(crate) struct WorkData {
    pub work_fn: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

/// Which loop (if any) a source is currently started on, plus the
/// backend-private slot that loop's backend may use (§6's "backend-facing
/// sub-interface").
pub(crate) struct Registration {
    pub loop_weak: Option<Weak<LoopCore>>,
    pub backend_data: Option<Box<dyn Any + Send>>,
}

/// The common header every source kind shares (§3).
pub(crate) struct Inner {
    pub id: Id,
    pub kind: SourceKind,
    pub userdata: Mutex<UserData>,
    pub callback: Mutex<Option<Callback>>,
    pub kind_data: KindData,
    pub registration: Mutex<Registration>,
    /// Non-fd coalescing flag: true while the source sits in an event
    /// queue. FdHandlers use `FdData::pending` instead (see §4.4).
    pub queued: std::sync::atomic::AtomicBool,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

fn new_inner(kind: SourceKind, kind_data: KindData) -> Arc<Inner> {
    let id = id::next_id();
    let inner = Arc::new(Inner {
        id,
        kind,
        userdata: Mutex::new(UserData::empty()),
        callback: Mutex::new(None),
        kind_data,
        registration: Mutex::new(Registration {
            loop_weak: None,
            backend_data: None,
        }),
        queued: std::sync::atomic::AtomicBool::new(false),
    });
    id::register(id, &inner);
    inner
}

impl Drop for Inner {
    fn drop(&mut self) {
        id::drop_id(self.id);
    }
}

/// Build the source representing a loop itself
/// ([`crate::loop_::Loop::from_id`] resolves it back).
pub(crate) fn new_loop_source(core: Arc<LoopCore>) -> Arc<Inner> {
    new_inner(SourceKind::Loop, KindData::Loop(core))
}

/// A generic handle to any source kind.
///
/// Typed wrappers ([`FdHandler`], [`Timer`], [`Ticker`], [`Signal`],
/// [`Work`], [`Idle`]) each deref to this for the operations common to
/// every kind (§6's "Per-source" operations).
#[derive(Clone)]
pub struct Source(pub(crate) Arc<Inner>);

impl Source {
    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Source(inner)
    }

    /// This source's stable id.
    pub fn get_id(&self) -> Id {
        self.0.id
    }

    /// Which kind of source this is.
    pub fn kind(&self) -> SourceKind {
        self.0.kind
    }

    /// Bump the reference count, C-library style, returning the count
    /// observed *before* the bump.
    pub fn ref_(&self) -> usize {
        let prior = Arc::strong_count(&self.0);
        // SAFETY: `self.0` is a live `Arc`, so incrementing the strong
        // count by one through the raw pointer is exactly what
        // `Arc::clone` would do; we just avoid materializing (and then
        // immediately forgetting) the extra clone.
        unsafe { Arc::increment_strong_count(Arc::as_ptr(&self.0)) };
        prior
    }

    /// Drop a reference, C-library style, returning the count observed
    /// *after* the decrement. When it reaches zero the source is
    /// finalized: its user-data release callback runs and its id leaves
    /// the registry.
    ///
    /// Takes `self` by value: this *is* the handle's one release. A
    /// `&self` version would decrement the count here and then decrement
    /// it again when the handle's ordinary `Drop` ran at end of scope,
    /// freeing `Inner` out from under any other live `Arc<Inner>` clone
    /// (the loop's started-list entry, say). Consuming `self` makes that
    /// double release impossible: the value is gone, so there is nothing
    /// left for `Drop` to run on afterward.
    pub fn unref(self) -> usize {
        let ptr = Arc::as_ptr(&self.0);
        let count = Arc::strong_count(&self.0) - 1;
        // SAFETY: `self.0` is a live `Arc` until the `mem::forget` below,
        // so this is exactly the decrement an ordinary `Drop` would have
        // performed. Forgetting `self` afterward is what keeps that `Drop`
        // from also running and decrementing a second time.
        unsafe { Arc::decrement_strong_count(ptr) };
        std::mem::forget(self);
        count
    }

    /// Attach opaque user data and an optional release callback, invoked
    /// exactly once when the source is finalized.
    pub fn set_userdata<T: Any + Send + 'static>(
        &self,
        data: T,
        release: Option<Box<dyn FnOnce(T) + Send>>,
    ) {
        let release: Option<ReleaseFn> = release.map(|r| -> ReleaseFn {
            Box::new(move |boxed: Box<dyn Any + Send>| {
                if let Ok(data) = boxed.downcast::<T>() {
                    r(*data);
                }
            })
        });
        let mut ud = self.0.userdata.lock().unwrap();
        *ud = UserData {
            data: Some(Box::new(data)),
            release,
        };
    }

    /// Run `f` with a reference to the user data, if any was set and it
    /// matches `T`; otherwise run `f` with `None`.
    ///
    /// Borrow-scoped rather than returning a reference directly, since the
    /// data lives behind this source's internal mutex.
    pub fn with_userdata<T: Any + Send + 'static, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let guard = self.0.userdata.lock().unwrap();
        f(guard.data.as_deref().and_then(|d| d.downcast_ref::<T>()))
    }

    /// Install (replacing any previous) dispatch callback.
    pub fn set_callback(&self, cb: Callback) {
        *self.0.callback.lock().unwrap() = Some(cb);
    }

    /// Whether this source is currently started on `loop_`.
    pub fn is_started(&self, loop_: &crate::loop_::Loop) -> bool {
        self.0
            .registration
            .lock()
            .unwrap()
            .loop_weak
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|core| Arc::ptr_eq(&core, &loop_.core))
            .unwrap_or(false)
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.0
    }

    /// Attach backend-private state, distinct from the user payload set by
    /// [`Source::set_userdata`] (§6's "backend-facing sub-interface").
    /// Backend implementations use this for bookkeeping they want to keep
    /// with the source rather than in their own side table.
    pub(crate) fn set_backend_data(&self, data: Box<dyn Any + Send>) {
        self.0.registration.lock().unwrap().backend_data = Some(data);
    }

    /// Run `f` with the backend-private state, if any was set and it
    /// matches `T`.
    pub(crate) fn with_backend_data<T: Any + Send + 'static, R>(
        &self,
        f: impl FnOnce(Option<&T>) -> R,
    ) -> R {
        let guard = self.0.registration.lock().unwrap();
        f(guard.backend_data.as_deref().and_then(|d| d.downcast_ref::<T>()))
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Upgrade a weak [`Id`] back to a [`Source`] handle, or `None` if the
/// source has already been finalized (§4.1, §8's "upgrade safety").
pub fn upgrade(id: Id) -> Option<Source> {
    id::try_upgrade(id).map(Source::from_inner)
}

macro_rules! typed_source {
    ($name:ident, $kind:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone)]
        pub struct $name(pub(crate) Source);

        impl Deref for $name {
            type Target = Source;
            fn deref(&self) -> &Source {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl $name {
            /// Start this source on `loop_` (§4.2).
            pub fn start(&self, loop_: &crate::loop_::Loop) -> Result<()> {
                crate::loop_::start_source(loop_, &self.0)
            }

            /// Stop this source, idempotently (§4.2).
            pub fn stop(&self, loop_: &crate::loop_::Loop) -> Result<()> {
                crate::loop_::stop_source(loop_, &self.0)
            }

            /// Drop a reference, C-library style (see [`Source::unref`]).
            /// Shadows the `Deref`-forwarded version because it must
            /// consume the whole typed handle, not just the `Source` it
            /// wraps.
            pub fn unref(self) -> usize {
                self.0.unref()
            }
        }
    };
}

typed_source!(FdHandler, FdHandler, "A watched file descriptor (§3).");
typed_source!(Timer, Timer, "A one-shot relative timer (§3).");
typed_source!(Ticker, Ticker, "A self-rearming periodic timer (§3).");
typed_source!(Signal, Signal, "A watched process signal (§3).");
typed_source!(Work, Work, "Off-thread work plus a done callback (§3).");
typed_source!(Idle, Idle, "A callback run at the end of every pass (§3).");

impl FdHandler {
    /// Create a new, unstarted `FdHandler`. Holds one reference, owned by
    /// the caller (§3's "create, start, drop the creation reference").
    pub fn new(fd: RawFd, mask: EventMask, callback: impl FnMut() + Send + 'static) -> Self {
        let inner = new_inner(
            SourceKind::FdHandler,
            KindData::FdHandler(FdData {
                fd,
                requested: Mutex::new(mask),
                pending: AtomicU8::new(0),
            }),
        );
        *inner.callback.lock().unwrap() = Some(Box::new(callback));
        FdHandler(Source::from_inner(inner))
    }

    fn fd_data(&self) -> &FdData {
        match &self.0.inner().kind_data {
            KindData::FdHandler(d) => d,
            _ => unreachable!("FdHandler wraps a non-FdHandler source"),
        }
    }

    /// The watched file descriptor.
    pub fn get_fd(&self) -> RawFd {
        self.fd_data().fd
    }

    /// Replace the requested event mask, re-arming the backend immediately
    /// if already started.
    pub fn set_event_mask(&self, mask: EventMask) -> Result<()> {
        *self.fd_data().requested.lock().unwrap() = mask;
        crate::loop_::reregister_fd(&self.0)
    }

    /// The currently requested event mask.
    pub fn get_event_mask(&self) -> EventMask {
        *self.fd_data().requested.lock().unwrap()
    }

    /// The readiness bits observed for the invocation currently being
    /// dispatched (valid from inside the callback; cleared right after).
    pub fn get_revents(&self) -> EventMask {
        EventMask::from_bits(self.fd_data().pending.load(Ordering::Acquire))
    }
}

impl Timer {
    /// Create a new, unstarted one-shot `Timer` with `duration_us`
    /// microseconds to wait once started.
    pub fn new(duration_us: u64, callback: impl FnMut() + Send + 'static) -> Self {
        let inner = new_inner(
            SourceKind::Timer,
            KindData::Timer(TimerData {
                duration_us: Mutex::new(duration_us),
                deadline_us: AtomicU64::new(0),
            }),
        );
        *inner.callback.lock().unwrap() = Some(Box::new(callback));
        Timer(Source::from_inner(inner))
    }

    /// Change the duration. Undefined behavior (per §6) if the source is
    /// currently started — call this only while stopped.
    pub fn set_duration(&self, duration_us: u64) {
        if let KindData::Timer(d) = &self.0.inner().kind_data {
            *d.duration_us.lock().unwrap() = duration_us;
        }
    }
}

impl Ticker {
    /// Create a new, unstarted periodic `Ticker`. `duration_us` must be
    /// nonzero (§4.2: zero-duration tickers abort).
    pub fn new(duration_us: u64, callback: impl FnMut() + Send + 'static) -> Self {
        assert!(duration_us > 0, "Ticker duration must be nonzero");
        let inner = new_inner(
            SourceKind::Ticker,
            KindData::Ticker(TimerData {
                duration_us: Mutex::new(duration_us),
                deadline_us: AtomicU64::new(0),
            }),
        );
        *inner.callback.lock().unwrap() = Some(Box::new(callback));
        Ticker(Source::from_inner(inner))
    }

    /// Change the duration. Undefined behavior (per §6) if started.
    pub fn set_duration(&self, duration_us: u64) {
        assert!(duration_us > 0, "Ticker duration must be nonzero");
        if let KindData::Ticker(d) = &self.0.inner().kind_data {
            *d.duration_us.lock().unwrap() = duration_us;
        }
    }
}

impl Signal {
    /// Create a new, unstarted `Signal` source for signal number `signo`.
    pub fn new(signo: i32, callback: impl FnMut() + Send + 'static) -> Self {
        let inner = new_inner(SourceKind::Signal, KindData::Signal(SignalData { signo }));
        *inner.callback.lock().unwrap() = Some(Box::new(callback));
        Signal(Source::from_inner(inner))
    }

    /// The watched signal number.
    pub fn get_signo(&self) -> i32 {
        match &self.0.inner().kind_data {
            KindData::Signal(d) => d.signo,
            _ => unreachable!(),
        }
    }
}

impl Work {
    /// Create a new, unstarted `Work` source: `work_fn` runs once on a
    /// pool worker thread; `done` runs on the dispatch thread afterwards.
    pub fn new(
        work_fn: impl FnOnce() + Send + 'static,
        done: impl FnMut() + Send + 'static,
    ) -> Self {
        let inner = new_inner(
            SourceKind::Work,
            KindData::Work(WorkData {
                work_fn: Mutex::new(Some(Box::new(work_fn))),
            }),
        );
        *inner.callback.lock().unwrap() = Some(Box::new(done));
        Work(Source::from_inner(inner))
    }
}

impl Idle {
    /// Create a new, unstarted `Idle` source.
    pub fn new(callback: impl FnMut() + Send + 'static) -> Self {
        let inner = new_inner(SourceKind::Idle, KindData::Idle);
        *inner.callback.lock().unwrap() = Some(Box::new(callback));
        Idle(Source::from_inner(inner))
    }
}

/// Invoke a source's dispatch callback, if one is set. Shared by the
/// dispatcher (§4.4) for every kind.
pub(crate) fn invoke_callback(inner: &Arc<Inner>) {
    let mut guard = inner.callback.lock().unwrap();
    if let Some(cb) = guard.as_mut() {
        cb();
    }
}
