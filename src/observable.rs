//! A minimal in-house hot multicast primitive.
//!
//! `Observable<T>` is the thing every multicast stream in this crate (a
//! channel's message stream, a store's change stream) is built out of. It
//! has exactly the properties the bus kernel needs and nothing more:
//!
//! - no replay: a subscriber only ever sees values emitted after it
//!   subscribed.
//! - in-order, synchronous fan-out: `emit` calls every current subscriber,
//!   in subscription order, before returning.
//! - idempotent unsubscribe: unsubscribing twice, or unsubscribing an id
//!   that was never valid, is a harmless no-op.
//! - a panicking subscriber does not stop delivery to the subscribers after
//!   it.
//!
//! This is deliberately not a channel (no buffering, no backpressure, no
//! `Send`/`Sync`): the bus is single-task and cooperative, so there is
//! nothing to buffer against.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

/// Handle returned by [`Observable::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct Inner<T> {
    subscribers: Vec<(u64, Handler<T>)>,
    next_id: u64,
    closed: bool,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 0,
            closed: false,
        }
    }
}

/// A hot, unbuffered multicast stream of `T`.
///
/// Cheaply `Clone`: clones share the same underlying subscriber list, the
/// way a `tokio::sync::watch::Sender` handle does.
pub struct Observable<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Observable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::default())),
        }
    }

    /// Register a handler. Returns an id that can later be passed to
    /// [`Observable::unsubscribe`].
    ///
    /// Subscribing from inside a handler currently running as part of an
    /// `emit` is safe: the new subscriber is appended to the live list but
    /// the in-flight `emit` call has already taken its own snapshot, so the
    /// new subscriber only sees values emitted after it joined.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&T) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subscribers
            .push((id, Rc::new(RefCell::new(handler))));
        SubscriptionId(id)
    }

    /// Remove a subscriber. Returns `true` if it was present, `false` if it
    /// had already been removed (or never existed) — either way this never
    /// panics or errors.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id.0);
        inner.subscribers.len() != before
    }

    /// Deliver `value` to every subscriber currently registered, in
    /// subscription order.
    ///
    /// Subscribers are snapshotted (their `Rc<RefCell<..>>` cells are
    /// cloned) before any of them run, outside the registry's own borrow.
    /// This means a handler that subscribes or unsubscribes during its own
    /// invocation can't deadlock on `RefCell` and won't observe the
    /// mutation it causes mid-emission — it takes effect starting with the
    /// next `emit`.
    ///
    /// A handler that panics is caught; the panic is not propagated and
    /// every subsequent subscriber still runs. The panic payload is
    /// dropped — callers that need to observe a broken subscriber should
    /// watch the monitor stream instead of relying on `emit` to report it.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = {
            let inner = self.inner.borrow();
            inner.subscribers.iter().map(|(_, h)| Rc::clone(h)).collect()
        };
        for handler in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| {
                let mut handler = handler.borrow_mut();
                (handler)(value);
            }));
            if result.is_err() {
                tracing::error!("observable subscriber panicked during emit");
            }
        }
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    /// Mark this observable closed. Closing does not remove subscribers or
    /// prevent further `emit` calls — it is a flag callers (the channel
    /// registry, in particular) consult to decide whether to accept new
    /// traffic; `Observable` itself has no opinion on what "closed" means
    /// for `T`.
    pub fn close(&self) {
        self.inner.borrow_mut().closed = true;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }
}
