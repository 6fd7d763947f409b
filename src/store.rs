//! The store subsystem: a keyed, state-tagged value store layered over the
//! kernel, plus the multi-store manager and `readyJoin`.
//!
//! Every store keeps its own ordered map as the authoritative state (the
//! kernel has no storage of its own) but also publishes a change record on
//! a dedicated per-store channel (`store:<name>`) so a monitor subscriber
//! or the proxy can observe store activity the same way it observes any
//! other kernel traffic, per the overview's "store subsystem is a
//! consumer/producer of the kernel" data flow line. The change/mutation
//! streams themselves are plain [`Observable`]s — see DESIGN.md for why
//! that's a better fit here than round-tripping through Request/Response/
//! Error/Control message kinds, which don't naturally express a keyed
//! change event.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

#[cfg(feature = "instrumentation")]
use tracing::instrument;

use crate::kernel::Bus;
use crate::message::{ChannelName, Message, Payload};
use crate::observable::{Observable, SubscriptionId};
use crate::BusError;

/// An opaque, caller-defined tag used only for filtering change events and
/// mutation requests (`Created`, `Updated`, `Deleted`, or whatever vocabulary
/// the application wants).
pub type StateTag = String;

/// An opaque, caller-defined tag identifying a kind of mutation
/// (`onMutationRequest`'s `mutationTypes` filter).
pub type MutationTag = String;

/// One change to a store: `key` took on `value` tagged `state`. Removal is
/// represented the same way, carrying the value that was just removed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Payload,
    pub state: StateTag,
}

/// A single-shot reply handle handed to a mutator subscribed via
/// [`Store::on_mutation_request`].
///
/// `success` or `error` may be called at most once; a second call is
/// logged and dropped rather than causing a panic or a `BusError` — per
/// `§3`, the envelope itself enforces single-shot-ness, it doesn't fail
/// loudly when misused.
pub struct MutateEnvelope {
    pub value: Payload,
    pub mutation_type: MutationTag,
    replied: Rc<Cell<bool>>,
    on_success: Rc<RefCell<Option<Box<dyn FnOnce(Payload)>>>>,
    on_error: Rc<RefCell<Option<Box<dyn FnOnce(Payload)>>>>,
    bus: Rc<Bus>,
    channel: ChannelName,
}

impl MutateEnvelope {
    pub fn success(&self, result: Payload) {
        if self.replied.replace(true) {
            let reason = BusError::MutationDoubleReply.to_string();
            tracing::error!(%reason, "dropping duplicate success reply");
            self.bus.report_dropped(&self.channel, reason);
            return;
        }
        match self.on_success.borrow_mut().take() {
            Some(cb) => cb(result),
            None => {
                let reason = BusError::MissingSubscriberHandler(self.channel.to_string()).to_string();
                tracing::error!(%reason, "mutation succeeded but caller supplied no success handler");
                self.bus.report_dropped(&self.channel, reason);
            }
        }
    }

    pub fn error(&self, err: Payload) {
        if self.replied.replace(true) {
            let reason = BusError::MutationDoubleReply.to_string();
            tracing::error!(%reason, "dropping duplicate error reply");
            self.bus.report_dropped(&self.channel, reason);
            return;
        }
        match self.on_error.borrow_mut().take() {
            Some(cb) => cb(err),
            None => {
                let reason = BusError::MissingSubscriberHandler(self.channel.to_string()).to_string();
                tracing::error!(%reason, "mutation failed but caller supplied no error handler");
                self.bus.report_dropped(&self.channel, reason);
            }
        }
    }
}

/// Ordered keyed map: iteration order follows insertion order; a key's
/// position doesn't change when its value is updated in place.
#[derive(Default)]
struct OrderedMap {
    order: Vec<String>,
    values: HashMap<String, Payload>,
}

impl OrderedMap {
    fn get(&self, key: &str) -> Option<Payload> {
        self.values.get(key).cloned()
    }

    fn insert(&mut self, key: String, value: Payload) {
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value);
    }

    fn remove(&mut self, key: &str) -> Option<Payload> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    fn clear(&mut self) {
        self.order.clear();
        self.values.clear();
    }

    fn ordered_values(&self) -> Vec<Payload> {
        self.order
            .iter()
            .filter_map(|k| self.values.get(k).cloned())
            .collect()
    }

    fn as_map(&self) -> HashMap<String, Payload> {
        self.values.clone()
    }
}

struct StoreInner {
    name: String,
    map: OrderedMap,
    ready: bool,
    ever_populated: bool,
    closed: bool,
    ready_waiters: Vec<Box<dyn FnOnce()>>,
}

/// A keyed, state-tagged value store.
#[derive(Clone)]
pub struct Store {
    inner: Rc<RefCell<StoreInner>>,
    changes: Observable<ChangeEvent>,
    mutations: Observable<Rc<MutateEnvelope>>,
    bus: Rc<Bus>,
}

impl Store {
    fn new(bus: Rc<Bus>, name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StoreInner {
                name: name.into(),
                map: OrderedMap::default(),
                ready: false,
                ever_populated: false,
                closed: false,
                ready_waiters: Vec::new(),
            })),
            changes: Observable::new(),
            mutations: Observable::new(),
            bus,
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.borrow().ready
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    fn dedicated_channel_name(&self) -> ChannelName {
        ChannelName::new(format!("store:{}", self.inner.borrow().name))
    }

    fn announce(&self, event: &ChangeEvent) {
        let channel = self.dedicated_channel_name();
        let payload = serde_json::json!({
            "key": event.key,
            "value": event.value,
            "state": event.state,
        });
        self.bus.send(
            &channel,
            Message::control(crate::Identifier::generate(), payload, "store"),
        );
    }

    /// Insert or update `key`. Emits exactly one change event. A no-op,
    /// logged at warn, if the store has already been destroyed.
    #[cfg_attr(feature = "instrumentation", instrument(skip(self, value)))]
    pub fn put(&self, key: impl Into<String>, value: Payload, state: impl Into<StateTag>) {
        if self.is_closed() {
            tracing::warn!(store = %self.name(), "put on closed store ignored");
            return;
        }
        let key = key.into();
        let state = state.into();
        self.inner.borrow_mut().map.insert(key.clone(), value.clone());
        let event = ChangeEvent { key, value, state };
        self.announce(&event);
        self.changes.emit(&event);
    }

    /// Remove `key` if present. The removed value is deleted from the map
    /// before the change event carrying it is observed by subscribers.
    /// Returns `false`, with no change event, if the key didn't exist.
    pub fn remove(&self, key: &str, state: impl Into<StateTag>) -> bool {
        let removed = self.inner.borrow_mut().map.remove(key);
        match removed {
            Some(value) => {
                let event = ChangeEvent {
                    key: key.to_owned(),
                    value,
                    state: state.into(),
                };
                self.announce(&event);
                self.changes.emit(&event);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Payload> {
        self.inner.borrow().map.get(key)
    }

    /// Insertion-order snapshot of every value currently in the store.
    #[must_use]
    pub fn all_values(&self) -> Vec<Payload> {
        self.inner.borrow().map.ordered_values()
    }

    /// Defensive copy: mutating the returned map never affects the store
    /// or any later call to this method.
    #[must_use]
    pub fn all_values_as_map(&self) -> HashMap<String, Payload> {
        self.inner.borrow().map.as_map()
    }

    /// Bulk-load `entries`. Succeeds (returns `true`) only if this store has
    /// never been populated or initialized before; a later call, or a call
    /// after [`Store::initialize`], returns `false` and changes nothing.
    pub fn populate(&self, entries: Vec<(String, Payload)>) -> Result<(), BusError> {
        let mut inner = self.inner.borrow_mut();
        if inner.ever_populated {
            return Err(BusError::PopulateRejected(inner.name.clone()));
        }
        for (k, v) in entries {
            inner.map.insert(k, v);
        }
        inner.ever_populated = true;
        inner.ready = true;
        let waiters: Vec<Box<dyn FnOnce()>> = std::mem::take(&mut inner.ready_waiters);
        drop(inner);
        for waiter in waiters {
            waiter();
        }
        Ok(())
    }

    /// Mark ready, firing every `when_ready` waiter in registration order.
    /// A no-op (not an error) if already ready.
    pub fn initialize(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.ready {
            return;
        }
        inner.ready = true;
        inner.ever_populated = true;
        let waiters: Vec<Box<dyn FnOnce()>> = std::mem::take(&mut inner.ready_waiters);
        drop(inner);
        for waiter in waiters {
            waiter();
        }
    }

    /// Register a callback to run once this store becomes ready. If it's
    /// already ready, the callback runs synchronously and immediately.
    pub fn when_ready<F: FnOnce() + 'static>(&self, callback: F) {
        let mut inner = self.inner.borrow_mut();
        if inner.ready {
            drop(inner);
            callback();
        } else {
            inner.ready_waiters.push(Box::new(callback));
        }
    }

    /// Clear every value. Retains `ready` and subscribers; does not emit
    /// change events and does not re-arm `populate`.
    pub fn reset(&self) {
        self.inner.borrow_mut().map.clear();
    }

    fn close(&self) {
        self.inner.borrow_mut().closed = true;
    }

    /// Subscribe to changes for one key, optionally filtered to a set of
    /// states (empty = all states).
    pub fn on_change<F>(&self, key: impl Into<String>, states: &[StateTag], mut handler: F) -> SubscriptionId
    where
        F: FnMut(&ChangeEvent) + 'static,
    {
        let key = key.into();
        let states: Vec<StateTag> = states.to_vec();
        self.changes.subscribe(move |event| {
            if event.key != key {
                return;
            }
            if !states.is_empty() && !states.contains(&event.state) {
                return;
            }
            handler(event);
        })
    }

    /// Subscribe across all keys, filtered by a discriminator over the
    /// value (selects a "variant" when values are heterogeneous) and
    /// optionally a set of states (empty = all states).
    pub fn on_all_changes<D, F>(&self, discriminator: D, states: &[StateTag], mut handler: F) -> SubscriptionId
    where
        D: Fn(&Payload) -> bool + 'static,
        F: FnMut(&ChangeEvent) + 'static,
    {
        let states: Vec<StateTag> = states.to_vec();
        self.changes.subscribe(move |event| {
            if !discriminator(&event.value) {
                return;
            }
            if !states.is_empty() && !states.contains(&event.state) {
                return;
            }
            handler(event);
        })
    }

    /// Subscribe a mutator. `mutation_types`, if non-empty, filters which
    /// mutation requests this mutator receives.
    pub fn on_mutation_request<F>(&self, mutation_types: &[MutationTag], mut handler: F) -> SubscriptionId
    where
        F: FnMut(&Rc<MutateEnvelope>) + 'static,
    {
        let mutation_types: Vec<MutationTag> = mutation_types.to_vec();
        self.mutations.subscribe(move |envelope: &Rc<MutateEnvelope>| {
            if !mutation_types.is_empty() && !mutation_types.contains(&envelope.mutation_type) {
                return;
            }
            handler(envelope);
        })
    }

    /// Remove a change-stream subscription installed via [`Store::on_change`]
    /// or [`Store::on_all_changes`]. Idempotent.
    pub fn unsubscribe_change(&self, id: SubscriptionId) -> bool {
        self.changes.unsubscribe(id)
    }

    /// Remove a mutation subscription installed via
    /// [`Store::on_mutation_request`]. Idempotent.
    pub fn unsubscribe_mutation(&self, id: SubscriptionId) -> bool {
        self.mutations.unsubscribe(id)
    }

    /// Post a mutation request. If nobody is subscribed via
    /// [`Store::on_mutation_request`] this logs and drops the request
    /// rather than calling `on_error`, matching `§4.F`'s failure semantics
    /// for missing handlers.
    #[cfg_attr(feature = "instrumentation", instrument(skip(self, value, on_success, on_error)))]
    pub fn mutate(
        &self,
        value: Payload,
        mutation_type: impl Into<MutationTag>,
        on_success: Option<Box<dyn FnOnce(Payload)>>,
        on_error: Option<Box<dyn FnOnce(Payload)>>,
    ) {
        let channel = self.dedicated_channel_name();
        if self.mutations.subscriber_count() == 0 {
            let reason = BusError::MissingSubscriberHandler(self.name()).to_string();
            tracing::error!(store = %self.name(), "mutation posted with no subscriber handler");
            self.bus.report_dropped(&channel, reason);
            return;
        }
        let envelope = Rc::new(MutateEnvelope {
            value,
            mutation_type: mutation_type.into(),
            replied: Rc::new(Cell::new(false)),
            on_success: Rc::new(RefCell::new(on_success)),
            on_error: Rc::new(RefCell::new(on_error)),
            bus: Rc::clone(&self.bus),
            channel,
        });
        self.mutations.emit(&envelope);
    }
}

/// Owns every store in a bus instance.
pub struct StoreManager {
    bus: Rc<Bus>,
    stores: RefCell<HashMap<String, Store>>,
}

impl StoreManager {
    #[must_use]
    pub fn new(bus: Rc<Bus>) -> Self {
        Self {
            bus,
            stores: RefCell::new(HashMap::new()),
        }
    }

    /// Create a store, or return the existing one if `name` is already
    /// registered.
    pub fn create_store(&self, name: impl Into<String>) -> Store {
        let name = name.into();
        let mut stores = self.stores.borrow_mut();
        stores
            .entry(name.clone())
            .or_insert_with(|| Store::new(Rc::clone(&self.bus), name))
            .clone()
    }

    #[must_use]
    pub fn get_store(&self, name: &str) -> Option<Store> {
        self.stores.borrow().get(name).cloned()
    }

    /// Destroy a store: close it and remove it from the manager.
    pub fn destroy_store(&self, name: &str) -> bool {
        let removed = self.stores.borrow_mut().remove(name);
        match removed {
            Some(store) => {
                store.close();
                true
            }
            None => false,
        }
    }

    /// Reset every registered store, keeping registrations.
    pub fn wipe_all_stores(&self) {
        for store in self.stores.borrow().values() {
            store.reset();
        }
    }

    #[must_use]
    pub fn get_all_stores(&self) -> Vec<Store> {
        self.stores.borrow().values().cloned().collect()
    }

    /// Resolve once every named store has become ready, creating any that
    /// don't yet exist. Resolves immediately, with an empty list, if
    /// `names` is empty.
    pub async fn ready_join(&self, names: &[impl AsRef<str>]) -> Vec<Store> {
        let stores: Vec<Store> = names.iter().map(|n| self.create_store(n.as_ref())).collect();
        if stores.is_empty() {
            return stores;
        }

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Rc::new(RefCell::new(Some(tx)));
        let remaining = Rc::new(Cell::new(stores.len()));

        for store in &stores {
            let remaining = Rc::clone(&remaining);
            let tx = Rc::clone(&tx);
            store.when_ready(move || {
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    if let Some(tx) = tx.borrow_mut().take() {
                        let _ = tx.send(());
                    }
                }
            });
        }

        let _ = rx.await;
        stores
    }
}
