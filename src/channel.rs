//! The channel registry: owns channels, creates them on demand, destroys
//! them, and projects a channel's stream by [`MessageKind`].
//!
//! A [`Channel`] is a thin wrapper around an [`Observable`] of
//! [`ChannelEvent`]. The registry is the only thing that creates or removes
//! channels; everything above it (the kernel, the store subsystem, the
//! proxy) only ever holds a [`Channel`] handle, which is cheaply `Clone`.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;

#[cfg(feature = "instrumentation")]
use tracing::instrument;

use crate::message::{ChannelName, Message, MessageKind, Payload};
use crate::observable::{Observable, SubscriptionId};

/// What a channel subscriber actually receives: either a live message, or a
/// terminal marker delivered once to subscribers that arrive after the
/// channel has already been destroyed.
///
/// Subscribers registered before destruction are simply never invoked again
/// — they are not retroactively notified, matching `§3`'s "once closed, no
/// new messages are emitted."
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(Message<Payload>),
    Closed,
}

impl ChannelEvent {
    #[must_use]
    pub const fn as_message(&self) -> Option<&Message<Payload>> {
        match self {
            Self::Message(m) => Some(m),
            Self::Closed => None,
        }
    }
}

struct ChannelInner {
    name: ChannelName,
    stream: Observable<ChannelEvent>,
    closed: bool,
}

/// A handle to one channel. Cloning shares the same underlying stream; it
/// does not create a new channel.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<ChannelInner>>,
}

impl Channel {
    fn new(name: ChannelName) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChannelInner {
                name,
                stream: Observable::new(),
                closed: false,
            })),
        }
    }

    #[must_use]
    pub fn name(&self) -> ChannelName {
        self.inner.borrow().name.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Subscribe to every event on this channel (messages of all kinds,
    /// plus the terminal `Closed` event if delivered late).
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&ChannelEvent) + 'static,
    {
        let inner = self.inner.borrow();
        if inner.closed {
            let mut handler = handler;
            handler(&ChannelEvent::Closed);
            // Not retained: return an id that unsubscribe will simply not find.
            return SubscriptionId::detached();
        }
        inner.stream.subscribe(handler)
    }

    /// Subscribe only to messages of a given [`MessageKind`].
    pub fn subscribe_kind<F>(&self, kind: MessageKind, mut handler: F) -> SubscriptionId
    where
        F: FnMut(&Message<Payload>) + 'static,
    {
        self.subscribe(move |event| {
            if let ChannelEvent::Message(msg) = event {
                if msg.kind == kind {
                    handler(msg);
                }
            }
        })
    }

    pub fn subscribe_requests<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&Message<Payload>) + 'static,
    {
        self.subscribe_kind(MessageKind::Request, handler)
    }

    pub fn subscribe_responses<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&Message<Payload>) + 'static,
    {
        self.subscribe_kind(MessageKind::Response, handler)
    }

    pub fn subscribe_errors<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&Message<Payload>) + 'static,
    {
        self.subscribe_kind(MessageKind::Error, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.borrow().stream.unsubscribe(id)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().stream.subscriber_count()
    }

    /// Publish a message on this channel. A no-op, logged at warn, if the
    /// channel has already been destroyed.
    pub fn emit(&self, message: Message<Payload>) {
        let inner = self.inner.borrow();
        if inner.closed {
            tracing::warn!(channel = %inner.name, "send on closed channel ignored");
            return;
        }
        tracing::debug!(channel = %inner.name, kind = ?message.kind, "delivering message");
        inner.stream.emit(&ChannelEvent::Message(message));
    }

    fn close(&self) {
        let inner = self.inner.borrow();
        inner.stream.emit(&ChannelEvent::Closed);
        inner.stream.close();
        drop(inner);
        self.inner.borrow_mut().closed = true;
    }
}

impl SubscriptionId {
    /// A sentinel id guaranteed not to match any real subscription, used
    /// when a "subscribe" call must hand back *something* but the
    /// subscriber was never actually registered (e.g. it arrived after the
    /// channel closed).
    pub(crate) fn detached() -> Self {
        // SubscriptionId has no public constructor; we go through the
        // registry's own id space by subscribing-then-unsubscribing a
        // throwaway observable, which is wasteful only at the margin (a
        // channel that's already closed, an infrequent path).
        let throwaway: Observable<()> = Observable::new();
        let id = throwaway.subscribe(|_| {});
        throwaway.unsubscribe(id);
        id
    }
}

/// Owns every channel in a bus instance. Channels are created lazily the
/// first time they're referenced and destroyed explicitly.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RefCell<HashMap<ChannelName, Channel>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (creating if absent) the channel named `name`.
    #[cfg_attr(feature = "instrumentation", instrument(skip(self)))]
    pub fn get_channel(&self, name: &ChannelName) -> Channel {
        self.get_or_create(name).0
    }

    /// Get (creating if absent) the channel named `name`, reporting whether
    /// this call is the one that created it — the only thing a caller needs
    /// to decide whether to fire a one-shot `ChannelCreated` event.
    pub(crate) fn get_or_create(&self, name: &ChannelName) -> (Channel, bool) {
        let mut channels = self.channels.borrow_mut();
        match channels.entry(name.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let channel = Channel::new(name.clone());
                entry.insert(channel.clone());
                (channel, true)
            }
        }
    }

    /// Look up a channel without creating it.
    #[must_use]
    pub fn peek_channel(&self, name: &ChannelName) -> Option<Channel> {
        self.channels.borrow().get(name).cloned()
    }

    /// Destroy a channel: mark it closed and terminate its stream. The
    /// channel stays in the registry as a closed tombstone rather than
    /// being removed — per `§3`'s "once closed, no new messages are
    /// emitted" invariant, a later `get_channel` for the same name must
    /// keep returning the same closed channel, not silently hand back a
    /// fresh, reopened one. No-op (returns `false`) if the channel doesn't
    /// exist or was already destroyed.
    #[cfg_attr(feature = "instrumentation", instrument(skip(self)))]
    pub fn destroy(&self, name: &ChannelName) -> bool {
        let existing = self.channels.borrow().get(name).cloned();
        match existing {
            Some(channel) if !channel.is_closed() => {
                channel.close();
                tracing::info!(channel = %name, "channel destroyed");
                true
            }
            _ => false,
        }
    }

    /// Destroy every channel currently registered.
    pub fn destroy_all(&self) {
        let names: Vec<ChannelName> = self.channels.borrow().keys().cloned().collect();
        for name in names {
            self.destroy(&name);
        }
    }

    #[must_use]
    pub fn channel_names(&self) -> Vec<ChannelName> {
        self.channels.borrow().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Identifier;
    use std::cell::RefCell as StdRefCell;

    fn payload(v: &str) -> Payload {
        Payload::String(v.to_owned())
    }

    #[test]
    fn get_channel_creates_lazily_and_returns_the_same_instance_on_repeat_lookups() {
        let registry = ChannelRegistry::new();
        let name = ChannelName::new("chat");
        assert!(registry.peek_channel(&name).is_none());

        let ch = registry.get_channel(&name);
        let ch2 = registry.get_channel(&name);
        assert!(Rc::ptr_eq(&ch.inner, &ch2.inner));
    }

    #[test]
    fn get_or_create_reports_creation_only_on_the_first_call() {
        let registry = ChannelRegistry::new();
        let name = ChannelName::new("chat");

        let (_, first_created) = registry.get_or_create(&name);
        let (_, second_created) = registry.get_or_create(&name);

        assert!(first_created);
        assert!(!second_created);
    }

    #[test]
    fn destroy_closes_channel_and_keeps_it_tombstoned_in_registry() {
        let registry = ChannelRegistry::new();
        let name = ChannelName::new("chat");
        let ch = registry.get_channel(&name);
        assert!(registry.destroy(&name));
        assert!(ch.is_closed());

        // The name stays resolvable, but to the same closed channel — not a
        // freshly reopened one — so a later get_channel can't reanimate
        // traffic on a destroyed name.
        let reacquired = registry.peek_channel(&name).expect("tombstone retained");
        assert!(reacquired.is_closed());
        assert_eq!(registry.get_channel(&name).subscriber_count(), ch.subscriber_count());
    }

    #[test]
    fn destroy_unknown_channel_is_noop() {
        let registry = ChannelRegistry::new();
        assert!(!registry.destroy(&ChannelName::new("ghost")));
    }

    #[test]
    fn destroying_an_already_destroyed_channel_is_noop() {
        let registry = ChannelRegistry::new();
        let name = ChannelName::new("chat");
        registry.get_channel(&name);
        assert!(registry.destroy(&name));
        assert!(!registry.destroy(&name));
    }

    #[test]
    fn subscribers_receive_messages_in_order() {
        let registry = ChannelRegistry::new();
        let ch = registry.get_channel(&ChannelName::new("chat"));
        let received = Rc::new(StdRefCell::new(Vec::new()));

        let r1 = Rc::clone(&received);
        ch.subscribe(move |event| {
            if let Some(msg) = event.as_message() {
                r1.borrow_mut().push(msg.sender.clone());
            }
        });

        ch.emit(Message::request(Identifier::generate(), payload("hi"), "alice"));
        assert_eq!(*received.borrow(), vec!["alice".to_owned()]);
    }

    #[test]
    fn subscribe_kind_filters_to_matching_messages() {
        let registry = ChannelRegistry::new();
        let ch = registry.get_channel(&ChannelName::new("svc"));
        let responses = Rc::new(StdRefCell::new(0));

        let r = Rc::clone(&responses);
        ch.subscribe_responses(move |_| *r.borrow_mut() += 1);

        let id = Identifier::generate();
        ch.emit(Message::request(id.clone(), payload("req"), "a"));
        ch.emit(Message::response(id.clone(), payload("resp"), "b"));
        ch.emit(Message::error(id, payload("err"), "b"));

        assert_eq!(*responses.borrow(), 1);
    }

    #[test]
    fn late_subscriber_on_destroyed_channel_gets_terminal_event_only() {
        let registry = ChannelRegistry::new();
        let name = ChannelName::new("chat");
        let ch = registry.get_channel(&name);
        registry.destroy(&name);

        let got_closed = Rc::new(StdRefCell::new(false));
        let g = Rc::clone(&got_closed);
        ch.subscribe(move |event| {
            if matches!(event, ChannelEvent::Closed) {
                *g.borrow_mut() = true;
            }
        });
        assert!(*got_closed.borrow());
    }

    #[test]
    fn emit_on_closed_channel_is_noop() {
        let registry = ChannelRegistry::new();
        let name = ChannelName::new("chat");
        let ch = registry.get_channel(&name);
        registry.destroy(&name);
        // Should not panic and should not deliver anywhere.
        ch.emit(Message::request(Identifier::generate(), payload("x"), "a"));
    }

    #[test]
    fn destroy_all_closes_every_channel() {
        let registry = ChannelRegistry::new();
        let a = registry.get_channel(&ChannelName::new("a"));
        let b = registry.get_channel(&ChannelName::new("b"));
        registry.destroy_all();
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
