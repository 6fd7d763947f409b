//! The bus kernel: the public send/listen/request surface, request/response
//! correlation by identifier, and the monitor meta-stream.
//!
//! `Bus` owns a [`ChannelRegistry`] and a monitor [`Observable`]. It does
//! not maintain a pending-request table — once-style handlers install a
//! filter on the relevant channel and self-unsubscribe on first match, per
//! `§4.D`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[cfg(feature = "instrumentation")]
use tracing::instrument;

use crate::channel::{Channel, ChannelEvent, ChannelRegistry};
use crate::message::{ChannelName, Identifier, Message, MessageKind, MonitorEvent, Payload};
use crate::observable::{Observable, SubscriptionId};
use crate::BusError;

/// A listener installed by [`Bus::listen`]. Call [`Listener::handle`] to
/// register a `handle(success, failure)` pair against it.
pub struct Listener {
    channel: Channel,
    monitor: Observable<MonitorEvent>,
    monitoring_enabled: Rc<Cell<bool>>,
}

impl Listener {
    /// Subscribe `on_success` to Response-kind messages and `on_error` to
    /// Error-kind messages on this listener's channel. Long-lived: unlike
    /// [`Bus::request_once_with_id`], this subscription is not torn down
    /// after its first delivery.
    pub fn handle<S, E>(&self, mut on_success: S, mut on_error: E) -> SubscriptionId
    where
        S: FnMut(&Message<Payload>) + 'static,
        E: FnMut(&Message<Payload>) + 'static,
    {
        self.channel.subscribe(move |event| {
            if let ChannelEvent::Message(msg) = event {
                match msg.kind {
                    MessageKind::Response => on_success(msg),
                    MessageKind::Error => on_error(msg),
                    MessageKind::Request | MessageKind::Control => {}
                }
            }
        })
    }

    /// Tear down a subscription installed via [`Listener::handle`]. The
    /// counterpart to [`Bus::listen`]'s `SubscriberAdded`: removing the last
    /// thing this listener ever installed is reported as
    /// `MonitorEvent::SubscriberRemoved` on the channel it was listening to.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.channel.unsubscribe(id);
        if removed && self.monitoring_enabled.get() {
            self.monitor.emit(&MonitorEvent::SubscriberRemoved {
                channel: self.channel.name(),
            });
        }
        removed
    }
}

/// Read side of the monitor meta-stream.
///
/// `§3`'s "monitor events never themselves generate monitor events" is
/// formalised as code, not just convention: [`MonitorStream::publish`] is
/// `pub(in crate::kernel)`, so the only code in the whole crate able to push
/// an event onto this stream is [`Bus::emit_monitor`] itself. Every other
/// module — the store subsystem, the proxy controller — can only
/// `subscribe`/`unsubscribe`; they have no path back onto the stream.
pub struct MonitorStream {
    inner: Observable<MonitorEvent>,
}

impl MonitorStream {
    fn new() -> Self {
        Self { inner: Observable::new() }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&MonitorEvent) + 'static,
    {
        self.inner.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }

    pub(in crate::kernel) fn publish(&self, event: MonitorEvent) {
        self.inner.emit(&event);
    }
}

/// The bus kernel.
///
/// Not `Send`/`Sync` by design: the concurrency model (`§5`) is a single
/// cooperative task, and `Rc`/`RefCell` make that a compile-time guarantee
/// rather than a convention.
pub struct Bus {
    channels: ChannelRegistry,
    monitor: MonitorStream,
    monitoring_enabled: Rc<Cell<bool>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: ChannelRegistry::new(),
            monitor: MonitorStream::new(),
            monitoring_enabled: Rc::new(Cell::new(true)),
        }
    }

    /// Enable or disable monitor event construction. Disabling is a cheap
    /// toggle: while disabled, no `MonitorEvent` is built at all, not just
    /// suppressed after construction.
    pub fn set_monitoring_enabled(&self, enabled: bool) {
        self.monitoring_enabled.set(enabled);
    }

    #[must_use]
    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring_enabled.get()
    }

    /// The monitor meta-stream. Subscribing here never itself produces a
    /// monitor event — see `§3`'s no-recursion invariant and
    /// [`MonitorStream`]'s doc comment for how that's enforced.
    #[must_use]
    pub const fn monitor(&self) -> &MonitorStream {
        &self.monitor
    }

    fn emit_monitor(&self, event: MonitorEvent) {
        if self.monitoring_enabled.get() {
            self.monitor.publish(event);
        }
    }

    /// Report an internal invariant violation as a `Dropped` monitor event
    /// rather than throwing, per `§7` — the store subsystem and the proxy
    /// controller call this from their own drop sites; it still funnels
    /// through [`Bus::emit_monitor`] like every other monitor push.
    pub fn report_dropped(&self, channel: &ChannelName, reason: impl Into<String>) {
        self.emit_monitor(MonitorEvent::Dropped {
            channel: channel.clone(),
            reason: reason.into(),
        });
    }

    fn get_or_create_channel(&self, name: &ChannelName) -> Channel {
        let (channel, created) = self.channels.get_or_create(name);
        if created {
            self.emit_monitor(MonitorEvent::ChannelCreated {
                channel: name.clone(),
            });
        }
        channel
    }

    /// Raw access to a channel's stream, for callers that want to filter by
    /// kind themselves. Creates the channel if absent.
    #[must_use]
    pub fn get_channel(&self, name: &ChannelName) -> Channel {
        self.get_or_create_channel(name)
    }

    /// Publish `message` verbatim on `channel`.
    #[cfg_attr(feature = "instrumentation", instrument(skip(self, message)))]
    pub fn send(&self, channel: &ChannelName, message: Message<Payload>) {
        let kind = message.kind;
        let ch = self.get_or_create_channel(channel);
        if ch.is_closed() {
            self.report_dropped(
                channel,
                BusError::ClosedChannel(channel.to_string()).to_string(),
            );
            ch.emit(message);
            return;
        }
        if kind == MessageKind::Error {
            self.emit_monitor(MonitorEvent::ErrorSent {
                channel: channel.clone(),
                message: message.clone(),
            });
        } else {
            self.emit_monitor(MonitorEvent::MessageSent {
                channel: channel.clone(),
                kind,
                message: message.clone(),
            });
        }
        ch.emit(message);
    }

    /// Emit a Request-kind message with an explicit id, without generating
    /// one. Shared by [`Bus::send_request`] and
    /// [`Bus::request_once_with_id`].
    pub fn send_request_with_id(
        &self,
        channel: &ChannelName,
        payload: Payload,
        id: Identifier,
        sender: impl Into<String>,
    ) {
        self.send(channel, Message::request(id, payload, sender));
    }

    /// Emit a Request-kind message, generating an id if `id` is `None`.
    /// Returns the id used.
    pub fn send_request(
        &self,
        channel: &ChannelName,
        payload: Payload,
        id: Option<Identifier>,
        sender: impl Into<String>,
    ) -> Identifier {
        let id = id.unwrap_or_else(Identifier::generate);
        self.send_request_with_id(channel, payload, id.clone(), sender);
        id
    }

    pub fn send_response_with_id(
        &self,
        channel: &ChannelName,
        payload: Payload,
        id: Identifier,
        sender: impl Into<String>,
    ) {
        self.send(channel, Message::response(id, payload, sender));
    }

    pub fn send_error_with_id(
        &self,
        channel: &ChannelName,
        payload: Payload,
        id: Identifier,
        sender: impl Into<String>,
    ) {
        self.send(channel, Message::error(id, payload, sender));
    }

    /// Install a long-lived Response/Error listener on `channel`. `sender`
    /// identifies the listener for diagnostics only; it is not used for
    /// filtering.
    #[cfg_attr(feature = "instrumentation", instrument(skip(self)))]
    pub fn listen(&self, channel: &ChannelName, sender: &str) -> Listener {
        let ch = self.get_or_create_channel(channel);
        self.emit_monitor(MonitorEvent::SubscriberAdded {
            channel: channel.clone(),
        });
        tracing::debug!(channel = %channel, %sender, "listener installed");
        Listener {
            channel: ch,
            monitor: self.monitor.inner.clone(),
            monitoring_enabled: Rc::clone(&self.monitoring_enabled),
        }
    }

    /// Long-lived, unfiltered Request stream on `channel` — the caller is
    /// responsible for its own teardown.
    #[must_use]
    pub fn request_stream(&self, channel: &ChannelName) -> Channel {
        self.get_or_create_channel(channel)
    }

    /// Long-lived, unfiltered Response/Error stream on `channel` — the
    /// caller is responsible for its own teardown.
    #[must_use]
    pub fn response_stream(&self, channel: &ChannelName) -> Channel {
        self.get_or_create_channel(channel)
    }

    /// Send a request with the given `id` on `channel`, then resolve with
    /// the matching Response or Error payload (or a synthetic closed-
    /// channel error if the reply channel is already closed). The
    /// subscription is torn down automatically after the first match,
    /// regardless of which way it resolved.
    ///
    /// `return_channel`, when given, is where the reply is expected instead
    /// of `channel` — useful when a service replies on a different channel
    /// than the one the request went out on.
    #[cfg_attr(feature = "instrumentation", instrument(skip(self, payload, sender)))]
    pub async fn request_once_with_id(
        &self,
        id: Identifier,
        channel: ChannelName,
        payload: Payload,
        return_channel: Option<ChannelName>,
        sender: impl Into<String>,
    ) -> Result<Payload, Payload> {
        let reply_channel_name = return_channel.unwrap_or_else(|| channel.clone());

        if let Some(existing) = self.channels.peek_channel(&reply_channel_name) {
            if existing.is_closed() {
                tracing::warn!(channel = %reply_channel_name, "request on closed channel resolved synthetically");
                self.report_dropped(
                    &reply_channel_name,
                    BusError::ClosedChannel(reply_channel_name.to_string()).to_string(),
                );
                return Err(BusError::synthetic_closed_channel(reply_channel_name.as_str()).to_payload());
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel::<Result<Payload, Payload>>();
        let tx = Rc::new(RefCell::new(Some(tx)));
        let expect_id = id.clone();

        let reply_channel = self.get_or_create_channel(&reply_channel_name);
        let sub_id_slot: Rc<RefCell<Option<SubscriptionId>>> = Rc::new(RefCell::new(None));

        let tx_for_handler = Rc::clone(&tx);
        let sub_id_for_handler = Rc::clone(&sub_id_slot);
        let channel_for_unsub = reply_channel.clone();
        let subscription = reply_channel.subscribe(move |event| {
            let ChannelEvent::Message(msg) = event else {
                return;
            };
            if msg.id != expect_id {
                return;
            }
            let resolved = match msg.kind {
                MessageKind::Response => Some(Ok(msg.payload.clone())),
                MessageKind::Error => Some(Err(msg.payload.clone())),
                MessageKind::Request | MessageKind::Control => None,
            };
            let Some(result) = resolved else {
                return;
            };
            if let Some(sender) = tx_for_handler.borrow_mut().take() {
                let _ = sender.send(result);
            }
            if let Some(sid) = sub_id_for_handler.borrow_mut().take() {
                channel_for_unsub.unsubscribe(sid);
            }
        });
        *sub_id_slot.borrow_mut() = Some(subscription);

        self.send_request_with_id(&channel, payload, id, sender);

        rx.await.unwrap_or_else(|_| {
            self.report_dropped(
                &reply_channel_name,
                BusError::ClosedChannel(reply_channel_name.to_string()).to_string(),
            );
            Err(BusError::synthetic_closed_channel(reply_channel_name.as_str()).to_payload())
        })
    }

    /// Destroy a single channel. Emits `ChannelClosed` then
    /// `ChannelDestroyed` before the underlying stream is torn down — this
    /// crate has no separate "close without destroy" operation, so the two
    /// monitor events describe the same transition.
    #[cfg_attr(feature = "instrumentation", instrument(skip(self)))]
    pub fn close_channel(&self, name: &ChannelName) -> bool {
        let will_destroy = self
            .channels
            .peek_channel(name)
            .is_some_and(|ch| !ch.is_closed());
        if will_destroy {
            self.emit_monitor(MonitorEvent::ChannelClosed {
                channel: name.clone(),
            });
            self.emit_monitor(MonitorEvent::ChannelDestroyed {
                channel: name.clone(),
            });
        }
        self.channels.destroy(name)
    }

    /// Destroy every channel currently registered.
    pub fn destroy_all_channels(&self) {
        for name in self.channels.channel_names() {
            self.close_channel(&name);
        }
    }
}

/// A builder that batches a request and its expected reply into one object,
/// a thin convenience wrapper over [`Bus::request_once_with_id`] — it
/// introduces no wire behaviour of its own.
pub struct Transaction {
    channel: ChannelName,
    payload: Payload,
    id: Option<Identifier>,
    return_channel: Option<ChannelName>,
    sender: String,
}

impl Transaction {
    #[must_use]
    pub fn new(channel: ChannelName, payload: Payload, sender: impl Into<String>) -> Self {
        Self {
            channel,
            payload,
            id: None,
            return_channel: None,
            sender: sender.into(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: Identifier) -> Self {
        self.id = Some(id);
        self
    }

    /// Expect the reply on `channel` instead of the channel the request
    /// went out on.
    #[must_use]
    pub fn returning_on(mut self, channel: ChannelName) -> Self {
        self.return_channel = Some(channel);
        self
    }

    /// Send the request and await its matching Response or Error.
    pub async fn send(self, bus: &Bus) -> Result<Payload, Payload> {
        let id = self.id.unwrap_or_else(Identifier::generate);
        bus.request_once_with_id(id, self.channel, self.payload, self.return_channel, self.sender)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn send_delivers_to_all_current_subscribers_in_order() {
        let bus = Bus::new();
        let channel = ChannelName::new("chat");
        let order = Rc::new(StdRefCell::new(Vec::new()));

        let o1 = Rc::clone(&order);
        bus.get_channel(&channel)
            .subscribe(move |_| o1.borrow_mut().push("a"));
        let o2 = Rc::clone(&order);
        bus.get_channel(&channel)
            .subscribe(move |_| o2.borrow_mut().push("b"));

        bus.send(
            &channel,
            Message::request(Identifier::generate(), serde_json::json!("hi"), "alice"),
        );

        assert_eq!(*order.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn send_request_generates_id_when_none_given() {
        let bus = Bus::new();
        let channel = ChannelName::new("svc");
        let id = bus.send_request(&channel, serde_json::json!(1), None, "alice");
        assert!(!id.as_str().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn request_once_with_id_resolves_on_matching_response() {
        let bus = Rc::new(Bus::new());
        let channel = ChannelName::new("svc");
        let id = Identifier::generate();

        let bus_for_responder = Rc::clone(&bus);
        let channel_for_responder = channel.clone();
        let id_for_responder = id.clone();
        bus.get_channel(&channel).subscribe_requests(move |msg| {
            bus_for_responder.send_response_with_id(
                &channel_for_responder,
                msg.payload.clone(),
                id_for_responder.clone(),
                "service",
            );
        });

        let result = bus
            .request_once_with_id(id, channel, serde_json::json!("ping"), None, "client")
            .await;

        assert_eq!(result, Ok(serde_json::json!("ping")));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn request_once_with_id_detaches_after_first_match() {
        let bus = Rc::new(Bus::new());
        let channel = ChannelName::new("svc");
        let id = Identifier::generate();

        bus.get_channel(&channel).subscribe_requests({
            let bus = Rc::clone(&bus);
            let channel = channel.clone();
            let id = id.clone();
            move |msg| {
                bus.send_response_with_id(&channel, msg.payload.clone(), id.clone(), "service");
            }
        });

        let _ = bus
            .request_once_with_id(id.clone(), channel.clone(), serde_json::json!(1), None, "client")
            .await;

        let remaining = bus.get_channel(&channel).subscriber_count();
        // Only the responder's own subscription should remain; the
        // request-once listener detached itself.
        assert_eq!(remaining, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn request_on_closed_channel_resolves_synthetically() {
        let bus = Bus::new();
        let channel = ChannelName::new("svc");
        bus.get_channel(&channel);
        bus.close_channel(&channel);

        let result = bus
            .request_once_with_id(
                Identifier::generate(),
                channel,
                serde_json::json!(1),
                None,
                "client",
            )
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn close_channel_emits_monitor_event_before_effect() {
        let bus = Bus::new();
        let channel = ChannelName::new("chat");
        bus.get_channel(&channel);

        let events = Rc::new(StdRefCell::new(Vec::new()));
        let e = Rc::clone(&events);
        bus.monitor().subscribe(move |event: &MonitorEvent| {
            e.borrow_mut().push(format!("{event:?}"));
        });

        bus.close_channel(&channel);
        assert!(events.borrow().iter().any(|e| e.contains("ChannelClosed")));
        assert!(events
            .borrow()
            .iter()
            .any(|e| e.contains("ChannelDestroyed")));
    }

    #[test]
    fn listener_unsubscribe_emits_subscriber_removed() {
        let bus = Bus::new();
        let channel = ChannelName::new("chat");

        let events = Rc::new(StdRefCell::new(Vec::new()));
        let e = Rc::clone(&events);
        bus.monitor().subscribe(move |event: &MonitorEvent| {
            e.borrow_mut().push(format!("{event:?}"));
        });

        let listener = bus.listen(&channel, "alice");
        let sub = listener.handle(|_| {}, |_| {});
        assert!(listener.unsubscribe(sub));

        assert!(events.borrow().iter().any(|e| e.contains("SubscriberAdded")));
        assert!(events
            .borrow()
            .iter()
            .any(|e| e.contains("SubscriberRemoved")));
    }

    #[test]
    fn listener_unsubscribing_an_already_removed_id_does_not_re_emit() {
        let bus = Bus::new();
        let channel = ChannelName::new("chat");
        let listener = bus.listen(&channel, "alice");
        let sub = listener.handle(|_| {}, |_| {});

        assert!(listener.unsubscribe(sub));

        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        bus.monitor().subscribe(move |event: &MonitorEvent| {
            if matches!(event, MonitorEvent::SubscriberRemoved { .. }) {
                c.set(c.get() + 1);
            }
        });
        assert!(!listener.unsubscribe(sub));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn send_on_closed_channel_is_dropped_and_reported_on_the_monitor_stream() {
        let bus = Bus::new();
        let channel = ChannelName::new("chat");
        bus.get_channel(&channel);
        bus.close_channel(&channel);

        let dropped = Rc::new(StdRefCell::new(Vec::new()));
        let d = Rc::clone(&dropped);
        bus.monitor().subscribe(move |event: &MonitorEvent| {
            if let MonitorEvent::Dropped { reason, .. } = event {
                d.borrow_mut().push(reason.clone());
            }
        });

        bus.send(
            &channel,
            Message::request(Identifier::generate(), serde_json::json!("hi"), "alice"),
        );

        assert_eq!(dropped.borrow().len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transaction_batches_request_and_reply() {
        let bus = Rc::new(Bus::new());
        let channel = ChannelName::new("svc");

        bus.get_channel(&channel).subscribe_requests({
            let bus = Rc::clone(&bus);
            let channel = channel.clone();
            move |msg| {
                bus.send_response_with_id(&channel, msg.payload.clone(), msg.id.clone(), "service");
            }
        });

        let result = Transaction::new(channel, serde_json::json!("ping"), "client")
            .send(&bus)
            .await;

        assert_eq!(result, Ok(serde_json::json!("ping")));
    }

    #[test]
    fn disabling_monitoring_suppresses_events() {
        let bus = Bus::new();
        bus.set_monitoring_enabled(false);
        let channel = ChannelName::new("chat");

        let seen = Rc::new(Cell::new(false));
        let s = Rc::clone(&seen);
        bus.monitor().subscribe(move |_: &MonitorEvent| s.set(true));

        bus.get_channel(&channel);
        assert!(!seen.get());
    }
}
