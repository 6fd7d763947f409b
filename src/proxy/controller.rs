//! The proxy controller: the parent/child frame relay, its state machine,
//! the inbound filter pipeline and the outbound monitor-driven relay
//! (`§4.G`).
//!
//! A [`ProxyController`] owns no bus state of its own — it is a subscriber
//! of the kernel's monitor stream plus an inbound adapter over a
//! [`FrameHost`]. All allowlist/topology configuration lives in
//! [`ProxySettings`], updatable at runtime through the same
//! [`crate::settings::SettingsHandle`] split the kernel itself uses.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

#[cfg(feature = "instrumentation")]
use tracing::instrument;

use crate::kernel::Bus;
use crate::message::{ChannelName, Identifier, Message, MessageKind, MonitorEvent, Payload};
use crate::observable::SubscriptionId;
use crate::proxy::frame_host::{FrameHost, InboundEvent, InboundSubscription};
use crate::proxy::origin::OriginAllowlist;
use crate::proxy::wire::{ControlCommand, ControlPayload, WireMessage};
use crate::settings::{SettingsHandle, SettingsNotifier};
use crate::BusError;

/// Which side of the relay a controller plays. `Hybrid` is declared per
/// `§4.G` but left unimplemented per `§9`'s open question — constructing a
/// controller with it fails at [`ProxyController::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Parent,
    Child,
    Hybrid,
}

impl ProxyType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "Parent",
            Self::Child => "Child",
            Self::Hybrid => "Hybrid",
        }
    }
}

/// The proxy controller's configuration surface, per `§4.G`.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub accepted_origins: OriginAllowlist,
    pub target_all_frames: bool,
    pub target_specific_frames: Vec<String>,
    /// Channels authorised for relay in either direction. The reserved
    /// control channel is always authorised regardless of this set.
    pub protected_channels: HashSet<ChannelName>,
    pub parent_origin: String,
    pub proxy_type: ProxyType,
}

impl ProxySettings {
    #[must_use]
    pub fn is_channel_authorised(&self, channel: &ChannelName) -> bool {
        channel.as_str() == ChannelName::PROXY_CONTROL || self.protected_channels.contains(channel)
    }
}

/// Per-known-child-bus state, mutated only by well-formed control messages
/// on `__proxycontrol__` (`§3`'s `ProxyState`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildBusState {
    pub proxy_type: String,
    pub active: bool,
}

/// The controller's lifecycle state (`§4.G`'s state table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Idle,
    ListeningParent,
    ListeningChild,
}

struct Subscriptions {
    inbound: Option<InboundSubscription>,
    monitor: Option<SubscriptionId>,
}

/// A parent or child frame relay over a [`FrameHost`].
pub struct ProxyController {
    name: String,
    bus_id: String,
    bus: Rc<Bus>,
    frame_host: Rc<dyn FrameHost>,
    settings: SettingsNotifier<ProxySettings>,
    settings_handle: SettingsHandle<ProxySettings>,
    state: std::cell::Cell<LifecycleState>,
    subscriptions: std::cell::RefCell<Subscriptions>,
    known_children: Rc<std::cell::RefCell<HashMap<String, ChildBusState>>>,
}

impl ProxyController {
    /// Build a controller. Fails with [`BusError::InvalidConfiguration`]
    /// if `settings.proxy_type` is [`ProxyType::Hybrid`] — that role is
    /// declared in `§4.G` but explicitly unimplemented (`§9`).
    pub fn new(
        name: impl Into<String>,
        bus: Rc<Bus>,
        frame_host: Rc<dyn FrameHost>,
        settings: ProxySettings,
    ) -> Result<Self, BusError> {
        if settings.proxy_type == ProxyType::Hybrid {
            return Err(BusError::InvalidConfiguration(
                "Hybrid proxy role is declared but unimplemented".to_owned(),
            ));
        }
        let settings_handle = SettingsHandle::new(settings);
        let notifier = settings_handle.notifier();
        Ok(Self {
            name: name.into(),
            bus_id: Identifier::generate().to_string(),
            bus,
            frame_host,
            settings: notifier,
            settings_handle,
            state: std::cell::Cell::new(LifecycleState::Idle),
            subscriptions: std::cell::RefCell::new(Subscriptions {
                inbound: None,
                monitor: None,
            }),
            known_children: Rc::new(std::cell::RefCell::new(HashMap::new())),
        })
    }

    #[must_use]
    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    /// The "`proxy-<busId>`" tag this controller stamps on outbound
    /// messages and checks inbound messages against for loop prevention.
    fn own_wire_tag(&self) -> String {
        format!("proxy-{}", self.bus_id)
    }

    /// Push new configuration to a running or idle controller. Takes
    /// effect immediately for the next inbound/outbound message; it does
    /// not require `listen()`/`stop_listening()` to be called again.
    #[must_use]
    pub fn settings_updater(&self) -> &crate::settings::SettingsUpdater<ProxySettings> {
        self.settings_handle.updater()
    }

    #[must_use]
    pub fn known_children(&self) -> HashMap<String, ChildBusState> {
        self.known_children.borrow().clone()
    }

    /// Enter the listening state for this controller's configured role.
    /// A child controller additionally announces itself to the parent via
    /// `RegisterEventBus`. Re-entrant: calling `listen()` while already
    /// listening is a no-op.
    #[cfg_attr(feature = "instrumentation", instrument(skip(self)))]
    pub fn listen(self: &Rc<Self>) {
        if self.state.get() != LifecycleState::Idle {
            return;
        }
        let proxy_type = self.settings.current().proxy_type;
        let controller = Rc::clone(self);
        let inbound_sub = self.frame_host.on_inbound_message(Box::new(move |event| {
            controller.handle_inbound(event);
        }));

        let controller_for_monitor = Rc::clone(self);
        let monitor_sub = self
            .bus
            .monitor()
            .subscribe(move |event: &MonitorEvent| controller_for_monitor.handle_monitor_event(event));

        *self.subscriptions.borrow_mut() = Subscriptions {
            inbound: Some(inbound_sub),
            monitor: Some(monitor_sub),
        };

        match proxy_type {
            ProxyType::Parent => {
                self.state.set(LifecycleState::ListeningParent);
                tracing::info!(proxy = %self.name, "proxy listening as parent");
            }
            ProxyType::Child => {
                self.state.set(LifecycleState::ListeningChild);
                tracing::info!(proxy = %self.name, "proxy listening as child");
                self.send_control(ControlCommand::RegisterEventBus);
            }
            ProxyType::Hybrid => unreachable!("rejected at construction"),
        }
    }

    /// Leave the listening state. A child controller announces
    /// `BusStopListening` to the parent first. No-op if already idle.
    pub fn stop_listening(&self) {
        if self.state.get() == LifecycleState::Idle {
            return;
        }
        if self.state.get() == LifecycleState::ListeningChild {
            self.send_control(ControlCommand::BusStopListening);
        }
        let mut subs = self.subscriptions.borrow_mut();
        if let Some(inbound) = subs.inbound.take() {
            inbound.cancel();
        }
        if let Some(monitor_id) = subs.monitor.take() {
            self.bus.monitor().unsubscribe(monitor_id);
        }
        drop(subs);
        tracing::info!(proxy = %self.name, "proxy stopped listening");
        self.state.set(LifecycleState::Idle);
    }

    fn send_control(&self, command: ControlCommand) {
        let settings = self.settings.current();
        let payload = ControlPayload {
            command: control_command_name(command).to_owned(),
            body: self.bus_id.clone(),
            proxy_type: settings.proxy_type.as_str().to_owned(),
        };
        let wire = WireMessage {
            channel: ChannelName::PROXY_CONTROL.to_owned(),
            kind: MessageKind::Control,
            payload: serde_json::to_value(payload).unwrap_or(Payload::Null),
            from: self.own_wire_tag(),
            control: Some(control_command_name(command).to_owned()),
        };
        self.frame_host.post_to_parent(&wire, &settings.parent_origin);
    }

    /// Step 1-6 of the inbound filter pipeline (`§4.G`).
    #[cfg_attr(feature = "instrumentation", instrument(skip(self, event)))]
    fn handle_inbound(&self, event: &InboundEvent) {
        if event.data.from == self.own_wire_tag() {
            tracing::debug!(proxy = %self.name, "dropped own rebroadcast (loop prevention)");
            return;
        }

        let settings = self.settings.current();
        if !settings.accepted_origins.is_allowed(&event.origin) {
            let reason = BusError::UnauthorizedOrigin(event.origin.clone()).to_string();
            tracing::warn!(proxy = %self.name, origin = %event.origin, "rejected message from unallowlisted origin");
            self.bus.report_dropped(&fallback_channel(&event.data.channel), reason);
            return;
        }

        let data = &event.data;
        if data.channel.is_empty() || !data.is_well_formed() || data.payload.is_null() {
            let reason =
                BusError::MalformedProxyMessage("channel, kind or payload missing".to_owned()).to_string();
            tracing::warn!(proxy = %self.name, "dropped malformed proxy message");
            self.bus.report_dropped(&fallback_channel(&data.channel), reason);
            return;
        }

        let channel = ChannelName::new(data.channel.clone());
        if !settings.is_channel_authorised(&channel) {
            let reason = BusError::UnauthorizedChannel(channel.to_string()).to_string();
            tracing::warn!(proxy = %self.name, %channel, "dropped message on unauthorised channel");
            self.bus.report_dropped(&channel, reason);
            return;
        }

        if data.kind == MessageKind::Control {
            self.apply_control(data);
            return;
        }

        let sender = format!("{}-{}", self.name, event.origin);
        let message = Message {
            id: Identifier::generate(),
            kind: data.kind,
            payload: data.payload.clone(),
            sender,
            version: 1,
            proxy_rebroadcast: true,
        };
        tracing::debug!(proxy = %self.name, %channel, "rebroadcasting inbound proxy message locally");
        self.bus.send(&channel, message);
    }

    #[cfg_attr(feature = "instrumentation", instrument(skip(self, data)))]
    fn apply_control(&self, data: &WireMessage) {
        let control_channel = ChannelName::new(ChannelName::PROXY_CONTROL);
        let Some(raw_command) = data.control.as_deref() else {
            let reason =
                BusError::MalformedProxyMessage("control message missing command name".to_owned())
                    .to_string();
            tracing::warn!(proxy = %self.name, "control message missing command name");
            self.bus.report_dropped(&control_channel, reason);
            return;
        };
        let Some(command) = ControlCommand::parse(raw_command) else {
            let reason = BusError::UnknownControl(raw_command.to_owned()).to_string();
            tracing::warn!(proxy = %self.name, command = %raw_command, "unknown proxy control command, ignored");
            self.bus.report_dropped(&control_channel, reason);
            return;
        };
        let Ok(payload) = serde_json::from_value::<ControlPayload>(data.payload.clone()) else {
            let reason = BusError::MalformedProxyMessage(
                "control payload did not match the expected shape".to_owned(),
            )
            .to_string();
            tracing::warn!(proxy = %self.name, "control payload did not match the expected shape");
            self.bus.report_dropped(&control_channel, reason);
            return;
        };
        let mut children = self.known_children.borrow_mut();
        match command {
            ControlCommand::RegisterEventBus => {
                children.insert(
                    payload.body.clone(),
                    ChildBusState {
                        proxy_type: payload.proxy_type.clone(),
                        active: true,
                    },
                );
                tracing::info!(proxy = %self.name, child = %payload.body, "registered child bus");
            }
            ControlCommand::BusStartListening => {
                if let Some(state) = children.get_mut(&payload.body) {
                    state.active = true;
                }
            }
            ControlCommand::BusStopListening => {
                if let Some(state) = children.get_mut(&payload.body) {
                    state.active = false;
                }
            }
        }
    }

    /// The outbound relay: react to the kernel's own traffic and post it
    /// across the frame boundary, skipping anything that already arrived
    /// via the proxy (`proxy_rebroadcast`) to prevent loops.
    fn handle_monitor_event(&self, event: &MonitorEvent) {
        let Some(message) = event.message() else {
            return;
        };
        if message.proxy_rebroadcast {
            return;
        }
        let settings = self.settings.current();
        if !settings.is_channel_authorised(event.channel()) {
            return;
        }

        let wire = WireMessage {
            channel: event.channel().as_str().to_owned(),
            kind: message.kind,
            payload: message.payload.clone(),
            from: self.own_wire_tag(),
            control: None,
        };

        match settings.proxy_type {
            ProxyType::Child => {
                self.frame_host.post_to_parent(&wire, &settings.parent_origin);
            }
            ProxyType::Parent => {
                let targets = if settings.target_all_frames {
                    None
                } else {
                    Some(settings.target_specific_frames.as_slice())
                };
                self.frame_host.post_to_children(&wire, &self.frame_host.current_origin(), targets);
            }
            ProxyType::Hybrid => unreachable!("rejected at construction"),
        }
    }
}

/// Best-effort channel name for a `Dropped` report when the inbound pipeline
/// rejects a message before `data.channel` is known to be well-formed (an
/// unallowlisted origin or a structurally malformed payload may carry an
/// empty or invalid channel string).
fn fallback_channel(raw: &str) -> ChannelName {
    ChannelName::try_new(raw.to_owned()).unwrap_or_else(|_| ChannelName::new("__proxy_inbound__"))
}

fn control_command_name(command: ControlCommand) -> &'static str {
    match command {
        ControlCommand::RegisterEventBus => "RegisterEventBus",
        ControlCommand::BusStartListening => "BusStartListening",
        ControlCommand::BusStopListening => "BusStopListening",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::frame_host::testing::MemoryFrameHost;

    fn settings(origins: &[&str], channels: &[&str]) -> ProxySettings {
        ProxySettings {
            accepted_origins: OriginAllowlist::new(origins),
            target_all_frames: true,
            target_specific_frames: Vec::new(),
            protected_channels: channels.iter().map(|c| ChannelName::new(*c)).collect(),
            parent_origin: "https://parent.example".to_owned(),
            proxy_type: ProxyType::Child,
        }
    }

    #[test]
    fn hybrid_proxy_type_is_rejected_at_construction() {
        let bus = Rc::new(Bus::new());
        let (parent_host, _child_host) =
            MemoryFrameHost::pair("https://parent.example", "https://child.example");
        let mut s = settings(&["https://parent.example"], &["chat"]);
        s.proxy_type = ProxyType::Hybrid;
        let result = ProxyController::new("proxy", bus, Rc::new(parent_host), s);
        assert!(matches!(result, Err(BusError::InvalidConfiguration(_))));
    }

    #[test]
    fn inbound_from_unallowlisted_origin_is_dropped() {
        let bus = Rc::new(Bus::new());
        let (parent_host, child_host) =
            MemoryFrameHost::pair("https://parent.example", "https://b.example");
        let settings = settings(&["https://a.example"], &["chat"]);
        let controller = Rc::new(
            ProxyController::new("proxy", Rc::clone(&bus), Rc::new(parent_host), settings).unwrap(),
        );
        controller.listen();

        let received = Rc::new(std::cell::RefCell::new(0));
        let r = Rc::clone(&received);
        bus.get_channel(&ChannelName::new("chat")).subscribe(move |_| {
            *r.borrow_mut() += 1;
        });

        child_host.post_to_parent(
            &WireMessage {
                channel: "chat".to_owned(),
                kind: MessageKind::Request,
                payload: serde_json::json!("hi"),
                from: "proxy-remote".to_owned(),
                control: None,
            },
            "https://b.example",
        );

        assert_eq!(*received.borrow(), 0);
    }

    #[test]
    fn inbound_authorised_message_rebroadcasts_locally_marked() {
        let bus = Rc::new(Bus::new());
        let (parent_host, child_host) =
            MemoryFrameHost::pair("https://parent.example", "https://a.example");
        let settings = settings(&["https://a.example"], &["chat"]);
        let controller = Rc::new(
            ProxyController::new("proxy", Rc::clone(&bus), Rc::new(parent_host), settings).unwrap(),
        );
        controller.listen();

        let received = Rc::new(std::cell::RefCell::new(Vec::new()));
        let r = Rc::clone(&received);
        bus.get_channel(&ChannelName::new("chat")).subscribe(move |event| {
            if let crate::channel::ChannelEvent::Message(msg) = event {
                r.borrow_mut().push(msg.clone());
            }
        });

        child_host.post_to_parent(
            &WireMessage {
                channel: "chat".to_owned(),
                kind: MessageKind::Request,
                payload: serde_json::json!("hi"),
                from: "proxy-remote".to_owned(),
                control: None,
            },
            "https://a.example",
        );

        let msgs = received.borrow();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].proxy_rebroadcast);
        assert_eq!(msgs[0].payload, serde_json::json!("hi"));
    }

    #[test]
    fn rebroadcast_message_is_not_relayed_outward_again() {
        let bus = Rc::new(Bus::new());
        let (parent_host, child_host) =
            MemoryFrameHost::pair("https://parent.example", "https://a.example");
        let settings = settings(&["https://a.example"], &["chat"]);
        let controller = Rc::new(
            ProxyController::new("proxy", Rc::clone(&bus), Rc::new(parent_host), settings).unwrap(),
        );
        controller.listen();

        let outbound_seen = Rc::new(std::cell::RefCell::new(0));
        let o = Rc::clone(&outbound_seen);
        child_host.on_inbound_message(Box::new(move |_| *o.borrow_mut() += 1));

        child_host.post_to_parent(
            &WireMessage {
                channel: "chat".to_owned(),
                kind: MessageKind::Request,
                payload: serde_json::json!("hi"),
                from: "proxy-remote".to_owned(),
                control: None,
            },
            "https://a.example",
        );

        // The rebroadcasted message hit the kernel, which in turn fed the
        // monitor stream; the outbound relay must have skipped it because
        // proxy_rebroadcast was set, so nothing new arrives at the child.
        assert_eq!(*outbound_seen.borrow(), 0);
    }

    #[test]
    fn register_event_bus_control_populates_registry() {
        let bus = Rc::new(Bus::new());
        let (parent_host, child_host) =
            MemoryFrameHost::pair("https://parent.example", "https://a.example");
        let settings = settings(&["https://a.example"], &["chat"]);
        let controller = Rc::new(
            ProxyController::new("proxy", Rc::clone(&bus), Rc::new(parent_host), settings).unwrap(),
        );
        controller.listen();

        child_host.post_to_parent(
            &WireMessage {
                channel: ChannelName::PROXY_CONTROL.to_owned(),
                kind: MessageKind::Control,
                payload: serde_json::to_value(ControlPayload {
                    command: "RegisterEventBus".to_owned(),
                    body: "child-1".to_owned(),
                    proxy_type: "Child".to_owned(),
                })
                .unwrap(),
                from: "proxy-remote".to_owned(),
                control: Some("RegisterEventBus".to_owned()),
            },
            "https://a.example",
        );

        let children = controller.known_children();
        assert_eq!(children.get("child-1").map(|s| s.active), Some(true));
    }

    #[test]
    fn child_listen_announces_registration_to_parent() {
        let bus = Rc::new(Bus::new());
        let (parent_host, child_host) =
            MemoryFrameHost::pair("https://parent.example", "https://a.example");
        let settings = settings(&["https://parent.example"], &["chat"]);
        let controller = Rc::new(
            ProxyController::new("proxy", Rc::clone(&bus), Rc::new(parent_host), settings).unwrap(),
        );

        let seen_commands = Rc::new(std::cell::RefCell::new(Vec::new()));
        let s = Rc::clone(&seen_commands);
        child_host.on_inbound_message(Box::new(move |event| {
            s.borrow_mut().push(event.data.control.clone());
        }));

        controller.listen();

        assert_eq!(
            *seen_commands.borrow(),
            vec![Some("RegisterEventBus".to_owned())]
        );
    }

    #[test]
    fn inbound_from_unallowlisted_origin_is_reported_as_dropped() {
        let bus = Rc::new(Bus::new());
        let (parent_host, child_host) =
            MemoryFrameHost::pair("https://parent.example", "https://b.example");
        let settings = settings(&["https://a.example"], &["chat"]);
        let controller = Rc::new(
            ProxyController::new("proxy", Rc::clone(&bus), Rc::new(parent_host), settings).unwrap(),
        );
        controller.listen();

        let dropped = Rc::new(std::cell::RefCell::new(0));
        let d = Rc::clone(&dropped);
        bus.monitor().subscribe(move |event: &MonitorEvent| {
            if matches!(event, MonitorEvent::Dropped { .. }) {
                *d.borrow_mut() += 1;
            }
        });

        child_host.post_to_parent(
            &WireMessage {
                channel: "chat".to_owned(),
                kind: MessageKind::Request,
                payload: serde_json::json!("hi"),
                from: "proxy-remote".to_owned(),
                control: None,
            },
            "https://b.example",
        );

        assert_eq!(*dropped.borrow(), 1);
    }

    #[test]
    fn unknown_control_command_is_reported_as_dropped() {
        let bus = Rc::new(Bus::new());
        let (parent_host, child_host) =
            MemoryFrameHost::pair("https://parent.example", "https://a.example");
        let settings = settings(&["https://a.example"], &["chat"]);
        let controller = Rc::new(
            ProxyController::new("proxy", Rc::clone(&bus), Rc::new(parent_host), settings).unwrap(),
        );
        controller.listen();

        let dropped_reasons = Rc::new(std::cell::RefCell::new(Vec::new()));
        let d = Rc::clone(&dropped_reasons);
        bus.monitor().subscribe(move |event: &MonitorEvent| {
            if let MonitorEvent::Dropped { reason, .. } = event {
                d.borrow_mut().push(reason.clone());
            }
        });

        child_host.post_to_parent(
            &WireMessage {
                channel: ChannelName::PROXY_CONTROL.to_owned(),
                kind: MessageKind::Control,
                payload: serde_json::json!({}),
                from: "proxy-remote".to_owned(),
                control: Some("NoSuchCommand".to_owned()),
            },
            "https://a.example",
        );

        assert_eq!(dropped_reasons.borrow().len(), 1);
    }
}
