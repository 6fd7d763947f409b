//! The value types that flow through the bus: identifiers, channel names,
//! message kinds, messages themselves, and the monitor's activity records.
//!
//! Everything here is pure data: construction, equality, predicates and a
//! JSON-compatible serialisation round-trip. No behaviour lives in this
//! module.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The dynamically-typed payload shape used everywhere a message crosses a
/// channel, a proxy boundary, or gets serialised to JSON.
///
/// Per Design Note 9, a statically-typed reimplementation should model
/// payloads as a tagged variant when the shape is known ahead of time and
/// fall back to an opaque envelope at the proxy boundary; `serde_json::Value`
/// serves both roles here without forcing every channel to be generic over
/// a distinct payload type.
pub type Payload = serde_json::Value;

/// An opaque identifier, unique per message and per bus instance.
///
/// Two identifiers are equal iff they were generated from the same value;
/// that equality is what correlation (request/response pairing) is built
/// on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier(String);

impl Identifier {
    /// Generate a fresh, practically-unique identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an externally-supplied identifier (e.g. one echoed back from a
    /// proxied frame) verbatim.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A non-empty channel name.
///
/// Channels are created lazily the first time a name is referenced and are
/// reference-counted by number of active subscriptions plus explicit
/// create/destroy calls (see [`crate::channel::ChannelRegistry`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelName(String);

impl ChannelName {
    /// Reserved channel carrying proxy control traffic (`RegisterEventBus`,
    /// `BusStartListening`, `BusStopListening`). Always authorised for
    /// relay regardless of a proxy's configured channel allowlist.
    pub const PROXY_CONTROL: &'static str = "__proxycontrol__";

    /// Reserved store name carrying the current organisation id.
    pub const ORGS_STORE: &'static str = "ORGS";

    /// Reserved key within the `ORGS` store.
    pub const ORG_ID_KEY: &'static str = "ORG_ID";

    /// Reserved channel the fabric facade (`§4.H`) broadcasts connection
    /// state transitions on.
    pub const FABRIC_CONNECTION: &'static str = "__fabric_connection__";

    /// Reserved channel the fabric facade's version request/response pair
    /// rides on.
    pub const FABRIC_VERSION: &'static str = "__fabric_version__";

    /// Reserved channel the fabric facade's REST transport routes through,
    /// per `§6`'s REST transport contract.
    pub const FABRIC_REST: &'static str = "__fabric_rest__";

    /// Build a channel name, rejecting the empty string.
    ///
    /// # Panics
    ///
    /// If `name` is empty. Channel names are almost always literals or
    /// otherwise known-valid at the call site; use
    /// [`ChannelName::try_new`] when the name comes from untrusted input
    /// (e.g. a proxied message).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::try_new(name).expect("channel name must not be empty")
    }

    /// Build a channel name, rejecting the empty string without panicking.
    pub fn try_new(name: impl Into<String>) -> Result<Self, crate::BusError> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::BusError::MalformedProxyMessage(
                "channel name must not be empty".to_owned(),
            ));
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChannelName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// The four message kinds the kernel understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum MessageKind {
    Request,
    Response,
    Error,
    Control,
}

/// One publication event.
///
/// Immutable once emitted. `proxy_rebroadcast` marks a message that
/// re-entered the kernel from a [`crate::proxy::controller::ProxyController`]
/// and must not be relayed back out, preventing loops across the proxy
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message<P> {
    pub id: Identifier,
    pub kind: MessageKind,
    pub payload: P,
    pub sender: String,
    pub version: u32,
    #[serde(default)]
    pub proxy_rebroadcast: bool,
}

impl<P> Message<P> {
    #[must_use]
    pub fn request(id: Identifier, payload: P, sender: impl Into<String>) -> Self {
        Self {
            id,
            kind: MessageKind::Request,
            payload,
            sender: sender.into(),
            version: 1,
            proxy_rebroadcast: false,
        }
    }

    #[must_use]
    pub fn response(id: Identifier, payload: P, sender: impl Into<String>) -> Self {
        Self {
            id,
            kind: MessageKind::Response,
            payload,
            sender: sender.into(),
            version: 1,
            proxy_rebroadcast: false,
        }
    }

    #[must_use]
    pub fn error(id: Identifier, payload: P, sender: impl Into<String>) -> Self {
        Self {
            id,
            kind: MessageKind::Error,
            payload,
            sender: sender.into(),
            version: 1,
            proxy_rebroadcast: false,
        }
    }

    #[must_use]
    pub fn control(id: Identifier, payload: P, sender: impl Into<String>) -> Self {
        Self {
            id,
            kind: MessageKind::Control,
            payload,
            sender: sender.into(),
            version: 1,
            proxy_rebroadcast: false,
        }
    }

    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request)
    }

    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(self.kind, MessageKind::Response)
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.kind, MessageKind::Error)
    }

    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self.kind, MessageKind::Control)
    }

    /// Build a copy of this message carrying a different id. Used by the
    /// proxy to rehome an inbound message's id onto the local bus while
    /// preserving payload, kind and sender.
    #[must_use]
    pub fn with_id(mut self, id: Identifier) -> Self {
        self.id = id;
        self
    }

    /// Mark this message as having re-entered the kernel via the proxy, so
    /// the outbound relay never rebroadcasts it.
    #[must_use]
    pub fn marked_proxy_rebroadcast(mut self) -> Self {
        self.proxy_rebroadcast = true;
        self
    }
}

impl<P: PartialEq> PartialEq for Message<P> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.payload == other.payload
            && self.sender == other.sender
            && self.version == other.version
            && self.proxy_rebroadcast == other.proxy_rebroadcast
    }
}

impl<P: Eq> Eq for Message<P> {}

/// A record describing one piece of kernel activity, published on the
/// monitor meta-stream (`§2` component E). Monitor events are never
/// themselves the cause of further monitor events — see
/// [`crate::kernel::Bus::monitor`].
///
/// `MessageSent` and `ErrorSent` carry the full [`Message`], not just its
/// channel and kind: the proxy controller's outbound relay (`§4.G`) needs
/// `proxy_rebroadcast` and the payload to decide whether, and what, to post
/// across the frame boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorEvent {
    ChannelCreated { channel: ChannelName },
    ChannelClosed { channel: ChannelName },
    ChannelDestroyed { channel: ChannelName },
    SubscriberAdded { channel: ChannelName },
    SubscriberRemoved { channel: ChannelName },
    MessageSent {
        channel: ChannelName,
        kind: MessageKind,
        message: Message<Payload>,
    },
    ErrorSent {
        channel: ChannelName,
        message: Message<Payload>,
    },
    Dropped { channel: ChannelName, reason: String },
}

impl MonitorEvent {
    #[must_use]
    pub const fn channel(&self) -> &ChannelName {
        match self {
            Self::ChannelCreated { channel }
            | Self::ChannelClosed { channel }
            | Self::ChannelDestroyed { channel }
            | Self::SubscriberAdded { channel }
            | Self::SubscriberRemoved { channel }
            | Self::MessageSent { channel, .. }
            | Self::ErrorSent { channel, .. }
            | Self::Dropped { channel, .. } => channel,
        }
    }

    /// The underlying message, for the `MessageSent`/`ErrorSent` variants
    /// that carry one.
    #[must_use]
    pub const fn message(&self) -> Option<&Message<Payload>> {
        match self {
            Self::MessageSent { message, .. } | Self::ErrorSent { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_generated_are_unique() {
        let a = Identifier::generate();
        let b = Identifier::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn message_predicates() {
        let id = Identifier::generate();
        let msg = Message::request(id, "payload".to_owned(), "tester");
        assert!(msg.is_request());
        assert!(!msg.is_response());
        assert!(!msg.is_error());
        assert!(!msg.is_control());
    }

    #[test]
    fn message_json_round_trips() {
        let id = Identifier::generate();
        let msg = Message::response(id, 42u32, "tester");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn channel_name_rejects_empty() {
        assert!(ChannelName::try_new("").is_err());
        assert!(ChannelName::try_new("chat").is_ok());
    }
}
