//! The JSON wire format a proxy message is serialised to/from when it
//! crosses a [`super::frame_host::FrameHost`] boundary.

use serde::{Deserialize, Serialize};

use crate::message::{MessageKind, Payload};

/// One message as it appears on the wire, per `§6`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Payload,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<String>,
}

impl WireMessage {
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.channel.is_empty() && !self.from.is_empty()
    }
}

/// The three recognised control commands carried in a `Control`-kind
/// message's payload (`{ command, body: busId, proxyType }`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ControlCommand {
    RegisterEventBus,
    BusStartListening,
    BusStopListening,
}

impl ControlCommand {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "RegisterEventBus" => Some(Self::RegisterEventBus),
            "BusStartListening" => Some(Self::BusStartListening),
            "BusStopListening" => Some(Self::BusStopListening),
            _ => None,
        }
    }
}

/// Payload shape for a `Control`-kind wire message, per `§6`'s
/// `{ command, body: busId, proxyType }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPayload {
    pub command: String,
    /// The announcing bus's id.
    pub body: String,
    #[serde(rename = "proxyType")]
    pub proxy_type: String,
}
