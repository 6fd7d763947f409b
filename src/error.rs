//! Error kinds for the bus, the store subsystem and the proxy controller.
//!
//! Most failure conditions are logged and swallowed at the point they occur
//! rather than propagated to an unrelated caller (`§7`). `BusError` exists
//! for the remaining cases where a caller is in a position to react: a
//! failed `populate`, a rejected mutation reply, an invalid proxy
//! configuration.

use thiserror::Error;

use crate::message::Payload;

/// Errors produced by the bus kernel, the store subsystem and the proxy
/// controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A proxy controller was started without (or with incomplete)
    /// configuration.
    #[error("proxy started without valid configuration: {0}")]
    InvalidConfiguration(String),

    /// A message arrived on a channel that isn't in the authorised set.
    #[error("channel {0:?} is not authorised")]
    UnauthorizedChannel(String),

    /// A message arrived from an origin that isn't in the allowlist.
    #[error("origin {0:?} is not allowlisted")]
    UnauthorizedOrigin(String),

    /// An inbound proxy message failed structural validation.
    #[error("malformed proxy message: {0}")]
    MalformedProxyMessage(String),

    /// A channel was subscribed to, or a mutation was posted, with no
    /// handler able to receive it.
    #[error("no subscriber handler available for channel {0:?}")]
    MissingSubscriberHandler(String),

    /// An operation was attempted against a channel that has already been
    /// destroyed.
    #[error("channel {0:?} is closed")]
    ClosedChannel(String),

    /// `populate` was called on a store that has already been populated or
    /// initialized.
    #[error("store {0:?} has already been populated")]
    PopulateRejected(String),

    /// A mutation envelope's `success`/`error` reply was invoked more than
    /// once.
    #[error("mutation envelope already replied to")]
    MutationDoubleReply,

    /// A control message named a command the proxy doesn't recognise.
    #[error("unknown proxy control command: {0:?}")]
    UnknownControl(String),

    /// A transport-level failure mirroring a REST error, carrying the
    /// numeric status the REST collaborator would have produced.
    #[error("transport error {code}: {message}")]
    Transport {
        /// Numeric status code (400 = synthetic mock failure, 444 =
        /// unimplemented, 505 = invalid service request — see `§7`).
        code: u16,
        /// Human-readable detail.
        message: String,
    },
}

impl BusError {
    /// Build the synthetic "closed channel" transport error a
    /// `request_once_with_id` resolves with when requesting against a
    /// channel that has already been destroyed.
    #[must_use]
    pub fn synthetic_closed_channel(channel: &str) -> Self {
        Self::Transport {
            code: 400,
            message: format!("channel {channel:?} is closed"),
        }
    }

    /// Render as the `{code, message}` JSON shape the REST transport
    /// contract (`§6`) uses for its own errors, so every failure path that
    /// resolves a request with an `Err(Payload)` looks the same on the
    /// wire, whether the failure actually came from the REST collaborator
    /// or was synthesized locally.
    #[must_use]
    pub fn to_payload(&self) -> Payload {
        match self {
            Self::Transport { code, message } => serde_json::json!({
                "code": code,
                "message": message,
            }),
            other => serde_json::json!({
                "code": 400,
                "message": other.to_string(),
            }),
        }
    }
}
