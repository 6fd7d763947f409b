//! `relaybus` is an in-process publish/subscribe message bus.
//!
//! It is built around four cooperating pieces:
//!
//! - [`message`]: the value types flowing through the bus (identifiers,
//!   channel names, message kinds, monitor events).
//! - [`channel`]: the channel registry that owns channels and their
//!   multicast streams.
//! - [`kernel`]: the public send/listen/request API, correlation by
//!   identifier, and the monitor meta-stream.
//! - [`store`]: a keyed, state-tagged value store layered over the kernel.
//! - [`proxy`]: a cross-frame relay that serialises kernel traffic over a
//!   [`proxy::frame_host::FrameHost`].
//! - [`fabric`]: a thin facade mapping connection/session/org/version
//!   concerns onto well-known kernel channels and the `ORGS` store.
//!
//! Everything here runs on a single cooperative task: a publish call
//! invokes every current subscriber, in subscription order, before it
//! returns. See [`observable`] for the primitive this rests on.

pub mod channel;
pub mod error;
pub mod fabric;
pub mod kernel;
pub mod message;
pub mod observable;
pub mod proxy;
pub mod settings;
pub mod store;

/// Test-only doubles (a queued request responder resolving `§9`'s
/// `forceResponse`/`forceError` open question). Gated the way `tokio`
/// gates its own `test-util` feature, rather than always compiled in.
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use error::BusError;
pub use fabric::FabricFacade;
pub use kernel::{Bus, MonitorStream, Transaction};
pub use message::{ChannelName, Identifier, Message, MessageKind, MonitorEvent};
pub use proxy::ProxyController;
pub use store::{Store, StoreManager};
