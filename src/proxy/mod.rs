//! Cross-context proxy: relays kernel traffic over a [`frame_host::FrameHost`]
//! boundary, with origin and channel allowlisting, parent/child topology,
//! a bus-instance registry, and loop prevention (`§2` component G, `§4.G`).

pub mod controller;
pub mod frame_host;
pub mod origin;
pub mod wire;

pub use controller::{ChildBusState, ProxyController, ProxySettings, ProxyType};
pub use frame_host::{FrameHost, InboundEvent, InboundSubscription};
pub use origin::{OriginAllowlist, OriginPattern};
pub use wire::{ControlCommand, ControlPayload, WireMessage};
