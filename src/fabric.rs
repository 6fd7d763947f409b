//! The fabric facade (`§4.H`, `§6`'s REST transport contract): connection
//! state, current-organisation tracking and version lookup, and outbound
//! REST-shaped requests, all mapped onto well-known kernel channels and the
//! `ORGS` store. This module adds no runtime behaviour beyond that mapping
//! — the remote broker itself is an external collaborator (`§1`).

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::kernel::Bus;
use crate::message::{ChannelName, Identifier, Message, Payload};
use crate::store::StoreManager;
use crate::BusError;

/// Connection state broadcast on [`ChannelName::FABRIC_CONNECTION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// REST verbs accepted by the transport collaborator (`§6`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestVerb {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "UPDATE_HEADERS")]
    UpdateHeaders,
    #[serde(rename = "HOST_OPTIONS")]
    HostOptions,
    #[serde(rename = "CORS_OPTIONS")]
    CorsOptions,
    #[serde(rename = "CORS_CREDENTIALS_OPTIONS")]
    CorsCredentialsOptions,
}

/// The shape a REST call takes when handed to the transport collaborator,
/// per `§6`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestRequest {
    pub verb: RestVerb,
    pub uri: String,
    #[serde(default)]
    pub body: Payload,
    #[serde(default)]
    pub headers: Payload,
    #[serde(default)]
    pub query_params: Payload,
    #[serde(default)]
    pub path_params: Payload,
    pub api_class: String,
    pub sender: String,
}

/// Facade over connection/session/org/version state, backed entirely by
/// the kernel and the `ORGS` store.
pub struct FabricFacade {
    bus: Rc<Bus>,
    stores: Rc<StoreManager>,
    connected: std::cell::Cell<bool>,
    route_through_fabric: std::cell::Cell<bool>,
}

impl FabricFacade {
    #[must_use]
    pub fn new(bus: Rc<Bus>, stores: Rc<StoreManager>) -> Self {
        Self {
            bus,
            stores,
            connected: std::cell::Cell::new(false),
            route_through_fabric: std::cell::Cell::new(false),
        }
    }

    fn connection_channel(&self) -> ChannelName {
        ChannelName::new(ChannelName::FABRIC_CONNECTION)
    }

    fn broadcast_connection_state(&self, state: ConnectionState) {
        let payload = serde_json::to_value(state).unwrap_or(Payload::Null);
        self.bus.send(
            &self.connection_channel(),
            Message::control(Identifier::generate(), payload, "fabric"),
        );
    }

    /// Mark the fabric connected and broadcast the transition.
    pub fn connect(&self) {
        self.connected.set(true);
        tracing::info!("fabric connected");
        self.broadcast_connection_state(ConnectionState::Connected);
    }

    /// Mark the fabric disconnected and broadcast the transition.
    pub fn disconnect(&self) {
        self.connected.set(false);
        tracing::info!("fabric disconnected");
        self.broadcast_connection_state(ConnectionState::Disconnected);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// The connection-state stream. Subscribers receive every subsequent
    /// `connect`/`disconnect` transition, never past ones (`§4.C`: no
    /// replay).
    #[must_use]
    pub fn when_connection_state_changes(&self) -> Channel {
        self.bus.get_channel(&self.connection_channel())
    }

    /// Record the current organisation id in the `ORGS` store under
    /// `ORG_ID`.
    pub fn set_fabric_current_org_id(&self, org_id: impl Into<String>) {
        let store = self.stores.create_store(ChannelName::ORGS_STORE);
        store.put(
            ChannelName::ORG_ID_KEY,
            Payload::String(org_id.into()),
            "Updated",
        );
    }

    /// Read the current organisation id, if one has been set.
    #[must_use]
    pub fn current_org_id(&self) -> Option<String> {
        self.stores
            .get_store(ChannelName::ORGS_STORE)?
            .get(ChannelName::ORG_ID_KEY)?
            .as_str()
            .map(str::to_owned)
    }

    /// Resolve once with the fabric's reported version, via a single
    /// request/response exchange on [`ChannelName::FABRIC_VERSION`]. The
    /// responder (the host application, or the REST façade collaborator in
    /// a full deployment) is expected to answer with a string payload.
    pub async fn get_fabric_version(&self) -> Result<String, Payload> {
        let id = Identifier::generate();
        let payload = self
            .bus
            .request_once_with_id(
                id,
                ChannelName::new(ChannelName::FABRIC_VERSION),
                Payload::Null,
                None,
                "fabric",
            )
            .await?;
        match payload.as_str() {
            Some(version) => Ok(version.to_owned()),
            None => Err(BusError::Transport {
                code: 505,
                message: "fabric version response was not a string".to_owned(),
            }
            .to_payload()),
        }
    }

    /// Toggle whether outbound REST traffic is routed through the remote
    /// fabric broker or served locally.
    pub fn set_route_through_fabric(&self, enabled: bool) {
        self.route_through_fabric.set(enabled);
    }

    #[must_use]
    pub fn routes_through_fabric(&self) -> bool {
        self.route_through_fabric.get()
    }

    /// Publish a REST-shaped request as a kernel Request message on
    /// [`ChannelName::FABRIC_REST`]. Returns the generated correlation id;
    /// the caller pairs it with [`Bus::request_once_with_id`] or
    /// [`Bus::listen`] for the reply.
    pub fn send_rest_request(&self, request: RestRequest) -> Identifier {
        let sender = request.sender.clone();
        let payload = serde_json::to_value(request).unwrap_or(Payload::Null);
        self.bus
            .send_request(&ChannelName::new(ChannelName::FABRIC_REST), payload, None, sender)
    }
}
