//! Top-level CloudStack service that owns per-session adapters.
//!
//! `CloudStackService` is the single entry point an application keeps in
//! shared state. Each `connect` builds one `CsClient` for the endpoint and
//! hands clones of it to every resource adapter.

use crate::addresses::{AddressClient, IpAddress};
use crate::client::CsClient;
use crate::config::EndpointContext;
use crate::jobs::JobWaiter;
use crate::keypairs::{KeypairClient, SshKeypair};
use crate::networks::{NetworkClient, Vlan};
use crate::tags::TagService;
use crate::templates::{ImageFilter, MachineImage, TemplateClient};
use crate::transport::{HttpTransport, Transport};
use crate::wire::WireObserver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Thread-safe state type for an application's shared state.
pub type CloudStackServiceState = Arc<Mutex<CloudStackService>>;

/// Public view of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsSession {
    pub id: String,
    pub endpoint: String,
    pub region_id: Option<String>,
    pub account_number: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_connected: bool,
    /// Result of the subscription check run at connect time.
    pub subscribed: Option<bool>,
}

/// Per-session bundle of adapters.
struct SessionClients {
    templates: TemplateClient,
    keypairs: KeypairClient,
    addresses: AddressClient,
    networks: NetworkClient,
}

pub struct CloudStackService {
    sessions: HashMap<String, CsSession>,
    clients: HashMap<String, SessionClients>,
    jobs: Arc<dyn JobWaiter>,
    tags: Arc<dyn TagService>,
    wire: Option<Arc<dyn WireObserver>>,
}

impl CloudStackService {
    /// Create a service wrapped as shared state.
    pub fn new(jobs: Arc<dyn JobWaiter>, tags: Arc<dyn TagService>) -> CloudStackServiceState {
        Arc::new(Mutex::new(Self::unshared(jobs, tags)))
    }

    pub fn unshared(jobs: Arc<dyn JobWaiter>, tags: Arc<dyn TagService>) -> Self {
        Self {
            sessions: HashMap::new(),
            clients: HashMap::new(),
            jobs,
            tags,
            wire: None,
        }
    }

    /// Trace every session's traffic through `wire`.
    pub fn set_wire(&mut self, wire: Arc<dyn WireObserver>) {
        self.wire = Some(wire);
    }

    // ── Session management ──────────────────────────────────────────

    /// Connect over HTTP and create a new session.
    pub async fn connect(&mut self, context: EndpointContext) -> Result<String, String> {
        self.connect_with(context, Arc::new(HttpTransport::new())).await
    }

    pub async fn connect_with(
        &mut self,
        context: EndpointContext,
        transport: Arc<dyn Transport>,
    ) -> Result<String, String> {
        context.validate()?;
        let context = context.sanitized();
        let session_id = Uuid::new_v4().to_string();

        let mut base = CsClient::with_transport(Arc::new(context.clone()), transport);
        if let Some(ref wire) = self.wire {
            base = base.with_wire(wire.clone());
        }

        // Check the account (best-effort)
        let subscribed = match base.is_subscribed().await {
            Ok(subscribed) => Some(subscribed),
            Err(e) => {
                log::warn!(
                    "Subscription check failed for session {}: {} (session created anyway)",
                    session_id,
                    e
                );
                None
            }
        };

        let clients = SessionClients {
            templates: TemplateClient::new(base.clone(), self.jobs.clone(), self.tags.clone()),
            keypairs: KeypairClient::new(base.clone()),
            addresses: AddressClient::new(base.clone(), self.jobs.clone(), self.tags.clone()),
            networks: NetworkClient::new(base, self.jobs.clone(), self.tags.clone()),
        };
        let now = Utc::now();
        let session = CsSession {
            id: session_id.clone(),
            endpoint: context.endpoint.clone(),
            region_id: context.region_id.clone(),
            account_number: context.account_number.clone(),
            connected_at: now,
            last_activity: now,
            is_connected: true,
            subscribed,
        };

        log::info!("CloudStack session {} connected to {}", session_id, context.endpoint);
        self.sessions.insert(session_id.clone(), session);
        self.clients.insert(session_id.clone(), clients);
        Ok(session_id)
    }

    pub fn disconnect(&mut self, session_id: &str) -> Result<(), String> {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.is_connected = false;
                session.last_activity = Utc::now();
                self.clients.remove(session_id);
                Ok(())
            }
            None => Err(format!("CloudStack session {} not found", session_id)),
        }
    }

    pub fn list_sessions(&self) -> Vec<CsSession> {
        self.sessions.values().cloned().collect()
    }

    pub fn get_session(&self, session_id: &str) -> Option<CsSession> {
        self.sessions.get(session_id).cloned()
    }

    fn require_clients(&mut self, session_id: &str) -> Result<&SessionClients, String> {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
        self.clients
            .get(session_id)
            .ok_or_else(|| format!("CloudStack session {} not found or disconnected", session_id))
    }

    // ── Adapters ────────────────────────────────────────────────────

    pub fn templates(&mut self, session_id: &str) -> Result<TemplateClient, String> {
        Ok(self.require_clients(session_id)?.templates.clone())
    }

    pub fn keypairs(&mut self, session_id: &str) -> Result<KeypairClient, String> {
        Ok(self.require_clients(session_id)?.keypairs.clone())
    }

    pub fn addresses(&mut self, session_id: &str) -> Result<AddressClient, String> {
        Ok(self.require_clients(session_id)?.addresses.clone())
    }

    pub fn networks(&mut self, session_id: &str) -> Result<NetworkClient, String> {
        Ok(self.require_clients(session_id)?.networks.clone())
    }

    // ── Common calls ────────────────────────────────────────────────

    pub async fn list_images(
        &mut self,
        session_id: &str,
        filter: Option<ImageFilter>,
    ) -> Result<Vec<MachineImage>, String> {
        let templates = self.templates(session_id)?;
        Ok(templates.list_images(filter.as_ref()).await?)
    }

    pub async fn list_keypairs(&mut self, session_id: &str) -> Result<Vec<SshKeypair>, String> {
        let keypairs = self.keypairs(session_id)?;
        Ok(keypairs.list().await?)
    }

    pub async fn list_ip_pool(
        &mut self,
        session_id: &str,
        unassigned_only: bool,
    ) -> Result<Vec<IpAddress>, String> {
        let addresses = self.addresses(session_id)?;
        Ok(addresses.list_ip_pool(unassigned_only).await?)
    }

    pub async fn list_vlans(&mut self, session_id: &str) -> Result<Vec<Vlan>, String> {
        let networks = self.networks(session_id)?;
        Ok(networks.list_vlans().await?)
    }
}
