//! Client lifecycle on the main interface.
//!
//! Adding a client touches three places in order: the store, the
//! interface file and the kernel. Each step undoes the earlier ones when it
//! fails, so an error leaves the host as it was.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net};
use phantom_system::fs::{self, PRIVATE_MODE};
use phantom_system::random_bytes;
use phantom_wireguard::{
    Endpoint, InterfaceConfig, InterfaceDump, PeerConfig, PresharedKey, PrivateKey, PublicKey,
    KEY_SIZE,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PhantomConfig;
use crate::context::Context;
use crate::error::{PhantomError, Result};
use crate::features::GhostState;
use crate::interface::MainInterface;
use crate::store::{ClientRecord, DataStore};
use crate::tweaks::RESTART_AFTER_CLIENT_CHANGE;
use crate::validate;

/// A handshake newer than this many seconds counts as connected.
pub const ONLINE_THRESHOLD_SECS: i64 = 180;

/// Default page size for `list_clients`.
pub const DEFAULT_PER_PAGE: usize = 20;

/// Default count for `latest_clients`.
pub const DEFAULT_LATEST: usize = 5;

/// Public view of a stored client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Tunnel address.
    pub ip: Ipv4Addr,
    /// Client public key.
    pub public_key: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether the client may connect.
    pub enabled: bool,
}

impl From<&ClientRecord> for ClientInfo {
    fn from(record: &ClientRecord) -> Self {
        Self {
            name: record.name.clone(),
            ip: record.ip,
            public_key: record.public_key.to_base64(),
            created_at: record.created_at,
            enabled: record.enabled,
        }
    }
}

/// Ghost mode hints attached to a new client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GhostInfo {
    /// Tunnel domain.
    pub domain: String,
    /// Command the client runs to reach the server.
    pub connection_command: String,
}

/// Result of `add_client`.
#[derive(Debug, Clone, Serialize)]
pub struct AddClientResult {
    /// The new client.
    pub client: ClientInfo,
    /// Where its config was exported.
    pub config_file_path: String,
    /// Present when ghost mode is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ghost_info: Option<GhostInfo>,
}

/// Result of `remove_client`.
#[derive(Debug, Clone, Serialize)]
pub struct RemoveClientResult {
    /// Always true.
    pub removed: bool,
    /// Removed client.
    pub client_name: String,
    /// Address returned to the pool.
    pub client_ip: Ipv4Addr,
}

/// Live kernel view of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// `connected` or `offline`.
    pub status: &'static str,
    /// Time of the latest handshake.
    pub latest_handshake: Option<DateTime<Utc>>,
    /// Last seen endpoint.
    pub endpoint: Option<String>,
    /// Bytes received from the client.
    pub transfer_rx: u64,
    /// Bytes sent to the client.
    pub transfer_tx: u64,
}

impl ConnectionInfo {
    fn offline() -> Self {
        Self {
            status: "offline",
            latest_handshake: None,
            endpoint: None,
            transfer_rx: 0,
            transfer_tx: 0,
        }
    }
}

/// A client with its connection state.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Stored data.
    #[serde(flatten)]
    pub info: ClientInfo,
    /// Handshake within [`ONLINE_THRESHOLD_SECS`].
    pub connected: bool,
    /// Kernel view.
    pub connection: ConnectionInfo,
}

/// Page window of `list_clients`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    /// Current page, 1-based.
    pub page: usize,
    /// Page size.
    pub per_page: usize,
    /// Number of pages, 0 when empty.
    pub total_pages: usize,
    /// Another page follows.
    pub has_next: bool,
    /// A page precedes.
    pub has_prev: bool,
    /// 1-based index of the first shown client, 0 when none.
    pub showing_from: usize,
    /// 1-based index of the last shown client.
    pub showing_to: usize,
}

impl Pagination {
    /// Computes the window, clamping `page` into range.
    #[must_use]
    pub fn new(total: usize, page: usize, per_page: usize) -> Self {
        let per_page = per_page.max(1);
        let total_pages = total.div_ceil(per_page);
        let page = page.clamp(1, total_pages.max(1));
        let start = ((page - 1) * per_page).min(total);
        let end = (start + per_page).min(total);
        Self {
            page,
            per_page,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
            showing_from: if end > start { start + 1 } else { 0 },
            showing_to: end,
        }
    }

    fn range(&self) -> std::ops::Range<usize> {
        self.showing_from.saturating_sub(1)..self.showing_to
    }
}

/// Result of `list_clients`.
#[derive(Debug, Clone, Serialize)]
pub struct ClientList {
    /// Clients on this page.
    pub clients: Vec<ClientStatus>,
    /// Matching clients across all pages.
    pub total: usize,
    /// Window.
    pub pagination: Pagination,
    /// Search term applied.
    pub search: Option<String>,
}

/// Result of `export_client`.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedClient {
    /// Client name.
    pub client_name: String,
    /// `wg-quick` file for the client.
    pub config: String,
}

/// Result of `latest_clients`.
#[derive(Debug, Clone, Serialize)]
pub struct LatestClients {
    /// Newest first.
    pub latest_clients: Vec<ClientStatus>,
    /// Entries returned.
    pub count: usize,
    /// All stored clients.
    pub total_clients: usize,
}

/// Renders the config a client imports.
pub(crate) fn render_client_config(
    config: &PhantomConfig,
    server_key: PublicKey,
    record: &ClientRecord,
) -> String {
    let peer = PeerConfig::new(server_key)
        .with_preshared_key(record.preshared_key.clone())
        .with_endpoint(Endpoint::new(config.endpoint_host(), config.wireguard.port))
        .with_allowed_ip(IpNet::V4(Ipv4Net::default()))
        .with_keepalive(config.wireguard.keepalive);
    InterfaceConfig::new(record.private_key.clone())
        .with_address(IpNet::V4(Ipv4Net::from(record.ip)))
        .with_dns(config.dns.primary.to_string())
        .with_dns(config.dns.secondary.to_string())
        .with_mtu(config.wireguard.mtu)
        .with_peer(peer)
        .render()
}

/// Client lifecycle operations.
#[derive(Clone, Debug)]
pub struct ClientHandler {
    ctx: Context,
}

impl ClientHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Creates a client, installs its peer and exports its config.
    pub async fn add_client(&self, client_name: &str) -> Result<AddClientResult> {
        validate::client_name(client_name)?;
        let config = self.ctx.load_config()?;
        let mut store = self.ctx.open_store(&config)?;
        if store.client(client_name).is_some() {
            return Err(PhantomError::ClientExists(client_name.to_string()));
        }

        let iface = MainInterface::new(&self.ctx, config.interface());
        let original_file = iface.read_raw()?.ok_or_else(|| {
            PhantomError::Config(format!(
                "WireGuard config not found: {}",
                iface.config_path().display()
            ))
        })?;
        let mut wg = phantom_wireguard::parse_wg_config(&original_file)?;
        let store_before = store.clone();

        let private_key = PrivateKey::from_entropy(random_bytes::<KEY_SIZE>(self.ctx.random()));
        let preshared_key = PresharedKey::from_entropy(random_bytes::<KEY_SIZE>(self.ctx.random()));
        let ip = store.allocate(client_name)?;
        let record = ClientRecord {
            name: client_name.to_string(),
            ip,
            public_key: private_key.public_key(),
            private_key,
            preshared_key,
            created_at: self.ctx.clock().now(),
            enabled: true,
        };
        let peer = record.server_peer();
        store.insert_client(record.clone())?;
        store.save()?;

        wg.peers.push(peer.clone());
        if let Err(err) = iface.save(&wg) {
            restore(&iface, None, &store_before);
            return Err(err);
        }

        if let Err(err) = iface.inject_peer(&peer).await {
            warn!(client = %client_name, error = %err, "dynamic peer injection failed, restarting service");
            if let Err(restart_err) = iface.restart_and_wait().await {
                restore(&iface, Some(&original_file), &store_before);
                return Err(PhantomError::ServiceOperation(format!(
                    "Failed to apply peer for client '{client_name}': {err}; service restart failed: {restart_err}"
                )));
            }
        }

        let export_path = self.ctx.paths().client_config(client_name);
        let export = render_client_config(&config, wg.private_key.public_key(), &record);
        if let Err(err) = fs::write_atomic(&export_path, export.as_bytes(), PRIVATE_MODE) {
            if let Err(undo) = iface.remove_peer(&record.public_key).await {
                warn!(client = %client_name, error = %undo, "could not remove injected peer");
            }
            restore(&iface, Some(&original_file), &store_before);
            return Err(err.into());
        }

        if config.tweak(RESTART_AFTER_CLIENT_CHANGE) {
            if let Err(err) = iface.restart_and_wait().await {
                warn!(error = %err, "restart after client creation failed");
            }
        }

        let ghost_info = GhostState::load(&self.ctx.paths().ghost_state())
            .ok()
            .flatten()
            .filter(|g| g.enabled)
            .map(|g| GhostInfo {
                connection_command: g.connection_command(),
                domain: g.domain,
            });

        info!(client = %client_name, ip = %ip, "client added");
        Ok(AddClientResult {
            client: ClientInfo::from(&record),
            config_file_path: export_path.display().to_string(),
            ghost_info,
        })
    }

    /// Removes a client everywhere.
    pub async fn remove_client(&self, client_name: &str) -> Result<RemoveClientResult> {
        if client_name.is_empty() {
            return Err(PhantomError::MissingParameter("client_name".to_string()));
        }
        let config = self.ctx.load_config()?;
        let mut store = self.ctx.open_store(&config)?;
        let record = store
            .client(client_name)
            .cloned()
            .ok_or_else(|| PhantomError::ClientNotFound(client_name.to_string()))?;

        let iface = MainInterface::new(&self.ctx, config.interface());
        let kernel_removed = match iface.remove_peer(&record.public_key).await {
            Ok(()) => true,
            Err(err) => {
                warn!(client = %client_name, error = %err, "dynamic peer removal failed");
                false
            }
        };

        if let Err(err) = forget(&iface, &mut store, &record) {
            if kernel_removed {
                if let Err(undo) = iface.inject_peer(&record.server_peer()).await {
                    warn!(client = %client_name, error = %undo, "could not restore removed peer");
                }
            }
            return Err(err);
        }

        match fs::remove_file(&self.ctx.paths().client_config(client_name)) {
            Ok(removed) => debug!(client = %client_name, removed, "exported config deleted"),
            Err(err) => warn!(client = %client_name, error = %err, "could not delete exported config"),
        }

        if !kernel_removed || config.tweak(RESTART_AFTER_CLIENT_CHANGE) {
            if let Err(err) = iface.restart_and_wait().await {
                warn!(error = %err, "restart after client removal failed");
            }
        }

        info!(client = %client_name, ip = %record.ip, "client removed");
        Ok(RemoveClientResult {
            removed: true,
            client_name: client_name.to_string(),
            client_ip: record.ip,
        })
    }

    /// Lists clients oldest first with connection state.
    pub async fn list_clients(
        &self,
        page: usize,
        per_page: usize,
        search: Option<&str>,
    ) -> Result<ClientList> {
        if per_page == 0 {
            return Err(PhantomError::validation("per_page must be at least 1"));
        }
        let config = self.ctx.load_config()?;
        let store = self.ctx.open_store(&config)?;
        let dump = self.kernel_dump(&config).await;

        let needle = search.map(str::to_lowercase).filter(|s| !s.is_empty());
        let mut matching: Vec<&ClientRecord> = store
            .clients()
            .iter()
            .filter(|c| {
                needle
                    .as_ref()
                    .is_none_or(|n| c.name.to_lowercase().contains(n.as_str()))
            })
            .collect();
        matching.sort_by_key(|c| c.created_at);

        let pagination = Pagination::new(matching.len(), page, per_page);
        let clients = matching[pagination.range()]
            .iter()
            .map(|c| self.status_of(c, dump.as_ref()))
            .collect();

        Ok(ClientList {
            clients,
            total: matching.len(),
            pagination,
            search: search.map(str::to_string),
        })
    }

    /// Renders a client's config. Identical across calls.
    pub async fn export_client(&self, client_name: &str) -> Result<ExportedClient> {
        if client_name.is_empty() {
            return Err(PhantomError::MissingParameter("client_name".to_string()));
        }
        let config = self.ctx.load_config()?;
        let store = self.ctx.open_store(&config)?;
        let record = store
            .client(client_name)
            .ok_or_else(|| PhantomError::ClientNotFound(client_name.to_string()))?;
        let server = MainInterface::new(&self.ctx, config.interface()).load()?;
        Ok(ExportedClient {
            client_name: client_name.to_string(),
            config: render_client_config(&config, server.private_key.public_key(), record),
        })
    }

    /// Newest `count` clients.
    pub async fn latest_clients(&self, count: usize) -> Result<LatestClients> {
        let config = self.ctx.load_config()?;
        let store = self.ctx.open_store(&config)?;
        let dump = self.kernel_dump(&config).await;

        let mut all: Vec<&ClientRecord> = store.clients().iter().collect();
        all.sort_by_key(|c| c.created_at);
        all.reverse();
        let latest: Vec<ClientStatus> = all
            .iter()
            .take(count)
            .map(|c| self.status_of(c, dump.as_ref()))
            .collect();

        Ok(LatestClients {
            count: latest.len(),
            latest_clients: latest,
            total_clients: store.clients().len(),
        })
    }

    async fn kernel_dump(&self, config: &PhantomConfig) -> Option<InterfaceDump> {
        match MainInterface::new(&self.ctx, config.interface()).dump().await {
            Ok(dump) => Some(dump),
            Err(err) => {
                debug!(error = %err, "interface dump unavailable");
                None
            }
        }
    }

    fn status_of(&self, record: &ClientRecord, dump: Option<&InterfaceDump>) -> ClientStatus {
        let now = self.ctx.clock().unix();
        let connection = dump
            .and_then(|d| d.peer(&record.public_key))
            .map_or_else(ConnectionInfo::offline, |peer| {
                let online = peer
                    .latest_handshake
                    .is_some_and(|ts| now - ts <= ONLINE_THRESHOLD_SECS);
                ConnectionInfo {
                    status: if online { "connected" } else { "offline" },
                    latest_handshake: peer
                        .latest_handshake
                        .and_then(|ts| DateTime::from_timestamp(ts, 0)),
                    endpoint: peer.endpoint.clone(),
                    transfer_rx: peer.transfer_rx,
                    transfer_tx: peer.transfer_tx,
                }
            });
        ClientStatus {
            info: ClientInfo::from(record),
            connected: connection.status == "connected",
            connection,
        }
    }
}

fn restore(iface: &MainInterface<'_>, raw: Option<&str>, store: &DataStore) {
    if let Some(raw) = raw {
        if let Err(err) = iface.write_raw(raw) {
            warn!(error = %err, "could not restore interface file");
        }
    }
    if let Err(err) = store.save() {
        warn!(error = %err, "could not restore client store");
    }
}

/// Drops the client from the interface file and the store. The file is put
/// back when the store cannot be saved.
fn forget(iface: &MainInterface<'_>, store: &mut DataStore, record: &ClientRecord) -> Result<()> {
    let original_file = iface.read_raw()?;
    let mut wg = iface.load()?;
    wg.remove_peer(&record.public_key);
    iface.save(&wg)?;

    store.release(record.ip);
    store.remove_client(&record.name);
    if let Err(err) = store.save() {
        if let Some(raw) = &original_file {
            if let Err(undo) = iface.write_raw(raw) {
                warn!(error = %undo, "could not restore interface file");
            }
        }
        return Err(err);
    }
    Ok(())
}
