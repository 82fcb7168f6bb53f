//! Client and IP allocation database.
//!
//! A single JSON document with three collections: `clients`,
//! `ip_allocations` and a `config` document holding the subnet the
//! allocations belong to. The whole document is rewritten atomically on
//! every save, so a clone taken before a mutation is a complete rollback
//! point.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use phantom_system::fs::{self, PRIVATE_MODE};
use phantom_wireguard::{PeerConfig, PresharedKey, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allocation::{first_free, server_address};
use crate::error::{PhantomError, Result};

/// Owner recorded for the server's own address.
pub const SERVER_OWNER: &str = "__server__";

/// A stored client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Unique name.
    pub name: String,
    /// Tunnel address.
    pub ip: Ipv4Addr,
    /// Client public key.
    pub public_key: PublicKey,
    /// Client private key, needed to export its config.
    pub private_key: PrivateKey,
    /// Preshared key shared with the server.
    pub preshared_key: PresharedKey,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether the client may connect.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

const fn enabled_default() -> bool {
    true
}

impl ClientRecord {
    /// The `[Peer]` block the server holds for this client.
    #[must_use]
    pub fn server_peer(&self) -> PeerConfig {
        PeerConfig::new(self.public_key)
            .with_name(self.name.clone())
            .with_preshared_key(self.preshared_key.clone())
            .with_allowed_ip(Ipv4Net::from(self.ip).into())
    }
}

/// Store-level configuration document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Subnet the allocations were made from.
    pub subnet: Option<Ipv4Net>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    clients: Vec<ClientRecord>,
    #[serde(default)]
    ip_allocations: BTreeMap<Ipv4Addr, String>,
    #[serde(default)]
    config: StoreConfig,
}

/// File-backed client store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataStore {
    path: PathBuf,
    doc: Document,
}

impl DataStore {
    /// Opens the store, creating an empty one for `default_subnet` if the
    /// file does not exist. The server allocation is always present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn open(path: &Path, default_subnet: Ipv4Net) -> Result<Self> {
        let doc: Document = fs::read_json(path)?.unwrap_or_default();
        let mut store = Self {
            path: path.to_path_buf(),
            doc,
        };
        if store.doc.config.subnet.is_none() {
            store.doc.config.subnet = Some(default_subnet);
        }
        let server = server_address(store.subnet());
        store
            .doc
            .ip_allocations
            .entry(server)
            .or_insert_with(|| SERVER_OWNER.to_string());
        Ok(store)
    }

    /// Writes the whole document.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        fs::write_json(&self.path, &self.doc, PRIVATE_MODE)?;
        debug!(path = %self.path.display(), clients = self.doc.clients.len(), "store saved");
        Ok(())
    }

    /// Subnet allocations are drawn from.
    #[must_use]
    pub fn subnet(&self) -> Ipv4Net {
        self.doc.config.subnet.unwrap_or_default()
    }

    /// All clients in insertion order.
    #[must_use]
    pub fn clients(&self) -> &[ClientRecord] {
        &self.doc.clients
    }

    /// Looks up a client by name.
    #[must_use]
    pub fn client(&self, name: &str) -> Option<&ClientRecord> {
        self.doc.clients.iter().find(|c| c.name == name)
    }

    /// IP to owner map.
    #[must_use]
    pub fn allocations(&self) -> &BTreeMap<Ipv4Addr, String> {
        &self.doc.ip_allocations
    }

    /// Reserves the lowest free address for `owner`.
    ///
    /// # Errors
    ///
    /// [`PhantomError::IpAllocation`] when the subnet is full.
    pub fn allocate(&mut self, owner: &str) -> Result<Ipv4Addr> {
        let subnet = self.subnet();
        let taken: BTreeSet<Ipv4Addr> = self.doc.ip_allocations.keys().copied().collect();
        let ip = first_free(subnet, &taken).ok_or_else(|| {
            PhantomError::IpAllocation(format!("No available IP addresses in {subnet}"))
        })?;
        self.doc.ip_allocations.insert(ip, owner.to_string());
        Ok(ip)
    }

    /// Frees an address; returns whether it was allocated.
    pub fn release(&mut self, ip: Ipv4Addr) -> bool {
        self.doc.ip_allocations.remove(&ip).is_some()
    }

    /// Adds a client record.
    ///
    /// # Errors
    ///
    /// [`PhantomError::ClientExists`] if the name is taken.
    pub fn insert_client(&mut self, record: ClientRecord) -> Result<()> {
        if self.client(&record.name).is_some() {
            return Err(PhantomError::ClientExists(record.name));
        }
        self.doc.clients.push(record);
        Ok(())
    }

    /// Removes and returns a client record.
    pub fn remove_client(&mut self, name: &str) -> Option<ClientRecord> {
        let idx = self.doc.clients.iter().position(|c| c.name == name)?;
        Some(self.doc.clients.remove(idx))
    }

    /// Moves every client to the address in `mapping` and rebuilds the
    /// allocation table for `new_subnet`.
    ///
    /// # Errors
    ///
    /// [`PhantomError::IpAllocation`] if a client is missing from `mapping`.
    pub fn readdress(
        &mut self,
        new_subnet: Ipv4Net,
        mapping: &BTreeMap<String, Ipv4Addr>,
    ) -> Result<()> {
        let mut allocations = BTreeMap::new();
        allocations.insert(server_address(new_subnet), SERVER_OWNER.to_string());
        for client in &mut self.doc.clients {
            let new_ip = mapping.get(&client.name).ok_or_else(|| {
                PhantomError::IpAllocation(format!("No new address for client '{}'", client.name))
            })?;
            client.ip = *new_ip;
            allocations.insert(*new_ip, client.name.clone());
        }
        self.doc.ip_allocations = allocations;
        self.doc.config.subnet = Some(new_subnet);
        Ok(())
    }
}
