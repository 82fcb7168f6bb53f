//! Reading and writing wg-quick configuration files.
//!
//! This module handles the INI-style format shared by `wg setconf` and
//! `wg-quick`. `wg-quick` only keys (`Address`, `DNS`, `MTU`, hooks) are kept
//! on [`InterfaceConfig`] so a file can be edited and written back without
//! losing anything; [`InterfaceConfig::render_kernel`] drops them again for
//! `wg setconf`.

use std::fmt::{self, Write as FmtWrite};

use ipnet::IpNet;

use crate::error::{Result, WireGuardError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::types::{parse_cidr, Endpoint};

/// Keepalive interval applied to upstream exits used for multihop.
pub const MULTIHOP_KEEPALIVE: u16 = 5;

/// An `[Interface]` section together with its peers.
#[derive(Clone, Debug)]
pub struct InterfaceConfig {
    /// Secret key of this interface.
    pub private_key: PrivateKey,
    /// UDP port; unset lets the kernel choose.
    pub listen_port: Option<u16>,
    /// Optional firewall mark, kept verbatim (`off`, decimal or hex).
    pub fwmark: Option<String>,
    /// `Address` entries (wg-quick only).
    pub addresses: Vec<IpNet>,
    /// DNS servers or search domains.
    pub dns: Vec<String>,
    /// Optional MTU.
    pub mtu: Option<u16>,
    /// `PostUp` hook commands, in file order.
    pub post_up: Vec<String>,
    /// `PostDown` hook commands, in file order.
    pub post_down: Vec<String>,
    /// Any other `[Interface]` keys, preserved verbatim.
    pub extra: Vec<(String, String)>,
    /// `[Peer]` sections in file order.
    pub peers: Vec<PeerConfig>,
}

impl InterfaceConfig {
    /// An interface with only its key set.
    #[must_use]
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            private_key,
            listen_port: None,
            fwmark: None,
            addresses: Vec::new(),
            dns: Vec::new(),
            mtu: None,
            post_up: Vec::new(),
            post_down: Vec::new(),
            extra: Vec::new(),
            peers: Vec::new(),
        }
    }

    /// Builder for [`Self::listen_port`].
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Adds an address.
    #[must_use]
    pub fn with_address(mut self, address: IpNet) -> Self {
        self.addresses.push(address);
        self
    }

    /// Adds a DNS server.
    #[must_use]
    pub fn with_dns(mut self, dns: impl Into<String>) -> Self {
        self.dns.push(dns.into());
        self
    }

    /// Builder for [`Self::mtu`].
    #[must_use]
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Appends a peer.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// Returns the peer with the given public key.
    #[must_use]
    pub fn find_peer(&self, key: &PublicKey) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| &p.public_key == key)
    }

    /// Removes and returns the peer with the given public key.
    pub fn remove_peer(&mut self, key: &PublicKey) -> Option<PeerConfig> {
        let idx = self.peers.iter().position(|p| &p.public_key == key)?;
        Some(self.peers.remove(idx))
    }

    /// Returns the first IPv4 address of the interface.
    #[must_use]
    pub fn ipv4_address(&self) -> Option<IpNet> {
        self.addresses
            .iter()
            .copied()
            .find(|a| matches!(a, IpNet::V4(_)))
    }

    /// Text for `wg-quick`, with every key this value holds.
    #[must_use]
    pub fn render(&self) -> String {
        self.render_with(false)
    }

    /// Text for `wg setconf`: wg-quick keys and peer labels are left out.
    #[must_use]
    pub fn render_kernel(&self) -> String {
        self.render_with(true)
    }

    fn render_with(&self, kernel: bool) -> String {
        let mut out = String::from("[Interface]\n");
        entry(&mut out, "PrivateKey", self.private_key.to_base64());
        if !kernel && !self.addresses.is_empty() {
            entry(&mut out, "Address", join(&self.addresses));
        }
        if let Some(port) = self.listen_port {
            entry(&mut out, "ListenPort", port);
        }
        if let Some(mark) = &self.fwmark {
            entry(&mut out, "FwMark", mark);
        }
        if !kernel {
            if !self.dns.is_empty() {
                entry(&mut out, "DNS", self.dns.join(", "));
            }
            if let Some(mtu) = self.mtu {
                entry(&mut out, "MTU", mtu);
            }
            for (key, value) in &self.extra {
                entry(&mut out, key, value);
            }
            for hook in &self.post_up {
                entry(&mut out, "PostUp", hook);
            }
            for hook in &self.post_down {
                entry(&mut out, "PostDown", hook);
            }
        }
        for peer in &self.peers {
            out.push('\n');
            peer.render_into(&mut out, kernel);
        }
        out
    }
}

fn entry(out: &mut String, key: &str, value: impl fmt::Display) {
    // Writing to a String cannot fail.
    let _ = writeln!(out, "{key} = {value}");
}

impl fmt::Display for InterfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// One `[Peer]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    /// Label written as a comment directly under `[Peer]`.
    pub name: Option<String>,
    /// Identity of the peer.
    pub public_key: PublicKey,
    /// Extra symmetric key, when configured.
    pub preshared_key: Option<PresharedKey>,
    /// Source addresses accepted from, and routed to, this peer.
    pub allowed_ips: Vec<IpNet>,
    /// Optional endpoint.
    pub endpoint: Option<Endpoint>,
    /// Optional persistent keepalive interval in seconds; 0 means off.
    pub persistent_keepalive: Option<u16>,
    /// Any other `[Peer]` keys, preserved verbatim.
    pub extra: Vec<(String, String)>,
}

impl PeerConfig {
    /// A peer with only its key set.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            name: None,
            public_key,
            preshared_key: None,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
            extra: Vec::new(),
        }
    }

    /// Sets the comment label.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder for [`Self::preshared_key`].
    #[must_use]
    pub fn with_preshared_key(mut self, key: PresharedKey) -> Self {
        self.preshared_key = Some(key);
        self
    }

    /// Adds an allowed IP.
    #[must_use]
    pub fn with_allowed_ip(mut self, net: IpNet) -> Self {
        self.allowed_ips.push(net);
        self
    }

    /// Builder for [`Self::endpoint`].
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Builder for [`Self::persistent_keepalive`].
    #[must_use]
    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }

    /// Returns true if any allowed IP is the IPv4 default route.
    #[must_use]
    pub fn routes_all_ipv4(&self) -> bool {
        self.allowed_ips
            .iter()
            .any(|net| matches!(net, IpNet::V4(v4) if v4.prefix_len() == 0))
    }

    fn render_into(&self, out: &mut String, kernel: bool) {
        out.push_str("[Peer]\n");
        if let (false, Some(label)) = (kernel, &self.name) {
            out.push_str(&format!("# {label}\n"));
        }
        entry(out, "PublicKey", self.public_key);
        if let Some(psk) = &self.preshared_key {
            entry(out, "PresharedKey", psk.to_base64());
        }
        if !self.allowed_ips.is_empty() {
            entry(out, "AllowedIPs", join(&self.allowed_ips));
        }
        if let Some(endpoint) = &self.endpoint {
            entry(out, "Endpoint", endpoint);
        }
        if let Some(secs) = self.persistent_keepalive {
            entry(out, "PersistentKeepalive", secs);
        }
        if !kernel {
            for (key, value) in &self.extra {
                entry(out, key, value);
            }
        }
    }
}

fn join(nets: &[IpNet]) -> String {
    nets.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// What [`enhance_keepalive`] did to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepaliveChange {
    /// No keepalive was configured.
    Added,
    /// Keepalive was explicitly disabled.
    Enabled,
    /// Keepalive was too slow to hold NAT state.
    Optimized {
        /// Previous interval in seconds.
        from: u16,
    },
    /// Existing interval was acceptable.
    Kept(u16),
}

impl KeepaliveChange {
    /// Returns true if the peer was modified.
    #[must_use]
    pub const fn modified(self) -> bool {
        !matches!(self, Self::Kept(_))
    }
}

impl fmt::Display for KeepaliveChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(
                f,
                "Added PersistentKeepalive = {MULTIHOP_KEEPALIVE} for multihop stability"
            ),
            Self::Enabled => write!(
                f,
                "Enabled PersistentKeepalive = {MULTIHOP_KEEPALIVE} (was disabled)"
            ),
            Self::Optimized { from } => write!(
                f,
                "Optimized PersistentKeepalive: {from}s -> {MULTIHOP_KEEPALIVE}s"
            ),
            Self::Kept(secs) => write!(f, "Kept existing PersistentKeepalive = {secs}s"),
        }
    }
}

/// Normalises a peer's keepalive for use as a multihop exit: missing, zero
/// or longer than 60 seconds becomes [`MULTIHOP_KEEPALIVE`].
pub fn enhance_keepalive(peer: &mut PeerConfig) -> KeepaliveChange {
    let change = match peer.persistent_keepalive {
        None => KeepaliveChange::Added,
        Some(0) => KeepaliveChange::Enabled,
        Some(secs) if secs > 60 => KeepaliveChange::Optimized { from: secs },
        Some(secs) => KeepaliveChange::Kept(secs),
    };
    if change.modified() {
        peer.persistent_keepalive = Some(MULTIHOP_KEEPALIVE);
    }
    change
}

/// One `[Section]` of a config file with its `key = value` lines.
struct Block<'a> {
    header: &'a str,
    line: usize,
    label: Option<&'a str>,
    entries: Vec<Entry<'a>>,
}

struct Entry<'a> {
    line: usize,
    name: &'a str,
    key: String,
    value: &'a str,
}

fn parse_error(line: usize, message: impl Into<String>) -> WireGuardError {
    WireGuardError::ParseError {
        line,
        message: message.into(),
    }
}

fn invalid(line: usize, what: &str, value: &str) -> WireGuardError {
    parse_error(line, format!("invalid {what}: {value}"))
}

/// Splits the text into sections. A comment that precedes a section's first
/// key becomes its label.
fn split_blocks(text: &str) -> Result<Vec<Block<'_>>> {
    let mut blocks: Vec<Block<'_>> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(comment) = trimmed.strip_prefix('#') {
            if let Some(block) = blocks.last_mut() {
                let comment = comment.trim();
                if block.entries.is_empty() && block.label.is_none() && !comment.is_empty() {
                    block.label = Some(comment);
                }
            }
            continue;
        }
        if let Some(header) = trimmed.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            blocks.push(Block {
                header: header.trim(),
                line,
                label: None,
                entries: Vec::new(),
            });
            continue;
        }
        let (key, value) = trimmed
            .split_once('=')
            .ok_or_else(|| parse_error(line, format!("expected key = value, got: {trimmed}")))?;
        let block = blocks
            .last_mut()
            .ok_or_else(|| parse_error(line, "key-value pair outside of section"))?;
        let name = key.trim();
        block.entries.push(Entry {
            line,
            name,
            key: name.to_ascii_lowercase(),
            value: value.trim(),
        });
    }
    Ok(blocks)
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn nets(entry: &Entry<'_>, what: &str) -> Result<Vec<IpNet>> {
    list(entry.value)
        .map(|s| parse_cidr(s).ok_or_else(|| invalid(entry.line, what, s)))
        .collect()
}

fn number<T: std::str::FromStr>(entry: &Entry<'_>, what: &str) -> Result<T> {
    entry
        .value
        .parse()
        .map_err(|_| invalid(entry.line, what, entry.value))
}

impl<'a> Block<'a> {
    /// Last occurrence wins, as with `wg setconf`.
    fn last(&self, key: &str) -> Option<&Entry<'a>> {
        self.entries.iter().rev().find(|e| e.key == key)
    }
}

impl Entry<'_> {
    fn verbatim(&self) -> (String, String) {
        (self.name.to_string(), self.value.to_string())
    }
}

/// Parses a `wg`/`wg-quick` configuration file.
///
/// Keys are matched case-insensitively. A comment directly under `[Peer]`
/// (before any key) becomes the peer's name.
pub fn parse_wg_config(text: &str) -> Result<InterfaceConfig> {
    let mut interface: Option<InterfaceConfig> = None;
    let mut peers = Vec::new();
    for block in split_blocks(text)? {
        if block.header.eq_ignore_ascii_case("interface") {
            interface = Some(interface_from(&block)?);
        } else if block.header.eq_ignore_ascii_case("peer") {
            peers.push(peer_from(&block)?);
        } else {
            return Err(parse_error(
                block.line,
                format!("unknown section: {}", block.header),
            ));
        }
    }
    let mut config = interface.ok_or_else(|| parse_error(0, "missing [Interface] section"))?;
    config.peers = peers;
    Ok(config)
}

fn interface_from(block: &Block<'_>) -> Result<InterfaceConfig> {
    let entry = block
        .last("privatekey")
        .ok_or_else(|| parse_error(block.line, "missing PrivateKey in [Interface] section"))?;
    let private_key = PrivateKey::from_base64(entry.value)
        .map_err(|_| invalid(entry.line, "PrivateKey", "<redacted>"))?;
    let mut config = InterfaceConfig::new(private_key);
    for entry in &block.entries {
        match entry.key.as_str() {
            "privatekey" => {}
            "listenport" => config.listen_port = Some(number(entry, "ListenPort")?),
            "fwmark" => config.fwmark = Some(entry.value.to_string()),
            "address" => config.addresses.extend(nets(entry, "Address")?),
            "dns" => config.dns.extend(list(entry.value).map(str::to_string)),
            "mtu" => config.mtu = Some(number(entry, "MTU")?),
            "postup" => config.post_up.push(entry.value.to_string()),
            "postdown" => config.post_down.push(entry.value.to_string()),
            _ => config.extra.push(entry.verbatim()),
        }
    }
    Ok(config)
}

fn peer_from(block: &Block<'_>) -> Result<PeerConfig> {
    let entry = block
        .last("publickey")
        .ok_or_else(|| parse_error(block.line, "missing PublicKey in [Peer] section"))?;
    let public_key = PublicKey::from_base64(entry.value)
        .map_err(|_| invalid(entry.line, "PublicKey", entry.value))?;
    let mut peer = PeerConfig::new(public_key);
    peer.name = block.label.map(str::to_string);
    for entry in &block.entries {
        match entry.key.as_str() {
            "publickey" => {}
            "presharedkey" => {
                let key = PresharedKey::from_base64(entry.value)
                    .map_err(|_| invalid(entry.line, "PresharedKey", "<redacted>"))?;
                peer.preshared_key = Some(key);
            }
            "allowedips" => peer.allowed_ips.extend(nets(entry, "AllowedIPs")?),
            "endpoint" => {
                let endpoint = entry
                    .value
                    .parse()
                    .map_err(|_| invalid(entry.line, "Endpoint", entry.value))?;
                peer.endpoint = Some(endpoint);
            }
            "persistentkeepalive" if entry.value.eq_ignore_ascii_case("off") => {
                peer.persistent_keepalive = Some(0);
            }
            "persistentkeepalive" => {
                peer.persistent_keepalive = Some(number(entry, "PersistentKeepalive")?);
            }
            _ => peer.extra.push(entry.verbatim()),
        }
    }
    Ok(peer)
}
