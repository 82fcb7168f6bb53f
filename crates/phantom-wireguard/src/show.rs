//! Parsers for the machine-readable output of `wg show`.

use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;

/// Interface line and peers from `wg show <if> dump`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceDump {
    /// Interface public key.
    pub public_key: Option<PublicKey>,
    /// Listening UDP port.
    pub listen_port: Option<u16>,
    /// One entry per configured peer.
    pub peers: Vec<PeerDump>,
}

impl InterfaceDump {
    /// Returns the peer with the given public key.
    #[must_use]
    pub fn peer(&self, key: &PublicKey) -> Option<&PeerDump> {
        self.peers.iter().find(|p| &p.public_key == key)
    }

    /// Total received bytes across peers.
    #[must_use]
    pub fn rx_bytes(&self) -> u64 {
        self.peers.iter().map(|p| p.transfer_rx).sum()
    }

    /// Total transmitted bytes across peers.
    #[must_use]
    pub fn tx_bytes(&self) -> u64 {
        self.peers.iter().map(|p| p.transfer_tx).sum()
    }
}

/// Runtime state of one peer as reported by the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerDump {
    /// Peer public key.
    pub public_key: PublicKey,
    /// Last seen endpoint, if any.
    pub endpoint: Option<String>,
    /// Allowed IPs as printed by `wg`.
    pub allowed_ips: Vec<String>,
    /// Unix time of the latest handshake, `None` if never.
    pub latest_handshake: Option<i64>,
    /// Bytes received.
    pub transfer_rx: u64,
    /// Bytes sent.
    pub transfer_tx: u64,
}

fn none_or(field: &str) -> Option<&str> {
    (field != "(none)" && !field.is_empty()).then_some(field)
}

fn bad_line(line: usize, message: &str) -> WireGuardError {
    WireGuardError::ParseError {
        line,
        message: message.to_string(),
    }
}

/// Parses `wg show <if> dump`.
///
/// The first line describes the interface (4 fields); every following line
/// describes a peer (8 fields).
pub fn parse_dump(output: &str) -> Result<InterfaceDump> {
    let mut dump = InterfaceDump::default();
    let mut lines = output.lines().filter(|l| !l.trim().is_empty()).enumerate();

    if let Some((_, header)) = lines.next() {
        let fields: Vec<&str> = header.split('\t').collect();
        if fields.len() != 4 {
            return Err(bad_line(1, "interface line must have 4 fields"));
        }
        dump.public_key = none_or(fields[1]).and_then(|k| PublicKey::from_base64(k).ok());
        dump.listen_port = fields[2].parse().ok();
    }

    for (idx, line) in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 8 {
            return Err(bad_line(idx + 1, "peer line must have 8 fields"));
        }
        let public_key = PublicKey::from_base64(fields[0])
            .map_err(|_| bad_line(idx + 1, "invalid peer public key"))?;
        let latest_handshake = fields[4].parse::<i64>().ok().filter(|ts| *ts > 0);
        dump.peers.push(PeerDump {
            public_key,
            endpoint: none_or(fields[2]).map(str::to_string),
            allowed_ips: none_or(fields[3])
                .map(|ips| ips.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            latest_handshake,
            transfer_rx: fields[5].parse().unwrap_or(0),
            transfer_tx: fields[6].parse().unwrap_or(0),
        });
    }

    Ok(dump)
}

/// Parses `wg show <if> latest-handshakes` into `(peer, unix time)` pairs.
///
/// Peers that never completed a handshake report `0` and are skipped.
#[must_use]
pub fn parse_latest_handshakes(output: &str) -> Vec<(String, i64)> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let ts = parts.next()?.parse::<i64>().ok()?;
            (ts > 0).then(|| (key.to_string(), ts))
        })
        .collect()
}
