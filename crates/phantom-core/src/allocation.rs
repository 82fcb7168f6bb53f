//! Address arithmetic for the client subnet.
//!
//! # Layout
//!
//! ```text
//! 10.8.0.0/24
//! 10.8.0.0     - network
//! 10.8.0.1     - server (first usable host)
//! 10.8.0.2-254 - clients, lowest free first
//! 10.8.0.255   - broadcast
//! ```

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Address the server takes in `subnet`.
#[must_use]
pub fn server_address(subnet: Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()).saturating_add(1))
}

/// Number of usable host addresses (excluding network and broadcast).
#[must_use]
pub fn usable_hosts(subnet: Ipv4Net) -> u32 {
    let size = 1u64 << (32 - u32::from(subnet.prefix_len()));
    u32::try_from(size.saturating_sub(2)).unwrap_or(u32::MAX)
}

/// Client capacity: usable hosts minus the server.
#[must_use]
pub fn client_capacity(subnet: Ipv4Net) -> u32 {
    usable_hosts(subnet).saturating_sub(1)
}

/// Usable hosts a subnet must offer to hold `clients` with 20% headroom
/// plus the server: `ceil(1.2 * clients) + 1`.
#[must_use]
pub fn required_hosts(clients: usize) -> u64 {
    let clients = clients as u64;
    (clients * 6).div_ceil(5) + 1
}

/// Lowest client address in `subnet` not present in `taken`.
#[must_use]
pub fn first_free(subnet: Ipv4Net, taken: &BTreeSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    let server = server_address(subnet);
    subnet
        .hosts()
        .find(|ip| *ip != server && !taken.contains(ip))
}

/// Assigns new addresses when moving to `new_subnet`: the server gets the
/// first host and clients follow in ascending order of their old address.
///
/// Returns `(name, old, new)` triples, or `None` if `new_subnet` is too
/// small.
#[must_use]
pub fn remap(
    clients: &[(String, Ipv4Addr)],
    new_subnet: Ipv4Net,
) -> Option<Vec<(String, Ipv4Addr, Ipv4Addr)>> {
    let mut sorted: Vec<&(String, Ipv4Addr)> = clients.iter().collect();
    sorted.sort_by_key(|(_, ip)| u32::from(*ip));

    let server = server_address(new_subnet);
    let mut hosts = new_subnet.hosts().filter(|ip| *ip != server);
    sorted
        .into_iter()
        .map(|(name, old)| hosts.next().map(|new| (name.clone(), *old, new)))
        .collect()
}

/// Returns true if both networks share at least one address.
#[must_use]
pub fn overlaps(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Returns true if the network lies entirely inside RFC 1918 space.
#[must_use]
pub fn is_rfc1918(net: Ipv4Net) -> bool {
    const PRIVATE: [(Ipv4Addr, u8); 3] = [
        (Ipv4Addr::new(10, 0, 0, 0), 8),
        (Ipv4Addr::new(172, 16, 0, 0), 12),
        (Ipv4Addr::new(192, 168, 0, 0), 16),
    ];
    PRIVATE.iter().any(|(addr, prefix)| {
        Ipv4Net::new(*addr, *prefix)
            .map(|block| block.contains(&net))
            .unwrap_or(false)
    })
}
