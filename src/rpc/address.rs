//! NAT-traversal-aware address selection for dialing a peer.

use crate::discovery::Server;

/// Selects the `host:port` to dial for `peer`, given the local node's
/// region.
///
/// Rule, in order:
/// - No region configured on the peer: prefer external if present, else
///   internal.
/// - Peer's region equals `local_region`, or the peer has no external
///   address: internal.
/// - Peer's region differs from `local_region` and an external address is
///   present: external.
///
/// Returns `None` when neither an internal nor an external address is
/// available.
#[must_use]
pub fn select_address(peer: &Server, local_region: &str) -> Option<(String, String)> {
    match peer.region() {
        None => peer.external_addr().or_else(|| peer.internal_addr()),
        Some(region) if region == local_region => peer.internal_addr(),
        Some(_) if peer.external_addr().is_none() => peer.internal_addr(),
        Some(_) => peer.external_addr(),
    }
}
