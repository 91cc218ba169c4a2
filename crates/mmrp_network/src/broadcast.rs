//! Broadcast flooding — routing styles and per-hop target selection.
//!
//! A broadcast never carries global topology. Each hop forwards to the peers
//! it knows about that are not already on the envelope's return route, and
//! appends a marker telling the next hop how far to keep flooding.

use std::fmt;

use crate::connection::{ClientConnection, RelayConnection};

/// How far a broadcast is forwarded from the current hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RoutingStyle {
    /// Peer relays and own clients (`*`).
    #[default]
    All,
    /// Peer relays only (`*:r`).
    Relays,
    /// Own clients only (`*:c`).
    Clients,
}

impl RoutingStyle {
    pub const ALL_MARKER: &'static str = "*";
    pub const RELAYS_MARKER: &'static str = "*:r";
    pub const CLIENTS_MARKER: &'static str = "*:c";

    /// Parse a route hop as a broadcast marker.
    pub fn from_marker(hop: &str) -> Option<Self> {
        match hop {
            Self::ALL_MARKER => Some(Self::All),
            Self::RELAYS_MARKER => Some(Self::Relays),
            Self::CLIENTS_MARKER => Some(Self::Clients),
            _ => None,
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            Self::All => Self::ALL_MARKER,
            Self::Relays => Self::RELAYS_MARKER,
            Self::Clients => Self::CLIENTS_MARKER,
        }
    }

    fn includes_relays(self) -> bool {
        matches!(self, Self::All | Self::Relays)
    }

    fn includes_clients(self) -> bool {
        matches!(self, Self::All | Self::Clients)
    }
}

impl fmt::Display for RoutingStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Routes to forward a broadcast along from this hop.
///
/// Peers whose identity already appears on `return_route` are skipped so a
/// broadcast never travels back toward where it came from. Relay targets get
/// a continuation marker: `*:c` when this node is a relay (the peer only
/// tells its clients), `*` when this node is a pure client handing the
/// broadcast up to its relay.
pub fn broadcast_targets<'a, R, C>(
    style: RoutingStyle,
    is_relay: bool,
    relays: R,
    clients: C,
    return_route: &[String],
) -> Vec<Vec<String>>
where
    R: IntoIterator<Item = &'a RelayConnection>,
    C: IntoIterator<Item = &'a ClientConnection>,
{
    let seen = |identity: Option<&str>| match identity {
        Some(identity) => return_route.iter().any(|hop| hop == identity),
        None => true,
    };
    let continuation = if is_relay {
        RoutingStyle::Clients
    } else {
        RoutingStyle::All
    };

    let mut targets = Vec::new();

    if style.includes_relays() {
        for relay in relays {
            if seen(relay.identity()) {
                continue;
            }
            let mut route = relay.route.clone();
            route.push(continuation.marker().to_string());
            targets.push(route);
        }
    }

    if style.includes_clients() {
        for client in clients {
            if seen(client.identity()) {
                continue;
            }
            targets.push(client.route.clone());
        }
    }

    targets
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(id: &str) -> RelayConnection {
        RelayConnection::new(Some(format!("mem://{id}")), vec![id.to_string()], 1)
    }

    fn client(id: &str) -> ClientConnection {
        ClientConnection::new(vec![id.to_string()])
    }

    fn route(hops: &[&str]) -> Vec<String> {
        hops.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_marker_parsing() {
        assert_eq!(RoutingStyle::from_marker("*"), Some(RoutingStyle::All));
        assert_eq!(RoutingStyle::from_marker("*:r"), Some(RoutingStyle::Relays));
        assert_eq!(RoutingStyle::from_marker("*:c"), Some(RoutingStyle::Clients));
        assert_eq!(RoutingStyle::from_marker("*:x"), None);
        assert_eq!(RoutingStyle::default().to_string(), "*");
    }

    #[test]
    fn test_loop_prevention_skips_return_route() {
        let relays = [relay("B"), relay("C")];
        let clients = [client("X")];

        let mut targets =
            broadcast_targets(RoutingStyle::All, true, &relays, &clients, &route(&["B"]));
        targets.sort();

        assert_eq!(targets, vec![route(&["C", "*:c"]), route(&["X"])]);
    }

    #[test]
    fn test_styles_limit_targets() {
        let relays = [relay("B")];
        let clients = [client("X")];

        let only_relays = broadcast_targets(RoutingStyle::Relays, true, &relays, &clients, &[]);
        assert_eq!(only_relays, vec![route(&["B", "*:c"])]);

        let only_clients = broadcast_targets(RoutingStyle::Clients, true, &relays, &clients, &[]);
        assert_eq!(only_clients, vec![route(&["X"])]);
    }

    #[test]
    fn test_pure_client_hands_up_with_full_flood() {
        let relays = [relay("A")];
        let clients: [ClientConnection; 0] = [];
        let targets =
            broadcast_targets(RoutingStyle::All, false, &relays, &clients, &route(&["X"]));
        assert_eq!(targets, vec![route(&["A", "*"])]);
    }

    #[test]
    fn test_multi_hop_client_route() {
        let far_client = ClientConnection::new(route(&["gw", "Y"]));
        let relays: [RelayConnection; 0] = [];
        let targets = broadcast_targets(RoutingStyle::Clients, true, &relays, [&far_client], &[]);
        assert_eq!(targets, vec![route(&["gw", "Y"])]);

        let skipped =
            broadcast_targets(RoutingStyle::Clients, true, &relays, [&far_client], &route(&["Y"]));
        assert!(skipped.is_empty());
    }
}
