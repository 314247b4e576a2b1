//! Wire types for the on-gateway agent.
//!
//! The agent runs on the provisioned machine, owns the WireGuard interface,
//! and accepts full desired-state configuration pushes. It reports back what
//! is actually live so the reconciler can compare instead of blindly
//! re-applying.

use serde::{Deserialize, Serialize};

/// One peer entry as the agent sees it: a public key and its /32 address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerEntry {
    /// WireGuard public key, base64.
    pub public_key: String,
    /// Assigned address in CIDR form (e.g. "10.10.0.2/32").
    pub address: String,
}

/// The full peer set the reconciler wants live on the interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredConfig {
    /// Interface address in CIDR form (host index 1 of the gateway subnet).
    pub interface_address: String,
    /// WireGuard listen port.
    pub listen_port: u16,
    /// Complete desired peer set; the agent replaces, never merges.
    pub peers: Vec<PeerEntry>,
}

/// The peer set the agent reports as currently applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedConfig {
    /// Peers live on the interface right now.
    pub peers: Vec<PeerEntry>,
}

impl DesiredConfig {
    /// Whether the applied set already matches this desired set.
    ///
    /// Order-insensitive: the agent is free to report peers in any order.
    pub fn matches(&self, applied: &AppliedConfig) -> bool {
        if self.peers.len() != applied.peers.len() {
            return false;
        }
        let mut want = self.peers.clone();
        let mut have = applied.peers.clone();
        want.sort();
        have.sort();
        want == have
    }
}

/// Result of an interface health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceStatus {
    /// Whether the WireGuard interface is up.
    pub up: bool,
    /// The interface's public key, once generated on first boot.
    pub public_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, addr: &str) -> PeerEntry {
        PeerEntry {
            public_key: key.into(),
            address: addr.into(),
        }
    }

    #[test]
    fn matches_ignores_order() {
        let desired = DesiredConfig {
            interface_address: "10.10.0.1/24".into(),
            listen_port: 51820,
            peers: vec![entry("a", "10.10.0.2/32"), entry("b", "10.10.0.3/32")],
        };
        let applied = AppliedConfig {
            peers: vec![entry("b", "10.10.0.3/32"), entry("a", "10.10.0.2/32")],
        };
        assert!(desired.matches(&applied));
    }

    #[test]
    fn matches_detects_divergence() {
        let desired = DesiredConfig {
            interface_address: "10.10.0.1/24".into(),
            listen_port: 51820,
            peers: vec![entry("a", "10.10.0.2/32")],
        };
        assert!(!desired.matches(&AppliedConfig::default()));
        assert!(!desired.matches(&AppliedConfig {
            peers: vec![entry("a", "10.10.0.9/32")],
        }));
    }
}
