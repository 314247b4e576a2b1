//! gatehouse-types: Shared data model for the gatehouse ecosystem.
//!
//! This crate contains the gateway/peer lifecycle model and the wire types
//! exchanged with the cloud provisioner and the on-gateway agent. It is
//! shared between the reconciler core and the API server.

#![warn(missing_docs)]

pub mod agent;
pub mod cloud;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a [`Gateway`].
///
/// Transitions are driven exclusively by the reconciler:
/// `requested → provisioning → running ↔ degraded → terminating → terminated`,
/// with `failed` terminal and reachable from `requested` or `provisioning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// Persisted, no cloud resource issued yet.
    Requested,
    /// Machine create issued; waiting for boot + interface up.
    Provisioning,
    /// Machine active and the agent confirms the interface is up.
    Running,
    /// Agent unreachable for too many consecutive health polls.
    Degraded,
    /// User-initiated teardown in progress.
    Terminating,
    /// Teardown finished (possibly unconfirmed by the cloud).
    Terminated,
    /// Terminal provisioning failure; requires a fresh user request.
    Failed,
}

impl GatewayState {
    /// No reconciliation work is ever scheduled for a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Whether the gateway accepts peer registrations.
    pub fn accepts_peers(self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }

    /// Stable string form, used for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a persisted [`GatewayState`] string.
#[derive(Debug, thiserror::Error)]
#[error("unknown gateway state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for GatewayState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "provisioning" => Ok(Self::Provisioning),
            "running" => Ok(Self::Running),
            "degraded" => Ok(Self::Degraded),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// One cloud VM hosting one WireGuard interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning user.
    pub owner_id: Uuid,
    /// Provider-specific region string (e.g. "us-east-1").
    pub region: String,
    /// Provider-specific machine size/class (e.g. "t3.micro").
    pub machine_class: String,
    /// Current lifecycle state.
    pub state: GatewayState,
    /// Human-readable reason for `failed`/`degraded`, when known.
    pub state_reason: Option<String>,
    /// Cloud-assigned machine id, set once the create call is issued.
    pub cloud_id: Option<String>,
    /// Public address, set once the machine reports one.
    pub public_addr: Option<String>,
    /// The gateway interface's WireGuard public key, reported by the agent.
    pub public_key: Option<String>,
    /// Subnet the gateway owns. The interface itself takes host index 1.
    pub subnet: Ipv4Network,
    /// Highest host index handed out so far; allocation is monotonic.
    pub next_host_index: i32,
    /// When the gateway was requested.
    pub created_at: DateTime<Utc>,
    /// Last time the reconciler acted on this gateway.
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

/// One client device registered against exactly one [`Gateway`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning gateway; the gateway's deletion cascades to its peers.
    pub gateway_id: Uuid,
    /// Display name (e.g. "Dad's laptop").
    pub name: String,
    /// Free-form device tag (phone, laptop, tablet, ...).
    pub device_class: String,
    /// Host index within the gateway subnet; unique and never reused.
    pub host_index: i32,
    /// WireGuard public key, base64.
    pub public_key: String,
    /// Private key sealed with AES-256-GCM; never serialized outward.
    #[serde(skip)]
    pub private_key_enc: Vec<u8>,
    /// Nonce used to seal the private key.
    #[serde(skip)]
    pub private_key_nonce: Vec<u8>,
    /// Whether the agent has confirmed this peer live on the interface.
    pub applied: bool,
    /// Marked for removal; deleted once a push excluding it is confirmed.
    pub removing: bool,
    /// When this peer was allocated.
    pub created_at: DateTime<Utc>,
}
