//! Wire types for the cloud provisioner.
//!
//! The provisioner is an opaque asynchronous service: machine creation is
//! acknowledged with an id long before the machine is reachable, and
//! termination may take several polls to be confirmed.

use serde::{Deserialize, Serialize};

/// Request payload for creating a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Provider region to launch in.
    pub region: String,
    /// Machine size/class, passed through verbatim.
    pub machine_class: String,
    /// Name tag for the machine, derived from the gateway id.
    pub name: String,
}

/// Coarse machine lifecycle as reported by the provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    /// Accepted but not yet booted.
    Pending,
    /// Booted and addressable.
    Active,
    /// Termination in progress.
    Stopping,
    /// No longer exists (terminated or never found).
    Gone,
}

/// Result of a describe-machine call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDescription {
    /// Current machine state.
    pub state: MachineState,
    /// Public address once assigned.
    pub public_addr: Option<String>,
}
