//! Collaborator traits for the infrastructure the reconciler drives.
//!
//! Both services are reached over the network and may be slow, flaky, or
//! eventually consistent; implementations are expected to carry their own
//! bounded request timeouts. The reconciler never retries inside a single
//! call; retry policy lives in the tick loop.

use std::future::Future;

use gatehouse_types::agent::{AppliedConfig, DesiredConfig, InterfaceStatus};
use gatehouse_types::cloud::{MachineDescription, MachineSpec};

use crate::error::{AgentError, ProvisionError};

/// Creates and destroys virtual machines.
pub trait CloudProvisioner: Send + Sync + 'static {
    /// Issue a create call; returns the cloud-assigned machine id. The
    /// machine is usually not reachable yet when this returns.
    fn create_machine(
        &self,
        spec: &MachineSpec,
    ) -> impl Future<Output = Result<String, ProvisionError>> + Send;

    /// Report the machine's boot state and public address.
    fn describe_machine(
        &self,
        cloud_id: &str,
    ) -> impl Future<Output = Result<MachineDescription, ProvisionError>> + Send;

    /// Request termination. Idempotent: terminating a machine that is
    /// already gone succeeds.
    fn terminate_machine(
        &self,
        cloud_id: &str,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;
}

/// The configuration agent running on a provisioned gateway, addressed by
/// the gateway's public address.
pub trait GatewayAgent: Send + Sync + 'static {
    /// Replace the interface's full peer set with `desired`.
    fn apply_config(
        &self,
        endpoint: &str,
        desired: &DesiredConfig,
    ) -> impl Future<Output = Result<AppliedConfig, AgentError>> + Send;

    /// Report the peer set currently live on the interface.
    fn current_config(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<AppliedConfig, AgentError>> + Send;

    /// Health probe: interface up/down and its public key.
    fn interface_status(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<InterfaceStatus, AgentError>> + Send;
}
