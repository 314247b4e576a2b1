use gatehouse_types::GatewayState;

use crate::store::StoreError;

/// Failures talking to the cloud provisioner.
///
/// Transient failures are retried on later reconciler ticks; fatal ones
/// (quota exhausted, unknown image, bad credentials) move the gateway to
/// `failed` and require a fresh user request.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("transient provisioner failure: {0}")]
    Transient(String),

    #[error("fatal provisioning failure: {0}")]
    Fatal(String),
}

impl ProvisionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Failures talking to the on-gateway agent. Always treated as transient:
/// the agent channel is expected to flap while machines boot or networks
/// hiccup, and the reconciler degrades the gateway rather than failing it.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("gateway agent unreachable: {0}")]
    Unreachable(String),

    #[error("agent rejected configuration: {0}")]
    Rejected(String),
}

/// Synchronous, user-facing failures from the peer registry. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("gateway already holds the maximum of {limit} peers")]
    CapacityExceeded { limit: u32 },

    #[error("gateway is {state}, not accepting peers")]
    GatewayNotReady { state: GatewayState },

    #[error("gateway not found")]
    GatewayNotFound,

    #[error("peer not found")]
    PeerNotFound,

    #[error("failed to seal peer private key")]
    KeySeal,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures from user-facing gateway lifecycle requests.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("user already has the maximum of {limit} gateways")]
    TooManyGateways { limit: u32 },

    #[error("no free subnet available for a new gateway")]
    SubnetExhausted,

    #[error("gateway not found")]
    GatewayNotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures rendering a client configuration document.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("peer has not been applied to the gateway yet")]
    PeerNotApplied,

    #[error("gateway has no public endpoint yet")]
    NoEndpoint,

    #[error("gateway interface key is not known yet")]
    MissingServerKey,

    #[error("failed to open peer private key")]
    KeyOpen,

    #[error("QR encoding failed: {0}")]
    Qr(#[from] qrcode::types::QrError),
}
