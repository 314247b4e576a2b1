//! Persistence boundary for gateways and peers.
//!
//! The reconciler and registry only see this trait; the API server backs it
//! with Postgres, the test suite with [`memory::MemoryStore`]. The store is
//! the single shared mutable resource in the system; every mutation runs
//! under the owning gateway's lock.

pub mod memory;

use std::future::Future;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use uuid::Uuid;

use gatehouse_types::{Gateway, Peer};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("gateway not found")]
    GatewayNotFound,

    #[error("peer not found")]
    PeerNotFound,

    #[error("no addresses left in the gateway subnet")]
    AddressesExhausted,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Fields for a new gateway record; everything else starts at its
/// `requested`-state default.
#[derive(Debug, Clone)]
pub struct NewGateway {
    pub owner_id: Uuid,
    pub region: String,
    pub machine_class: String,
    pub subnet: Ipv4Network,
}

/// Fields for a new peer record; created unapplied.
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub gateway_id: Uuid,
    pub name: String,
    pub device_class: String,
    pub host_index: i32,
    pub public_key: String,
    pub private_key_enc: Vec<u8>,
    pub private_key_nonce: Vec<u8>,
}

pub trait Store: Send + Sync + 'static {
    fn create_gateway(
        &self,
        new: NewGateway,
    ) -> impl Future<Output = Result<Gateway, StoreError>> + Send;

    fn gateway(&self, id: Uuid)
    -> impl Future<Output = Result<Option<Gateway>, StoreError>> + Send;

    fn gateways_by_owner(
        &self,
        owner_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Gateway>, StoreError>> + Send;

    /// Gateways in any non-terminal state, for the scheduler tick.
    fn active_gateways(&self) -> impl Future<Output = Result<Vec<Gateway>, StoreError>> + Send;

    /// Subnets held by a user's live (non-terminal) gateways.
    fn live_subnets(
        &self,
        owner_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Ipv4Network>, StoreError>> + Send;

    /// Persist the full gateway row as given.
    fn update_gateway(&self, gateway: &Gateway)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    fn touch_reconciled(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete the gateway record; cascades to its peers.
    fn delete_gateway(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Bump and return the gateway's next host index. Monotonic: indices
    /// are never handed out twice while the gateway lives.
    fn allocate_host_index(
        &self,
        gateway_id: Uuid,
    ) -> impl Future<Output = Result<i32, StoreError>> + Send;

    fn create_peer(&self, new: NewPeer) -> impl Future<Output = Result<Peer, StoreError>> + Send;

    fn peer(&self, id: Uuid) -> impl Future<Output = Result<Option<Peer>, StoreError>> + Send;

    /// Peers of a gateway in creation order.
    fn peers_by_gateway(
        &self,
        gateway_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Peer>, StoreError>> + Send;

    fn count_peers(
        &self,
        gateway_id: Uuid,
    ) -> impl Future<Output = Result<u32, StoreError>> + Send;

    fn set_peers_applied(
        &self,
        gateway_id: Uuid,
        peer_ids: &[Uuid],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn mark_peer_removing(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete_peer(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete_peers_by_gateway(
        &self,
        gateway_id: Uuid,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
