// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Peer allocation within a gateway's subnet.
//!
//! The registry owns address assignment and key material; it never talks to
//! the agent itself. Converging the live peer set is the reconciler's job,
//! so every mutation here just enqueues a push and returns.

use std::sync::Arc;

use uuid::Uuid;

use gatehouse_types::agent::{DesiredConfig, PeerEntry};
use gatehouse_types::{Gateway, Peer};

use crate::error::RegistryError;
use crate::keys::{self, RevealOnce};
use crate::lock::GatewayLocks;
use crate::queue::{PushQueues, PushReason};
use crate::settings::ReconcilerSettings;
use crate::store::{NewPeer, Store, StoreError};
use crate::subnet;

/// Result of a successful allocation. The private key is readable exactly
/// once; afterwards only the sealed copy in the store remains.
#[derive(Debug)]
pub struct PeerCreated {
    pub peer: Peer,
    pub private_key: RevealOnce,
}

/// The desired peer set for one gateway, with the store ids behind it.
#[derive(Debug)]
pub(crate) struct DesiredSet {
    pub config: DesiredConfig,
    /// Peers the config includes; marked applied after a confirmed push.
    pub included: Vec<Uuid>,
    /// Peers excluded because they are marked removing; deleted after a
    /// confirmed push.
    pub removing: Vec<Uuid>,
}

/// Build the full desired peer set for a gateway from the store.
pub(crate) async fn desired_set<S: Store>(
    store: &S,
    gateway: &Gateway,
    listen_port: u16,
) -> Result<DesiredSet, StoreError> {
    let mut entries = Vec::new();
    let mut included = Vec::new();
    let mut removing = Vec::new();

    for peer in store.peers_by_gateway(gateway.id).await? {
        if peer.removing {
            removing.push(peer.id);
            continue;
        }
        entries.push(PeerEntry {
            public_key: peer.public_key.clone(),
            address: format!("{}/32", subnet::host_address(gateway.subnet, peer.host_index)),
        });
        included.push(peer.id);
    }

    Ok(DesiredSet {
        config: DesiredConfig {
            interface_address: format!(
                "{}/{}",
                subnet::gateway_address(gateway.subnet),
                gateway.subnet.prefix()
            ),
            listen_port,
            peers: entries,
        },
        included,
        removing,
    })
}

pub struct Registry<S> {
    store: Arc<S>,
    locks: Arc<GatewayLocks>,
    queues: Arc<PushQueues>,
    settings: Arc<ReconcilerSettings>,
    key_secret: [u8; 32],
}

impl<S> Clone for Registry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            queues: Arc::clone(&self.queues),
            settings: Arc::clone(&self.settings),
            key_secret: self.key_secret,
        }
    }
}

impl<S: Store> Registry<S> {
    pub fn new(
        store: Arc<S>,
        locks: Arc<GatewayLocks>,
        queues: Arc<PushQueues>,
        settings: Arc<ReconcilerSettings>,
        key_secret: [u8; 32],
    ) -> Self {
        Self {
            store,
            locks,
            queues,
            settings,
            key_secret,
        }
    }

    /// Allocate a peer against a running or degraded gateway.
    ///
    /// Assigns the next host index (monotonic, never reused), generates a
    /// key pair, persists the peer unapplied with its private key sealed,
    /// and enqueues a push. The capacity check happens before any mutation.
    #[tracing::instrument(skip(self, name, device_class))]
    pub async fn allocate(
        &self,
        gateway_id: Uuid,
        name: &str,
        device_class: &str,
    ) -> Result<PeerCreated, RegistryError> {
        let _guard = self.locks.hold(gateway_id).await;

        let gateway = self
            .store
            .gateway(gateway_id)
            .await?
            .ok_or(RegistryError::GatewayNotFound)?;

        if !gateway.state.accepts_peers() {
            return Err(RegistryError::GatewayNotReady {
                state: gateway.state,
            });
        }

        let limit = self.settings.max_peers_per_gateway;
        if self.store.count_peers(gateway_id).await? >= limit {
            return Err(RegistryError::CapacityExceeded { limit });
        }

        let host_index = self.store.allocate_host_index(gateway_id).await?;
        let pair = keys::generate();
        let (private_key_enc, private_key_nonce) =
            keys::seal(&self.key_secret, &pair.private_b64).map_err(|_| RegistryError::KeySeal)?;

        let peer = self
            .store
            .create_peer(NewPeer {
                gateway_id,
                name: name.to_string(),
                device_class: device_class.to_string(),
                host_index,
                public_key: pair.public_b64,
                private_key_enc,
                private_key_nonce,
            })
            .await?;

        self.queues.enqueue(gateway_id, PushReason::PeerAdded(peer.id));

        tracing::info!(
            peer_id = %peer.id,
            address = %subnet::host_address(gateway.subnet, host_index),
            "peer allocated"
        );

        Ok(PeerCreated {
            peer,
            private_key: RevealOnce::new(pair.private_b64),
        })
    }

    /// Mark a peer for removal and enqueue a push excluding it.
    ///
    /// The record is deleted only once the agent confirms a peer set
    /// without it, unless the gateway is already terminal, in which case
    /// there is nothing live to converge and the record goes immediately.
    #[tracing::instrument(skip(self))]
    pub async fn deallocate(&self, peer_id: Uuid) -> Result<(), RegistryError> {
        let peer = self
            .store
            .peer(peer_id)
            .await?
            .ok_or(RegistryError::PeerNotFound)?;

        let _guard = self.locks.hold(peer.gateway_id).await;

        let gateway = self.store.gateway(peer.gateway_id).await?;
        let terminal = gateway.map_or(true, |g| g.state.is_terminal());

        if terminal {
            self.store.delete_peer(peer_id).await?;
            tracing::info!(%peer_id, "peer deleted directly, gateway terminal");
            return Ok(());
        }

        self.store.mark_peer_removing(peer_id).await?;
        self.queues
            .enqueue(peer.gateway_id, PushReason::PeerRemoved(peer_id));
        tracing::info!(%peer_id, gateway_id = %peer.gateway_id, "peer marked for removal");
        Ok(())
    }
}
