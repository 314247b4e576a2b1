//! In-memory [`Store`] used by the reconciler test suite.
//!
//! Vec-backed so listings preserve insertion order; the scale is a handful
//! of records per test.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use uuid::Uuid;

use gatehouse_types::{Gateway, GatewayState, Peer};

use super::{NewGateway, NewPeer, Store, StoreError};
use crate::subnet;

#[derive(Default)]
pub struct MemoryStore {
    gateways: Mutex<Vec<Gateway>>,
    peers: Mutex<Vec<Peer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    async fn create_gateway(&self, new: NewGateway) -> Result<Gateway, StoreError> {
        let gateway = Gateway {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            region: new.region,
            machine_class: new.machine_class,
            state: GatewayState::Requested,
            state_reason: None,
            cloud_id: None,
            public_addr: None,
            public_key: None,
            subnet: new.subnet,
            next_host_index: subnet::GATEWAY_HOST_INDEX,
            created_at: Utc::now(),
            last_reconciled_at: None,
        };
        self.gateways.lock().unwrap().push(gateway.clone());
        Ok(gateway)
    }

    async fn gateway(&self, id: Uuid) -> Result<Option<Gateway>, StoreError> {
        Ok(self
            .gateways
            .lock()
            .unwrap()
            .iter()
            .find(|g| g.id == id)
            .cloned())
    }

    async fn gateways_by_owner(&self, owner_id: Uuid) -> Result<Vec<Gateway>, StoreError> {
        Ok(self
            .gateways
            .lock()
            .unwrap()
            .iter()
            .filter(|g| g.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn active_gateways(&self) -> Result<Vec<Gateway>, StoreError> {
        Ok(self
            .gateways
            .lock()
            .unwrap()
            .iter()
            .filter(|g| !g.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn live_subnets(&self, owner_id: Uuid) -> Result<Vec<Ipv4Network>, StoreError> {
        Ok(self
            .gateways
            .lock()
            .unwrap()
            .iter()
            .filter(|g| g.owner_id == owner_id && !g.state.is_terminal())
            .map(|g| g.subnet)
            .collect())
    }

    async fn update_gateway(&self, gateway: &Gateway) -> Result<(), StoreError> {
        let mut gateways = self.gateways.lock().unwrap();
        let slot = gateways
            .iter_mut()
            .find(|g| g.id == gateway.id)
            .ok_or(StoreError::GatewayNotFound)?;
        *slot = gateway.clone();
        Ok(())
    }

    async fn touch_reconciled(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut gateways = self.gateways.lock().unwrap();
        let slot = gateways
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or(StoreError::GatewayNotFound)?;
        slot.last_reconciled_at = Some(at);
        Ok(())
    }

    async fn delete_gateway(&self, id: Uuid) -> Result<(), StoreError> {
        self.peers.lock().unwrap().retain(|p| p.gateway_id != id);
        self.gateways.lock().unwrap().retain(|g| g.id != id);
        Ok(())
    }

    async fn allocate_host_index(&self, gateway_id: Uuid) -> Result<i32, StoreError> {
        let mut gateways = self.gateways.lock().unwrap();
        let gateway = gateways
            .iter_mut()
            .find(|g| g.id == gateway_id)
            .ok_or(StoreError::GatewayNotFound)?;
        let next = gateway.next_host_index + 1;
        if next > subnet::max_host_index(gateway.subnet) {
            return Err(StoreError::AddressesExhausted);
        }
        gateway.next_host_index = next;
        Ok(next)
    }

    async fn create_peer(&self, new: NewPeer) -> Result<Peer, StoreError> {
        let peer = Peer {
            id: Uuid::new_v4(),
            gateway_id: new.gateway_id,
            name: new.name,
            device_class: new.device_class,
            host_index: new.host_index,
            public_key: new.public_key,
            private_key_enc: new.private_key_enc,
            private_key_nonce: new.private_key_nonce,
            applied: false,
            removing: false,
            created_at: Utc::now(),
        };
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }

    async fn peer(&self, id: Uuid) -> Result<Option<Peer>, StoreError> {
        Ok(self
            .peers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn peers_by_gateway(&self, gateway_id: Uuid) -> Result<Vec<Peer>, StoreError> {
        Ok(self
            .peers
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn count_peers(&self, gateway_id: Uuid) -> Result<u32, StoreError> {
        Ok(self
            .peers
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.gateway_id == gateway_id)
            .count() as u32)
    }

    async fn set_peers_applied(
        &self,
        gateway_id: Uuid,
        peer_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut peers = self.peers.lock().unwrap();
        for peer in peers.iter_mut() {
            if peer.gateway_id == gateway_id && peer_ids.contains(&peer.id) {
                peer.applied = true;
            }
        }
        Ok(())
    }

    async fn mark_peer_removing(&self, id: Uuid) -> Result<(), StoreError> {
        let mut peers = self.peers.lock().unwrap();
        let peer = peers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StoreError::PeerNotFound)?;
        peer.removing = true;
        Ok(())
    }

    async fn delete_peer(&self, id: Uuid) -> Result<(), StoreError> {
        self.peers.lock().unwrap().retain(|p| p.id != id);
        Ok(())
    }

    async fn delete_peers_by_gateway(&self, gateway_id: Uuid) -> Result<(), StoreError> {
        self.peers
            .lock()
            .unwrap()
            .retain(|p| p.gateway_id != gateway_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_gateway(subnet: &str) -> NewGateway {
        NewGateway {
            owner_id: Uuid::new_v4(),
            region: "us-east-1".into(),
            machine_class: "t3.micro".into(),
            subnet: subnet.parse().unwrap(),
        }
    }

    fn new_peer(gateway_id: Uuid, host_index: i32) -> NewPeer {
        NewPeer {
            gateway_id,
            name: format!("peer-{host_index}"),
            device_class: "phone".into(),
            host_index,
            public_key: format!("pk-{host_index}"),
            private_key_enc: vec![0],
            private_key_nonce: vec![0],
        }
    }

    #[tokio::test]
    async fn host_index_allocation_is_monotonic() {
        let store = MemoryStore::new();
        let gw = store.create_gateway(new_gateway("10.10.0.0/24")).await.unwrap();

        assert_eq!(store.allocate_host_index(gw.id).await.unwrap(), 2);
        assert_eq!(store.allocate_host_index(gw.id).await.unwrap(), 3);
        assert_eq!(store.allocate_host_index(gw.id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn host_index_allocation_exhausts() {
        let store = MemoryStore::new();
        // /30: index 1 is the gateway, index 2 the only peer slot.
        let gw = store.create_gateway(new_gateway("10.10.0.0/30")).await.unwrap();

        assert_eq!(store.allocate_host_index(gw.id).await.unwrap(), 2);
        assert!(matches!(
            store.allocate_host_index(gw.id).await,
            Err(StoreError::AddressesExhausted)
        ));
    }

    #[tokio::test]
    async fn deleting_a_gateway_cascades_to_peers() {
        let store = MemoryStore::new();
        let gw = store.create_gateway(new_gateway("10.10.0.0/24")).await.unwrap();
        store.create_peer(new_peer(gw.id, 2)).await.unwrap();
        store.create_peer(new_peer(gw.id, 3)).await.unwrap();

        store.delete_gateway(gw.id).await.unwrap();
        assert!(store.gateway(gw.id).await.unwrap().is_none());
        assert!(store.peers_by_gateway(gw.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn peers_listed_in_creation_order() {
        let store = MemoryStore::new();
        let gw = store.create_gateway(new_gateway("10.10.0.0/24")).await.unwrap();
        for index in 2..5 {
            store.create_peer(new_peer(gw.id, index)).await.unwrap();
        }
        let indices: Vec<_> = store
            .peers_by_gateway(gw.id)
            .await
            .unwrap()
            .iter()
            .map(|p| p.host_index)
            .collect();
        assert_eq!(indices, vec![2, 3, 4]);
    }
}
