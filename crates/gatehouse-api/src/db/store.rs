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

//! Postgres-backed [`Store`] implementation.

use chrono::{DateTime, Utc};
use ipnetwork::{IpNetwork, Ipv4Network};
use sqlx::PgPool;
use uuid::Uuid;

use gatehouse_core::store::{NewGateway, NewPeer, Store, StoreError};
use gatehouse_core::subnet;
use gatehouse_types::{Gateway, GatewayState, Peer};

#[derive(Debug, sqlx::FromRow)]
struct GatewayRow {
    id: Uuid,
    owner_id: Uuid,
    region: String,
    machine_class: String,
    state: String,
    state_reason: Option<String>,
    cloud_id: Option<String>,
    public_addr: Option<String>,
    public_key: Option<String>,
    subnet: IpNetwork,
    next_host_index: i32,
    created_at: DateTime<Utc>,
    last_reconciled_at: Option<DateTime<Utc>>,
}

impl TryFrom<GatewayRow> for Gateway {
    type Error = StoreError;

    fn try_from(row: GatewayRow) -> Result<Self, StoreError> {
        let state: GatewayState = row
            .state
            .parse()
            .map_err(|e: gatehouse_types::UnknownState| StoreError::Backend(e.to_string()))?;
        let IpNetwork::V4(subnet) = row.subnet else {
            return Err(StoreError::Backend(format!(
                "gateway {} has a non-IPv4 subnet",
                row.id
            )));
        };

        Ok(Gateway {
            id: row.id,
            owner_id: row.owner_id,
            region: row.region,
            machine_class: row.machine_class,
            state,
            state_reason: row.state_reason,
            cloud_id: row.cloud_id,
            public_addr: row.public_addr,
            public_key: row.public_key,
            subnet,
            next_host_index: row.next_host_index,
            created_at: row.created_at,
            last_reconciled_at: row.last_reconciled_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PeerRow {
    id: Uuid,
    gateway_id: Uuid,
    name: String,
    device_class: String,
    host_index: i32,
    public_key: String,
    private_key_enc: Vec<u8>,
    private_key_nonce: Vec<u8>,
    applied: bool,
    removing: bool,
    created_at: DateTime<Utc>,
}

impl From<PeerRow> for Peer {
    fn from(row: PeerRow) -> Self {
        Peer {
            id: row.id,
            gateway_id: row.gateway_id,
            name: row.name,
            device_class: row.device_class,
            host_index: row.host_index,
            public_key: row.public_key,
            private_key_enc: row.private_key_enc,
            private_key_nonce: row.private_key_nonce,
            applied: row.applied,
            removing: row.removing,
            created_at: row.created_at,
        }
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

const TERMINAL_STATES: [&str; 2] = ["terminated", "failed"];

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl Store for PgStore {
    #[tracing::instrument(skip(self, new))]
    async fn create_gateway(&self, new: NewGateway) -> Result<Gateway, StoreError> {
        let row = sqlx::query_as::<_, GatewayRow>(
            "INSERT INTO gateways (owner_id, region, machine_class, state, subnet, next_host_index)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(new.owner_id)
        .bind(&new.region)
        .bind(&new.machine_class)
        .bind(GatewayState::Requested.as_str())
        .bind(IpNetwork::V4(new.subnet))
        .bind(subnet::GATEWAY_HOST_INDEX)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_into()
    }

    #[tracing::instrument(skip(self))]
    async fn gateway(&self, id: Uuid) -> Result<Option<Gateway>, StoreError> {
        sqlx::query_as::<_, GatewayRow>("SELECT * FROM gateways WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(TryInto::try_into)
            .transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn gateways_by_owner(&self, owner_id: Uuid) -> Result<Vec<Gateway>, StoreError> {
        sqlx::query_as::<_, GatewayRow>(
            "SELECT * FROM gateways WHERE owner_id = $1 ORDER BY created_at",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    #[tracing::instrument(skip(self))]
    async fn active_gateways(&self) -> Result<Vec<Gateway>, StoreError> {
        sqlx::query_as::<_, GatewayRow>(
            "SELECT * FROM gateways WHERE state != ALL($1) ORDER BY created_at",
        )
        .bind(&TERMINAL_STATES[..])
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    #[tracing::instrument(skip(self))]
    async fn live_subnets(&self, owner_id: Uuid) -> Result<Vec<Ipv4Network>, StoreError> {
        let rows: Vec<(IpNetwork,)> = sqlx::query_as(
            "SELECT subnet FROM gateways WHERE owner_id = $1 AND state != ALL($2)",
        )
        .bind(owner_id)
        .bind(&TERMINAL_STATES[..])
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .filter_map(|(net,)| match net {
                IpNetwork::V4(v4) => Some(v4),
                IpNetwork::V6(_) => None,
            })
            .collect())
    }

    #[tracing::instrument(skip(self, gateway), fields(gateway_id = %gateway.id))]
    async fn update_gateway(&self, gateway: &Gateway) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE gateways
             SET state = $2, state_reason = $3, cloud_id = $4, public_addr = $5,
                 public_key = $6, next_host_index = $7
             WHERE id = $1",
        )
        .bind(gateway.id)
        .bind(gateway.state.as_str())
        .bind(&gateway.state_reason)
        .bind(&gateway.cloud_id)
        .bind(&gateway.public_addr)
        .bind(&gateway.public_key)
        .bind(gateway.next_host_index)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::GatewayNotFound);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn touch_reconciled(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE gateways SET last_reconciled_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::GatewayNotFound);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_gateway(&self, id: Uuid) -> Result<(), StoreError> {
        // Peers go with it via ON DELETE CASCADE.
        sqlx::query("DELETE FROM gateways WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn allocate_host_index(&self, gateway_id: Uuid) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row: Option<(IpNetwork, i32)> = sqlx::query_as(
            "SELECT subnet, next_host_index FROM gateways WHERE id = $1 FOR UPDATE",
        )
        .bind(gateway_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some((net, current)) = row else {
            return Err(StoreError::GatewayNotFound);
        };
        let IpNetwork::V4(net) = net else {
            return Err(StoreError::Backend(format!(
                "gateway {gateway_id} has a non-IPv4 subnet"
            )));
        };

        let next = current + 1;
        if next > subnet::max_host_index(net) {
            return Err(StoreError::AddressesExhausted);
        }

        sqlx::query("UPDATE gateways SET next_host_index = $2 WHERE id = $1")
            .bind(gateway_id)
            .bind(next)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(next)
    }

    #[tracing::instrument(skip(self, new), fields(gateway_id = %new.gateway_id))]
    async fn create_peer(&self, new: NewPeer) -> Result<Peer, StoreError> {
        let row = sqlx::query_as::<_, PeerRow>(
            "INSERT INTO peers (gateway_id, name, device_class, host_index, public_key,
                                private_key_enc, private_key_nonce)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(new.gateway_id)
        .bind(&new.name)
        .bind(&new.device_class)
        .bind(new.host_index)
        .bind(&new.public_key)
        .bind(&new.private_key_enc)
        .bind(&new.private_key_nonce)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.into())
    }

    #[tracing::instrument(skip(self))]
    async fn peer(&self, id: Uuid) -> Result<Option<Peer>, StoreError> {
        Ok(
            sqlx::query_as::<_, PeerRow>("SELECT * FROM peers WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .map(Into::into),
        )
    }

    #[tracing::instrument(skip(self))]
    async fn peers_by_gateway(&self, gateway_id: Uuid) -> Result<Vec<Peer>, StoreError> {
        Ok(sqlx::query_as::<_, PeerRow>(
            "SELECT * FROM peers WHERE gateway_id = $1 ORDER BY created_at",
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(Into::into)
        .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn count_peers(&self, gateway_id: Uuid) -> Result<u32, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM peers WHERE gateway_id = $1")
                .bind(gateway_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(count as u32)
    }

    #[tracing::instrument(skip(self, peer_ids), fields(peer_count = peer_ids.len()))]
    async fn set_peers_applied(
        &self,
        gateway_id: Uuid,
        peer_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE peers SET applied = TRUE WHERE gateway_id = $1 AND id = ANY($2)")
            .bind(gateway_id)
            .bind(peer_ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn mark_peer_removing(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE peers SET removing = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PeerNotFound);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_peer(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM peers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_peers_by_gateway(&self, gateway_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM peers WHERE gateway_id = $1")
            .bind(gateway_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
