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

use std::sync::Arc;

use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatehouse_core::settings::ReconcilerSettings;
use gatehouse_core::store::Store;
use gatehouse_core::{keys, render, subnet};
use gatehouse_types::{Gateway, Peer};

use crate::config::Config;
use crate::db::store::PgStore;
use crate::error::ApiError;
use crate::extract::AuthUser;
use crate::routes::gateways::owned_gateway;
use crate::{AppReconciler, AppRegistry};

#[derive(Debug, Deserialize)]
struct CreatePeerRequest {
    name: String,
    device_class: Option<String>,
}

#[derive(Debug, Serialize)]
struct PeerResponse {
    id: Uuid,
    gateway_id: Uuid,
    name: String,
    device_class: String,
    public_key: String,
    address: String,
    applied: bool,
    removing: bool,
    created_at: DateTime<Utc>,
    /// Present only in the creation response. There is no way to read it
    /// again afterwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
}

fn build_response(gateway: &Gateway, peer: &Peer, private_key: Option<String>) -> PeerResponse {
    PeerResponse {
        id: peer.id,
        gateway_id: peer.gateway_id,
        name: peer.name.clone(),
        device_class: peer.device_class.clone(),
        public_key: peer.public_key.clone(),
        address: subnet::host_address(gateway.subnet, peer.host_index).to_string(),
        applied: peer.applied,
        removing: peer.removing,
        created_at: peer.created_at,
        private_key,
    }
}

/// Loads a peer through its owning gateway, enforcing ownership.
async fn owned_peer(
    store: &PgStore,
    auth: &AuthUser,
    peer_id: Uuid,
) -> Result<(Gateway, Peer), ApiError> {
    let peer = store.peer(peer_id).await?.ok_or(ApiError::NotFound)?;
    let gateway = owned_gateway(store, auth, peer.gateway_id).await?;
    Ok((gateway, peer))
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id))]
async fn create_peer(
    auth: AuthUser,
    store: web::Data<PgStore>,
    registry: web::Data<AppRegistry>,
    reconciler: web::Data<Arc<AppReconciler>>,
    path: web::Path<Uuid>,
    body: web::Json<CreatePeerRequest>,
) -> Result<HttpResponse, ApiError> {
    if body.name.is_empty() {
        return Err(ApiError::Validation("peer name must not be empty".into()));
    }
    let gateway = owned_gateway(&store, &auth, path.into_inner()).await?;

    let device_class = body.device_class.as_deref().unwrap_or("unknown");
    let created = registry
        .allocate(gateway.id, &body.name, device_class)
        .await?;
    Arc::clone(reconciler.get_ref()).kick(gateway.id);

    let resp = build_response(&gateway, &created.peer, Some(created.private_key.reveal()));
    Ok(HttpResponse::Created().json(resp))
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id))]
async fn list_peers(
    auth: AuthUser,
    store: web::Data<PgStore>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let gateway = owned_gateway(&store, &auth, path.into_inner()).await?;
    let peers = store.peers_by_gateway(gateway.id).await?;

    let resp: Vec<_> = peers
        .iter()
        .map(|p| build_response(&gateway, p, None))
        .collect();
    Ok(HttpResponse::Ok().json(resp))
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id))]
async fn delete_peer(
    auth: AuthUser,
    store: web::Data<PgStore>,
    registry: web::Data<AppRegistry>,
    reconciler: web::Data<Arc<AppReconciler>>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let (gateway, peer) = owned_peer(&store, &auth, path.into_inner()).await?;

    registry.deallocate(peer.id).await?;
    Arc::clone(reconciler.get_ref()).kick(gateway.id);

    Ok(HttpResponse::Accepted().finish())
}

async fn render_config(
    store: &PgStore,
    config: &Config,
    settings: &ReconcilerSettings,
    auth: &AuthUser,
    peer_id: Uuid,
) -> Result<String, ApiError> {
    let (gateway, peer) = owned_peer(store, auth, peer_id).await?;

    let private_key = keys::open(
        &config.peer_key_secret,
        &peer.private_key_enc,
        &peer.private_key_nonce,
    )
    .map_err(|_| ApiError::Internal)?;

    Ok(render::client_config(
        &gateway,
        &peer,
        &private_key,
        &settings.dns_servers,
        settings.listen_port,
    )?)
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id))]
async fn peer_config(
    auth: AuthUser,
    store: web::Data<PgStore>,
    config: web::Data<Config>,
    settings: web::Data<Arc<ReconcilerSettings>>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let doc = render_config(&store, &config, &settings, &auth, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "config": doc })))
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id))]
async fn peer_qr(
    auth: AuthUser,
    store: web::Data<PgStore>,
    config: web::Data<Config>,
    settings: web::Data<Arc<ReconcilerSettings>>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let doc = render_config(&store, &config, &settings, &auth, path.into_inner()).await?;
    let qr = render::qr_data_uri(&doc)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "qr": qr })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/gateways/{id}/peers")
            .route(web::post().to(create_peer))
            .route(web::get().to(list_peers)),
    )
    .service(web::resource("/api/peers/{id}").route(web::delete().to(delete_peer)))
    .service(web::resource("/api/peers/{id}/config").route(web::get().to(peer_config)))
    .service(web::resource("/api/peers/{id}/qr").route(web::get().to(peer_qr)));
}
