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

use gatehouse_core::store::Store;
use gatehouse_types::Gateway;

use crate::config::Config;
use crate::db::store::PgStore;
use crate::error::ApiError;
use crate::extract::AuthUser;
use crate::AppReconciler;

#[derive(Debug, Deserialize)]
struct CreateGatewayRequest {
    region: Option<String>,
    machine_class: Option<String>,
}

#[derive(Debug, Serialize)]
struct GatewayResponse {
    id: Uuid,
    state: String,
    state_reason: Option<String>,
    region: String,
    machine_class: String,
    public_addr: Option<String>,
    subnet: String,
    peer_count: u32,
    created_at: DateTime<Utc>,
    last_reconciled_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

async fn build_response(
    store: &PgStore,
    reconciler: &AppReconciler,
    gateway: &Gateway,
) -> Result<GatewayResponse, ApiError> {
    let peer_count = store.count_peers(gateway.id).await?;
    let last_error = reconciler
        .last_attempt(gateway.id)
        .and_then(|attempt| attempt.error);

    Ok(GatewayResponse {
        id: gateway.id,
        state: gateway.state.to_string(),
        state_reason: gateway.state_reason.clone(),
        region: gateway.region.clone(),
        machine_class: gateway.machine_class.clone(),
        public_addr: gateway.public_addr.clone(),
        subnet: gateway.subnet.to_string(),
        peer_count,
        created_at: gateway.created_at,
        last_reconciled_at: gateway.last_reconciled_at,
        last_error,
    })
}

/// Loads the gateway and enforces ownership. A foreign gateway id reads as
/// not-found, never as forbidden.
pub async fn owned_gateway(
    store: &PgStore,
    auth: &AuthUser,
    id: Uuid,
) -> Result<Gateway, ApiError> {
    let gateway = store.gateway(id).await?.ok_or(ApiError::NotFound)?;
    if gateway.owner_id != auth.user_id {
        return Err(ApiError::NotFound);
    }
    Ok(gateway)
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id))]
async fn create_gateway(
    auth: AuthUser,
    config: web::Data<Config>,
    store: web::Data<PgStore>,
    reconciler: web::Data<Arc<AppReconciler>>,
    body: web::Json<CreateGatewayRequest>,
) -> Result<HttpResponse, ApiError> {
    let region = body.region.as_deref().unwrap_or(&config.default_region);
    let machine_class = body
        .machine_class
        .as_deref()
        .unwrap_or(&config.default_machine_class);

    let gateway = reconciler
        .request_gateway(auth.user_id, region, machine_class)
        .await?;
    Arc::clone(reconciler.get_ref()).kick(gateway.id);

    let resp = build_response(&store, &reconciler, &gateway).await?;
    Ok(HttpResponse::Accepted().json(resp))
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id))]
async fn list_gateways(
    auth: AuthUser,
    store: web::Data<PgStore>,
    reconciler: web::Data<Arc<AppReconciler>>,
) -> Result<HttpResponse, ApiError> {
    let gateways = store.gateways_by_owner(auth.user_id).await?;
    let mut resp = Vec::with_capacity(gateways.len());
    for gateway in &gateways {
        resp.push(build_response(&store, &reconciler, gateway).await?);
    }
    Ok(HttpResponse::Ok().json(resp))
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id))]
async fn get_gateway(
    auth: AuthUser,
    store: web::Data<PgStore>,
    reconciler: web::Data<Arc<AppReconciler>>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let gateway = owned_gateway(&store, &auth, path.into_inner()).await?;
    let resp = build_response(&store, &reconciler, &gateway).await?;
    Ok(HttpResponse::Ok().json(resp))
}

#[tracing::instrument(skip_all, fields(user_id = %auth.user_id))]
async fn delete_gateway(
    auth: AuthUser,
    store: web::Data<PgStore>,
    reconciler: web::Data<Arc<AppReconciler>>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let gateway = owned_gateway(&store, &auth, path.into_inner()).await?;

    let gateway = reconciler.remove_gateway(gateway.id).await?;
    Arc::clone(reconciler.get_ref()).kick(gateway.id);

    let resp = build_response(&store, &reconciler, &gateway).await?;
    Ok(HttpResponse::Accepted().json(resp))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/gateways")
            .route(web::post().to(create_gateway))
            .route(web::get().to(list_gateways)),
    )
    .service(
        web::resource("/api/gateways/{id}")
            .route(web::get().to(get_gateway))
            .route(web::delete().to(delete_gateway)),
    );
}
