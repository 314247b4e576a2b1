use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::create_token;
use crate::config::Config;
use crate::db::user::{User, UserStore};
use crate::error::ApiError;
use crate::extract::AuthUser;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub display_name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserResponse {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            display_name: u.display_name.clone(),
            created_at: u.created_at,
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auth")
            .route("/register", web::post().to(register))
            .route("/login", web::post().to(login))
            .route("/me", web::get().to(me)),
    );
}

const MIN_PASSWORD_LEN: usize = 8;

fn validate_registration(body: &RegisterRequest) -> Result<(), ApiError> {
    if body.email.is_empty() || body.password.is_empty() {
        return Err(ApiError::Validation("missing required fields".into()));
    }
    if body.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

#[tracing::instrument(skip(body, store))]
async fn register(
    body: web::Json<RegisterRequest>,
    store: web::Data<UserStore>,
) -> Result<HttpResponse, ApiError> {
    validate_registration(&body)?;

    let user = store
        .create(&body.email, &body.display_name, &body.password)
        .await?;

    tracing::info!(user_id = %user.id, "user registered");

    Ok(HttpResponse::Created().json(UserResponse::from(&user)))
}

#[tracing::instrument(skip(body, store, config))]
async fn login(
    body: web::Json<LoginRequest>,
    store: web::Data<UserStore>,
    config: web::Data<Config>,
) -> Result<HttpResponse, ApiError> {
    let user = store
        .get_by_email(&body.email)
        .await?
        .ok_or(ApiError::InvalidCredentials)?;

    if !store.verify_password(&user, &body.password)? {
        tracing::info!(user_id = %user.id, "login failed: invalid password");
        return Err(ApiError::InvalidCredentials);
    }

    let token = create_token(user.id, &config.jwt_secret)?;
    tracing::info!(user_id = %user.id, "login success");

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "token": token,
        "user": UserResponse::from(&user),
    })))
}

#[tracing::instrument(skip(store))]
async fn me(auth: AuthUser, store: web::Data<UserStore>) -> Result<HttpResponse, ApiError> {
    let user = store
        .get_by_id(auth.user_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    Ok(HttpResponse::Ok().json(UserResponse::from(&user)))
}
