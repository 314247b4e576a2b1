use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use gatehouse_core::error::{LifecycleError, RegistryError, RenderError};
use gatehouse_core::store::StoreError;

use crate::db::user::UserStoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("unauthorized")]
    Unauthorized,

    #[error("email already taken")]
    DuplicateEmail,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("gateway limit reached ({limit})")]
    TooManyGateways { limit: u32 },

    #[error("peer limit reached ({limit})")]
    CapacityExceeded { limit: u32 },

    #[error("no free subnet available")]
    SubnetExhausted,

    #[error("gateway is {state}, not accepting peers")]
    GatewayNotReady { state: String },

    #[error("peer not applied to the gateway yet")]
    PeerNotApplied,

    #[error("gateway endpoint not available yet")]
    EndpointPending,

    #[error("internal server error")]
    Internal,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DuplicateEmail
            | Self::TooManyGateways { .. }
            | Self::CapacityExceeded { .. }
            | Self::GatewayNotReady { .. }
            | Self::PeerNotApplied
            | Self::EndpointPending => StatusCode::CONFLICT,
            Self::Validation(_) | Self::SubnetExhausted => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

impl From<UserStoreError> for ApiError {
    fn from(err: UserStoreError) -> Self {
        match err {
            UserStoreError::DuplicateEmail => Self::DuplicateEmail,
            UserStoreError::PasswordHash | UserStoreError::Database(_) => {
                tracing::error!(error = %err, "user store error");
                Self::Internal
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::GatewayNotFound | StoreError::PeerNotFound => Self::NotFound,
            StoreError::AddressesExhausted => Self::SubnetExhausted,
            StoreError::Backend(_) => {
                tracing::error!(error = %err, "store error");
                Self::Internal
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded { limit } => Self::CapacityExceeded { limit },
            RegistryError::GatewayNotReady { state } => Self::GatewayNotReady {
                state: state.to_string(),
            },
            RegistryError::GatewayNotFound | RegistryError::PeerNotFound => Self::NotFound,
            RegistryError::Store(e) => e.into(),
            RegistryError::KeySeal => {
                tracing::error!(error = %err, "registry error");
                Self::Internal
            }
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::TooManyGateways { limit } => Self::TooManyGateways { limit },
            LifecycleError::SubnetExhausted => Self::SubnetExhausted,
            LifecycleError::GatewayNotFound => Self::NotFound,
            LifecycleError::Store(e) => e.into(),
        }
    }
}

impl From<RenderError> for ApiError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::PeerNotApplied => Self::PeerNotApplied,
            RenderError::NoEndpoint | RenderError::MissingServerKey => Self::EndpointPending,
            RenderError::KeyOpen | RenderError::Qr(_) => {
                tracing::error!(error = %err, "render error");
                Self::Internal
            }
        }
    }
}
