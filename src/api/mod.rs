//! HTTP surface: shared state, error mapping and the bearer-token extractor.

pub mod routes;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::Json;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::compose::ResponseComposer;
use crate::error::{DatabaseError, DeliveryError, Error, IngestError, LifecycleError, MailError};
use crate::mail::MailProvider;
use crate::pipeline::delivery::DeliverySequencer;
use crate::pipeline::ingest::IngestPipeline;
use crate::pipeline::lifecycle::Lifecycle;
use crate::pipeline::responder::BatchResponder;
use crate::store::Database;

pub use routes::router;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub mail: Arc<dyn MailProvider>,
    pub ingest: Arc<IngestPipeline>,
    pub lifecycle: Arc<Lifecycle>,
    pub delivery: Arc<DeliverySequencer>,
    pub responder: Arc<BatchResponder>,
    pub composer: Arc<ResponseComposer>,
    /// Receives the failure report.
    pub report_email: String,
}

/// Error returned by handlers, rendered as `{"error": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Upstream(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::BadRequest(m)
            | Self::Unauthorized(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::Upstream(m)
            | Self::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.message(), "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.message() }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<MailError> for ApiError {
    fn from(e: MailError) -> Self {
        match e {
            MailError::MissingToken => Self::Unauthorized(e.to_string()),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Fetch(mail) => mail.into(),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::NotFound { .. } => Self::NotFound(e.to_string()),
            LifecycleError::InvalidTransition { .. } | LifecycleError::Conflict { .. } => {
                Self::Conflict(e.to_string())
            }
            LifecycleError::Store(db) => db.into(),
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::NotFound { .. } => Self::NotFound(e.to_string()),
            DeliveryError::NotEligible { .. }
            | DeliveryError::Response(_)
            | DeliveryError::NoRecipient
            | DeliveryError::EmptyBody => Self::Conflict(e.to_string()),
            DeliveryError::Folder(_)
            | DeliveryError::SendFailed(_)
            | DeliveryError::SentMessageNotFound
            | DeliveryError::SentLookup(_)
            | DeliveryError::MoveFailed(_) => Self::Upstream(e.to_string()),
            DeliveryError::Store(db) => db.into(),
            DeliveryError::Lifecycle(l) => l.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidInput(m) => Self::BadRequest(m),
            Error::Database(db) => db.into(),
            Error::Mail(m) => m.into(),
            Error::Ingest(i) => i.into(),
            Error::Delivery(d) => d.into(),
            Error::Lifecycle(l) => l.into(),
            Error::Llm(l) => Self::Upstream(l.to_string()),
            Error::Config(c) => Self::Internal(c.to_string()),
        }
    }
}

/// Mail provider access token taken from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Authorization token required".to_string()))?;
        Ok(Self(token.to_string()))
    }
}
