//! REST endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::{ApiError, AppState, BearerToken};
use crate::pipeline::lifecycle::ReviewAction;
use crate::pipeline::report::send_failure_report;
use crate::pipeline::types::{EmailStatus, ScheduledResponseSpec};
use crate::store::EmailFilter;

/// Build the Axum router with every triage endpoint.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/emails", get(list_emails))
        .route("/api/emails/{id}", delete(delete_email))
        .route("/api/emails/{id}/approve", post(approve_email))
        .route("/api/emails/{id}/edit", post(edit_email))
        .route("/api/inbox/fetch", post(fetch_inbox))
        .route("/api/approvals/batch", post(approve_batch))
        .route("/api/approvals/by-category", post(approve_category))
        .route("/api/reviews/reject", post(reject_emails))
        .route("/api/reviews/flag", post(flag_emails))
        .route("/api/responses/generate", post(generate_response))
        .route("/api/respond", post(respond_category))
        .route("/api/schedules", post(create_schedule))
        .route("/api/folders", get(list_folders).post(create_folder))
        .route("/api/reports/failures", post(failure_report))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn required(value: &str, field: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        Err(ApiError::BadRequest(format!("{field} is required")))
    } else {
        Ok(value.to_string())
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "mail-triage"
    }))
}

// ── Emails ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    category: Option<String>,
    status: Option<String>,
}

async fn list_emails(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<EmailStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let filter = EmailFilter {
        category: query.category.filter(|c| !c.is_empty()),
        status,
    };
    let emails = state.db.list_emails(&filter).await?;
    Ok(Json(emails))
}

async fn fetch_inbox(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.ingest.fetch_and_ingest(&token).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct EditRequest {
    ai_response: String,
}

async fn edit_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EditRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let text = required(&body.ai_response, "ai_response")?;
    let email = state.lifecycle.edit_reply(&id, &text).await?;
    Ok(Json(email))
}

async fn delete_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = required(&id, "id")?;
    state.lifecycle.delete(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

// ── Review ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct IdsRequest {
    #[serde(default)]
    email_ids: Vec<String>,
}

impl IdsRequest {
    fn ids(self) -> Result<Vec<String>, ApiError> {
        if self.email_ids.is_empty() {
            Err(ApiError::BadRequest("email_ids is required".to_string()))
        } else {
            Ok(self.email_ids)
        }
    }
}

async fn reject_emails(
    State(state): State<AppState>,
    Json(body): Json<IdsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.lifecycle.review(&body.ids()?, ReviewAction::Reject).await;
    Ok(Json(outcome))
}

async fn flag_emails(
    State(state): State<AppState>,
    Json(body): Json<IdsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.lifecycle.review(&body.ids()?, ReviewAction::Flag).await;
    Ok(Json(outcome))
}

// ── Approval ────────────────────────────────────────────────────────────

async fn approve_email(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.delivery.approve(&token, &id).await?;
    Ok(Json(json!({ "status": "approved", "id": id })))
}

async fn approve_batch(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Json(body): Json<IdsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.delivery.approve_batch(&token, &body.ids()?).await;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct CategoryRequest {
    #[serde(default)]
    category: String,
}

async fn approve_category(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Json(body): Json<CategoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let category = required(&body.category, "category")?;
    let outcome = state.delivery.approve_category(&token, &category).await?;
    Ok(Json(outcome))
}

// ── Responses ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    email_text: String,
}

async fn generate_response(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let text = required(&body.email_text, "email_text")?;
    Ok(Json(state.composer.compose(&text).await))
}

#[derive(Deserialize)]
struct RespondRequest {
    #[serde(default)]
    category: String,
    #[serde(default)]
    folder: String,
}

async fn respond_category(
    State(state): State<AppState>,
    Json(body): Json<RespondRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let category = required(&body.category, "category")?;
    let folder = required(&body.folder, "folder")?;
    let processed = state.responder.respond_category(&category, &folder).await?;
    Ok(Json(json!({ "processed": processed })))
}

#[derive(Deserialize)]
struct ScheduleRequest {
    #[serde(default)]
    category: String,
    hour: u32,
    minute: u32,
    #[serde(default)]
    folder_name: String,
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(body): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let folder = required(&body.folder_name, "folder_name")?;
    let spec = ScheduledResponseSpec::new(body.category, body.hour, body.minute, folder)?;
    let processed = state.responder.schedule(&spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "schedule": spec, "processed": processed })),
    ))
}

// ── Folders ─────────────────────────────────────────────────────────────

async fn list_folders(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, ApiError> {
    let folders = state.mail.list_folders(&token).await?;
    Ok(Json(folders))
}

#[derive(Deserialize)]
struct FolderRequest {
    #[serde(default)]
    name: String,
}

async fn create_folder(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Json(body): Json<FolderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = required(&body.name, "name")?;
    let folder = state.mail.create_folder(&token, &name).await?;
    info!(folder = %folder.display_name, "Mail folder created");
    Ok((StatusCode::CREATED, Json(folder)))
}

// ── Reports ─────────────────────────────────────────────────────────────

async fn failure_report(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, ApiError> {
    let report = send_failure_report(
        state.db.as_ref(),
        state.mail.as_ref(),
        &token,
        &state.report_email,
        Utc::now(),
    )
    .await?;
    Ok(Json(json!({ "report": report })))
}
