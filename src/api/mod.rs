//! API layer
//!
//! HTTP handlers for the job lifecycle:
//! - POST  /jobs        - create a job
//! - GET   /jobs/:id    - fetch a job
//! - POST  /jobs/next   - claim the next queued job
//! - PATCH /jobs/:id    - partial update with validation

use axum::{
    Router,
    extract::{Path, State},
    response::Json,
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::data::{Job, JobPatch};
use crate::error::AppError;

/// Create jobs router
pub fn jobs_router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_job))
        .route("/next", post(claim_next_job))
        .route("/:id", get(get_job))
        .route("/:id", patch(patch_job))
}

// =============================================================================
// DTOs
// =============================================================================

/// Create job request
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Target player's friend code
    pub friend_code: String,
    /// Skip score scraping after the friendship forms
    #[serde(default)]
    pub skip_update_score: bool,
}

/// Claim request; identifies the worker asking for a job
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub bot_account_id: String,
}

/// Job as exposed over the API
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub friend_code: String,
    pub skip_update_score: bool,
    pub bot_account_id: Option<String>,
    pub status: String,
    pub stage: String,
    pub request_sent_at: Option<DateTime<Utc>>,
    pub completed_tiers: Vec<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let completed_tiers = serde_json::from_str(&job.completed_tiers).unwrap_or_default();
        let result = job
            .result
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        Self {
            id: job.id,
            friend_code: job.friend_code,
            skip_update_score: job.skip_update_score,
            bot_account_id: job.bot_account_id,
            status: job.status,
            stage: job.stage,
            request_sent_at: job.request_sent_at,
            completed_tiers,
            result,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /jobs
///
/// Creates a job for a friend code. Any prior live job for the same code
/// is auto-canceled; a creation inside the cool-down window is rejected
/// with 409.
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<Json<JobResponse>, AppError> {
    let friend_code = req.friend_code.trim();
    if friend_code.is_empty() {
        return Err(AppError::Validation("friend_code must not be empty".to_string()));
    }
    if !friend_code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "friend_code must be numeric".to_string(),
        ));
    }

    let cooldown = chrono::Duration::seconds(state.config.worker.cooldown_seconds as i64);
    let job = state
        .db
        .create_job(friend_code, req.skip_update_score, cooldown)
        .await?;

    tracing::info!(job_id = %job.id, friend_code = %job.friend_code, "Job created");
    Ok(Json(job.into()))
}

/// GET /jobs/:id
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state.db.get_job(&id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(job.into()))
}

/// POST /jobs/next
///
/// Atomically claims the oldest queued job for the given worker. Returns
/// `null` when the queue is empty; claiming is the only way a job moves
/// to `processing`.
async fn claim_next_job(
    State(state): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<Option<JobResponse>>, AppError> {
    if req.bot_account_id.trim().is_empty() {
        return Err(AppError::Validation(
            "bot_account_id must not be empty".to_string(),
        ));
    }

    let job = state.db.claim_next_job(&req.bot_account_id).await?;
    Ok(Json(job.map(JobResponse::from)))
}

/// PATCH /jobs/:id
///
/// Partial update. Enum-valued fields are validated before anything is
/// written; an invalid value rejects the whole patch.
async fn patch_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<JobPatch>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state.db.patch_job(&id, &req).await?;
    Ok(Json(job.into()))
}
