//! Status/health HTTP surface (spec §6). Request-body validation and the
//! full REST API are external concerns (spec §1) — this exposes enough to
//! observe the running system and exercise the core's submit path directly.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::InboxAgent;
use crate::credentials::CredentialResolver;
use crate::db::entities::outbound_message;
use crate::discovery::{DiscoveryClient, DiscoveryResult};
use crate::error::AppError;
use crate::mime::{build_message, OutboundParts};
use crate::pool::SubmissionPool;
use crate::ratelimit;
use crate::worker::SendWorker;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub pool: Arc<SubmissionPool>,
    pub worker: Arc<SendWorker>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub discovery: Arc<DiscoveryClient>,
    pub agent: Option<Arc<InboxAgent>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/agent/status", get(agent_status))
        .route("/discover", get(discover))
        .route("/send", post(send))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn agent_status(State(state): State<AppState>) -> Result<Json<crate::agent::AgentStatus>, AppError> {
    let agent = state
        .agent
        .clone()
        .ok_or_else(|| AppError::NotFound("inbox agent is not configured".to_string()))?;
    Ok(Json(agent.status().await))
}

#[derive(Deserialize)]
struct DiscoverParams {
    email: String,
}

async fn discover(State(state): State<AppState>, Query(params): Query<DiscoverParams>) -> Json<DiscoveryResult> {
    Json(state.discovery.discover(&params.email).await)
}

#[derive(Deserialize)]
struct SendRequest {
    account_id: Uuid,
    to: String,
    subject: String,
    text: Option<String>,
    html: Option<String>,
    from: Option<String>,
    #[serde(default)]
    sync: bool,
}

#[derive(Serialize)]
struct Envelope {
    from: String,
    to: String,
    subject: String,
}

#[derive(Serialize)]
#[serde(tag = "status")]
enum SendResponse {
    #[serde(rename = "sent")]
    Sent {
        id: Uuid,
        message_id: String,
        envelope: Envelope,
    },
    #[serde(rename = "queued")]
    Queued { id: Uuid, envelope: Envelope },
}

async fn send(State(state): State<AppState>, Json(req): Json<SendRequest>) -> Result<Json<SendResponse>, AppError> {
    let account = state
        .credentials
        .resolve(req.account_id)
        .await?
        .ok_or_else(|| AppError::NotFound("account not found".to_string()))?;
    ratelimit::check_admission(&state.db, account.id, account.rate_limit_per_hour).await?;

    let from_addr = req.from.clone().unwrap_or_else(|| account.smtp_username.clone());
    let envelope = Envelope {
        from: from_addr.clone(),
        to: req.to.clone(),
        subject: req.subject.clone(),
    };

    if req.sync {
        let parts = OutboundParts {
            from_addr: &from_addr,
            from_name: account.display_name.as_deref(),
            to_addr: &req.to,
            subject: &req.subject,
            text: req.text.as_deref(),
            html: req.html.as_deref(),
            in_reply_to: None,
            references: None,
        };
        let (raw_message, fallback_message_id) =
            build_message(&parts).map_err(|e| AppError::Internal(e.to_string()))?;

        let mut lease = state.pool.acquire(account.id).await?;
        let send_result = lease.client_mut().send(&from_addr, &req.to, &raw_message).await;
        let server_id = match send_result {
            Ok(id) => {
                lease.release_ok().await;
                id.unwrap_or(fallback_message_id)
            }
            Err(err) => return Err(err),
        };

        let id = Uuid::new_v4();
        let row = outbound_message::ActiveModel {
            id: Set(id),
            account_id: Set(account.id),
            message_id: Set(Some(server_id.clone())),
            direction: Set("outbound".to_string()),
            from_addr: Set(from_addr),
            to_addr: Set(req.to),
            subject: Set(Some(req.subject)),
            status: Set(outbound_message::status::SENT.to_string()),
            error: Set(None),
            text_content: Set(req.text),
            html_content: Set(req.html),
            retry_count: Set(0),
            next_retry_at: Set(None),
            created_at: Set(Utc::now().into()),
            sent_at: Set(Some(Utc::now().into())),
        };
        row.insert(&state.db).await?;

        Ok(Json(SendResponse::Sent { id, message_id: server_id, envelope }))
    } else {
        let id = Uuid::new_v4();
        let row = outbound_message::ActiveModel {
            id: Set(id),
            account_id: Set(account.id),
            message_id: Set(None),
            direction: Set("outbound".to_string()),
            from_addr: Set(from_addr),
            to_addr: Set(req.to),
            subject: Set(Some(req.subject)),
            status: Set(outbound_message::status::QUEUED.to_string()),
            error: Set(None),
            text_content: Set(req.text),
            html_content: Set(req.html),
            retry_count: Set(0),
            next_retry_at: Set(None),
            created_at: Set(Utc::now().into()),
            sent_at: Set(None),
        };
        row.insert(&state.db).await?;
        state.worker.notify();

        Ok(Json(SendResponse::Queued { id, envelope }))
    }
}
