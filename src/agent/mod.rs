//! The inbox agent (spec §4.4): poll → dedup via `agent_actions` → build
//! context → classify via LLM → dispatch → journal. The background loop
//! follows the same swallow-and-continue discipline as the send worker.

pub mod llm;
pub mod prompts;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::credentials::{CredentialResolver, ResolvedAccount};
use crate::db::entities::{agent_action, draft, outbound_message};
use crate::embeddings::EmbeddingsClient;
use crate::error::AppError;
use crate::mime::{build_message, OutboundParts};
use crate::pool::SubmissionPool;
use crate::retrieval::{ImapRetrievalClient, InboundMessage, Retriever};

use self::llm::LlmClient;
use self::prompts::{system_prompt, user_prompt, PromptArgs};

const BODY_TRUNCATE_CHARS: usize = 4000;
const THREAD_MESSAGE_TRUNCATE_CHARS: usize = 1000;
const SEMANTIC_QUERY_TRUNCATE_CHARS: usize = 500;
const SEMANTIC_RESULT_LIMIT: usize = 3;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub account_id: Option<Uuid>,
    pub poll_interval: Duration,
    pub escalation_email: Option<String>,
    pub send_from: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Classification {
    AutoReply,
    DraftForReview,
    Escalate,
    Ignore,
}

impl Classification {
    fn as_str(&self) -> &'static str {
        match self {
            Classification::AutoReply => "auto_reply",
            Classification::DraftForReview => "draft_for_review",
            Classification::Escalate => "escalate",
            Classification::Ignore => "ignore",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "auto_reply" => Classification::AutoReply,
            "draft_for_review" => Classification::DraftForReview,
            "ignore" => Classification::Ignore,
            _ => Classification::Escalate,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ClassifierReply {
    #[serde(default = "default_classification")]
    classification: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    draft_reply: Option<String>,
    #[serde(default)]
    escalation_note: Option<String>,
    #[serde(default)]
    signals: serde_json::Value,
}

fn default_classification() -> String {
    "escalate".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub last_poll: Option<DateTime<Utc>>,
    pub poll_count: u64,
    pub poll_interval: u64,
    pub action_counts: HashMap<String, u64>,
}

pub struct InboxAgent {
    db: DatabaseConnection,
    credentials: Arc<dyn CredentialResolver>,
    pool: Arc<SubmissionPool>,
    llm: LlmClient,
    embeddings: EmbeddingsClient,
    settings: AgentSettings,
    stopping: Arc<AtomicBool>,
    last_poll: Mutex<Option<DateTime<Utc>>>,
    poll_count: AtomicU64,
    action_counts: Mutex<HashMap<String, u64>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl InboxAgent {
    pub fn new(
        db: DatabaseConnection,
        credentials: Arc<dyn CredentialResolver>,
        pool: Arc<SubmissionPool>,
        llm: LlmClient,
        embeddings: EmbeddingsClient,
        settings: AgentSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            credentials,
            pool,
            llm,
            embeddings,
            settings,
            stopping: Arc::new(AtomicBool::new(false)),
            last_poll: Mutex::new(None),
            poll_count: AtomicU64::new(0),
            action_counts: Mutex::new(HashMap::new()),
            loop_handle: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        self.stopping.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        let agent = Arc::clone(self);
        let handle = tokio::spawn(async move {
            agent.poll_loop().await;
        });
        *self.loop_handle.lock().await = Some(handle);
        tracing::info!(interval_secs = self.settings.poll_interval.as_secs(), "inbox agent started");
    }

    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
        }
        tracing::info!("inbox agent stopped");
    }

    pub async fn status(&self) -> AgentStatus {
        AgentStatus {
            running: self.running.load(Ordering::SeqCst),
            last_poll: *self.last_poll.lock().await,
            poll_count: self.poll_count.load(Ordering::SeqCst),
            poll_interval: self.settings.poll_interval.as_secs(),
            action_counts: self.action_counts.lock().await.clone(),
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        while !self.stopping.load(Ordering::SeqCst) {
            if let Err(err) = self.poll_once().await {
                tracing::error!(error = %err, "inbox agent poll error");
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Runs a single poll cycle; exposed for the status endpoint's
    /// "poll now" affordance and for tests.
    pub async fn poll_once(&self) -> Result<Vec<agent_action::Model>, AppError> {
        let Some(account_id) = self.settings.account_id else {
            tracing::warn!("inbox agent: no account configured");
            return Ok(Vec::new());
        };

        let Some(account) = self.credentials.resolve(account_id).await? else {
            tracing::error!(%account_id, "inbox agent: account not found");
            return Ok(Vec::new());
        };

        *self.last_poll.lock().await = Some(Utc::now());
        self.poll_count.fetch_add(1, Ordering::SeqCst);

        let retriever = ImapRetrievalClient::new(
            account.imap_host.clone(),
            account.imap_port,
            account.imap_username.clone(),
            account.imap_password.clone(),
        );

        let unread = match retriever.fetch_unread().await {
            Ok(messages) => messages,
            Err(err) => {
                tracing::error!(error = %err, "inbox agent: IMAP fetch failed");
                return Ok(Vec::new());
            }
        };
        tracing::info!(count = unread.len(), "inbox agent: found unread messages");

        let mut records = Vec::new();
        for msg in unread {
            if self.already_processed(&msg).await? {
                continue;
            }
            match self.process_message(&account, &retriever, &msg).await {
                Ok(record) => records.push(record),
                Err(err) => tracing::error!(error = %err, uid = msg.uid, "inbox agent: failed to process message"),
            }
        }
        Ok(records)
    }

    async fn already_processed(&self, msg: &InboundMessage) -> Result<bool, AppError> {
        let key = msg.dedup_key();
        let existing = agent_action::Entity::find()
            .filter(agent_action::Column::InboundMessageId.eq(key))
            .one(&self.db)
            .await?;
        Ok(existing.is_some())
    }

    async fn process_message(
        &self,
        account: &ResolvedAccount,
        retriever: &ImapRetrievalClient,
        msg: &InboundMessage,
    ) -> Result<agent_action::Model, AppError> {
        let body: String = if !msg.text_body.is_empty() {
            msg.text_body.clone()
        } else {
            msg.html_body.clone().unwrap_or_default()
        };
        let body: String = body.chars().take(BODY_TRUNCATE_CHARS).collect();

        let thread_context = self.fetch_thread_context(retriever, msg).await;
        let semantic_context = self.fetch_semantic_context(account, msg).await;

        let prompt_args = PromptArgs {
            from_addr: &msg.from_addr,
            subject: &msg.subject,
            date: msg.date.as_deref().unwrap_or("unknown"),
            body: &body,
            thread_context: &thread_context,
            semantic_context: &semantic_context,
        };
        let prompt = user_prompt(&prompt_args);
        let system = system_prompt(account.display_name.as_deref());

        let reply = self.llm.chat_completion(&system, &prompt).await?;
        let parsed = parse_classifier_reply(&reply);

        let classification = Classification::parse(&parsed.classification);
        let mut outbound_message_id: Option<Uuid> = None;

        match classification {
            Classification::AutoReply if parsed.draft_reply.as_deref().is_some_and(|s| !s.trim().is_empty()) => {
                let reply_text = parsed.draft_reply.as_deref().unwrap();
                outbound_message_id = self.send_reply(account, msg, reply_text).await.unwrap_or(None);
                self.mark_seen_safe(retriever, msg.uid).await;
            }
            Classification::DraftForReview if parsed.draft_reply.as_deref().is_some_and(|s| !s.trim().is_empty()) => {
                self.create_review_draft(account, msg, parsed.draft_reply.as_deref().unwrap(), &parsed)
                    .await
                    .ok();
                self.mark_seen_safe(retriever, msg.uid).await;
            }
            Classification::Escalate => {
                let note = parsed
                    .escalation_note
                    .clone()
                    .unwrap_or_else(|| parsed.reasoning.clone());
                self.create_escalation_draft(account, msg, &note, &parsed).await.ok();
                self.mark_seen_safe(retriever, msg.uid).await;
            }
            Classification::Ignore => {
                self.mark_seen_safe(retriever, msg.uid).await;
            }
            // classification demanded a draft but the model returned none;
            // fall through to journaling only, leaving the message unseen
            // so the next poll can reattempt.
            _ => {}
        }

        self.bump_action_count(classification.as_str()).await;

        let record = self
            .record_action(msg, &classification, &parsed, outbound_message_id)
            .await?;

        tracing::info!(
            action = classification.as_str(),
            confidence = parsed.confidence,
            subject = %msg.subject,
            from = %msg.from_addr,
            "inbox agent dispatched message"
        );
        Ok(record)
    }

    async fn fetch_thread_context(&self, retriever: &ImapRetrievalClient, msg: &InboundMessage) -> String {
        if msg.in_reply_to.is_none() && msg.references.is_none() {
            return String::new();
        }
        let Some(target_id) = msg.in_reply_to.clone().or_else(|| msg.message_id.clone()) else {
            return String::new();
        };
        let thread = match retriever.thread(&target_id).await {
            Ok(thread) => thread,
            Err(_) => return String::new(),
        };

        let parts: Vec<String> = thread
            .into_iter()
            .filter(|m| m.message_id != msg.message_id)
            .map(|m| {
                let preview: String = m.text_body.chars().take(THREAD_MESSAGE_TRUNCATE_CHARS).collect();
                format!("From: {}\nDate: {}\n{}\n", m.from_addr, m.date.unwrap_or_else(|| "unknown".to_string()), preview)
            })
            .collect();
        parts.join("\n---\n")
    }

    async fn fetch_semantic_context(&self, account: &ResolvedAccount, msg: &InboundMessage) -> String {
        let body_preview: String = msg.text_body.chars().take(SEMANTIC_QUERY_TRUNCATE_CHARS).collect();
        let query = format!("{} {}", msg.subject, body_preview);
        let results = match self
            .embeddings
            .find_similar(&self.db, account.id, &query, SEMANTIC_RESULT_LIMIT)
            .await
        {
            Ok(results) => results,
            Err(_) => return String::new(),
        };
        if results.is_empty() {
            return String::new();
        }

        results
            .into_iter()
            .map(|r| format!("Message: {}\nRelevance: {:.2}\n", r.message_id, r.score))
            .collect::<Vec<_>>()
            .join("\n---\n")
    }

    async fn send_reply(
        &self,
        account: &ResolvedAccount,
        inbound: &InboundMessage,
        reply_text: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let from_addr = self.settings.send_from.clone().unwrap_or_else(|| account.smtp_username.clone());
        let to_addr = extract_email(&inbound.from_addr);
        let subject = format!("Re: {}", inbound.subject);

        let parts = OutboundParts {
            from_addr: &from_addr,
            from_name: account.display_name.as_deref(),
            to_addr: &to_addr,
            subject: &subject,
            text: Some(reply_text),
            html: None,
            in_reply_to: inbound.message_id.as_deref(),
            references: inbound.message_id.as_deref(),
        };
        let (raw_message, fallback_message_id) = build_message(&parts).map_err(|e| AppError::Internal(e.to_string()))?;

        let mut lease = self.pool.acquire(account.id).await?;
        let send_result = lease.client_mut().send(&from_addr, &to_addr, &raw_message).await;
        let server_id = match send_result {
            Ok(id) => {
                lease.release_ok().await;
                id.unwrap_or(fallback_message_id)
            }
            Err(err) => {
                tracing::error!(error = %err, "inbox agent: failed to send auto-reply");
                return Ok(None);
            }
        };

        let row = outbound_message::ActiveModel {
            id: Set(Uuid::new_v4()),
            account_id: Set(account.id),
            message_id: Set(Some(server_id)),
            direction: Set("outbound".to_string()),
            from_addr: Set(from_addr),
            to_addr: Set(to_addr),
            subject: Set(Some(subject)),
            status: Set(outbound_message::status::SENT.to_string()),
            error: Set(None),
            text_content: Set(Some(reply_text.to_string())),
            html_content: Set(None),
            retry_count: Set(0),
            next_retry_at: Set(None),
            created_at: Set(Utc::now().into()),
            sent_at: Set(Some(Utc::now().into())),
        };
        let inserted = row.insert(&self.db).await?;
        Ok(Some(inserted.id))
    }

    async fn create_review_draft(
        &self,
        account: &ResolvedAccount,
        inbound: &InboundMessage,
        draft_text: &str,
        parsed: &ClassifierReply,
    ) -> Result<(), AppError> {
        let metadata = serde_json::json!({
            "agent": "inbox-agent",
            "classification": parsed.classification,
            "confidence": parsed.confidence,
            "reasoning": parsed.reasoning,
            "signals": parsed.signals,
            "inbound_message_id": inbound.message_id,
            "inbound_from": inbound.from_addr,
            "inbound_subject": inbound.subject,
            "inbound_date": inbound.date,
        });
        let active = draft::ActiveModel {
            id: Set(Uuid::new_v4()),
            account_id: Set(account.id),
            status: Set(draft::status::DRAFT.to_string()),
            to_addr: Set(extract_email(&inbound.from_addr)),
            subject: Set(Some(format!("Re: {}", inbound.subject))),
            text_content: Set(Some(draft_text.to_string())),
            html_content: Set(None),
            in_reply_to: Set(inbound.message_id.clone()),
            metadata: Set(Some(metadata)),
            message_id: Set(None),
            send_after: Set(None),
            snoozed_until: Set(None),
            created_at: Set(Utc::now().into()),
            updated_at: Set(Utc::now().into()),
            sent_at: Set(None),
            created_by: Set(Some("inbox-agent".to_string())),
        };
        active.insert(&self.db).await?;
        Ok(())
    }

    async fn create_escalation_draft(
        &self,
        account: &ResolvedAccount,
        inbound: &InboundMessage,
        escalation_note: &str,
        parsed: &ClassifierReply,
    ) -> Result<(), AppError> {
        let metadata = serde_json::json!({
            "agent": "inbox-agent",
            "classification": "escalate",
            "confidence": parsed.confidence,
            "escalation_note": escalation_note,
            "signals": parsed.signals,
            "inbound_message_id": inbound.message_id,
            "inbound_from": inbound.from_addr,
            "inbound_subject": inbound.subject,
            "inbound_date": inbound.date,
        });
        let active = draft::ActiveModel {
            id: Set(Uuid::new_v4()),
            account_id: Set(account.id),
            status: Set(draft::status::DRAFT.to_string()),
            to_addr: Set(extract_email(&inbound.from_addr)),
            subject: Set(Some(format!("Re: {}", inbound.subject))),
            text_content: Set(None),
            html_content: Set(None),
            in_reply_to: Set(inbound.message_id.clone()),
            metadata: Set(Some(metadata)),
            message_id: Set(None),
            send_after: Set(None),
            snoozed_until: Set(None),
            created_at: Set(Utc::now().into()),
            updated_at: Set(Utc::now().into()),
            sent_at: Set(None),
            created_by: Set(Some("inbox-agent".to_string())),
        };
        active.insert(&self.db).await?;
        Ok(())
    }

    async fn mark_seen_safe(&self, retriever: &ImapRetrievalClient, uid: u32) {
        if let Err(err) = retriever.mark_seen(uid).await {
            tracing::error!(error = %err, uid, "inbox agent: failed to mark uid seen");
        }
    }

    async fn bump_action_count(&self, action: &str) {
        let mut counts = self.action_counts.lock().await;
        *counts.entry(action.to_string()).or_insert(0) += 1;
    }

    async fn record_action(
        &self,
        msg: &InboundMessage,
        classification: &Classification,
        parsed: &ClassifierReply,
        outbound_message_id: Option<Uuid>,
    ) -> Result<agent_action::Model, AppError> {
        let active = agent_action::ActiveModel {
            id: Set(Uuid::new_v4()),
            inbound_message_id: Set(msg.dedup_key()),
            from_addr: Set(Some(msg.from_addr.clone())),
            subject: Set(Some(msg.subject.clone())),
            classification: Set(Some(parsed.classification.clone())),
            confidence: Set(Some(parsed.confidence)),
            action: Set(Some(classification.as_str().to_string())),
            reasoning: Set(Some(parsed.reasoning.clone())),
            draft_reply: Set(parsed.draft_reply.clone()),
            escalation_note: Set(parsed.escalation_note.clone()),
            outbound_message_id: Set(outbound_message_id),
            created_at: Set(Utc::now().into()),
        };
        Ok(active.insert(&self.db).await?)
    }
}

/// Strips code-fence framing and parses the classifier's JSON response;
/// any failure coerces to `escalate` with confidence 0 (spec §4.4 step 5).
fn parse_classifier_reply(raw: &str) -> ClassifierReply {
    let trimmed = raw.trim();
    let stripped = if trimmed.starts_with("```") {
        trimmed
            .lines()
            .filter(|line| !line.trim_start().starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        trimmed.to_string()
    };

    match serde_json::from_str::<ClassifierReply>(&stripped) {
        Ok(reply) => reply,
        Err(_) => ClassifierReply {
            classification: "escalate".to_string(),
            confidence: 0.0,
            reasoning: "Failed to parse LLM response".to_string(),
            draft_reply: None,
            escalation_note: Some("LLM response was not valid JSON. Manual review needed.".to_string()),
            signals: serde_json::Value::Null,
        },
    }
}

fn extract_email(addr: &str) -> String {
    if let (Some(start), Some(end)) = (addr.find('<'), addr.find('>')) {
        if end > start {
            return addr[start + 1..end].to_string();
        }
    }
    addr.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_classifier_json() {
        let raw = r#"{"classification":"auto_reply","confidence":0.9,"reasoning":"clear","draft_reply":"Sure thing","escalation_note":null,"signals":{"kb_match":true}}"#;
        let parsed = parse_classifier_reply(raw);
        assert_eq!(parsed.classification, "auto_reply");
        assert_eq!(parsed.draft_reply.as_deref(), Some("Sure thing"));
    }

    #[test]
    fn strips_code_fence_before_parsing() {
        let raw = "```json\n{\"classification\":\"ignore\",\"confidence\":0.99,\"reasoning\":\"spam\"}\n```";
        let parsed = parse_classifier_reply(raw);
        assert_eq!(parsed.classification, "ignore");
    }

    #[test]
    fn coerces_unparseable_reply_to_escalate_with_zero_confidence() {
        let parsed = parse_classifier_reply("not json at all");
        assert_eq!(parsed.classification, "escalate");
        assert_eq!(parsed.confidence, 0.0);
        assert!(parsed.escalation_note.is_some());
    }

    #[test]
    fn extracts_email_from_display_name_format() {
        assert_eq!(extract_email("Jane Doe <jane@example.com>"), "jane@example.com");
        assert_eq!(extract_email("jane@example.com"), "jane@example.com");
    }
}
