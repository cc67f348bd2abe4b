//! The send worker (spec §4.2): claim-by-conditional-update, an in-flight
//! dedup set, bounded concurrency via a semaphore, and notify-driven wakeup
//! with a timeout fallback using tokio's `Notify`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::WorkerConfigEnv;
use crate::credentials::CredentialResolver;
use crate::db::entities::outbound_message::{self, status};
use crate::error::AppError;
use crate::mime::{build_message, OutboundParts};
use crate::pool::SubmissionPool;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_retries: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub drain_budget: Duration,
    pub poll_batch: u64,
    pub poll_timeout: Duration,
    pub max_concurrent_sends: usize,
}

impl From<&WorkerConfigEnv> for WorkerConfig {
    fn from(env: &WorkerConfigEnv) -> Self {
        Self {
            max_retries: env.max_retries as i32,
            base_delay: Duration::from_secs(env.base_delay_seconds),
            max_delay: Duration::from_secs(env.max_delay_seconds),
            drain_budget: Duration::from_secs(env.drain_budget_seconds),
            poll_batch: 10,
            poll_timeout: Duration::from_secs(5),
            max_concurrent_sends: 5,
        }
    }
}

pub struct SendWorker {
    db: DatabaseConnection,
    pool: Arc<SubmissionPool>,
    credentials: Arc<dyn CredentialResolver>,
    config: WorkerConfig,
    notify: Arc<Notify>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    stopping: Arc<AtomicBool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SendWorker {
    pub fn new(
        db: DatabaseConnection,
        pool: Arc<SubmissionPool>,
        credentials: Arc<dyn CredentialResolver>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            pool,
            credentials,
            config,
            notify: Arc::new(Notify::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            stopping: Arc::new(AtomicBool::new(false)),
            loop_handle: Mutex::new(None),
        })
    }

    /// Resets any row left in `sending` by a crashed prior process, then
    /// starts the poll loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        self.recover_orphans().await?;
        self.stopping.store(false, Ordering::SeqCst);

        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            worker.poll_loop().await;
        });
        *self.loop_handle.lock().await = Some(handle);
        tracing::info!("send worker started");
        Ok(())
    }

    async fn recover_orphans(&self) -> Result<(), AppError> {
        let orphans = outbound_message::Entity::find()
            .filter(outbound_message::Column::Status.eq(status::SENDING))
            .all(&self.db)
            .await?;
        for orphan in orphans {
            let mut active: outbound_message::ActiveModel = orphan.into();
            active.status = Set(status::QUEUED.to_string());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_one();

        let deadline = tokio::time::Instant::now() + self.config.drain_budget;
        loop {
            if self.in_flight.lock().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
        }
        tracing::info!("send worker stopped");
    }

    async fn poll_loop(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sends));

        while !self.stopping.load(Ordering::SeqCst) {
            let queued = match self.load_queued().await {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::error!(error = %err, "send worker poll error");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if queued.is_empty() {
                let _ = tokio::time::timeout(self.config.poll_timeout, self.notify.notified()).await;
                continue;
            }

            let mut handles = Vec::new();
            for row in queued {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(row.id) {
                    continue;
                }
                drop(in_flight);

                let worker = Arc::clone(&self);
                let permit = Arc::clone(&semaphore).acquire_owned().await;
                let row_id = row.id;
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    worker.process_row(row).await;
                    worker.in_flight.lock().await.remove(&row_id);
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    async fn load_queued(&self) -> Result<Vec<outbound_message::Model>, AppError> {
        let now = Utc::now();
        let rows = outbound_message::Entity::find()
            .filter(outbound_message::Column::Status.eq(status::QUEUED))
            .filter(
                outbound_message::Column::NextRetryAt
                    .is_null()
                    .or(outbound_message::Column::NextRetryAt.lte(now)),
            )
            .order_by_asc(outbound_message::Column::NextRetryAt)
            .order_by_asc(outbound_message::Column::CreatedAt)
            .limit(self.config.poll_batch)
            .all(&self.db)
            .await?;
        Ok(rows)
    }

    async fn process_row(&self, row: outbound_message::Model) {
        let msg_id = row.id;
        match self.try_send(&row).await {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(error = %err, message_id = %msg_id, "send worker internal error");
                let _ = self.mark_failed(msg_id, "Internal worker error").await;
            }
        }
    }

    async fn try_send(&self, row: &outbound_message::Model) -> Result<(), AppError> {
        if !self.claim(row.id).await? {
            return Ok(());
        }

        let account = match self.credentials.resolve(row.account_id).await? {
            Some(account) => account,
            None => {
                self.mark_failed(row.id, "Account not found").await?;
                return Ok(());
            }
        };

        let parts = OutboundParts {
            from_addr: &row.from_addr,
            from_name: account.display_name.as_deref(),
            to_addr: &row.to_addr,
            subject: row.subject.as_deref().unwrap_or(""),
            text: row.text_content.as_deref(),
            html: row.html_content.as_deref(),
            in_reply_to: None,
            references: None,
        };
        let (raw_message, fallback_message_id) = build_message(&parts)
            .map_err(|e| AppError::Internal(e.to_string()))?;

        let send_result = self.send_via_pool(&account, row, &raw_message).await;

        match send_result {
            Ok(server_id) => {
                self.mark_sent(row.id, server_id.unwrap_or(fallback_message_id)).await?;
                tracing::info!(message_id = %row.id, "message sent");
                Ok(())
            }
            Err(err) => self.handle_send_error(row, err).await,
        }
    }

    async fn send_via_pool(
        &self,
        account: &crate::credentials::ResolvedAccount,
        row: &outbound_message::Model,
        raw_message: &[u8],
    ) -> Result<Option<String>, AppError> {
        let mut lease = self.pool.acquire(account.id).await?;
        let result = lease.client_mut().send(&row.from_addr, &row.to_addr, raw_message).await;
        match result {
            Ok(server_id) => {
                lease.release_ok().await;
                Ok(server_id)
            }
            Err(err) => Err(err),
        }
    }

    async fn claim(&self, id: Uuid) -> Result<bool, AppError> {
        use sea_orm::{ConnectionTrait, Statement};
        let backend = self.db.get_database_backend();
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                backend,
                "UPDATE messages SET status = ? WHERE id = ? AND status = ?",
                [status::SENDING.into(), id.to_string().into(), status::QUEUED.into()],
            ))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_sent(&self, id: Uuid, server_message_id: String) -> Result<(), AppError> {
        if let Some(model) = outbound_message::Entity::find_by_id(id).one(&self.db).await? {
            let mut active: outbound_message::ActiveModel = model.into();
            active.status = Set(status::SENT.to_string());
            active.message_id = Set(Some(server_message_id));
            active.sent_at = Set(Some(Utc::now().into()));
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        if let Some(model) = outbound_message::Entity::find_by_id(id).one(&self.db).await? {
            let mut active: outbound_message::ActiveModel = model.into();
            active.status = Set(status::FAILED.to_string());
            active.error = Set(Some(error.to_string()));
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn mark_retry(&self, id: Uuid, error: &str, retry_count: i32, next_retry_at: chrono::DateTime<Utc>) -> Result<(), AppError> {
        if let Some(model) = outbound_message::Entity::find_by_id(id).one(&self.db).await? {
            let mut active: outbound_message::ActiveModel = model.into();
            active.status = Set(status::QUEUED.to_string());
            active.error = Set(Some(error.to_string()));
            active.retry_count = Set(retry_count);
            active.next_retry_at = Set(Some(next_retry_at.into()));
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn handle_send_error(&self, row: &outbound_message::Model, error: AppError) -> Result<(), AppError> {
        match error {
            AppError::Auth(msg) | AppError::RecipientRejected(msg) => {
                self.mark_failed(row.id, &msg).await
            }
            other => {
                let retry_count = row.retry_count;
                if retry_count >= self.config.max_retries {
                    self.mark_failed(row.id, &format!("Max retries exceeded: {other}")).await
                } else {
                    let delay = backoff_delay(self.config.base_delay, self.config.max_delay, retry_count);
                    let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                    tracing::info!(
                        message_id = %row.id,
                        delay_secs = delay.as_secs(),
                        attempt = retry_count + 1,
                        "message scheduled for retry"
                    );
                    self.mark_retry(row.id, &other.to_string(), retry_count + 1, next_retry_at).await
                }
            }
        }
    }
}

/// `min(BASE_DELAY * 2^retry_count, MAX_DELAY)` (spec §4.2).
fn backoff_delay(base: Duration, max: Duration, retry_count: i32) -> Duration {
    let scaled = base.as_secs().saturating_mul(1u64 << retry_count.max(0).min(20));
    Duration::from_secs(scaled.min(max.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_matches_spec() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(600);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, max, 10), Duration::from_secs(600));
    }
}
