//! Submission connection pool (spec §4.1). A per-account LIFO idle stack
//! with a concurrency gate, credential versioning, and background eviction,
//! built on tokio primitives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PoolConfigEnv;
use crate::credentials::CredentialResolver;
use crate::error::AppError;
use crate::transport::SmtpClient;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections_per_account: u32,
    pub max_idle: Duration,
    pub max_lifetime: Duration,
    pub cleanup_interval: Duration,
    pub noop_check_before_use: bool,
}

impl From<&PoolConfigEnv> for PoolConfig {
    fn from(env: &PoolConfigEnv) -> Self {
        Self {
            max_connections_per_account: env.max_connections_per_account,
            max_idle: Duration::from_secs(env.max_idle_seconds),
            max_lifetime: Duration::from_secs(env.max_lifetime_seconds),
            cleanup_interval: Duration::from_secs(env.cleanup_interval_seconds),
            noop_check_before_use: env.noop_check_before_use,
        }
    }
}

struct LiveConnection {
    client: SmtpClient,
    created_at: Instant,
    credential_version: u64,
}

struct IdleEntry {
    conn: LiveConnection,
    last_returned_at: Instant,
}

struct AccountState {
    idle: Mutex<Vec<IdleEntry>>,
    semaphore: Arc<Semaphore>,
    credential_version: AtomicU64,
}

pub struct SubmissionPool {
    config: PoolConfig,
    credentials: Arc<dyn CredentialResolver>,
    accounts: Mutex<HashMap<Uuid, Arc<AccountState>>>,
    closed: AtomicBool,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SubmissionPool {
    pub fn new(config: PoolConfig, credentials: Arc<dyn CredentialResolver>) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            credentials,
            accounts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            cleanup_handle: Mutex::new(None),
        });
        pool.clone().spawn_cleanup();
        pool
    }

    fn spawn_cleanup(self: Arc<Self>) {
        let interval = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if self.closed.load(Ordering::SeqCst) {
                    break;
                }
                self.sweep().await;
            }
        });
        // stash the handle without blocking; best-effort since close_all cancels it
        if let Ok(mut guard) = self.cleanup_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn sweep(&self) {
        let accounts: Vec<Arc<AccountState>> = self.accounts.lock().await.values().cloned().collect();
        for state in accounts {
            let expired: Vec<IdleEntry> = {
                let mut idle = state.idle.lock().await;
                let (keep, expired): (Vec<_>, Vec<_>) = idle.drain(..).partition(|entry| {
                    entry.conn.created_at.elapsed() <= self.config.max_lifetime
                        && entry.last_returned_at.elapsed() <= self.config.max_idle
                });
                *idle = keep;
                expired
            };
            for mut entry in expired {
                entry.conn.client.quit().await;
            }
        }
    }

    async fn account_state(&self, account_id: Uuid) -> Arc<AccountState> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(account_id)
            .or_insert_with(|| {
                Arc::new(AccountState {
                    idle: Mutex::new(Vec::new()),
                    semaphore: Arc::new(Semaphore::new(
                        self.config.max_connections_per_account as usize,
                    )),
                    credential_version: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Acquires a scoped lease, blocking on the account's concurrency gate.
    pub async fn acquire(self: &Arc<Self>, account_id: Uuid) -> Result<Lease, AppError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Internal("submission pool is closed".to_string()));
        }

        let state = self.account_state(account_id).await;
        let permit = Arc::clone(&state.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal("submission pool is closed".to_string()))?;

        let current_version = state.credential_version.load(Ordering::SeqCst);
        let reused = self.take_reusable(&state, current_version).await;

        let conn = match reused {
            Some(conn) => conn,
            None => {
                let account = self
                    .credentials
                    .resolve(account_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound("account not found".to_string()))?;
                let client = SmtpClient::connect(
                    &account.smtp_host,
                    account.smtp_port,
                    &account.smtp_username,
                    &account.smtp_password,
                )
                .await?;
                LiveConnection {
                    client,
                    created_at: Instant::now(),
                    credential_version: current_version,
                }
            }
        };

        Ok(Lease {
            inner: Some(LeaseInner {
                account_id,
                conn,
                permit,
                pool: Arc::clone(self),
                state,
            }),
        })
    }

    async fn take_reusable(
        &self,
        state: &Arc<AccountState>,
        current_version: u64,
    ) -> Option<LiveConnection> {
        loop {
            let candidate = {
                let mut idle = state.idle.lock().await;
                idle.pop()
            };
            let Some(mut entry) = candidate else {
                return None;
            };

            let stale = entry.conn.credential_version != current_version
                || entry.conn.created_at.elapsed() > self.config.max_lifetime
                || entry.last_returned_at.elapsed() > self.config.max_idle;
            if stale {
                entry.conn.client.quit().await;
                continue;
            }

            if self.config.noop_check_before_use && entry.conn.client.noop().await.is_err() {
                entry.conn.client.quit().await;
                continue;
            }

            return Some(entry.conn);
        }
    }

    /// Bumps the account's credential version and discards its idle pool.
    /// In-flight leases are closed on release instead of reused (spec §4.1).
    pub async fn invalidate(&self, account_id: Uuid) {
        let state = self.account_state(account_id).await;
        state.credential_version.fetch_add(1, Ordering::SeqCst);
        let drained: Vec<IdleEntry> = state.idle.lock().await.drain(..).collect();
        for mut entry in drained {
            tokio::spawn(async move {
                entry.conn.client.quit().await;
            });
        }
    }

    /// Terminal shutdown: closes every idle connection and fails future acquires.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            handle.abort();
        }
        let accounts: Vec<Arc<AccountState>> = self.accounts.lock().await.values().cloned().collect();
        for state in accounts {
            let drained: Vec<IdleEntry> = state.idle.lock().await.drain(..).collect();
            for mut entry in drained {
                entry.conn.client.quit().await;
            }
        }
    }
}

struct LeaseInner {
    account_id: Uuid,
    conn: LiveConnection,
    permit: OwnedSemaphorePermit,
    pool: Arc<SubmissionPool>,
    state: Arc<AccountState>,
}

/// Scoped lease on a live, authenticated submission client. Call
/// `release_ok()` when the send succeeded; dropping without releasing (the
/// `?`-propagation path on failure) always closes the connection.
pub struct Lease {
    inner: Option<LeaseInner>,
}

impl Lease {
    pub fn client_mut(&mut self) -> &mut SmtpClient {
        &mut self.inner.as_mut().expect("lease already released").conn.client
    }

    pub fn account_id(&self) -> Uuid {
        self.inner.as_ref().expect("lease already released").account_id
    }

    /// Returns the connection to the account's idle stack.
    pub async fn release_ok(mut self) {
        if let Some(mut inner) = self.inner.take() {
            let current_version = inner.state.credential_version.load(Ordering::SeqCst);
            if inner.conn.credential_version != current_version {
                inner.conn.client.quit().await;
                return;
            }
            let entry = IdleEntry {
                conn: inner.conn,
                last_returned_at: Instant::now(),
            };
            inner.state.idle.lock().await.push(entry);
            // `permit` and `pool` drop here, releasing the concurrency gate.
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            tokio::spawn(async move {
                inner.conn.client.quit().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_converts_from_env_struct() {
        let env = PoolConfigEnv {
            max_connections_per_account: 3,
            max_idle_seconds: 100,
            max_lifetime_seconds: 200,
            cleanup_interval_seconds: 10,
            noop_check_before_use: false,
        };
        let config = PoolConfig::from(&env);
        assert_eq!(config.max_connections_per_account, 3);
        assert_eq!(config.max_idle, Duration::from_secs(100));
        assert_eq!(config.max_lifetime, Duration::from_secs(200));
        assert!(!config.noop_check_before_use);
    }
}
