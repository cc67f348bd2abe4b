//! Credential resolution. Account CRUD and envelope-encryption of stored
//! secrets are external concerns (spec §1) — this module only defines the
//! resolved bundle the core consumes and a store-backed resolver that reads
//! it out of the `accounts` table. A real deployment wires a resolver that
//! decrypts secrets from wherever they're vaulted; this one assumes the
//! columns already hold usable plaintext, which is fine for tests and for
//! a deployment that encrypts at rest via a layer below the DB connection.

use async_trait::async_trait;
use sea_orm::{DatabaseConnection, EntityTrait};
use uuid::Uuid;

use crate::db::entities::account;
use crate::error::AppError;

/// Per-account bundle the submission pool, send worker, retrieval client,
/// and inbox agent all consume. Invariant (spec §3): at least one usable
/// credential pair per protocol after resolution — when a protocol-specific
/// override is absent, the primary pair is used for both.
#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub imap_username: String,
    pub imap_password: String,
    pub approval_required: bool,
    pub auto_send_threshold: f64,
    pub review_threshold: f64,
    pub rate_limit_per_hour: Option<i32>,
}

impl ResolvedAccount {
    fn from_model(m: account::Model) -> Self {
        let smtp_username = m.smtp_username.clone().unwrap_or_else(|| m.username.clone());
        let smtp_password = m
            .encrypted_smtp_password
            .clone()
            .unwrap_or_else(|| m.encrypted_password.clone());
        let imap_username = m.imap_username.clone().unwrap_or_else(|| m.username.clone());
        let imap_password = m
            .encrypted_imap_password
            .clone()
            .unwrap_or_else(|| m.encrypted_password.clone());

        Self {
            id: m.id,
            display_name: m.display_name,
            smtp_host: m.smtp_host,
            smtp_port: m.smtp_port as u16,
            imap_host: m.imap_host,
            imap_port: m.imap_port as u16,
            smtp_username,
            smtp_password,
            imap_username,
            imap_password,
            approval_required: m.approval_required,
            auto_send_threshold: m.auto_send_threshold,
            review_threshold: m.review_threshold,
            rate_limit_per_hour: m.rate_limit_per_hour,
        }
    }
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, account_id: Uuid) -> Result<Option<ResolvedAccount>, AppError>;
}

pub struct StoreCredentialResolver {
    db: DatabaseConnection,
}

impl StoreCredentialResolver {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialResolver for StoreCredentialResolver {
    async fn resolve(&self, account_id: Uuid) -> Result<Option<ResolvedAccount>, AppError> {
        let model = account::Entity::find_by_id(account_id).one(&self.db).await?;
        Ok(model.map(ResolvedAccount::from_model))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct FakeCredentialResolver {
        accounts: RwLock<HashMap<Uuid, ResolvedAccount>>,
    }

    impl FakeCredentialResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert(&self, account: ResolvedAccount) {
            self.accounts.write().await.insert(account.id, account);
        }
    }

    #[async_trait]
    impl CredentialResolver for FakeCredentialResolver {
        async fn resolve(&self, account_id: Uuid) -> Result<Option<ResolvedAccount>, AppError> {
            Ok(self.accounts.read().await.get(&account_id).cloned())
        }
    }
}
