use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Cached embedding for an inbound message, keyed by content hash so
/// re-embedding identical `(subject, body)` text is skipped.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "message_embeddings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub message_id: String,
    pub account_id: Uuid,
    pub content_hash: String,
    pub embedding: Vec<u8>,
    pub model: String,
    pub embedded_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
