use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Journal entry for each processed inbound message. The unique constraint
/// on `inbound_message_id` is the sole source of dedup idempotence.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agent_actions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub inbound_message_id: String,
    pub from_addr: Option<String>,
    pub subject: Option<String>,
    pub classification: Option<String>,
    pub confidence: Option<f64>,
    pub action: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub reasoning: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub draft_reply: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub escalation_note: Option<String>,
    pub outbound_message_id: Option<Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
