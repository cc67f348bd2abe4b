use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A pending outbound composition subject to human approval.
/// Transitions are exclusively `draft -> {discarded, sent}`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "drafts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub account_id: Uuid,
    pub status: String,
    pub to_addr: String,
    pub subject: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub text_content: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub html_content: Option<String>,
    pub in_reply_to: Option<String>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub metadata: Option<serde_json::Value>,
    pub message_id: Option<String>,
    pub send_after: Option<chrono::DateTime<chrono::Utc>>,
    pub snoozed_until: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::AccountId",
        to = "super::account::Column::Id"
    )]
    Account,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// `status` column values.
pub mod status {
    pub const DRAFT: &str = "draft";
    pub const DISCARDED: &str = "discarded";
    pub const SENT: &str = "sent";
}
