use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A mail-hosting tenant: submission + retrieval endpoints, credentials,
/// and the policy thresholds the inbox agent dispatches on.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub smtp_host: String,
    pub smtp_port: i32,
    pub imap_host: String,
    pub imap_port: i32,
    pub username: String,
    #[sea_orm(column_type = "Text")]
    pub encrypted_password: String,
    pub smtp_username: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub encrypted_smtp_password: Option<String>,
    pub imap_username: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub encrypted_imap_password: Option<String>,
    pub display_name: Option<String>,
    pub approval_required: bool,
    pub auto_send_threshold: f64,
    pub review_threshold: f64,
    pub rate_limit_per_hour: Option<i32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub verified_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::outbound_message::Entity")]
    OutboundMessages,
    #[sea_orm(has_many = "super::draft::Entity")]
    Drafts,
}

impl Related<super::outbound_message::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OutboundMessages.def()
    }
}

impl Related<super::draft::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Drafts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
