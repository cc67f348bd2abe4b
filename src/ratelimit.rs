//! Per-account hourly send cap (spec §4.6). No separate counter table —
//! admission is decided by counting the trailing hour directly off
//! `messages` rather than introducing a bucket/token-bucket structure the
//! spec never calls for.

use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use uuid::Uuid;

use crate::db::entities::outbound_message;
use crate::error::AppError;

/// Returns `Ok(())` if sending is admitted, or `Err(AppError::RateLimit)`
/// with the configured limit when the trailing-hour count has reached it.
/// Accounts with no configured cap are unlimited.
pub async fn check_admission(
    db: &DatabaseConnection,
    account_id: Uuid,
    rate_limit_per_hour: Option<i32>,
) -> Result<(), AppError> {
    let Some(limit) = rate_limit_per_hour else {
        return Ok(());
    };

    let since = Utc::now() - ChronoDuration::hours(1);
    let count = outbound_message::Entity::find()
        .filter(outbound_message::Column::AccountId.eq(account_id))
        .filter(outbound_message::Column::CreatedAt.gte(since))
        .count(db)
        .await?;

    if count as i64 >= limit as i64 {
        return Err(AppError::RateLimit { limit });
    }
    Ok(())
}
