use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json, SqliteConnection};

/// Append-only record of a privileged action (send, schedule, delete).
/// Never mutated or deleted.
#[derive(Serialize, Deserialize, FromRow, Debug)]
pub struct AuditEntry {
    pub id: i64,
    pub action_type: String,
    pub affected_count: i64,
    pub message_preview: String,
    pub success: bool,
    pub details: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub async fn insert(
        db: &mut SqliteConnection,
        action_type: &str,
        affected_count: i64,
        message_preview: &str,
        success: bool,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> eyre::Result<()> {
        sqlx::query(
            "INSERT INTO audit_log
                (action_type, affected_count, message_preview, success, details, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(action_type)
        .bind(affected_count)
        .bind(message_preview)
        .bind(success)
        .bind(Json(details))
        .bind(now)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn recent(db: &mut SqliteConnection, limit: i64) -> eyre::Result<Vec<AuditEntry>> {
        Ok(sqlx::query_as(
            "SELECT id, action_type, affected_count, message_preview, success, details, created_at
             FROM audit_log ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(db)
        .await?)
    }
}
