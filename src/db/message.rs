use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RecipientType {
    Individual,
    Group,
}

/// One broadcast unit: a send-now or scheduled request with aggregate
/// delivery stats. Rows are never deleted; they are the audit trail the
/// dashboard reads.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub body: String,
    pub recipient_type: RecipientType,
    pub recipient_group: Option<String>,
    pub total_recipient_count: i64,
    pub successful_delivery_count: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempt_count: i64,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, body, recipient_type, recipient_group, total_recipient_count, \
                       successful_delivery_count, scheduled_at, attempt_count, \
                       last_attempted_at, claimed_at, created_at";

impl Message {
    pub async fn insert(
        db: &mut SqliteConnection,
        body: impl AsRef<str>,
        recipient_type: RecipientType,
        recipient_group: Option<&str>,
        total_recipient_count: i64,
        scheduled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> eyre::Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO messages
                (body, recipient_type, recipient_group, total_recipient_count, scheduled_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(body.as_ref())
        .bind(recipient_type)
        .bind(recipient_group)
        .bind(total_recipient_count)
        .bind(scheduled_at)
        .bind(now)
        .fetch_one(db)
        .await?;

        Ok(id)
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> eyre::Result<Option<Message>> {
        Ok(
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM messages WHERE id = $1"))
                .bind(id)
                .fetch_optional(db)
                .await?,
        )
    }

    pub async fn list(db: &mut SqliteConnection, limit: i64) -> eyre::Result<Vec<Message>> {
        Ok(sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM messages ORDER BY id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(db)
        .await?)
    }

    /// Scheduled messages that are past due and not yet attempted
    /// successfully. `successful_delivery_count = 0` is the "not yet
    /// attempted" proxy; `max_attempts` caps re-selection of messages
    /// where every recipient keeps failing.
    pub async fn find_due(
        db: &mut SqliteConnection,
        now: DateTime<Utc>,
        limit: i64,
        max_attempts: Option<i64>,
    ) -> eyre::Result<Vec<Message>> {
        Ok(sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE scheduled_at IS NOT NULL
               AND scheduled_at <= $1
               AND successful_delivery_count = 0
               AND ($2 IS NULL OR attempt_count < $2)
             ORDER BY scheduled_at ASC
             LIMIT $3"
        ))
        .bind(now)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(db)
        .await?)
    }

    /// Conditionally takes ownership of a due message for one delivery
    /// run. Succeeds only when the message is unclaimed or the previous
    /// claim is older than `stale_before`, so concurrent pollers cannot
    /// both deliver the same message.
    pub async fn claim(
        db: &mut SqliteConnection,
        id: i64,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> eyre::Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET claimed_at = $2
             WHERE id = $1 AND (claimed_at IS NULL OR claimed_at <= $3)",
        )
        .bind(id)
        .bind(now)
        .bind(stale_before)
        .execute(db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drops the claim after a delivery run completes, so a message whose
    /// recipients all failed is due again on the very next cycle. The
    /// staleness window in `claim` only covers holders that crashed.
    pub async fn release_claim(db: &mut SqliteConnection, id: i64) -> eyre::Result<()> {
        sqlx::query("UPDATE messages SET claimed_at = NULL WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(())
    }

    pub async fn record_attempt(
        db: &mut SqliteConnection,
        id: i64,
        now: DateTime<Utc>,
    ) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE messages SET attempt_count = attempt_count + 1, last_attempted_at = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Recounts `sent` recipients into `successful_delivery_count`.
    /// Called after every send run, including partial ones.
    pub async fn recompute_delivery_stats(
        db: &mut SqliteConnection,
        id: i64,
    ) -> eyre::Result<i64> {
        Ok(sqlx::query_scalar(
            "UPDATE messages
             SET successful_delivery_count =
                 (SELECT COUNT(*) FROM recipients
                  WHERE message = $1 AND delivery_status = 'sent')
             WHERE id = $1
             RETURNING successful_delivery_count",
        )
        .bind(id)
        .fetch_one(db)
        .await?)
    }
}
