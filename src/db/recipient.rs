use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

use crate::db::user::User;

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
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Deleted,
}

/// One (message, user) delivery attempt record. Unique per pair;
/// `external_message_id` is present exactly when the provider accepted
/// the send (and survives the `sent -> deleted` transition).
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct Recipient {
    pub id: i64,
    pub message: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub delivery_status: DeliveryStatus,
    pub external_message_id: Option<i64>,
    pub error: Option<String>,
}

/// A pending recipient with addressing fields resolved best-effort from
/// the user store when the snapshot taken at enqueue time lacks them.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct PendingRecipient {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

impl Recipient {
    /// Bulk-inserts one `pending` row per user. Callers run this in the
    /// same transaction as the message insert.
    pub async fn insert_pending(
        db: &mut SqliteConnection,
        message_id: i64,
        users: &[User],
    ) -> eyre::Result<()> {
        for user in users {
            sqlx::query(
                "INSERT INTO recipients (message, user_id, username) VALUES ($1, $2, $3)",
            )
            .bind(message_id)
            .bind(user.user_id)
            .bind(user.username.as_deref())
            .execute(&mut *db)
            .await?;
        }

        Ok(())
    }

    /// Idempotent per-key status write: re-applying the same status is a
    /// no-op in effect, and an absent external id never clears a stored
    /// one.
    pub async fn update_status(
        db: &mut SqliteConnection,
        message_id: i64,
        user_id: i64,
        status: DeliveryStatus,
        external_message_id: Option<i64>,
        error: Option<&str>,
    ) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE recipients
             SET delivery_status = $3,
                 external_message_id = COALESCE($4, external_message_id),
                 error = $5
             WHERE message = $1 AND user_id = $2",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(status)
        .bind(external_message_id)
        .bind(error)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn for_message(
        db: &mut SqliteConnection,
        message_id: i64,
    ) -> eyre::Result<Vec<Recipient>> {
        let mut stream = sqlx::query_as(
            "SELECT id, message, user_id, username, delivery_status, external_message_id, error
             FROM recipients WHERE message = $1 ORDER BY id",
        )
        .bind(message_id)
        .fetch(db);

        let mut recipients = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            recipients.push(res);
        }

        Ok(recipients)
    }

    pub async fn pending_for_message(
        db: &mut SqliteConnection,
        message_id: i64,
    ) -> eyre::Result<Vec<PendingRecipient>> {
        Ok(sqlx::query_as(
            "SELECT r.user_id,
                    COALESCE(r.username, u.username) AS username,
                    u.first_name
             FROM recipients r
             LEFT JOIN users u ON u.user_id = r.user_id
             WHERE r.message = $1 AND r.delivery_status = 'pending'
             ORDER BY r.id",
        )
        .bind(message_id)
        .fetch_all(db)
        .await?)
    }

    /// Recipients a scheduled delivery run should attempt: the not yet
    /// attempted plus earlier failures, which get retried on the next
    /// cycle.
    pub async fn retryable_for_message(
        db: &mut SqliteConnection,
        message_id: i64,
    ) -> eyre::Result<Vec<PendingRecipient>> {
        Ok(sqlx::query_as(
            "SELECT r.user_id,
                    COALESCE(r.username, u.username) AS username,
                    u.first_name
             FROM recipients r
             LEFT JOIN users u ON u.user_id = r.user_id
             WHERE r.message = $1 AND r.delivery_status IN ('pending', 'failed')
             ORDER BY r.id",
        )
        .bind(message_id)
        .fetch_all(db)
        .await?)
    }

    /// Delivered recipients with their provider message ids, as needed by
    /// the unsend action.
    pub async fn sent_for_message(
        db: &mut SqliteConnection,
        message_id: i64,
    ) -> eyre::Result<Vec<(i64, i64)>> {
        Ok(sqlx::query_as(
            "SELECT user_id, external_message_id FROM recipients
             WHERE message = $1 AND delivery_status = 'sent'
               AND external_message_id IS NOT NULL
             ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(db)
        .await?)
    }
}
