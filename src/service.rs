use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    Acquire, SqlitePool,
};

use crate::{
    cache::UserSearchCache,
    config::Config,
    db::{
        audit::AuditEntry,
        message::{Message, RecipientType},
        recipient::Recipient,
        user::User,
    },
    error::Error,
    messenger::{Button, Messenger, Payload},
    resolver::{self, RecipientSpec, Segment},
    sender::{BatchSender, RateLimit},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Text,
    Video,
    Document,
}

/// The message as submitted by the dashboard, before validation turns it
/// into a concrete payload.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageDraft {
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub text: Option<String>,
    pub media_reference: Option<String>,
    #[serde(default)]
    pub buttons: Vec<Button>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastRequest {
    pub recipients: RecipientSpec,
    pub message: MessageDraft,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BroadcastOutcome {
    Sent {
        message_id: i64,
        #[serde(flatten)]
        report: crate::sender::SendReport,
    },
    Scheduled {
        message_id: i64,
        scheduled_at: DateTime<Utc>,
    },
}

#[derive(Debug, Serialize, Default)]
pub struct UnsendReport {
    pub deleted: u32,
    pub failed: u32,
}

#[derive(Clone)]
pub struct Service {
    db: SqlitePool,
    config: Config,
    messenger: Option<Arc<dyn Messenger>>,
    cache: Arc<UserSearchCache>,
}

#[bon::bon]
impl Service {
    #[builder(finish_fn = connect)]
    pub async fn connect_with(
        config: Config,
        messenger: Option<Arc<dyn Messenger>>,
    ) -> eyre::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let cache = Arc::new(UserSearchCache::new(
            pool.clone(),
            Duration::from_secs(config.cache_ttl_secs),
        ));

        Ok(Self {
            db: pool,
            config,
            messenger,
            cache,
        })
    }
}

impl Service {
    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn messenger(&self) -> Option<Arc<dyn Messenger>> {
        self.messenger.clone()
    }

    /// Accepts a send-now or schedule request: resolves and validates
    /// recipients, persists the message with its pending recipient rows,
    /// then either delivers immediately or leaves the row for the
    /// scheduler to discover.
    pub async fn send_broadcast(&self, request: BroadcastRequest) -> Result<BroadcastOutcome, Error> {
        let now = Utc::now();

        let payload = build_payload(&request.message)?;
        let buttons = request.message.buttons.clone();

        if let Some(body) = payload.body() {
            let limit = payload.body_limit();
            if body.chars().count() > limit {
                return Err(Error::PayloadTooLarge { limit });
            }
        }

        if let Some(scheduled_at) = request.scheduled_at {
            if scheduled_at <= now {
                return Err(Error::ScheduleInPast);
            }
            if payload.is_media() {
                return Err(Error::validation(
                    "scheduled sends support plain text only",
                ));
            }
            if !buttons.is_empty() {
                return Err(Error::validation(
                    "scheduled sends do not support buttons",
                ));
            }
        }

        // An immediate send needs the credential; checked before any row
        // is written so a misconfigured service leaves no orphans.
        if request.scheduled_at.is_none() && self.messenger.is_none() {
            return Err(Error::configuration("messaging credential missing"));
        }

        let resolved = resolver::resolve(&self.db, &request.recipients).await?;

        if resolved.users.is_empty() {
            return Err(Error::validation("no recipients resolved"));
        }

        // Validation is done; from here on no partial side effects: the
        // message and its pending recipients land in one transaction.
        let body = payload.body().unwrap_or_default().to_owned();

        let mut tx = self.db.begin().await?;

        let message_id = Message::insert(
            tx.acquire().await?,
            &body,
            resolved.recipient_type,
            resolved.recipient_group.as_deref(),
            resolved.users.len() as i64,
            request.scheduled_at,
            now,
        )
        .await?;

        Recipient::insert_pending(tx.acquire().await?, message_id, &resolved.users).await?;

        tx.commit().await?;

        match request.scheduled_at {
            Some(scheduled_at) => {
                let mut conn = self.db.acquire().await?;
                AuditEntry::insert(
                    &mut conn,
                    "message_scheduled",
                    resolved.users.len() as i64,
                    &payload.preview(),
                    true,
                    json!({ "message_id": message_id, "scheduled_at": scheduled_at }),
                    now,
                )
                .await?;

                tracing::info!(message_id, %scheduled_at, "broadcast scheduled");

                Ok(BroadcastOutcome::Scheduled {
                    message_id,
                    scheduled_at,
                })
            }
            None => {
                let sender = self.batch_sender()?;

                let mut conn = self.db.acquire().await?;
                let pending = Recipient::pending_for_message(&mut conn, message_id).await?;
                drop(conn);

                let report = sender
                    .send_to_all(message_id, &payload, &buttons, &pending, "message_sent")
                    .await?;

                Ok(BroadcastOutcome::Sent { message_id, report })
            }
        }
    }

    /// Deletes the delivered copies of a message at the provider and
    /// transitions those recipients `sent -> deleted`. Per-recipient
    /// delete failures are isolated, like sends.
    pub async fn unsend_message(&self, message_id: i64) -> Result<UnsendReport, Error> {
        let messenger = self
            .messenger
            .clone()
            .ok_or_else(|| Error::configuration("messaging credential missing"))?;

        let mut conn = self.db.acquire().await?;

        let message = Message::get(&mut conn, message_id)
            .await?
            .ok_or_else(|| Error::message_not_found(message_id))?;

        let sent = Recipient::sent_for_message(&mut conn, message_id).await?;

        let mut report = UnsendReport::default();

        for (user_id, external_message_id) in sent {
            match messenger.delete(user_id, external_message_id).await {
                Ok(()) => {
                    Recipient::update_status(
                        &mut conn,
                        message_id,
                        user_id,
                        crate::db::recipient::DeliveryStatus::Deleted,
                        None,
                        None,
                    )
                    .await?;
                    report.deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(message_id, user_id, "delete failed: {e}");
                    report.failed += 1;
                }
            }
        }

        AuditEntry::insert(
            &mut conn,
            "message_deleted",
            i64::from(report.deleted),
            &message.body.chars().take(120).collect::<String>(),
            report.failed == 0,
            json!({
                "message_id": message_id,
                "deleted": report.deleted,
                "failed": report.failed,
            }),
            Utc::now(),
        )
        .await?;

        Ok(report)
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<User>, Error> {
        self.cache.search(query).await
    }

    pub async fn segment_users(&self, segment: &Segment) -> Result<Vec<User>, Error> {
        self.cache.segment(segment).await
    }

    pub async fn upsert_user(&self, user: &User) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;
        User::upsert(&mut conn, user, Utc::now()).await?;
        Ok(())
    }

    pub async fn get_message(&self, id: i64) -> Result<Message, Error> {
        let mut conn = self.db.acquire().await?;
        Message::get(&mut conn, id)
            .await?
            .ok_or_else(|| Error::message_not_found(id))
    }

    pub async fn list_messages(&self, limit: i64) -> Result<Vec<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::list(&mut conn, limit).await?)
    }

    pub async fn message_recipients(&self, id: i64) -> Result<Vec<Recipient>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Recipient::for_message(&mut conn, id).await?)
    }

    pub async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(AuditEntry::recent(&mut conn, limit).await?)
    }

    fn batch_sender(&self) -> Result<BatchSender, Error> {
        let messenger = self
            .messenger
            .clone()
            .ok_or_else(|| Error::configuration("messaging credential missing"))?;

        Ok(BatchSender::new(
            self.db.clone(),
            messenger,
            self.config.send_batch_size,
            RateLimit {
                burst: self.config.sends_per_second,
                per_second: self.config.sends_per_second,
            },
        ))
    }
}

fn build_payload(draft: &MessageDraft) -> Result<Payload, Error> {
    match draft.kind {
        PayloadKind::Text => {
            let text = draft
                .text
                .clone()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| Error::validation("text message requires a non-empty body"))?;

            Ok(Payload::Text { text })
        }
        PayloadKind::Video => {
            let file_id = draft
                .media_reference
                .clone()
                .filter(|r| !r.is_empty())
                .ok_or_else(|| Error::validation("video message requires a media reference"))?;

            Ok(Payload::Video {
                file_id,
                caption: draft.text.clone(),
            })
        }
        PayloadKind::Document => {
            let file_id = draft
                .media_reference
                .clone()
                .filter(|r| !r.is_empty())
                .ok_or_else(|| Error::validation("document message requires a media reference"))?;

            Ok(Payload::Document {
                file_id,
                caption: draft.text.clone(),
            })
        }
    }
}

/// Classifies recipients the way the resolver does, re-exported for the
/// dashboard's incremental selection flow.
pub fn classify_selection(users: &[User]) -> (RecipientType, Option<String>) {
    resolver::classify(users)
}
