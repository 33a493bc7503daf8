use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::time::Instant;

use crate::{
    db::{
        audit::AuditEntry,
        message::Message,
        recipient::{DeliveryStatus, PendingRecipient, Recipient},
    },
    messenger::{Button, Messenger, Payload},
};

/// Outbound pacing policy. The default reproduces the provider-friendly
/// envelope of ten sends followed by a one-second pause.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub burst: u32,
    pub per_second: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            burst: 10,
            per_second: 10,
        }
    }
}

/// Token bucket: starts full at `burst`, refills continuously. `acquire`
/// sleeps until a token is available.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    updated: Instant,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        let capacity = f64::from(limit.burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: f64::from(limit.per_second.max(1)),
            updated: Instant::now(),
        }
    }

    pub async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.updated).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.updated = now;

            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }

            let deficit = (1.0 - self.tokens) / self.refill_per_sec;
            tokio::time::sleep(Duration::from_secs_f64(deficit)).await;
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct RecipientError {
    pub user_id: i64,
    pub error: String,
}

/// Aggregate outcome of one delivery run. The run itself always
/// completes; per-recipient failures are collected, never raised.
#[derive(Serialize, Debug, Clone, Default)]
pub struct SendReport {
    pub sent: u32,
    pub failed: u32,
    pub errors: Vec<RecipientError>,
}

/// Delivers one message to a resolved recipient list in rate-limited
/// batches, recording each outcome in the delivery record store.
pub struct BatchSender {
    db: SqlitePool,
    messenger: Arc<dyn Messenger>,
    batch_size: usize,
    limit: RateLimit,
}

impl BatchSender {
    pub fn new(
        db: SqlitePool,
        messenger: Arc<dyn Messenger>,
        batch_size: usize,
        limit: RateLimit,
    ) -> Self {
        Self {
            db,
            messenger,
            batch_size: batch_size.max(1),
            limit,
        }
    }

    /// Sends to every recipient in list order, batch by batch. One bad
    /// recipient never aborts the run. Afterwards the aggregate stats are
    /// recomputed and one audit entry summarizes the run.
    pub async fn send_to_all(
        &self,
        message_id: i64,
        payload: &Payload,
        buttons: &[Button],
        recipients: &[PendingRecipient],
        action_type: &str,
    ) -> eyre::Result<SendReport> {
        let mut report = SendReport::default();
        let mut bucket = TokenBucket::new(self.limit);
        let mut conn = self.db.acquire().await?;

        let batches = recipients.chunks(self.batch_size);
        let batch_count = batches.len();

        for (index, batch) in batches.enumerate() {
            tracing::debug!(
                message_id,
                batch = index + 1,
                of = batch_count,
                "sending batch"
            );

            for recipient in batch {
                bucket.acquire().await;

                match self.messenger.send(recipient.user_id, payload, buttons).await {
                    Ok(external_message_id) => {
                        Recipient::update_status(
                            &mut conn,
                            message_id,
                            recipient.user_id,
                            DeliveryStatus::Sent,
                            Some(external_message_id),
                            None,
                        )
                        .await?;
                        report.sent += 1;
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        tracing::warn!(
                            message_id,
                            user_id = recipient.user_id,
                            error = %reason,
                            "delivery failed"
                        );

                        Recipient::update_status(
                            &mut conn,
                            message_id,
                            recipient.user_id,
                            DeliveryStatus::Failed,
                            None,
                            Some(&reason),
                        )
                        .await?;

                        report.failed += 1;
                        report.errors.push(RecipientError {
                            user_id: recipient.user_id,
                            error: reason,
                        });
                    }
                }
            }
        }

        let delivered = Message::recompute_delivery_stats(&mut conn, message_id).await?;

        AuditEntry::insert(
            &mut conn,
            action_type,
            recipients.len() as i64,
            &payload.preview(),
            report.failed == 0,
            json!({
                "message_id": message_id,
                "sent": report.sent,
                "failed": report.failed,
                "errors": report.errors,
            }),
            Utc::now(),
        )
        .await?;

        tracing::info!(
            message_id,
            sent = report.sent,
            failed = report.failed,
            delivered,
            "delivery run complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_paces_beyond_burst() {
        let mut bucket = TokenBucket::new(RateLimit {
            burst: 2,
            per_second: 10,
        });

        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third token only exists after a refill interval.
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
