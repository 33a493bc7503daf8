use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    db::{message::Message, recipient::Recipient},
    error::Error,
    messenger::Payload,
    sender::{BatchSender, RateLimit},
    service::Service,
};

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// A previous cycle was still running; this one was skipped entirely.
    Skipped,
    Completed { processed: u32 },
}

/// Recurring poller that discovers due scheduled messages and hands them
/// to the batch sender. Constructed by the application's startup routine
/// and passed by reference to whatever needs to start or stop it.
pub struct Scheduler {
    db: SqlitePool,
    sender: Option<BatchSender>,
    poll_interval: Duration,
    due_limit: i64,
    max_attempts: Option<i64>,
    claim_stale: chrono::Duration,
    running: AtomicBool,
    busy: AtomicBool,
    // Replaced on every start; a cancelled token cannot be reused.
    cancel: Mutex<CancellationToken>,
}

impl Scheduler {
    pub fn new(service: &Service) -> Self {
        let config = service.config();

        let sender = service.messenger().map(|messenger| {
            BatchSender::new(
                service.db().clone(),
                messenger,
                config.send_batch_size,
                RateLimit {
                    burst: config.sends_per_second,
                    per_second: config.sends_per_second,
                },
            )
        });

        Self {
            db: service.db().clone(),
            sender,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            due_limit: config.due_batch_limit,
            max_attempts: config.max_attempts,
            claim_stale: chrono::Duration::seconds(config.claim_stale_secs),
            running: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Transitions `Stopped -> Running`; a call while already running is
    /// a no-op, and a stopped scheduler can be started again. Refuses to
    /// run without a configured messaging credential.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.sender.is_none() {
            return Err(Error::configuration(
                "messaging credential missing, scheduler disabled",
            ));
        }

        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = cancel.clone();

        let this = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; swallow the first tick.
            ticker.tick().await;

            tracing::info!(
                interval_secs = this.poll_interval.as_secs(),
                "scheduler running"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                this.poll_once().await;
            }

            tracing::info!("scheduler stopped");
        });

        Ok(())
    }

    /// Cancels the timer. In-flight work is not interrupted; it finishes
    /// its current cycle.
    pub fn stop(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one poll cycle, unless a cycle is already executing. The busy
    /// flag is the single-flight guard: an overlapping call skips without
    /// touching the store.
    pub async fn poll_once(&self) -> PollOutcome {
        if self.busy.swap(true, Ordering::SeqCst) {
            tracing::debug!("previous poll cycle still running, skipping");
            return PollOutcome::Skipped;
        }

        let outcome = match self.run_cycle().await {
            Ok(processed) => PollOutcome::Completed { processed },
            Err(e) => {
                // Aborts this cycle only; the next tick retries.
                tracing::error!("poll cycle failed: {e}");
                PollOutcome::Completed { processed: 0 }
            }
        };

        self.busy.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_cycle(&self) -> eyre::Result<u32> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| eyre::eyre!("scheduler has no messenger"))?;

        let now = Utc::now();
        let mut conn = self.db.acquire().await?;

        let due = Message::find_due(&mut conn, now, self.due_limit, self.max_attempts).await?;

        if due.is_empty() {
            return Ok(0);
        }

        tracing::info!(count = due.len(), "due scheduled messages found");

        let mut processed = 0;

        // Sequential on purpose: bounds the total provider call rate for
        // the whole cycle.
        for message in due {
            let stale_before = now - self.claim_stale;

            if !Message::claim(&mut conn, message.id, now, stale_before).await? {
                tracing::debug!(message_id = message.id, "claimed by another poller, skipping");
                continue;
            }

            Message::record_attempt(&mut conn, message.id, now).await?;

            let pending = Recipient::retryable_for_message(&mut conn, message.id).await?;
            let payload = Payload::Text {
                text: message.body.clone(),
            };

            let report = sender
                .send_to_all(message.id, &payload, &[], &pending, "scheduled_message_sent")
                .await?;

            Message::release_claim(&mut conn, message.id).await?;

            tracing::info!(
                message_id = message.id,
                sent = report.sent,
                failed = report.failed,
                "scheduled message processed"
            );

            processed += 1;
        }

        Ok(processed)
    }
}
