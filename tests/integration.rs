use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use courier::config::Config;
use courier::db::message::Message;
use courier::db::recipient::{DeliveryStatus, Recipient};
use courier::db::user::User;
use courier::error::Error;
use courier::messenger::{Button, Messenger, Payload, SendError};
use courier::resolver::{RecipientSpec, Segment};
use courier::scheduler::{PollOutcome, Scheduler};
use courier::service::{
    BroadcastOutcome, BroadcastRequest, MessageDraft, PayloadKind, Service,
};

/// Scripted in-memory messenger: assigns increasing provider ids, records
/// every call, and fails for user ids it was told to fail for.
struct FakeMessenger {
    next_id: AtomicI64,
    sends: Mutex<Vec<i64>>,
    deletes: Mutex<Vec<(i64, i64)>>,
    failing: Mutex<HashSet<i64>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeMessenger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1000),
            sends: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
        })
    }

    fn fail_for(&self, user_id: i64) {
        self.failing.lock().unwrap().insert(user_id);
    }

    fn delay_sends(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn sent_to(&self) -> Vec<i64> {
        self.sends.lock().unwrap().clone()
    }

    fn deleted(&self) -> Vec<(i64, i64)> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send(
        &self,
        user_id: i64,
        _payload: &Payload,
        _buttons: &[Button],
    ) -> Result<i64, SendError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(&user_id) {
            return Err(SendError::Blocked);
        }

        self.sends.lock().unwrap().push(user_id);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn delete(&self, user_id: i64, external_message_id: i64) -> Result<(), SendError> {
        if self.failing.lock().unwrap().contains(&user_id) {
            return Err(SendError::Other("delete refused".to_owned()));
        }

        self.deletes
            .lock()
            .unwrap()
            .push((user_id, external_message_id));
        Ok(())
    }
}

struct TmpService {
    svc: Service,
    messenger: Arc<FakeMessenger>,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup() -> TmpService {
    setup_with(Config::default()).await
}

async fn setup_with(mut config: Config) -> TmpService {
    let path = tempfile::tempdir().unwrap();
    config.db_path = Some(path.path().join("courier.db").to_string_lossy().to_string());

    let messenger = FakeMessenger::new();

    let svc = Service::connect_with()
        .config(config)
        .messenger(messenger.clone())
        .connect()
        .await
        .unwrap();

    TmpService {
        svc,
        messenger,
        tmpdir: path,
    }
}

async fn seed_users(service: &Service, count: i64) -> Vec<i64> {
    let mut ids = Vec::new();

    for i in 1..=count {
        let user = User {
            user_id: i,
            username: Some(format!("user{i}")),
            first_name: Some(format!("User {i}")),
            course_stream: None,
            hackathon: false,
        };
        service.upsert_user(&user).await.unwrap();
        ids.push(i);
    }

    ids
}

fn text_draft(text: &str) -> MessageDraft {
    MessageDraft {
        kind: PayloadKind::Text,
        text: Some(text.to_owned()),
        media_reference: None,
        buttons: Vec::new(),
    }
}

fn send_now(ids: Vec<i64>, text: &str) -> BroadcastRequest {
    BroadcastRequest {
        recipients: RecipientSpec::Users { ids },
        message: text_draft(text),
        scheduled_at: None,
    }
}

#[tokio::test]
async fn immediate_send_delivers_to_all() {
    let service = setup().await;
    let ids = seed_users(&service, 10).await;

    let outcome = service
        .send_broadcast(send_now(ids.clone(), "hello everyone"))
        .await
        .unwrap();

    let BroadcastOutcome::Sent { message_id, report } = outcome else {
        panic!("expected immediate delivery");
    };

    assert_eq!(report.sent, 10);
    assert_eq!(report.failed, 0);
    assert_eq!(service.messenger.sent_to(), ids);

    let message = service.get_message(message_id).await.unwrap();
    assert_eq!(message.total_recipient_count, 10);
    assert_eq!(message.successful_delivery_count, 10);

    let recipients = service.message_recipients(message_id).await.unwrap();
    assert!(recipients
        .iter()
        .all(|r| r.delivery_status == DeliveryStatus::Sent && r.external_message_id.is_some()));
}

#[tokio::test]
async fn one_failed_recipient_does_not_abort_the_run() {
    let service = setup().await;
    let ids = seed_users(&service, 10).await;
    service.messenger.fail_for(3);

    let outcome = service
        .send_broadcast(send_now(ids, "partial run"))
        .await
        .unwrap();

    let BroadcastOutcome::Sent { message_id, report } = outcome else {
        panic!("expected immediate delivery");
    };

    assert_eq!(report.sent, 9);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].user_id, 3);

    let message = service.get_message(message_id).await.unwrap();
    assert_eq!(message.successful_delivery_count, 9);

    let recipients = service.message_recipients(message_id).await.unwrap();
    let failed: Vec<&Recipient> = recipients
        .iter()
        .filter(|r| r.delivery_status == DeliveryStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].user_id, 3);
    assert_eq!(failed[0].error.as_deref(), Some("recipient blocked sender"));

    let audit = service.recent_audit(10).await.unwrap();
    assert_eq!(audit[0].action_type, "message_sent");
    assert!(!audit[0].success);
    assert_eq!(audit[0].affected_count, 10);
}

#[tokio::test]
async fn unknown_recipient_rejects_the_whole_request() {
    let service = setup().await;
    seed_users(&service, 2).await;

    let err = service
        .send_broadcast(send_now(vec![1, 2, 999], "who?"))
        .await
        .unwrap_err();

    match err {
        Error::UnknownRecipients { user_ids } => assert_eq!(user_ids, vec![999]),
        other => panic!("unexpected error: {other}"),
    }

    // Validation failures leave no partial state behind.
    assert!(service.list_messages(10).await.unwrap().is_empty());
    assert!(service.messenger.sent_to().is_empty());
}

#[tokio::test]
async fn duplicate_ids_collapse_to_one_delivery() {
    let service = setup().await;
    seed_users(&service, 2).await;

    let outcome = service
        .send_broadcast(send_now(vec![1, 2, 1, 2, 1], "dedup"))
        .await
        .unwrap();

    let BroadcastOutcome::Sent { report, .. } = outcome else {
        panic!("expected immediate delivery");
    };

    assert_eq!(report.sent, 2);
    assert_eq!(service.messenger.sent_to(), vec![1, 2]);
}

#[tokio::test]
async fn schedule_validation() {
    let service = setup().await;
    seed_users(&service, 1).await;

    let past = BroadcastRequest {
        recipients: RecipientSpec::Users { ids: vec![1] },
        message: text_draft("too late"),
        scheduled_at: Some(Utc::now() - chrono::Duration::minutes(5)),
    };
    assert!(matches!(
        service.send_broadcast(past).await.unwrap_err(),
        Error::ScheduleInPast
    ));

    let media = BroadcastRequest {
        recipients: RecipientSpec::Users { ids: vec![1] },
        message: MessageDraft {
            kind: PayloadKind::Video,
            text: None,
            media_reference: Some("file123".to_owned()),
            buttons: Vec::new(),
        },
        scheduled_at: Some(Utc::now() + chrono::Duration::minutes(5)),
    };
    assert!(matches!(
        service.send_broadcast(media).await.unwrap_err(),
        Error::Validation { .. }
    ));

    let oversized = send_now(vec![1], &"x".repeat(5000));
    assert!(matches!(
        service.send_broadcast(oversized).await.unwrap_err(),
        Error::PayloadTooLarge { limit: 4096 }
    ));

    assert!(service.list_messages(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn scheduled_message_waits_for_the_poller() {
    let service = setup().await;
    let ids = seed_users(&service, 3).await;

    let scheduled_at = Utc::now() + chrono::Duration::milliseconds(200);
    let outcome = service
        .send_broadcast(BroadcastRequest {
            recipients: RecipientSpec::Users { ids: ids.clone() },
            message: text_draft("later"),
            scheduled_at: Some(scheduled_at),
        })
        .await
        .unwrap();

    let BroadcastOutcome::Scheduled { message_id, .. } = outcome else {
        panic!("expected a scheduled outcome");
    };

    // Nothing goes out at schedule time.
    assert!(service.messenger.sent_to().is_empty());

    let scheduler = Arc::new(Scheduler::new(&service));

    // Not due yet.
    assert_eq!(
        scheduler.poll_once().await,
        PollOutcome::Completed { processed: 0 }
    );

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        scheduler.poll_once().await,
        PollOutcome::Completed { processed: 1 }
    );
    assert_eq!(service.messenger.sent_to(), ids);

    let message = service.get_message(message_id).await.unwrap();
    assert_eq!(message.successful_delivery_count, 3);
    assert_eq!(message.attempt_count, 1);
    // Claims only live for the duration of a delivery run.
    assert!(message.claimed_at.is_none());

    // Delivered messages are no longer due.
    assert_eq!(
        scheduler.poll_once().await,
        PollOutcome::Completed { processed: 0 }
    );
    assert_eq!(service.messenger.sent_to().len(), 3);

    let audit = service.recent_audit(10).await.unwrap();
    let scheduled_sends = audit
        .iter()
        .filter(|e| e.action_type == "scheduled_message_sent")
        .count();
    assert_eq!(scheduled_sends, 1);
}

#[tokio::test]
async fn overlapping_poll_cycles_skip_instead_of_doubling() {
    let service = setup().await;
    let ids = seed_users(&service, 2).await;
    service.messenger.delay_sends(Duration::from_millis(300));

    service
        .send_broadcast(BroadcastRequest {
            recipients: RecipientSpec::Users { ids },
            message: text_draft("slow delivery"),
            scheduled_at: Some(Utc::now() + chrono::Duration::milliseconds(10)),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let scheduler = Arc::new(Scheduler::new(&service));

    let first = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.poll_once().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.poll_once().await, PollOutcome::Skipped);

    assert_eq!(
        first.await.unwrap(),
        PollOutcome::Completed { processed: 1 }
    );

    // Exactly one attempt; the overlapping cycle never touched the store.
    let messages = service.list_messages(1).await.unwrap();
    assert_eq!(messages[0].attempt_count, 1);
    assert_eq!(service.messenger.sent_to().len(), 2);
}

#[tokio::test]
async fn claim_is_exclusive_until_stale() {
    let service = setup().await;
    seed_users(&service, 1).await;

    service
        .send_broadcast(BroadcastRequest {
            recipients: RecipientSpec::Users { ids: vec![1] },
            message: text_draft("claimed"),
            scheduled_at: Some(Utc::now() + chrono::Duration::minutes(5)),
        })
        .await
        .unwrap();

    let id = service.list_messages(1).await.unwrap()[0].id;
    let mut conn = service.db().acquire().await.unwrap();

    let now = Utc::now();
    let stale_before = now - chrono::Duration::minutes(10);

    assert!(Message::claim(&mut conn, id, now, stale_before).await.unwrap());
    assert!(!Message::claim(&mut conn, id, now, stale_before).await.unwrap());

    // A crashed poller's claim ages out and becomes reclaimable.
    let later = now + chrono::Duration::minutes(15);
    assert!(Message::claim(&mut conn, id, later, later - chrono::Duration::minutes(10))
        .await
        .unwrap());
}

#[tokio::test]
async fn attempt_cap_retires_failing_messages() {
    let service = setup_with(Config {
        max_attempts: Some(2),
        ..Default::default()
    })
    .await;
    seed_users(&service, 1).await;
    service.messenger.fail_for(1);

    service
        .send_broadcast(BroadcastRequest {
            recipients: RecipientSpec::Users { ids: vec![1] },
            message: text_draft("doomed"),
            scheduled_at: Some(Utc::now() + chrono::Duration::milliseconds(10)),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let scheduler = Arc::new(Scheduler::new(&service));

    assert_eq!(
        scheduler.poll_once().await,
        PollOutcome::Completed { processed: 1 }
    );

    // The claim is released when the run completes, so the failed message
    // is due again on the immediately following cycle.
    let message = &service.list_messages(1).await.unwrap()[0];
    assert_eq!(message.attempt_count, 1);
    assert!(message.claimed_at.is_none());

    assert_eq!(
        scheduler.poll_once().await,
        PollOutcome::Completed { processed: 1 }
    );

    // Two attempts recorded; the cap stops a third.
    let message = &service.list_messages(1).await.unwrap()[0];
    assert_eq!(message.attempt_count, 2);
    assert_eq!(message.successful_delivery_count, 0);

    assert_eq!(
        scheduler.poll_once().await,
        PollOutcome::Completed { processed: 0 }
    );
}

#[tokio::test]
async fn unsend_deletes_delivered_copies() {
    let service = setup().await;
    let ids = seed_users(&service, 3).await;

    let outcome = service
        .send_broadcast(send_now(ids, "retract me"))
        .await
        .unwrap();
    let BroadcastOutcome::Sent { message_id, .. } = outcome else {
        panic!("expected immediate delivery");
    };

    let report = service.unsend_message(message_id).await.unwrap();
    assert_eq!(report.deleted, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(service.messenger.deleted().len(), 3);

    let recipients = service.message_recipients(message_id).await.unwrap();
    assert!(recipients
        .iter()
        .all(|r| r.delivery_status == DeliveryStatus::Deleted));
    // Provider ids survive the transition.
    assert!(recipients.iter().all(|r| r.external_message_id.is_some()));

    let audit = service.recent_audit(10).await.unwrap();
    assert_eq!(audit[0].action_type, "message_deleted");
}

#[tokio::test]
async fn unsend_unknown_message_is_not_found() {
    let service = setup().await;

    assert!(matches!(
        service.unsend_message(404).await.unwrap_err(),
        Error::NotFound { .. }
    ));
}

#[tokio::test]
async fn status_updates_are_idempotent() {
    let service = setup().await;
    seed_users(&service, 1).await;

    let outcome = service.send_broadcast(send_now(vec![1], "once")).await.unwrap();
    let BroadcastOutcome::Sent { message_id, .. } = outcome else {
        panic!("expected immediate delivery");
    };

    let mut conn = service.db().acquire().await.unwrap();

    let before = service.message_recipients(message_id).await.unwrap();
    let external_id = before[0].external_message_id.unwrap();

    // Re-applying the same status without a provider id keeps the stored one.
    Recipient::update_status(&mut conn, message_id, 1, DeliveryStatus::Sent, None, None)
        .await
        .unwrap();
    Recipient::update_status(&mut conn, message_id, 1, DeliveryStatus::Sent, None, None)
        .await
        .unwrap();

    let after = service.message_recipients(message_id).await.unwrap();
    assert_eq!(after[0].delivery_status, DeliveryStatus::Sent);
    assert_eq!(after[0].external_message_id, Some(external_id));

    assert_eq!(
        Message::recompute_delivery_stats(&mut conn, message_id)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn segments_resolve_from_user_tags() {
    let service = setup().await;

    let users = [
        ("anna", Some("rust-2026"), false),
        ("boris", Some("rust-2026"), true),
        ("carol", None, true),
    ];
    for (i, (name, stream, hackathon)) in users.iter().enumerate() {
        service
            .upsert_user(&User {
                user_id: i as i64 + 1,
                username: Some((*name).to_owned()),
                first_name: None,
                course_stream: stream.map(str::to_owned),
                hackathon: *hackathon,
            })
            .await
            .unwrap();
    }

    let stream = service
        .segment_users(&Segment::Stream {
            name: "rust-2026".to_owned(),
        })
        .await
        .unwrap();
    assert_eq!(stream.len(), 2);

    let hackathon = service.segment_users(&Segment::Hackathon).await.unwrap();
    assert_eq!(hackathon.len(), 2);

    let non_course = service.segment_users(&Segment::NonCourse).await.unwrap();
    assert_eq!(non_course.len(), 1);
    assert_eq!(non_course[0].username.as_deref(), Some("carol"));

    let all = service.segment_users(&Segment::All).await.unwrap();
    assert_eq!(all.len(), 3);

    // A segment send to a shared stream is recorded as a group broadcast.
    let outcome = service
        .send_broadcast(BroadcastRequest {
            recipients: RecipientSpec::Segment {
                segment: Segment::Stream {
                    name: "rust-2026".to_owned(),
                },
            },
            message: text_draft("stream news"),
            scheduled_at: None,
        })
        .await
        .unwrap();

    let BroadcastOutcome::Sent { message_id, .. } = outcome else {
        panic!("expected immediate delivery");
    };
    let message = service.get_message(message_id).await.unwrap();
    assert_eq!(message.recipient_group.as_deref(), Some("rust-2026"));
}

#[tokio::test]
async fn empty_segment_is_rejected_before_any_write() {
    let service = setup().await;

    let err = service
        .send_broadcast(BroadcastRequest {
            recipients: RecipientSpec::Segment {
                segment: Segment::Hackathon,
            },
            message: text_draft("to nobody"),
            scheduled_at: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation { .. }));
    assert!(service.list_messages(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_credential_rejects_immediate_sends_before_any_write() {
    let path = tempfile::tempdir().unwrap();
    let config = Config {
        db_path: Some(path.path().join("courier.db").to_string_lossy().to_string()),
        ..Default::default()
    };

    let service = Service::connect_with()
        .config(config)
        .connect()
        .await
        .unwrap();

    service
        .upsert_user(&User {
            user_id: 1,
            username: Some("anna".to_owned()),
            first_name: None,
            course_stream: None,
            hackathon: false,
        })
        .await
        .unwrap();

    let err = service
        .send_broadcast(send_now(vec![1], "no credential"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));

    // The rejection happens before the message row is written.
    assert!(service.list_messages(10).await.unwrap().is_empty());

    // Scheduling is a pure store write and still works; only delivery
    // needs the credential.
    let outcome = service
        .send_broadcast(BroadcastRequest {
            recipients: RecipientSpec::Users { ids: vec![1] },
            message: text_draft("for later"),
            scheduled_at: Some(Utc::now() + chrono::Duration::minutes(5)),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, BroadcastOutcome::Scheduled { .. }));
}

#[tokio::test]
async fn scheduler_restarts_after_stop() {
    let service = setup_with(Config {
        poll_interval_secs: 1,
        ..Default::default()
    })
    .await;
    let ids = seed_users(&service, 1).await;

    let scheduler = Arc::new(Scheduler::new(&service));

    scheduler.start().unwrap();
    assert!(scheduler.is_running());
    scheduler.stop();
    assert!(!scheduler.is_running());

    // A stopped scheduler comes back with a working timer.
    scheduler.start().unwrap();
    assert!(scheduler.is_running());

    service
        .send_broadcast(BroadcastRequest {
            recipients: RecipientSpec::Users { ids: ids.clone() },
            message: text_draft("after restart"),
            scheduled_at: Some(Utc::now() + chrono::Duration::milliseconds(10)),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(service.messenger.sent_to(), ids);

    scheduler.stop();
}

#[tokio::test]
async fn recipients_route_lists_delivery_records() {
    let service = setup().await;
    seed_users(&service, 2).await;

    let outcome = service
        .send_broadcast(send_now(vec![1, 2], "over http"))
        .await
        .unwrap();
    let BroadcastOutcome::Sent { message_id, .. } = outcome else {
        panic!("expected immediate delivery");
    };

    let app = actix_web::test::init_service(
        actix_web::App::new()
            .app_data(actix_web::web::Data::new(service.svc.clone()))
            .service(courier::api::broadcast::service()),
    )
    .await;

    let request = actix_web::test::TestRequest::get()
        .uri(&format!("/broadcast/{message_id}/recipients"))
        .to_request();
    let recipients: Vec<Recipient> =
        actix_web::test::call_and_read_body_json(&app, request).await;

    assert_eq!(recipients.len(), 2);
    assert!(recipients
        .iter()
        .all(|r| r.delivery_status == DeliveryStatus::Sent));
}

#[tokio::test]
async fn search_serves_from_the_snapshot() {
    let service = setup().await;

    service
        .upsert_user(&User {
            user_id: 1,
            username: Some("samvel".to_owned()),
            first_name: Some("Samvel".to_owned()),
            course_stream: None,
            hackathon: false,
        })
        .await
        .unwrap();
    service
        .upsert_user(&User {
            user_id: 2,
            username: None,
            first_name: Some("Sandra".to_owned()),
            course_stream: None,
            hackathon: false,
        })
        .await
        .unwrap();

    let results = service.search_users("sa").await.unwrap();
    assert_eq!(results.len(), 2);

    let results = service.search_users("@samvel").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].user_id, 1);

    assert!(service.search_users("").await.unwrap().is_empty());

    // The snapshot is time-bounded: a user added after the first read is
    // invisible until the TTL lapses.
    service
        .upsert_user(&User {
            user_id: 3,
            username: Some("sasha".to_owned()),
            first_name: None,
            course_stream: None,
            hackathon: false,
        })
        .await
        .unwrap();
    assert_eq!(service.search_users("sa").await.unwrap().len(), 2);
}
