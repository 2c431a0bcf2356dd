//! Batch, lease and failure handling of dequeue runs

mod common;

use chrono::{Duration, Utc};
use common::{soft_fail, Fixture};
use courier_common::config::WorkerConfig;
use courier_core::sender::Retry;
use courier_core::QueueWorker;
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test]
async fn test_foreign_lease_is_left_alone() {
    let fixture = Fixture::new();
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;
    let locked_at = Utc::now();
    fixture.store.update_queued(queued.id, |q| {
        q.locked_by = Some("other-worker".to_string());
        q.locked_at = Some(locked_at);
    });

    fixture.dequeuer().dequeue(queued.id).await;

    let untouched = fixture.store.queued(queued.id).unwrap();
    assert_eq!(untouched.locked_by.as_deref(), Some("other-worker"));
    assert_eq!(untouched.locked_at, Some(locked_at));
    assert_eq!(untouched.attempts, 0);
    assert!(fixture.store.deliveries(message.id).is_empty());
    assert!(fixture.senders.sent().is_empty());
}

#[tokio::test]
async fn test_message_not_yet_due_is_skipped() {
    let fixture = Fixture::new();
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;
    fixture
        .store
        .update_queued(queued.id, |q| q.retry_after = Some(Utc::now() + Duration::minutes(5)));

    fixture.dequeuer().dequeue(queued.id).await;

    let waiting = fixture.store.queued(queued.id).unwrap();
    assert!(!waiting.is_locked());
    assert!(fixture.store.deliveries(message.id).is_empty());
}

#[tokio::test]
async fn test_removed_message_drops_queue_entry() {
    let fixture = Fixture::new();
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;
    fixture.store.remove_message(message.id);

    fixture.dequeuer().dequeue(queued.id).await;

    assert_eq!(fixture.store.queued_len(), 0);
    assert!(fixture.senders.sent().is_empty());
}

#[tokio::test]
async fn test_unknown_queue_entry_is_ignored() {
    let fixture = Fixture::new();
    fixture.dequeuer().dequeue(uuid::Uuid::new_v4()).await;
    assert_eq!(fixture.metrics.dequeue_runs(), 1);
    assert_eq!(fixture.senders.built(), 0);
}

#[tokio::test]
async fn test_batch_siblings_share_one_sender() {
    let fixture = Fixture::new();
    let (first, first_queued) = fixture.queue_outgoing("one@example.org").await;
    let (second, second_queued) = fixture.queue_outgoing("two@example.org").await;
    let (other, other_queued) = fixture.queue_outgoing("three@example.net").await;

    fixture.dequeuer().dequeue(first_queued.id).await;

    assert!(fixture.store.queued(first_queued.id).is_none());
    assert!(fixture.store.queued(second_queued.id).is_none());
    assert_eq!(fixture.statuses(first.id), vec!["Sent"]);
    assert_eq!(fixture.statuses(second.id), vec!["Sent"]);

    assert!(fixture.store.queued(other_queued.id).is_some());
    assert!(fixture.store.deliveries(other.id).is_empty());

    let recipients: Vec<String> = fixture.senders.sent().into_iter().map(|s| s.rcpt_to).collect();
    assert_eq!(recipients, vec!["one@example.org", "two@example.org"]);
    assert_eq!(fixture.senders.built(), 1);
    assert_eq!(fixture.senders.finished(), 1);
}

#[tokio::test]
async fn test_batching_can_be_disabled() {
    let mut fixture = Fixture::new();
    fixture.config.batch_queued_messages = false;
    let (_, first_queued) = fixture.queue_outgoing("one@example.org").await;
    let (_, second_queued) = fixture.queue_outgoing("two@example.org").await;

    fixture.dequeuer().dequeue(first_queued.id).await;

    assert!(fixture.store.queued(first_queued.id).is_none());
    let untouched = fixture.store.queued(second_queued.id).unwrap();
    assert!(!untouched.is_locked());
}

#[tokio::test]
async fn test_sibling_leased_elsewhere_is_skipped() {
    let fixture = Fixture::new();
    let (_, first_queued) = fixture.queue_outgoing("one@example.org").await;
    let (second, second_queued) = fixture.queue_outgoing("two@example.org").await;
    fixture.store.update_queued(second_queued.id, |q| {
        q.locked_by = Some("other-worker".to_string());
        q.locked_at = Some(Utc::now());
    });

    fixture.dequeuer().dequeue(first_queued.id).await;

    assert!(fixture.store.queued(first_queued.id).is_none());
    assert!(fixture.store.deliveries(second.id).is_empty());
    assert_eq!(
        fixture.store.queued(second_queued.id).unwrap().locked_by.as_deref(),
        Some("other-worker")
    );
}

#[tokio::test]
async fn test_connect_failure_is_shared_across_batch() {
    let fixture = Fixture::new();
    let mut failure = soft_fail(Retry::Yes);
    failure.connect_error = true;
    fixture.senders.push(failure);
    let (first, first_queued) = fixture.queue_outgoing("one@example.org").await;
    let (second, second_queued) = fixture.queue_outgoing("two@example.org").await;

    fixture.dequeuer().dequeue(first_queued.id).await;

    assert_eq!(fixture.senders.sent().len(), 1);
    for (message, queued) in [(&first, &first_queued), (&second, &second_queued)] {
        assert_eq!(fixture.statuses(message.id), vec!["SoftFail"]);
        let requeued = fixture.store.queued(queued.id).unwrap();
        assert_eq!(requeued.attempts, 1);
        assert!(!requeued.is_locked());
    }
}

#[tokio::test]
async fn test_failed_batch_lookup_releases_the_lease() {
    let fixture = Fixture::new();
    fixture.store.fail_operation("find_eligible_siblings");
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;

    fixture.dequeuer().dequeue(queued.id).await;

    let released = fixture.store.queued(queued.id).unwrap();
    assert!(!released.is_locked());
    assert!(fixture.store.deliveries(message.id).is_empty());
}

#[tokio::test]
async fn test_store_error_records_error_delivery() {
    let fixture = Fixture::new();
    fixture.store.fail_operation("live_stats.increment");
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;

    fixture.dequeuer().dequeue(queued.id).await;

    let requeued = fixture.store.queued(queued.id).unwrap();
    assert_eq!(requeued.attempts, 1);
    assert!(!requeued.is_locked());
    assert!(requeued.retry_after.unwrap() > Utc::now());

    let delivery = fixture.store.deliveries(message.id).pop().unwrap();
    assert_eq!(delivery.status, "Error");
    assert_eq!(
        delivery.details.as_deref(),
        Some("An internal error occurred while sending this message. This message will be retried automatically.")
    );
    let output = delivery.output.unwrap();
    assert!(output.starts_with("DATABASE_ERROR: "));
    assert!(output.contains("live_stats.increment failed"));
}

#[tokio::test]
async fn test_sender_panic_is_contained() {
    let fixture = Fixture::new();
    fixture.senders.panic_next();
    let (first, first_queued) = fixture.queue_outgoing("one@example.org").await;
    let (second, second_queued) = fixture.queue_outgoing("two@example.org").await;

    fixture.dequeuer().dequeue(first_queued.id).await;

    let delivery = fixture.store.deliveries(first.id).pop().unwrap();
    assert_eq!(delivery.status, "Error");
    assert!(delivery.output.unwrap().contains("sender exploded"));
    assert_eq!(fixture.store.queued(first_queued.id).unwrap().attempts, 1);

    assert_eq!(fixture.statuses(second.id), vec!["Sent"]);
    assert!(fixture.store.queued(second_queued.id).is_none());
}

#[tokio::test]
async fn test_suspended_server_holds() {
    let fixture = Fixture::new();
    fixture
        .store
        .update_server(fixture.server.id, |s| s.suspended_at = Some(Utc::now()));
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;

    fixture.dequeuer().dequeue(queued.id).await;

    assert!(fixture.store.queued(queued.id).is_none());
    assert_eq!(fixture.statuses(message.id), vec!["Held"]);
    assert!(fixture.last_details(message.id).starts_with("Mail server has been suspended."));
}

#[tokio::test]
async fn test_development_mode_holds() {
    let fixture = Fixture::new();
    fixture
        .store
        .update_server(fixture.server.id, |s| s.mode = "Development".to_string());
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;

    fixture.dequeuer().dequeue(queued.id).await;

    assert_eq!(fixture.statuses(message.id), vec!["Held"]);
    assert_eq!(fixture.last_details(message.id), "Server is in development mode.");
    assert!(fixture.senders.sent().is_empty());
}

#[tokio::test]
async fn test_development_mode_sends_manual_messages() {
    let fixture = Fixture::new();
    fixture
        .store
        .update_server(fixture.server.id, |s| s.mode = "Development".to_string());
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;
    fixture.store.update_queued(queued.id, |q| q.manual = true);

    fixture.dequeuer().dequeue(queued.id).await;

    assert_eq!(fixture.statuses(message.id), vec!["Sent"]);
}

#[tokio::test]
async fn test_worker_dispatches_ready_messages() {
    let fixture = Fixture::new();
    let (first, _) = fixture.queue_outgoing("one@example.org").await;
    let (second, _) = fixture.queue_outgoing("two@example.net").await;
    let (later, later_queued) = fixture.queue_outgoing("three@example.com").await;
    fixture
        .store
        .update_queued(later_queued.id, |q| q.retry_after = Some(Utc::now() + Duration::hours(1)));

    let worker = QueueWorker::new(Arc::new(fixture.dequeuer()), WorkerConfig::default());
    assert_eq!(worker.run_once().await.unwrap(), 2);

    assert_eq!(fixture.statuses(first.id), vec!["Sent"]);
    assert_eq!(fixture.statuses(second.id), vec!["Sent"]);
    assert!(fixture.store.deliveries(later.id).is_empty());
    assert_eq!(fixture.store.queued_len(), 1);
}

#[tokio::test]
async fn test_unknown_scope_hard_fails() {
    let fixture = Fixture::new();
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;
    fixture
        .store
        .update_message(message.id, |m| m.scope = "sideways".to_string());

    fixture.dequeuer().dequeue(queued.id).await;

    assert!(fixture.store.queued(queued.id).is_none());
    assert_eq!(fixture.statuses(message.id), vec!["HardFail"]);
    assert_eq!(fixture.last_details(message.id), "Scope sideways is not valid");
    assert!(fixture.senders.sent().is_empty());
}

#[tokio::test]
async fn test_failed_address_allocation_keeps_single_reschedule() {
    let fixture = Fixture::new();
    fixture.senders.push(soft_fail(Retry::Yes));
    fixture.store.fail_operation("allocate_ip_address");
    let (message, queued) = fixture.queue_outgoing("rcpt@example.org").await;

    fixture.dequeuer().dequeue(queued.id).await;

    let requeued = fixture.store.queued(queued.id).unwrap();
    assert_eq!(requeued.attempts, 1);
    assert!(!requeued.is_locked());
    assert!(requeued.retry_after.unwrap() > Utc::now());
    assert_eq!(fixture.statuses(message.id), vec!["SoftFail"]);
}

#[test]
fn test_dequeue_runs_can_be_spawned() {
    fn assert_send<T: Send>(_: &T) {}

    let fixture = Fixture::new();
    let dequeuer = fixture.dequeuer();
    let run = dequeuer.dequeue(uuid::Uuid::new_v4());
    assert_send(&run);
}
