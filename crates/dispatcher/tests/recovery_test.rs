mod common;

use std::time::Duration;

use common::{draft, Harness};
use pipeline_core::Clock;
use pipeline_dispatcher::{RecoveryReport, RecoveryService};
use pipeline_domain::{
    ErrorClass, EventPayload, Item, ItemError, ItemState, NotificationKind,
};

fn failed_item(h: &Harness, id: &str, attempt_count: u32, local_ref: Option<&str>) -> Item {
    let mut item = Item::from_draft(&draft(id), h.clock.now());
    item.state = ItemState::Failed;
    item.attempt_count = attempt_count;
    item.local_ref = local_ref.map(str::to_string);
    item.last_error = Some(ItemError {
        class: ErrorClass::TransientNetwork,
        message: "connection reset".to_string(),
    });
    item
}

fn recovery(h: &Harness) -> RecoveryService {
    RecoveryService::new(h.ctx.clone(), Duration::from_secs(3600))
}

#[tokio::test]
async fn stuck_item_is_requeued_as_transient_failure() {
    let h = Harness::new();
    h.discover("a").await;
    h.ctx.machine.begin_download("a").await.unwrap();

    h.clock.advance(Duration::from_secs(30 * 60));
    let report = recovery(&h).recover_stuck().await.unwrap();
    assert_eq!(report, RecoveryReport::default());
    assert_eq!(h.state("a").await, ItemState::Downloading);

    h.clock.advance(Duration::from_secs(2 * 3600));
    let report = recovery(&h).recover_stuck().await.unwrap();
    assert_eq!(report.requeued, 1);

    let item = h.item("a").await;
    assert_eq!(item.state, ItemState::Discovered);
    assert_eq!(item.attempt_count, 1);
    assert_eq!(item.last_error.unwrap().class, ErrorClass::TransientNetwork);
}

#[tokio::test]
async fn item_held_by_a_handler_is_not_stuck() {
    let h = Harness::new();
    h.discover("a").await;
    h.ctx.machine.begin_download("a").await.unwrap();
    h.clock.advance(Duration::from_secs(3 * 3600));

    let lock = h.ctx.gate.try_lock_item("a").unwrap();
    let report = recovery(&h).recover_stuck().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(h.state("a").await, ItemState::Downloading);

    drop(lock);
    let report = recovery(&h).recover_stuck().await.unwrap();
    assert_eq!(report.requeued, 1);
}

#[tokio::test]
async fn stale_failed_items_are_requeued_or_abandoned() {
    let mut h = Harness::new();
    h.repo.put(failed_item(&h, "fresh", 1, None));
    h.repo.put(failed_item(&h, "uploaded-once", 2, Some("/data/b.mp4")));
    h.repo.put(failed_item(&h, "exhausted", 3, None));

    let report = recovery(&h).retry_stale_failed().await.unwrap();
    assert_eq!(report.requeued, 2);
    assert_eq!(report.abandoned, 1);

    let fresh = h.item("fresh").await;
    assert_eq!(fresh.state, ItemState::Discovered);
    assert!(fresh.next_retry_at.is_none());
    assert_eq!(fresh.attempt_count, 1);
    assert_eq!(h.state("uploaded-once").await, ItemState::Downloaded);
    assert_eq!(h.state("exhausted").await, ItemState::Abandoned);

    let events = h.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, EventPayload::ItemsDiscovered { .. })));
    assert!(events.contains(&EventPayload::DownloadCompleted {
        item_id: "uploaded-once".to_string()
    }));

    // 再次扫描不会重复发送放弃通知
    recovery(&h).retry_stale_failed().await.unwrap();
    assert_eq!(h.notifier.sent_of(NotificationKind::Abandoned).len(), 1);
}

#[tokio::test]
async fn failed_item_with_terminal_error_is_abandoned_within_budget() {
    let mut h = Harness::new();
    let mut item = failed_item(&h, "gone", 1, None);
    item.last_error = Some(ItemError {
        class: ErrorClass::NotFound,
        message: "视频已删除".to_string(),
    });
    h.repo.put(item);

    let report = recovery(&h).retry_stale_failed().await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(h.state("gone").await, ItemState::Abandoned);

    let abandoned = h.notifier.sent_of(NotificationKind::Abandoned);
    assert_eq!(abandoned.len(), 1);
    assert!(abandoned[0].message.contains("视频已删除"));
    assert!(!h
        .events()
        .iter()
        .any(|event| matches!(event, EventPayload::ItemsDiscovered { .. })));
}

#[tokio::test]
async fn abandoned_artifacts_are_cleaned_once() {
    let h = Harness::new();
    let mut item = failed_item(&h, "a", 3, Some("/data/a.mp4"));
    item.state = ItemState::Abandoned;
    h.repo.put(item);

    assert_eq!(recovery(&h).cleanup_abandoned().await.unwrap(), 1);
    assert_eq!(h.fetcher.discarded(), vec!["/data/a.mp4".to_string()]);
    assert!(h.item("a").await.local_ref.is_none());

    assert_eq!(recovery(&h).cleanup_abandoned().await.unwrap(), 0);
}

#[tokio::test]
async fn pending_work_is_re_announced() {
    let mut h = Harness::new();
    h.discover("a").await;

    recovery(&h).check_pending_work().await.unwrap();

    let events = h.events();
    assert_eq!(
        events,
        vec![EventPayload::ItemsDiscovered {
            source_id: "channel-a".to_string(),
            count: 1
        }]
    );
}

#[tokio::test]
async fn daily_summary_reports_counts() {
    let h = Harness::new();
    h.discover("a").await;
    h.discover("b").await;

    recovery(&h).send_daily_summary().await.unwrap();

    let summaries = h.notifier.sent_of(NotificationKind::Summary);
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].message.contains("2/2"));
}
