mod common;

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{start_time, Harness, ScriptedFetcher};
use pipeline_core::Clock;
use pipeline_dispatcher::stages::download::drain_downloads;
use pipeline_domain::{
    ErrorClass, EventPayload, FetchOutcome, ItemDraft, ItemState, NotificationKind, StageError,
    WorkerIdentity,
};

fn fetched(id: &str) -> Result<FetchOutcome, StageError> {
    Ok(FetchOutcome::Fetched(ScriptedFetcher::local_ref(id)))
}

#[tokio::test]
async fn first_try_success_moves_item_to_downloaded() {
    let mut h = Harness::new();
    h.discover("a").await;

    assert!(drain_downloads(h.ctx.clone()).await);

    let item = h.item("a").await;
    assert_eq!(item.state, ItemState::Downloaded);
    assert_eq!(item.attempt_count, 0);
    assert!(item.last_error.is_none());
    assert_eq!(item.local_ref, Some(ScriptedFetcher::local_ref("a")));
    assert!(h.events().contains(&EventPayload::DownloadCompleted {
        item_id: "a".to_string()
    }));

    // 开始和完成两条进度通知，后者撤回前者
    assert_eq!(h.notifier.sent_of(NotificationKind::Progress).len(), 2);
    assert_eq!(h.notifier.retracted(), 1);
}

#[tokio::test]
async fn transient_failures_back_off_then_succeed() {
    let mut h = Harness::new();
    h.discover("a").await;
    h.fetcher.script(
        "a",
        vec![
            Err(StageError::transient("connection reset")),
            Err(StageError::transient("connection reset")),
            fetched("a"),
        ],
    );

    drain_downloads(h.ctx.clone()).await;

    let item = h.item("a").await;
    assert_eq!(item.state, ItemState::Downloaded);
    assert_eq!(item.attempt_count, 0);
    assert_eq!(h.fetcher.calls_for("a"), 3);
    assert_eq!(
        h.clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert!(h.events().contains(&EventPayload::DownloadCompleted {
        item_id: "a".to_string()
    }));
}

#[tokio::test]
async fn permission_denied_is_abandoned_immediately() {
    let h = Harness::new();
    h.discover("a").await;
    h.fetcher.script(
        "a",
        vec![Err(StageError::new(ErrorClass::PermissionDenied, "Private video"))],
    );

    drain_downloads(h.ctx.clone()).await;

    let item = h.item("a").await;
    assert_eq!(item.state, ItemState::Abandoned);
    assert_eq!(item.attempt_count, 1);
    assert_eq!(item.last_error.unwrap().class, ErrorClass::PermissionDenied);
    assert_eq!(h.fetcher.calls_for("a"), 1);
    assert_eq!(h.notifier.sent_of(NotificationKind::Abandoned).len(), 1);
    assert!(h.clock.sleeps().is_empty());

    // 条目本身的问题不降级身份
    assert!(h.pool.health().iter().all(|identity| identity.failure_count == 0));
}

#[tokio::test]
async fn exhausted_budget_abandons_at_max_attempts() {
    let mut h = Harness::new();
    h.discover("a").await;
    h.fetcher.script(
        "a",
        vec![
            Err(StageError::transient("timed out")),
            Err(StageError::transient("timed out")),
            Err(StageError::transient("timed out")),
        ],
    );

    drain_downloads(h.ctx.clone()).await;

    let item = h.item("a").await;
    assert_eq!(item.state, ItemState::Abandoned);
    assert_eq!(item.attempt_count, 3);
    assert_eq!(h.notifier.sent_of(NotificationKind::Abandoned).len(), 1);
    assert!(!h.events().iter().any(|event| matches!(event, EventPayload::DownloadCompleted { .. })));

    // 已放弃的条目不会再被处理
    drain_downloads(h.ctx.clone()).await;
    assert_eq!(h.fetcher.calls_for("a"), 3);
    assert_eq!(h.notifier.sent_of(NotificationKind::Abandoned).len(), 1);
}

#[tokio::test]
async fn no_identity_available_requeues_without_consuming_budget() {
    let cooling_until = start_time() + ChronoDuration::hours(1);
    let identities = ["alpha", "beta"]
        .into_iter()
        .map(|name| {
            let mut identity = WorkerIdentity::new(name, None);
            identity.cooldown_until = Some(cooling_until);
            identity
        })
        .collect();
    let h = Harness::builder().identities(identities).build();
    h.discover("a").await;

    drain_downloads(h.ctx.clone()).await;

    let item = h.item("a").await;
    assert_eq!(item.state, ItemState::Discovered);
    assert_eq!(item.attempt_count, 0);
    assert_eq!(item.last_error.as_ref().unwrap().class, ErrorClass::TransientNetwork);
    assert!(item.next_retry_at.unwrap() > h.clock.now());
    assert_eq!(h.fetcher.calls_for("a"), 0);
    assert!(h.notifier.sent_of(NotificationKind::Abandoned).is_empty());

    // 退避未到期时扫描不会处理该条目
    drain_downloads(h.ctx.clone()).await;
    assert_eq!(
        h.repo
            .history("a")
            .iter()
            .filter(|(_, to)| *to == ItemState::Downloading)
            .count(),
        1
    );

    h.clock.advance(Duration::from_secs(2 * 3600));
    drain_downloads(h.ctx.clone()).await;
    assert_eq!(h.state("a").await, ItemState::Downloaded);
}

#[tokio::test]
async fn rate_limit_defers_item_and_cools_identity() {
    let h = Harness::new();
    h.discover("a").await;
    h.fetcher.script(
        "a",
        vec![Err(StageError::new(ErrorClass::RateLimited, "HTTP Error 429"))],
    );

    drain_downloads(h.ctx.clone()).await;

    let item = h.item("a").await;
    assert_eq!(item.state, ItemState::Discovered);
    assert_eq!(item.attempt_count, 1);
    let wait = item.next_retry_at.unwrap() - h.clock.now();
    assert!(wait >= ChronoDuration::seconds(600));
    assert!(h.clock.sleeps().is_empty());
    assert_eq!(h.notifier.sent_of(NotificationKind::Progress).len(), 2);

    let used = h.fetcher.calls()[0].1.clone();
    let health = h.pool.health();
    let used_health = health.iter().find(|identity| identity.name == used).unwrap();
    assert!(used_health.cooling);
    assert_eq!(h.pool.available_count(), 1);
}

#[tokio::test]
async fn authentication_failure_refreshes_session_before_reuse() {
    let h = Harness::builder()
        .identities(vec![WorkerIdentity::new("alpha", Some("cookies.txt".to_string()))])
        .build();
    h.discover("a").await;
    h.fetcher.script(
        "a",
        vec![Err(StageError::new(
            ErrorClass::AuthenticationFailed,
            "Sign in to confirm",
        ))],
    );

    drain_downloads(h.ctx.clone()).await;
    assert_eq!(h.state("a").await, ItemState::Discovered);
    assert!(h.pool.identities()[0].needs_session_refresh);
    assert!(h.fetcher.refreshed().is_empty());

    h.clock.advance(Duration::from_secs(1801));
    drain_downloads(h.ctx.clone()).await;

    assert_eq!(h.state("a").await, ItemState::Downloaded);
    assert_eq!(h.fetcher.refreshed(), vec!["alpha".to_string()]);
    assert!(!h.pool.identities()[0].needs_session_refresh);
}

#[tokio::test]
async fn skipped_download_is_synthetic_success() {
    let mut h = Harness::new();
    h.discover("a").await;
    h.fetcher.script(
        "a",
        vec![Ok(FetchOutcome::Skipped {
            reason: "live stream".to_string(),
        })],
    );

    drain_downloads(h.ctx.clone()).await;

    let item = h.item("a").await;
    assert_eq!(item.state, ItemState::Downloaded);
    assert!(item.skipped);
    assert!(item.local_ref.is_none());
    assert!(h.events().contains(&EventPayload::DownloadCompleted {
        item_id: "a".to_string()
    }));
}

#[tokio::test]
async fn description_links_request_aux_download() {
    let mut h = Harness::builder()
        .link_fetcher(std::sync::Arc::new(common::RecordingLinkFetcher::default()))
        .build();
    h.discover_draft(ItemDraft {
        description: Some(
            "资料: https://drive.google.com/file/d/1AbCdEfGhIjKlMnOpQrStUv/view?usp=sharing".to_string(),
        ),
        ..common::draft("a")
    })
    .await;
    h.discover("b").await;

    drain_downloads(h.ctx.clone()).await;

    let events = h.events();
    assert!(events.contains(&EventPayload::AuxDownloadNeeded {
        item_id: "a".to_string()
    }));
    assert!(!events.contains(&EventPayload::AuxDownloadNeeded {
        item_id: "b".to_string()
    }));
}

#[tokio::test]
async fn links_are_ignored_without_link_fetcher() {
    let mut h = Harness::new();
    h.discover_draft(ItemDraft {
        description: Some("https://drive.google.com/file/d/1AbCdEfGhIjKlMnOpQrStUv/view".to_string()),
        ..common::draft("a")
    })
    .await;

    drain_downloads(h.ctx.clone()).await;

    assert!(!h
        .events()
        .iter()
        .any(|event| matches!(event, EventPayload::AuxDownloadNeeded { .. })));
}
