#![cfg(unix)]

use chrono::Utc;
use pipeline_core::config::FetcherConfig;
use pipeline_domain::{ErrorClass, FetchOutcome, Fetcher, Item, ItemDraft, WorkerIdentity};
use pipeline_worker::CommandFetcher;
use tempfile::TempDir;

fn item(id: &str) -> Item {
    Item::from_draft(
        &ItemDraft {
            id: id.to_string(),
            source_id: "channel-a".to_string(),
            title: None,
            url: format!("https://example.com/{id}"),
            description: None,
            destination: None,
        },
        Utc::now(),
    )
}

fn shell_fetcher(dir: &TempDir, script: &str, timeout_seconds: u64) -> CommandFetcher {
    CommandFetcher::new(FetcherConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        session_refresh_args: Vec::new(),
        output_dir: dir.path().display().to_string(),
        timeout_seconds,
    })
}

#[tokio::test]
async fn fetch_returns_last_printed_path() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = shell_fetcher(
        &dir,
        "echo '[download] 100%'; touch {output_dir}/{id}.mp4; echo {output_dir}/{id}.mp4",
        10,
    );
    let identity = WorkerIdentity::new("alpha", None);

    let outcome = fetcher.fetch(&item("v1"), &identity).await.unwrap();
    let expected = dir.path().join("v1.mp4").display().to_string();
    assert_eq!(outcome, FetchOutcome::Fetched(expected.clone()));

    fetcher.discard(&expected).await.unwrap();
    assert!(!dir.path().join("v1.mp4").exists());
    fetcher.discard(&expected).await.unwrap();
}

#[tokio::test]
async fn skip_marker_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = shell_fetcher(&dir, "echo 'SKIP: live stream'", 10);
    let identity = WorkerIdentity::new("alpha", None);

    let outcome = fetcher.fetch(&item("v2"), &identity).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Skipped { .. }));
}

#[tokio::test]
async fn stderr_is_classified_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = shell_fetcher(
        &dir,
        "echo 'ERROR: HTTP Error 429: Too Many Requests' >&2; exit 1",
        10,
    );
    let identity = WorkerIdentity::new("alpha", None);

    let err = fetcher.fetch(&item("v3"), &identity).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::RateLimited);
    assert!(err.message.contains("429"));
}

#[tokio::test]
async fn missing_artifact_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = shell_fetcher(&dir, "echo {output_dir}/never-written.mp4", 10);
    let identity = WorkerIdentity::new("alpha", None);

    let err = fetcher.fetch(&item("v4"), &identity).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::Unknown);
}

#[tokio::test]
async fn slow_program_times_out_as_transient() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = shell_fetcher(&dir, "sleep 5", 1);
    let identity = WorkerIdentity::new("alpha", None);

    let err = fetcher.fetch(&item("v5"), &identity).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::TransientNetwork);
}
