use pipeline::Application;
use pipeline_core::config::IdentityConfig;
use pipeline_core::{AppConfig, PipelineError};
use pipeline_domain::{ItemState, StatusProvider};
use tempfile::TempDir;

fn config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.url = format!("sqlite://{}?mode=rwc", dir.path().join("pipeline.db").display());
    config.fetcher.output_dir = dir.path().join("downloads").display().to_string();
    config.identities = vec![
        IdentityConfig {
            name: "alpha".to_string(),
            credentials: None,
            enabled: true,
        },
        IdentityConfig {
            name: "beta".to_string(),
            credentials: None,
            enabled: true,
        },
    ];
    config
}

#[tokio::test]
async fn fresh_database_reports_empty_status() {
    let dir = TempDir::new().unwrap();
    let app = Application::new(config(&dir)).await.unwrap();

    let status = app.controller().get_status().await.unwrap();
    assert_eq!(status.scheduler_state, "stopped");
    assert_eq!(status.counts.total(), 0);
    assert_eq!(status.counts.get(ItemState::Discovered), 0);
    assert_eq!(status.identities.len(), 2);

    let result = app.controller().retry_item("missing").await;
    assert!(matches!(result, Err(PipelineError::ItemNotFound { .. })));
    app.close().await;
}

#[tokio::test]
async fn identity_toggle_survives_restart() {
    let dir = TempDir::new().unwrap();

    let app = Application::new(config(&dir)).await.unwrap();
    app.controller()
        .set_worker_identity_enabled("beta", false)
        .await
        .unwrap();
    app.close().await;

    let app = Application::new(config(&dir)).await.unwrap();
    let status = app.controller().get_status().await.unwrap();
    let beta = status.identities.iter().find(|i| i.name == "beta").unwrap();
    assert!(!beta.is_enabled);
    let alpha = status.identities.iter().find(|i| i.name == "alpha").unwrap();
    assert!(alpha.is_enabled);
    app.close().await;
}

#[tokio::test]
async fn management_commands_do_not_bind_the_metrics_address() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.observability.metrics_bind_address = Some("127.0.0.1:9464".to_string());

    // 守护进程和管理命令使用同一份配置
    let daemon = Application::new(config.clone()).await.unwrap();
    let cli = Application::new(config).await.unwrap();

    let status = cli.controller().get_status().await.unwrap();
    assert_eq!(status.identities.len(), 2);
    cli.close().await;
    daemon.close().await;
}

#[tokio::test]
async fn run_stops_on_shutdown_signal() {
    let dir = TempDir::new().unwrap();
    let app = Application::new(config(&dir)).await.unwrap();
    let (tx, rx) = tokio::sync::broadcast::channel(1);

    let handle = tokio::spawn(async move { app.run(rx).await });
    tx.send(()).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
