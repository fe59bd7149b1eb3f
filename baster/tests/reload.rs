//! Routing reload from a settings file

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use baster::monitoring::Monitoring;
use baster::proxy::{insecure_router, ProxyState};
use baster::source::FileSource;
use baster::watcher::ConfigWatcher;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const V1: &str = r#"
[acme]
email = "ops@example.com"

[domains.a]
hostname = "a.example.com"
service = "127.0.0.1:9"
"#;

const V2: &str = r#"
[acme]
email = "ops@example.com"

[domains.a]
hostname = "a.example.com"
service = "127.0.0.1:9"

[domains.b]
hostname = "b.example.com"
redirect = "https://a.example.com"
"#;

async fn status_for(state: &Arc<ProxyState>, host: &str) -> StatusCode {
    insecure_router(state.clone())
        .oneshot(
            Request::builder()
                .uri("/")
                .header(header::HOST, host)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_reload_publishes_new_domains() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("settings.toml");
    std::fs::write(&file, V1).unwrap();

    let mut watcher = ConfigWatcher::new(Arc::new(FileSource::new(&file)), Duration::from_secs(60));
    let settings = watcher.bootstrap().await;
    assert_eq!(settings.acme.email, "ops@example.com");

    let state = Arc::new(
        ProxyState::new(
            watcher.routing(),
            Arc::new(Monitoring::disabled()),
            None,
            Duration::from_secs(1),
        )
        .unwrap(),
    );
    assert_eq!(status_for(&state, "b.example.com").await, StatusCode::NOT_FOUND);

    std::fs::write(&file, V2).unwrap();
    assert!(watcher.poll().await.unwrap());
    assert_eq!(
        status_for(&state, "b.example.com").await,
        StatusCode::MOVED_PERMANENTLY
    );

    // A broken version keeps the previous table
    std::fs::write(&file, "[domains.c\nhostname = ").unwrap();
    assert!(!watcher.poll().await.unwrap());
    assert_eq!(
        status_for(&state, "b.example.com").await,
        StatusCode::MOVED_PERMANENTLY
    );
}
