//! baster: edge reverse proxy server
//!
//! Usage: `baster [config.toml]`. Without a config file the development
//! defaults are used (in-memory store, self-signed certificates).

use baster::acme::{AcmeManager, Issuer, LetsEncrypt};
use baster::config::{LogFormat, StoreBackend};
use baster::lock::DistributedLock;
use baster::monitoring::{HttpSink, LogSink, Monitoring};
use baster::proxy::ProxyState;
use baster::source::FileSource;
use baster::store::{KvStore, MemoryStore, Namespaced, RedisStore, KIND_CACHE};
use baster::watcher::ConfigWatcher;
use baster::{ProxyConfig, ProxyServer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ProxyConfig::load(Some(Path::new(&path)))?,
        None => ProxyConfig::development(),
    };

    init_logging(&config);
    info!("Starting baster v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn KvStore> = match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store, certificates are not shared");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => {
            info!(url = %config.store.url, "Connecting to Redis");
            Arc::new(
                RedisStore::connect(
                    &config.store.url,
                    &config.store.prefix,
                    Duration::from_millis(config.store.timeout_ms),
                )
                .await?,
            )
        }
    };

    let source = Arc::new(FileSource::new(&config.source.path));
    let mut watcher = ConfigWatcher::new(
        source,
        Duration::from_secs(config.source.poll_interval_seconds),
    );
    let settings = watcher.bootstrap().await;
    let routing = watcher.routing();

    let issuer = if config.certificates.self_signed {
        info!("Using self-signed certificates");
        Issuer::SelfSigned
    } else {
        let cache = Namespaced::new(store.clone(), KIND_CACHE);
        let directory =
            LetsEncrypt::connect(&cache, &settings.acme.email, settings.acme.staging).await?;
        Issuer::Acme(Arc::new(directory))
    };

    let lock = DistributedLock::with_timing(
        store.clone(),
        Duration::from_secs(config.certificates.lock_retry_seconds),
        Duration::from_secs(config.certificates.lock_stale_seconds),
    );
    let acme = Arc::new(AcmeManager::new(
        issuer,
        store,
        lock,
        routing.clone(),
        config.certificates.timing(),
    ));

    let mut monitoring = Monitoring::new(Duration::from_secs(
        config.monitoring.flush_interval_seconds,
    ));
    if config.monitoring.log {
        monitoring = monitoring.with_sink(Arc::new(LogSink), config.monitoring.backlog);
    }
    if let Some(endpoint) = &config.monitoring.http_endpoint {
        monitoring = monitoring.with_sink(
            Arc::new(HttpSink::new(endpoint.clone())?),
            config.monitoring.backlog,
        );
    }
    let monitoring = Arc::new(monitoring);

    monitoring.start();
    watcher.spawn();
    acme.clone().start_renewal_task();

    let state = Arc::new(ProxyState::new(
        routing,
        monitoring,
        Some(acme.clone()),
        config.request_timeout(),
    )?);

    ProxyServer::new(
        state,
        acme,
        config.server.insecure_addr.clone(),
        config.server.secure_addr.clone(),
    )
    .run()
    .await?;

    Ok(())
}

fn init_logging(config: &ProxyConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
