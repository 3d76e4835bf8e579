use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use onebox_sync::categorizer::ChatClassifier;
use onebox_sync::config;
use onebox_sync::dispatch::{spawn_failure_monitor, Dispatcher};
use onebox_sync::imap::ImapSessionFactory;
use onebox_sync::indexer::EsIndexer;
use onebox_sync::status::StatusStore;
use onebox_sync::{Result, SyncCoordinator, SyncError};

#[tokio::main]
async fn main() -> Result<()> {
    let default_filter = if cfg!(debug_assertions) {
        "onebox_sync=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config_path = parse_config_arg()?;
    let settings = config::load(config_path.as_deref()).map_err(|e| {
        error!("failed to load configuration: {}", e);
        e
    })?;

    let indexer = Arc::new(EsIndexer::new(&settings.indexer)?);
    indexer.ensure_index().await.map_err(|e| {
        error!("indexer bootstrap failed: {}", e);
        e
    })?;

    let classifier = Arc::new(ChatClassifier::new(&settings.classifier)?);
    let (dispatcher, failures) = Dispatcher::new(indexer, classifier);
    let _failure_monitor = spawn_failure_monitor(failures);

    let supervisor_config = settings.sync.supervisor_config();
    let grace = supervisor_config.logout_grace + Duration::from_secs(2);
    let factory = Arc::new(ImapSessionFactory::new(Duration::from_secs(
        settings.sync.poll_interval_seconds,
    )));

    let store = StatusStore::new();
    let mut coordinator = SyncCoordinator::new(
        supervisor_config,
        factory,
        store.clone(),
        Arc::new(dispatcher),
    );
    coordinator.start(&settings.accounts);

    let _reporter = spawn_status_reporter(store);

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    coordinator.stop(grace).await;
    info!("shutdown complete");
    Ok(())
}

/// Accepts `--config <path>`; everything else is rejected.
fn parse_config_arg() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config") => match args.next() {
            Some(path) => Ok(Some(PathBuf::from(path))),
            None => Err(SyncError::Config("--config requires a path".into())),
        },
        Some(other) => Err(SyncError::Config(format!("unknown argument: {}", other))),
    }
}

/// Periodically log every account's connection state.
fn spawn_status_reporter(store: StatusStore) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            for (id, status) in store.all().await {
                info!(
                    account = %id,
                    state = ?status.state,
                    connected = status.connected,
                    error = status.last_error.as_deref().unwrap_or("-"),
                    "account status"
                );
            }
        }
    })
}
