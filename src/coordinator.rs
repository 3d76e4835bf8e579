//! Multi-account lifecycle
//!
//! Spawns one independent supervisor task per configured account and owns
//! the shutdown broadcast. Accounts never share protocol state; the status
//! store and dispatcher are the only shared components, and both are safe
//! under concurrent use.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AccountConfig;
use crate::dispatch::Dispatcher;
use crate::session::SessionFactory;
use crate::status::StatusStore;
use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};

pub struct SyncCoordinator {
    config: SupervisorConfig,
    factory: Arc<dyn SessionFactory>,
    store: StatusStore,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl SyncCoordinator {
    pub fn new(
        config: SupervisorConfig,
        factory: Arc<dyn SessionFactory>,
        store: StatusStore,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            factory,
            store,
            dispatcher,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Spawn a supervisor for every account that has complete credentials.
    /// Incomplete accounts are skipped with a warning and stay visible in
    /// the status store as disconnected.
    pub fn start(&mut self, accounts: &[AccountConfig]) {
        for account in accounts {
            if !account.is_configured() {
                warn!(account = %account.id, "account missing host or credentials, skipping");
                continue;
            }

            info!(account = %account.id, host = %account.host, "launching account supervisor");
            let supervisor = ConnectionSupervisor::new(
                account.clone(),
                self.config.clone(),
                self.factory.clone(),
                self.store.clone(),
                self.dispatcher.clone(),
                self.shutdown_tx.subscribe(),
            );
            self.tasks
                .push((account.id.clone(), tokio::spawn(supervisor.run())));
        }

        info!(running = self.tasks.len(), "sync engine started");
    }

    pub fn status_store(&self) -> StatusStore {
        self.store.clone()
    }

    /// Broadcast shutdown, then wait a bounded grace period per supervisor.
    /// A supervisor that misses the deadline is abandoned so the process can
    /// still exit.
    pub async fn stop(self, grace: Duration) {
        info!("stopping sync engine");
        // Receivers may all be gone already if every supervisor gave up
        let _ = self.shutdown_tx.send(true);

        for (account, task) in self.tasks {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => info!(account = %account, "supervisor stopped"),
                Ok(Err(e)) => warn!(account = %account, "supervisor task failed: {}", e),
                Err(_) => warn!(account = %account, "supervisor did not stop in time, abandoning"),
            }
        }
    }
}
