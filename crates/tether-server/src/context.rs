//! Per-process owner of the IPC layer.
//!
//! An [`IpcContext`] either hosts the hub (listener plus lock arbiter) or
//! attaches to a remote one through an [`IpcClient`], depending on settings.
//! Everything it starts is torn down by [`IpcContext::shutdown`].

use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::lock::{self, LockArbiter, LockTicket};
use tether_core::{FactKey, FactValue, Hub, projects};
use tether_settings::TetherSettings;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::client::IpcClient;
use crate::errors::Result;
use crate::server::{IpcServer, ServerHandle};
use crate::shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator};

/// Hub, client and (in host mode) listener for one process.
pub struct IpcContext {
    settings: TetherSettings,
    hub: Hub,
    client: IpcClient,
    shutdown: Arc<ShutdownCoordinator>,
    started: OnceCell<String>,
    server: Mutex<Option<(IpcServer, ServerHandle)>>,
    arbiter: Mutex<Option<LockArbiter>>,
}

impl IpcContext {
    /// Build a context. Nothing runs until [`start`](Self::start).
    pub fn new(settings: TetherSettings) -> Self {
        let hub = Hub::new();
        let client = IpcClient::new(hub.clone(), &settings);
        // attaches only once started
        client.set_address(None);
        Self {
            settings,
            hub,
            client,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            started: OnceCell::new(),
            server: Mutex::new(None),
            arbiter: Mutex::new(None),
        }
    }

    /// This process's hub.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Settings the context was built with.
    pub fn settings(&self) -> &TetherSettings {
        &self.settings
    }

    /// Attach client. Idle in host mode.
    pub fn client(&self) -> &IpcClient {
        &self.client
    }

    /// Whether this process hosts the hub.
    pub fn is_host(&self) -> bool {
        self.server.lock().is_some()
    }

    /// Start IPC and return the hub address.
    ///
    /// - watch mode off: returns an empty address and starts nothing
    /// - attach address set: attaches to that hub in the background
    /// - otherwise: listens, runs the lock arbiter and returns the listening
    ///   address
    ///
    /// Later calls return the first result and re-kick the attach loop.
    pub async fn start(&self) -> Result<String> {
        let address = self
            .started
            .get_or_try_init(|| self.start_once())
            .await?
            .clone();
        self.kick();
        Ok(address)
    }

    async fn start_once(&self) -> Result<String> {
        if !self.settings.ipc.watch {
            debug!("ipc disabled outside watch mode");
            return Ok(String::new());
        }
        self.settings.validate()?;

        if let Some(address) = &self.settings.ipc.attach_address {
            info!(address, carrier = ?self.settings.client.carrier, "attaching to hub");
            self.client.set_address(Some(address.clone()));
            return Ok(address.clone());
        }

        let server = IpcServer::new(
            self.hub.clone(),
            self.settings.ipc.clone(),
            Arc::clone(&self.shutdown),
        );
        let handle = server.listen().await?;
        let address = handle.address().to_owned();
        *self.arbiter.lock() = Some(LockArbiter::spawn(&self.hub));
        *self.server.lock() = Some((server, handle));
        Ok(address)
    }

    /// Make sure the attach loop is running if there is anything to sync.
    fn kick(&self) {
        if self.client.address().is_none() || self.shutdown.is_shutting_down() {
            return;
        }
        let client = self.client.clone();
        self.shutdown.spawn(async move {
            let _ = client.sync().await;
        });
    }

    /// Publish or retract a fact and propagate it.
    pub fn commit(&self, key: FactKey, value: impl Into<Option<FactValue>>) -> bool {
        let present = self.hub.set(key, value);
        self.kick();
        present
    }

    /// Acquire the hub-wide lock. `None` if the wait ended without a grant.
    pub async fn lock_enter(&self) -> Option<LockTicket> {
        let request = lock::request_lock(&self.hub);
        self.kick();
        request.acquired().await
    }

    /// Release the hub-wide lock.
    pub fn lock_leave(&self, ticket: &LockTicket) {
        lock::lock_leave(&self.hub, ticket);
    }

    /// Announce that project `name` is ready.
    pub fn register_project(&self, key: FactKey, name: &str) -> bool {
        let present = projects::register_project(&self.hub, key, name);
        self.kick();
        present
    }

    /// Wait until every project in `names` has been announced anywhere on
    /// the hub.
    pub async fn wait_for_projects<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wait = projects::watch_projects(&self.hub, names);
        self.kick();
        wait.ready().await;
    }

    /// Stop the client and arbiter, close every connection and wait for
    /// background tasks.
    pub async fn shutdown(&self) {
        self.client.shutdown();
        if let Some(arbiter) = self.arbiter.lock().take() {
            arbiter.stop();
        }
        self.shutdown
            .graceful_shutdown(Some(DEFAULT_SHUTDOWN_TIMEOUT))
            .await;
        let _ = self.server.lock().take();
        let retracted = self.hub.clear(|_, _| true);
        info!(retracted, "ipc shut down");
    }
}

impl std::fmt::Debug for IpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcContext")
            .field("address", &self.started.get())
            .field("hub", &self.hub)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}
