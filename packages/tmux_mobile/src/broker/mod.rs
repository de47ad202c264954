//! The connection-and-session broker.
//!
//! Each authenticated control socket registers a [`ClientEntry`] keyed
//! by client id. The entry owns the client's terminal runtime and the
//! cancellation tokens that fate-share its data sockets, allow eviction
//! on reconnect, and signal completed teardown.

mod control;
mod protocol;
mod terminal;

pub use control::handle_control_socket;
pub use protocol::{
    CLOSE_RECONNECTED, CLOSE_UNAUTHORIZED, ControlRequest, ControlResponse, DataFrame,
};
pub use terminal::handle_data_socket;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pty_attach::PtyFactory;

use crate::auth::AuthService;
use crate::config::RuntimeConfig;
use crate::metrics::ServerMetrics;
use crate::monitor::StateMonitor;
use crate::runtime::TerminalRuntime;
use crate::tmux::MultiplexerGateway;

/// Only the broker creates or destroys sessions with this prefix, and
/// they never appear in the session picker.
pub const MOBILE_SESSION_PREFIX: &str = "tmux-mobile-client-";

/// How long eviction waits for the previous context's teardown before
/// proceeding anyway.
const EVICT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub fn mobile_session_name(client_id: &str) -> String {
    format!("{}{}", MOBILE_SESSION_PREFIX, client_id)
}

/// Per-client memory surviving control-socket close (not process exit).
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    pub base_session: Option<String>,
    pub pane_id: Option<String>,
    pub zoomed: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Shared state for one authenticated control context.
#[derive(Clone)]
pub struct ClientEntry {
    /// Guards against an evicted context unregistering its successor.
    nonce: u64,
    pub runtime: Arc<TerminalRuntime>,
    /// Mobile session currently attached, if any. Written by the control
    /// session, read at teardown.
    pub attached_session: Arc<StdMutex<Option<String>>>,
    /// Cancelled when teardown starts; bound data sockets close on it.
    pub closed: CancellationToken,
    /// Cancelled to force this control socket to close 4000 "reconnected".
    pub evict: CancellationToken,
    /// Cancelled once teardown has fully completed.
    pub done: CancellationToken,
    cleaning: Arc<AtomicBool>,
}

pub struct Broker {
    pub gateway: Arc<dyn MultiplexerGateway>,
    pub factory: Arc<dyn PtyFactory>,
    pub auth: Arc<AuthService>,
    pub monitor: Arc<StateMonitor>,
    pub config: Arc<RuntimeConfig>,
    pub metrics: Arc<ServerMetrics>,
    clients: RwLock<HashMap<String, ClientEntry>>,
    reconnect: RwLock<HashMap<String, ReconnectState>>,
    nonce_counter: AtomicU64,
    /// Cancelled by `stop` after contexts are down; the HTTP server's
    /// graceful shutdown watches it.
    shutdown: CancellationToken,
    stopped: Mutex<bool>,
}

impl Broker {
    pub fn new(
        gateway: Arc<dyn MultiplexerGateway>,
        factory: Arc<dyn PtyFactory>,
        auth: Arc<AuthService>,
        monitor: Arc<StateMonitor>,
        config: Arc<RuntimeConfig>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            gateway,
            factory,
            auth,
            monitor,
            config,
            metrics,
            clients: RwLock::new(HashMap::new()),
            reconnect: RwLock::new(HashMap::new()),
            nonce_counter: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            stopped: Mutex::new(false),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a freshly authenticated context under `client_id`. An
    /// existing holder of the id is evicted first and its teardown
    /// awaited, so the new context never races the old one's
    /// mobile-session kill.
    pub async fn register_client(&self, client_id: &str) -> ClientEntry {
        let existing = self.clients.read().await.get(client_id).cloned();
        if let Some(old) = existing {
            info!(client = %client_id, "Evicting previous context for reconnect");
            old.evict.cancel();
            if tokio::time::timeout(EVICT_DRAIN_TIMEOUT, old.done.cancelled())
                .await
                .is_err()
            {
                warn!(client = %client_id, "Evicted context did not drain in time");
            }
        }

        let entry = ClientEntry {
            nonce: self.nonce_counter.fetch_add(1, Ordering::SeqCst),
            runtime: Arc::new(TerminalRuntime::new(self.factory.clone())),
            attached_session: Arc::new(StdMutex::new(None)),
            closed: CancellationToken::new(),
            evict: CancellationToken::new(),
            done: CancellationToken::new(),
            cleaning: Arc::new(AtomicBool::new(false)),
        };
        self.clients
            .write()
            .await
            .insert(client_id.to_string(), entry.clone());
        self.metrics.client_registered();
        entry
    }

    pub async fn get_client(&self, client_id: &str) -> Option<ClientEntry> {
        self.clients.read().await.get(client_id).cloned()
    }

    /// Tear down a control context: close bound data sockets, kill the
    /// PTY, kill the mobile session (log and continue on failure), and
    /// free the registry slot. Concurrent callers await the first.
    pub async fn shutdown_context(&self, client_id: &str, entry: &ClientEntry) {
        if entry.cleaning.swap(true, Ordering::SeqCst) {
            entry.done.cancelled().await;
            return;
        }

        entry.closed.cancel();
        entry.runtime.shutdown().await;

        let attached = entry.attached_session.lock().unwrap().take();
        if let Some(mobile) = attached {
            if let Err(e) = self.gateway.kill_session(&mobile).await {
                warn!(session = %mobile, "Failed to kill mobile session on teardown: {}", e);
            }
        }

        self.update_reconnect(client_id, |_| {}).await;

        let mut clients = self.clients.write().await;
        if clients
            .get(client_id)
            .map(|current| current.nonce == entry.nonce)
            .unwrap_or(false)
        {
            clients.remove(client_id);
            self.metrics.client_unregistered();
        }
        drop(clients);

        debug!(client = %client_id, "Control context torn down");
        entry.done.cancel();
    }

    pub async fn get_reconnect(&self, client_id: &str) -> Option<ReconnectState> {
        self.reconnect.read().await.get(client_id).cloned()
    }

    /// Apply `apply` to the client's reconnect memory, stamping
    /// `updated_at`.
    pub async fn update_reconnect(
        &self,
        client_id: &str,
        apply: impl FnOnce(&mut ReconnectState),
    ) {
        let mut map = self.reconnect.write().await;
        let state = map.entry(client_id.to_string()).or_default();
        apply(state);
        state.updated_at = Some(Utc::now());
    }

    /// Drain the monitor's error channel into logs.
    pub fn spawn_monitor_error_drain(self: &Arc<Self>) {
        let mut errors = self.monitor.subscribe_errors();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            loop {
                match errors.recv().await {
                    Ok(message) => {
                        metrics.gateway_error();
                        warn!("State monitor error: {}", message);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Graceful stop: monitor first, then every context concurrently,
    /// then the upgrade endpoints and listener (via the shutdown token).
    /// Idempotent and single-flight; a second call awaits the first.
    pub async fn stop(&self) {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return;
        }

        info!("Stopping broker");
        self.monitor.stop();

        let entries: Vec<(String, ClientEntry)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };
        futures::future::join_all(
            entries
                .iter()
                .map(|(id, entry)| self.shutdown_context(id, entry)),
        )
        .await;

        self.shutdown.cancel();
        *stopped = true;
        info!("Broker stopped");
    }
}
