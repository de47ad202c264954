//! Polls the tmux gateway, diffs snapshots, and broadcasts changes.
//!
//! Staleness protection: every `force_publish` bumps a generation
//! counter. Any snapshot whose build started under an older generation
//! is discarded rather than delivered: in-flight tmux commands cannot
//! be cancelled, so the result is simply dropped.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tmux::{
    GatewayError, MultiplexerGateway, SessionState, StateSnapshot, WindowState,
};

/// Capacity of the snapshot broadcast channel.
const UPDATE_BUFFER_SIZE: usize = 64;

pub struct StateMonitor {
    gateway: Arc<dyn MultiplexerGateway>,
    poll_interval: Duration,
    update_tx: broadcast::Sender<StateSnapshot>,
    error_tx: broadcast::Sender<String>,
    /// Serialized sessions of the last snapshot delivered to subscribers.
    fingerprint: StdMutex<Option<String>>,
    force_generation: AtomicU64,
    tick_cancel: StdMutex<Option<CancellationToken>>,
    stopped: AtomicBool,
}

impl StateMonitor {
    pub fn new(gateway: Arc<dyn MultiplexerGateway>, poll_interval: Duration) -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_BUFFER_SIZE);
        let (error_tx, _) = broadcast::channel(16);
        Self {
            gateway,
            poll_interval,
            update_tx,
            error_tx,
            fingerprint: StdMutex::new(None),
            force_generation: AtomicU64::new(0),
            tick_cancel: StdMutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.update_tx.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.error_tx.subscribe()
    }

    /// Begin the polling loop.
    pub fn start(self: &Arc<Self>) {
        self.spawn_tick_loop();
    }

    /// Cancel polling. In-flight snapshots are discarded, not delivered.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Invalidate any in-flight build so nothing lands after stop.
        self.force_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.tick_cancel.lock().unwrap().take() {
            token.cancel();
        }
    }

    /// Build and publish a snapshot now, bypassing equality suppression.
    /// Older in-flight builds (ticks or earlier forces) are discarded.
    /// Errors propagate to the caller; the tick loop is rescheduled
    /// either way as long as this is still the most recent force call.
    pub async fn force_publish(self: &Arc<Self>) -> Result<(), GatewayError> {
        let generation = self.force_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(token) = self.tick_cancel.lock().unwrap().take() {
            token.cancel();
        }

        let result = self.build_snapshot().await;
        if let Ok(snapshot) = &result {
            self.publish(snapshot.clone(), generation, true);
        }

        let still_current = self.force_generation.load(Ordering::SeqCst) == generation;
        if still_current && !self.stopped.load(Ordering::SeqCst) {
            self.spawn_tick_loop();
        }

        result.map(|_| ())
    }

    /// Serialized sessions of the last delivered snapshot (None before
    /// the first delivery).
    pub fn last_fingerprint(&self) -> Option<String> {
        self.fingerprint.lock().unwrap().clone()
    }

    fn spawn_tick_loop(self: &Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut guard = self.tick_cancel.lock().unwrap();
            if let Some(previous) = guard.replace(token.clone()) {
                previous.cancel();
            }
        }

        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                let generation = monitor.force_generation.load(Ordering::SeqCst);
                match monitor.build_snapshot().await {
                    Ok(snapshot) => {
                        if token.is_cancelled() {
                            break;
                        }
                        monitor.publish(snapshot, generation, false);
                    }
                    Err(e) => {
                        if token.is_cancelled() {
                            break;
                        }
                        let _ = monitor.error_tx.send(e.to_string());
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(monitor.poll_interval) => {}
                }
            }
        });
    }

    /// Deliver a snapshot unless its build generation is stale. Forced
    /// publishes update the fingerprint unconditionally; tick publishes
    /// are suppressed when nothing changed. The generation re-check and
    /// the send happen under the fingerprint lock so delivery order and
    /// the recorded fingerprint agree.
    fn publish(&self, snapshot: StateSnapshot, generation: u64, forced: bool) {
        let fingerprint = snapshot.fingerprint();
        let mut last = self.fingerprint.lock().unwrap();

        if self.force_generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding stale snapshot");
            return;
        }
        if !forced && last.as_deref() == Some(fingerprint.as_str()) {
            return;
        }

        *last = Some(fingerprint);
        let _ = self.update_tx.send(snapshot);
    }

    /// One full poll: sessions, then windows per session, then panes per
    /// window. A window counts as zoomed when its active pane carries
    /// the zoom flag.
    async fn build_snapshot(&self) -> Result<StateSnapshot, GatewayError> {
        let summaries = self.gateway.list_sessions().await?;
        let mut sessions = Vec::with_capacity(summaries.len());

        for summary in summaries {
            let records = self.gateway.list_windows(&summary.name).await?;
            let mut windows = Vec::with_capacity(records.len());

            for record in records {
                let panes = self
                    .gateway
                    .list_panes(&summary.name, record.index)
                    .await?;
                let zoomed = panes.iter().any(|p| p.zoomed);
                windows.push(WindowState {
                    index: record.index,
                    name: record.name,
                    active: record.active,
                    zoomed,
                    pane_count: record.pane_count,
                    panes,
                });
            }

            sessions.push(SessionState {
                name: summary.name,
                attached: summary.attached,
                windows,
            });
        }

        Ok(StateSnapshot::new(sessions))
    }
}
