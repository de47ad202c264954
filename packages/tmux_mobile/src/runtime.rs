//! Per-client terminal runtime: owns one attached PTY, fans its bytes
//! out to bound data sockets, and preserves the last resize across
//! reattach.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use pty_attach::{DEFAULT_COLS, DEFAULT_ROWS, PtyError, PtyEvent, PtyFactory, PtyProcess};

/// Capacity of the output fan-out channel.
const OUTPUT_BUFFER_SIZE: usize = 1024;

struct RuntimeInner {
    session: Option<String>,
    process: Option<Box<dyn PtyProcess>>,
    cols: u16,
    rows: u16,
}

pub struct TerminalRuntime {
    factory: Arc<dyn PtyFactory>,
    inner: Arc<Mutex<RuntimeInner>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    exit_tx: broadcast::Sender<()>,
    /// Bumped on every respawn so a killed process's trailing events are
    /// dropped instead of reaching subscribers.
    epoch: Arc<AtomicU64>,
}

impl TerminalRuntime {
    pub fn new(factory: Arc<dyn PtyFactory>) -> Self {
        let (output_tx, _) = broadcast::channel(OUTPUT_BUFFER_SIZE);
        let (exit_tx, _) = broadcast::channel(8);
        Self {
            factory,
            inner: Arc::new(Mutex::new(RuntimeInner {
                session: None,
                process: None,
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
            })),
            output_tx,
            exit_tx,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attach to `session`. A no-op when already attached to it with a
    /// live process; otherwise the current process is killed and a new
    /// one spawned with the last known dimensions replayed.
    pub async fn attach(&self, session: &str) -> Result<(), PtyError> {
        let mut inner = self.inner.lock().await;

        if inner.session.as_deref() == Some(session) && inner.process.is_some() {
            return Ok(());
        }

        if let Some(old) = inner.process.take() {
            if let Err(e) = old.kill().await {
                warn!(session = ?inner.session, "Failed to kill previous PTY: {}", e);
            }
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let process = self.factory.spawn_attach(session).await?;

        if let Err(e) = process.resize(inner.cols, inner.rows).await {
            warn!(session = %session, "Failed to replay size on attach: {}", e);
        }

        let events = process.events();
        inner.session = Some(session.to_string());
        inner.process = Some(process);
        drop(inner);

        self.spawn_forwarder(events, epoch);
        Ok(())
    }

    /// Forward one process generation's events into the runtime-lifetime
    /// channels. Stops as soon as the epoch moves on.
    fn spawn_forwarder(&self, mut events: broadcast::Receiver<PtyEvent>, epoch: u64) {
        let output_tx = self.output_tx.clone();
        let exit_tx = self.exit_tx.clone();
        let current_epoch = self.epoch.clone();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if current_epoch.load(Ordering::SeqCst) != epoch {
                            break;
                        }
                        match event {
                            PtyEvent::Output(data) => {
                                let _ = output_tx.send(data);
                            }
                            PtyEvent::Exited => {
                                let mut guard = inner.lock().await;
                                if current_epoch.load(Ordering::SeqCst) == epoch {
                                    guard.process = None;
                                    let _ = exit_tx.send(());
                                }
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("PTY event stream lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Forward text to the PTY; a no-op when nothing is attached.
    pub async fn write(&self, text: &str) -> Result<(), PtyError> {
        self.write_bytes(text.as_bytes()).await
    }

    pub async fn write_bytes(&self, data: &[u8]) -> Result<(), PtyError> {
        let inner = self.inner.lock().await;
        match &inner.process {
            Some(process) => process.write(data).await,
            None => Ok(()),
        }
    }

    /// Store and apply new dimensions. Non-finite values and values
    /// below 2 are ignored; fractional values are truncated.
    pub async fn resize(&self, cols: f64, rows: f64) {
        if !cols.is_finite() || !rows.is_finite() || cols < 2.0 || rows < 2.0 {
            debug!(cols, rows, "Ignoring invalid resize");
            return;
        }
        let (cols, rows) = (cols as u16, rows as u16);

        let mut inner = self.inner.lock().await;
        inner.cols = cols;
        inner.rows = rows;
        if let Some(process) = &inner.process {
            if let Err(e) = process.resize(cols, rows).await {
                warn!("Failed to resize PTY: {}", e);
            }
        }
    }

    /// Kill the current process and forget it.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(process) = inner.process.take() {
            if let Err(e) = process.kill().await {
                warn!(session = ?inner.session, "Failed to kill PTY on shutdown: {}", e);
            }
        }
        inner.session = None;
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    pub fn subscribe_exit(&self) -> broadcast::Receiver<()> {
        self.exit_tx.subscribe()
    }

    pub async fn current_session(&self) -> Option<String> {
        self.inner.lock().await.session.clone()
    }

    pub async fn dimensions(&self) -> (u16, u16) {
        let inner = self.inner.lock().await;
        (inner.cols, inner.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Clone)]
    struct FakePty {
        session: String,
        log: Arc<StdMutex<Vec<String>>>,
        event_tx: broadcast::Sender<PtyEvent>,
    }

    #[async_trait]
    impl PtyProcess for FakePty {
        async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
            self.log.lock().unwrap().push(format!(
                "write[{}] {}",
                self.session,
                String::from_utf8_lossy(data)
            ));
            Ok(())
        }

        async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("resize[{}] {}x{}", self.session, cols, rows));
            Ok(())
        }

        async fn kill(&self) -> Result<(), PtyError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("kill[{}]", self.session));
            Ok(())
        }

        fn events(&self) -> broadcast::Receiver<PtyEvent> {
            self.event_tx.subscribe()
        }
    }

    struct FakeFactory {
        log: Arc<StdMutex<Vec<String>>>,
        spawned: Arc<StdMutex<Vec<FakePty>>>,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                log: Arc::new(StdMutex::new(Vec::new())),
                spawned: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn last_spawned(&self) -> FakePty {
            self.spawned.lock().unwrap().last().unwrap().clone()
        }

        fn spawn_count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PtyFactory for FakeFactory {
        async fn spawn_attach(&self, session: &str) -> Result<Box<dyn PtyProcess>, PtyError> {
            let (event_tx, _) = broadcast::channel(64);
            let pty = FakePty {
                session: session.to_string(),
                log: self.log.clone(),
                event_tx,
            };
            self.log
                .lock()
                .unwrap()
                .push(format!("spawn[{}]", session));
            self.spawned.lock().unwrap().push(pty.clone());
            Ok(Box::new(pty))
        }
    }

    fn harness() -> (Arc<FakeFactory>, TerminalRuntime) {
        let factory = Arc::new(FakeFactory::new());
        let runtime = TerminalRuntime::new(factory.clone());
        (factory, runtime)
    }

    #[tokio::test]
    async fn attach_replays_default_dimensions() {
        let (factory, runtime) = harness();
        runtime.attach("main").await.unwrap();
        let log = factory.log.lock().unwrap().clone();
        assert_eq!(log, vec!["spawn[main]", "resize[main] 80x24"]);
    }

    #[tokio::test]
    async fn attach_same_session_is_noop() {
        let (factory, runtime) = harness();
        runtime.attach("main").await.unwrap();
        runtime.attach("main").await.unwrap();
        assert_eq!(factory.spawn_count(), 1);
    }

    #[tokio::test]
    async fn attach_other_session_kills_and_replays_last_size() {
        let (factory, runtime) = harness();
        runtime.attach("main").await.unwrap();
        runtime.resize(100.0, 50.0).await;
        runtime.attach("dev").await.unwrap();

        let log = factory.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "spawn[main]",
                "resize[main] 80x24",
                "resize[main] 100x50",
                "kill[main]",
                "spawn[dev]",
                "resize[dev] 100x50",
            ]
        );
        assert_eq!(runtime.current_session().await.as_deref(), Some("dev"));
    }

    #[tokio::test]
    async fn invalid_resizes_are_ignored() {
        let (_, runtime) = harness();
        runtime.resize(f64::NAN, 24.0).await;
        runtime.resize(1.0, 24.0).await;
        runtime.resize(80.0, f64::INFINITY).await;
        assert_eq!(runtime.dimensions().await, (80, 24));
    }

    #[tokio::test]
    async fn fractional_resize_truncates() {
        let (_, runtime) = harness();
        runtime.resize(100.9, 50.2).await;
        assert_eq!(runtime.dimensions().await, (100, 50));
    }

    #[tokio::test]
    async fn write_without_process_is_noop() {
        let (factory, runtime) = harness();
        runtime.write("ls\r").await.unwrap();
        assert!(factory.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn output_reaches_subscribers() {
        let (factory, runtime) = harness();
        runtime.attach("main").await.unwrap();
        let mut rx = runtime.subscribe_output();

        let pty = factory.last_spawned();
        pty.event_tx
            .send(PtyEvent::Output(b"hello".to_vec()))
            .unwrap();

        let data = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn output_is_isolated_between_runtimes() {
        let (factory_a, runtime_a) = harness();
        let (factory_b, runtime_b) = harness();
        runtime_a.attach("a").await.unwrap();
        runtime_b.attach("b").await.unwrap();

        let mut rx_a = runtime_a.subscribe_output();
        let mut rx_b = runtime_b.subscribe_output();

        factory_a
            .last_spawned()
            .event_tx
            .send(PtyEvent::Output(b"from-a".to_vec()))
            .unwrap();
        factory_b
            .last_spawned()
            .event_tx
            .send(PtyEvent::Output(b"from-b".to_vec()))
            .unwrap();

        let got_a = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        let got_b = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_a, b"from-a");
        assert_eq!(got_b, b"from-b");
    }

    #[tokio::test]
    async fn stale_process_output_is_dropped_after_reattach() {
        let (factory, runtime) = harness();
        runtime.attach("main").await.unwrap();
        let old = factory.last_spawned();

        runtime.attach("dev").await.unwrap();
        let mut rx = runtime.subscribe_output();

        let _ = old.event_tx.send(PtyEvent::Output(b"stale".to_vec()));
        factory
            .last_spawned()
            .event_tx
            .send(PtyEvent::Output(b"fresh".to_vec()))
            .unwrap();

        let data = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"fresh");
    }

    #[tokio::test]
    async fn exit_clears_process_and_notifies() {
        let (factory, runtime) = harness();
        runtime.attach("main").await.unwrap();
        let mut exits = runtime.subscribe_exit();

        factory.last_spawned().event_tx.send(PtyEvent::Exited).unwrap();
        tokio::time::timeout(Duration::from_secs(1), exits.recv())
            .await
            .unwrap()
            .unwrap();

        // Same-session attach respawns because the process is gone.
        runtime.attach("main").await.unwrap();
        assert_eq!(factory.spawn_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_kills_and_forgets() {
        let (factory, runtime) = harness();
        runtime.attach("main").await.unwrap();
        runtime.shutdown().await;

        assert!(runtime.current_session().await.is_none());
        let log = factory.log.lock().unwrap().clone();
        assert!(log.contains(&"kill[main]".to_string()));
    }

    #[tokio::test]
    async fn exit_after_shutdown_is_not_reemitted() {
        let (factory, runtime) = harness();
        runtime.attach("main").await.unwrap();
        let old = factory.last_spawned();
        let mut exits = runtime.subscribe_exit();

        runtime.shutdown().await;
        let _ = old.event_tx.send(PtyEvent::Exited);

        let got = tokio::time::timeout(Duration::from_millis(100), exits.recv()).await;
        assert!(got.is_err(), "exit from a shut-down process leaked");
    }
}
