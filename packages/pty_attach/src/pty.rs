use anyhow::Context;
use async_trait::async_trait;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// Columns a freshly attached PTY starts with, before the first resize.
pub const DEFAULT_COLS: u16 = 80;
/// Rows a freshly attached PTY starts with, before the first resize.
pub const DEFAULT_ROWS: u16 = 24;

/// Size of the output/exit event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 1024;

/// Events emitted by an attached PTY
#[derive(Clone, Debug)]
pub enum PtyEvent {
    /// Raw bytes read from the PTY master
    Output(Vec<u8>),
    /// The attach child exited (EOF on the master side)
    Exited,
}

/// A live process running under a pseudo-terminal.
#[async_trait]
pub trait PtyProcess: Send + Sync {
    /// Write raw bytes to the process's stdin.
    async fn write(&self, data: &[u8]) -> Result<(), PtyError>;
    /// Resize the terminal.
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;
    /// Terminate the process.
    async fn kill(&self) -> Result<(), PtyError>;
    /// Subscribe to output and exit events.
    fn events(&self) -> broadcast::Receiver<PtyEvent>;
}

/// Spawns attach children. The gateway holds this behind a trait so tests
/// can substitute a scripted fake.
#[async_trait]
pub trait PtyFactory: Send + Sync {
    async fn spawn_attach(&self, session: &str) -> Result<Box<dyn PtyProcess>, PtyError>;
}

/// Messages that can be sent to the PTY actor
enum PtyMessage {
    Write {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    Resize {
        cols: u16,
        rows: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    Kill {
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Handle to communicate with a PTY actor
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    event_tx: broadcast::Sender<PtyEvent>,
}

#[async_trait]
impl PtyProcess for PtyHandle {
    async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Write {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("PTY actor is gone".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("PTY actor didn't respond".into()))?
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                cols,
                rows,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("PTY actor is gone".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("PTY actor didn't respond".into()))?
    }

    async fn kill(&self) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Kill { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelError("PTY actor is gone".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("PTY actor didn't respond".into()))?
    }

    fn events(&self) -> broadcast::Receiver<PtyEvent> {
        self.event_tx.subscribe()
    }
}

/// The PTY actor owning the master side of one attach child
struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    /// Open a PTY at the default 80x24 and spawn `<tmux_bin> attach-session -t <session>`.
    ///
    /// The session name is always a distinct argv element, never spliced
    /// into a shell string. `TMUX`/`TMUX_PANE` are removed so the child
    /// does not believe it is nested inside another client.
    fn spawn(tmux_bin: &str, session: &str) -> Result<PtyHandle, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")
            .map_err(PtyError::from)?;

        let mut cmd = CommandBuilder::new(tmux_bin);
        cmd.arg("attach-session");
        cmd.arg("-t");
        cmd.arg(session);
        cmd.env_remove("TMUX");
        cmd.env_remove("TMUX_PANE");
        cmd.env("TERM", "xterm-256color");

        debug!(session = %session, "Spawning attach child");

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!(session = %session, "Failed to spawn attach child: {}", e);
            PtyError::SpawnFailed(e.to_string())
        })?;

        let pid = child.process_id();
        info!(session = %session, pid = ?pid, "Attach child started");

        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (msg_tx, msg_rx) = mpsc::channel(32);

        let mut actor = Self {
            master: pair.master,
            writer: None,
            child,
            pid,
            receiver: msg_rx,
        };

        let event_tx_reader = event_tx.clone();
        let mut reader = actor
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
            .map_err(PtyError::from)?;

        // Blocking reader thread; EOF means the attach child is gone.
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("PTY EOF - attach child exited");
                        break;
                    }
                    Ok(n) => {
                        let _ = event_tx_reader.send(PtyEvent::Output(buffer[..n].to_vec()));
                    }
                    Err(e) => {
                        warn!("Error reading PTY output: {}", e);
                        break;
                    }
                }
            }
            let _ = event_tx_reader.send(PtyEvent::Exited);
        });

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok(PtyHandle {
            sender: msg_tx,
            event_tx,
        })
    }

    async fn run(&mut self) {
        // Take the writer up front so the PTY stdin stays open.
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => error!("Failed to get PTY writer: {}", e),
        }

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::Write { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write(&data));
                }
                PtyMessage::Resize {
                    cols,
                    rows,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(cols, rows));
                }
                PtyMessage::Kill { respond_to } => {
                    let result = self.handle_kill();
                    let killed = result.is_ok();
                    let _ = respond_to.send(result);
                    if killed {
                        break;
                    }
                }
            }

            if let Ok(Some(status)) = self.child.try_wait() {
                debug!("Attach child exited with status: {:?}", status);
                break;
            }
        }

        debug!("PTY actor shutting down");
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PtyError::WriteFailed("No PTY writer available".into()))?;
        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    fn handle_resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    fn handle_kill(&mut self) -> Result<(), PtyError> {
        // SIGTERM first so the tmux client detaches cleanly.
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                    return Ok(());
                }
            }
        }
        self.child
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))
    }
}

/// Factory spawning real tmux attach children.
pub struct TmuxAttachFactory {
    tmux_bin: String,
}

impl TmuxAttachFactory {
    pub fn new(tmux_bin: impl Into<String>) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
        }
    }
}

#[async_trait]
impl PtyFactory for TmuxAttachFactory {
    async fn spawn_attach(&self, session: &str) -> Result<Box<dyn PtyProcess>, PtyError> {
        let handle = PtyActor::spawn(&self.tmux_bin, session)?;
        Ok(Box::new(handle))
    }
}
