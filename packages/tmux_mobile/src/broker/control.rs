//! Control plane: `/ws/control`.
//!
//! One task per socket. Messages are processed in arrival order, so all
//! mutations for a given context are serialized; contexts never share
//! locks, so clients do not serialize against each other.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::protocol::{CLOSE_RECONNECTED, ControlRequest, ControlResponse};
use super::{Broker, ClientEntry, mobile_session_name};
use crate::auth::generate_client_id;
use crate::tmux::{GatewayError, StateSnapshot};

const NO_ATTACHED_SESSION: &str = "no attached session";
/// Longest client id the broker will adopt on reconnect.
const MAX_CLIENT_ID_LEN: usize = 128;

pub(crate) enum Outbound {
    Message(ControlResponse),
    Close { code: u16, reason: &'static str },
}

/// Serialize queued responses onto the socket. Ends after a close frame
/// or once every sender is dropped, so queued frames always flush.
pub(crate) async fn run_sender(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Message(msg) => {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("Failed to serialize control message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = ws_sender
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Handle one control socket from accept to teardown.
pub async fn handle_control_socket(socket: WebSocket, broker: Arc<Broker>) {
    broker.metrics.control_opened();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(100);
    let sender = tokio::spawn(run_sender(ws_sender, rx));

    let mut session = ControlSession::new(broker.clone(), tx.clone());

    // Unauthenticated phase: only `auth` makes progress.
    let authed = unauthenticated_loop(&broker, &mut session, &mut ws_receiver, &tx).await;

    // Authenticated phase: mutations, state broadcasts, runtime exits,
    // and the eviction/teardown tokens.
    if let Some((entry, state_rx)) = authed {
        authenticated_loop(&broker, &mut session, &mut ws_receiver, &tx, entry, state_rx).await;
    }

    session.teardown().await;
    drop(tx);
    let _ = sender.await;
    broker.metrics.control_closed();
}

async fn unauthenticated_loop(
    broker: &Arc<Broker>,
    session: &mut ControlSession,
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::Sender<Outbound>,
) -> Option<(ClientEntry, broadcast::Receiver<StateSnapshot>)> {
    let shutdown = broker.shutdown_token();
    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    broker.metrics.message_received();
                    // Subscribe before dispatch so the forced snapshot a
                    // successful auth triggers reaches this socket.
                    let state_rx = broker.monitor.subscribe();
                    if session.handle_text(&text).await {
                        return session.entry().cloned().map(|entry| (entry, state_rx));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Control socket error: {}", e);
                    return None;
                }
            },
            _ = shutdown.cancelled() => {
                let _ = tx
                    .send(Outbound::Close {
                        code: 1001,
                        reason: "shutting down",
                    })
                    .await;
                return None;
            }
        }
    }
}

async fn authenticated_loop(
    broker: &Arc<Broker>,
    session: &mut ControlSession,
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::Sender<Outbound>,
    entry: ClientEntry,
    mut state_rx: broadcast::Receiver<StateSnapshot>,
) {
    let evict = entry.evict.clone();
    let closed = entry.closed.clone();
    let mut exit_rx = entry.runtime.subscribe_exit();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    broker.metrics.message_received();
                    session.handle_text(&text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Control socket error: {}", e);
                    break;
                }
            },
            _ = evict.cancelled() => {
                debug!("Control context evicted by reconnect");
                let _ = tx
                    .send(Outbound::Close {
                        code: CLOSE_RECONNECTED,
                        reason: "reconnected",
                    })
                    .await;
                break;
            }
            _ = closed.cancelled() => {
                let _ = tx
                    .send(Outbound::Close {
                        code: 1001,
                        reason: "shutting down",
                    })
                    .await;
                break;
            }
            state = state_rx.recv() => match state {
                Ok(state) => {
                    session.send(ControlResponse::TmuxState { state }).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("State broadcast lagged by {} snapshots", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            exited = exit_rx.recv() => match exited {
                Ok(()) => {
                    session
                        .send(ControlResponse::Info {
                            message: "tmux client exited".to_string(),
                        })
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

struct Authed {
    client_id: String,
    entry: ClientEntry,
    base_session: Option<String>,
    attached_session: Option<String>,
}

/// Per-socket protocol state machine, separated from the WebSocket glue
/// so it can be driven directly in tests.
pub(crate) struct ControlSession {
    broker: Arc<Broker>,
    tx: mpsc::Sender<Outbound>,
    authed: Option<Authed>,
}

impl ControlSession {
    pub(crate) fn new(broker: Arc<Broker>, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            broker,
            tx,
            authed: None,
        }
    }

    pub(crate) fn entry(&self) -> Option<&ClientEntry> {
        self.authed.as_ref().map(|a| &a.entry)
    }

    fn attached_session(&self) -> Option<String> {
        self.authed.as_ref()?.attached_session.clone()
    }

    pub(crate) async fn send(&self, msg: ControlResponse) {
        let _ = self.tx.send(Outbound::Message(msg)).await;
    }

    /// Parse and dispatch one inbound frame. Returns true when this
    /// frame authenticated the session.
    pub(crate) async fn handle_text(&mut self, text: &str) -> bool {
        match serde_json::from_str::<ControlRequest>(text) {
            Ok(req) => self.handle_message(req).await,
            Err(_) => {
                self.send(ControlResponse::Error {
                    message: "invalid message format".to_string(),
                })
                .await;
                false
            }
        }
    }

    pub(crate) async fn handle_message(&mut self, req: ControlRequest) -> bool {
        match req {
            ControlRequest::Auth {
                token,
                password,
                client_id,
            } if self.authed.is_none() => self.handle_auth(token, password, client_id).await,
            _ if self.authed.is_none() => {
                self.send(ControlResponse::AuthError {
                    reason: "auth required".to_string(),
                })
                .await;
                false
            }
            // Includes a repeated `auth`, which is ignored but still
            // followed by the forced publish like every other message.
            req => {
                self.handle_command(req).await;
                false
            }
        }
    }

    async fn handle_auth(
        &mut self,
        token: Option<String>,
        password: Option<String>,
        client_id: Option<String>,
    ) -> bool {
        if let Err(reason) = self
            .broker
            .auth
            .verify(token.as_deref(), password.as_deref())
        {
            self.broker.metrics.auth_failure();
            self.send(ControlResponse::AuthError {
                reason: reason.to_string(),
            })
            .await;
            return false;
        }

        // Adopt a well-formed presented id, otherwise mint a fresh one.
        let client_id = client_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && id.len() <= MAX_CLIENT_ID_LEN)
            .unwrap_or_else(generate_client_id);

        let entry = self.broker.register_client(&client_id).await;
        let base_session = self
            .broker
            .get_reconnect(&client_id)
            .await
            .and_then(|r| r.base_session);

        self.authed = Some(Authed {
            client_id: client_id.clone(),
            entry,
            base_session,
            attached_session: None,
        });

        self.send(ControlResponse::AuthOk {
            client_id,
            requires_password: self.broker.auth.requires_password(),
        })
        .await;

        if let Err(e) = self.ensure_attached(None).await {
            self.broker.metrics.gateway_error();
            self.send(ControlResponse::Error {
                message: e.to_string(),
            })
            .await;
        }
        self.force_publish().await;
        true
    }

    /// Initial attach policy: explicit target, else remembered base,
    /// else the sole/default session, else offer the picker.
    async fn ensure_attached(&mut self, force: Option<String>) -> Result<(), GatewayError> {
        if let Some(base) = force {
            return self.attach_to_base(&base).await;
        }

        let sessions = self.broker.gateway.list_sessions().await?;
        let bases: Vec<_> = sessions
            .into_iter()
            .filter(|s| !s.name.starts_with(super::MOBILE_SESSION_PREFIX))
            .collect();

        if let Some(remembered) = self.authed.as_ref().and_then(|a| a.base_session.clone()) {
            if bases.iter().any(|s| s.name == remembered) {
                return self.attach_to_base(&remembered).await;
            }
        }

        if bases.is_empty() {
            let name = self.broker.config.default_session.clone();
            self.broker.gateway.create_session(&name).await?;
            return self.attach_to_base(&name).await;
        }
        if bases.len() == 1 {
            let name = bases[0].name.clone();
            return self.attach_to_base(&name).await;
        }

        self.send(ControlResponse::SessionPicker { sessions: bases })
            .await;
        Ok(())
    }

    /// Create/reuse the grouped mobile session for `base`, point the
    /// runtime at it, and restore remembered pane/zoom best-effort.
    async fn attach_to_base(&mut self, base: &str) -> Result<(), GatewayError> {
        let (client_id, entry, previous_base) = match &self.authed {
            Some(a) => (a.client_id.clone(), a.entry.clone(), a.base_session.clone()),
            None => return Ok(()),
        };
        let mobile = mobile_session_name(&client_id);
        let gateway = self.broker.gateway.clone();

        let sessions = gateway.list_sessions().await?;
        let mut exists = sessions.iter().any(|s| s.name == mobile);
        if exists && previous_base.as_deref() != Some(base) {
            gateway.kill_session(&mobile).await?;
            exists = false;
        }
        if !exists {
            gateway.create_grouped_session(&mobile, base).await?;
        }

        if let Some(authed) = &mut self.authed {
            authed.base_session = Some(base.to_string());
            authed.attached_session = Some(mobile.clone());
        }
        *entry.attached_session.lock().unwrap() = Some(mobile.clone());
        self.broker
            .update_reconnect(&client_id, |r| r.base_session = Some(base.to_string()))
            .await;

        if let Err(e) = entry.runtime.attach(&mobile).await {
            // The context stays authenticated but unattached; mutations
            // needing a session will fail until the next attach.
            if let Some(authed) = &mut self.authed {
                authed.attached_session = None;
            }
            *entry.attached_session.lock().unwrap() = None;
            self.broker.metrics.pty_error();
            return Err(GatewayError::Failed {
                command: "attach-session".to_string(),
                message: e.to_string(),
            });
        }

        // Best-effort restore of remembered pane selection and zoom;
        // failures stay silent (the pane may be gone).
        if let Some(rec) = self.broker.get_reconnect(&client_id).await {
            if let Some(pane_id) = rec.pane_id.as_deref() {
                if let Err(e) = gateway.select_pane(pane_id).await {
                    debug!(pane = %pane_id, "Pane restore failed: {}", e);
                }
                if let Some(want) = rec.zoomed {
                    match gateway.is_pane_zoomed(pane_id).await {
                        Ok(current) if current != want => {
                            if let Err(e) = gateway.zoom_pane(pane_id).await {
                                debug!(pane = %pane_id, "Zoom restore failed: {}", e);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        self.send(ControlResponse::Attached { session: mobile }).await;
        Ok(())
    }

    /// Run one mutation; failures surface as `error` messages. Every
    /// mutation triggers a force publish regardless of outcome so
    /// subscribers observe post-mutation state promptly.
    async fn handle_command(&mut self, req: ControlRequest) {
        if let Err(message) = self.run_command(req).await {
            self.broker.metrics.gateway_error();
            self.send(ControlResponse::Error { message }).await;
        }
        self.force_publish().await;
    }

    async fn run_command(&mut self, req: ControlRequest) -> Result<(), String> {
        let gateway = self.broker.gateway.clone();
        match req {
            // A repeated auth on a live session is a no-op.
            ControlRequest::Auth { .. } => Ok(()),
            ControlRequest::SelectSession { session } => self
                .attach_to_base(&session)
                .await
                .map_err(|e| e.to_string()),
            ControlRequest::NewSession { name } => {
                gateway
                    .create_session(&name)
                    .await
                    .map_err(|e| e.to_string())?;
                self.attach_to_base(&name).await.map_err(|e| e.to_string())
            }
            // The inbound session field is ignored: windows are always
            // created in this context's attached session.
            ControlRequest::NewWindow { session: _ } => {
                let target = self.require_attached()?;
                gateway.new_window(&target).await.map_err(|e| e.to_string())
            }
            ControlRequest::SelectWindow { window_index } => {
                let target = self.require_attached()?;
                gateway
                    .select_window(&target, window_index)
                    .await
                    .map_err(|e| e.to_string())
            }
            ControlRequest::KillWindow { window_index } => {
                let target = self.require_attached()?;
                gateway
                    .kill_window(&target, window_index)
                    .await
                    .map_err(|e| e.to_string())
            }
            ControlRequest::SelectPane { pane_id } => {
                gateway
                    .select_pane(&pane_id)
                    .await
                    .map_err(|e| e.to_string())?;
                if let Some(client_id) = self.authed.as_ref().map(|a| a.client_id.clone()) {
                    self.broker
                        .update_reconnect(&client_id, |r| r.pane_id = Some(pane_id))
                        .await;
                }
                Ok(())
            }
            ControlRequest::SplitPane {
                pane_id,
                orientation,
            } => gateway
                .split_window(&pane_id, orientation)
                .await
                .map_err(|e| e.to_string()),
            ControlRequest::KillPane { pane_id } => {
                gateway.kill_pane(&pane_id).await.map_err(|e| e.to_string())
            }
            ControlRequest::ZoomPane { pane_id } => {
                gateway
                    .zoom_pane(&pane_id)
                    .await
                    .map_err(|e| e.to_string())?;
                if let Some(client_id) = self.authed.as_ref().map(|a| a.client_id.clone()) {
                    self.broker
                        .update_reconnect(&client_id, |r| {
                            r.zoomed = Some(!r.zoomed.unwrap_or(false));
                        })
                        .await;
                }
                Ok(())
            }
            ControlRequest::CaptureScrollback { pane_id, lines } => {
                let lines = lines.unwrap_or(self.broker.config.scrollback_lines);
                let text = gateway
                    .capture_pane(&pane_id, lines)
                    .await
                    .map_err(|e| e.to_string())?;
                self.send(ControlResponse::Scrollback {
                    pane_id,
                    text,
                    lines,
                })
                .await;
                Ok(())
            }
            ControlRequest::SendCompose { text } => {
                if let Some(authed) = &self.authed {
                    authed
                        .entry
                        .runtime
                        .write(&format!("{}\r", text))
                        .await
                        .map_err(|e| {
                            self.broker.metrics.pty_error();
                            e.to_string()
                        })?;
                }
                Ok(())
            }
        }
    }

    fn require_attached(&self) -> Result<String, String> {
        self.attached_session()
            .ok_or_else(|| NO_ATTACHED_SESSION.to_string())
    }

    async fn force_publish(&self) {
        if let Err(e) = self.broker.monitor.force_publish().await {
            warn!("Force publish after mutation failed: {}", e);
        }
    }

    /// Tear the context down through the broker (idempotent).
    pub(crate) async fn teardown(self) {
        if let Some(authed) = &self.authed {
            self.broker
                .shutdown_context(&authed.client_id, &authed.entry)
                .await;
        }
    }
}
