//! Data plane: `/ws/terminal`.
//!
//! Raw PTY bytes in both directions, plus two JSON text frames: `auth`
//! (first message) and `resize`. A data socket binds to the control
//! context named by its client id and fate-shares with it.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::protocol::{CLOSE_UNAUTHORIZED, DataFrame};
use super::{Broker, ClientEntry};

enum Outbound {
    Bytes(Vec<u8>),
    Close { code: u16, reason: &'static str },
}

/// Parse a text frame into a protocol frame. Frames that do not look
/// like JSON objects, or that parse to neither `auth` nor `resize`, are
/// PTY input.
fn parse_data_frame(text: &str) -> Option<DataFrame> {
    if !text.trim_start().starts_with('{') {
        return None;
    }
    serde_json::from_str(text).ok()
}

async fn run_sender(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Bytes(data) => {
                if ws_sender.send(Message::Binary(data.into())).await.is_err() {
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

/// Handle one data socket from accept to close.
pub async fn handle_data_socket(socket: WebSocket, broker: Arc<Broker>) {
    broker.metrics.data_opened();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(256);
    let sender = tokio::spawn(run_sender(ws_sender, rx));

    if let Some(entry) = unauthenticated_loop(&broker, &mut ws_receiver, &tx).await {
        bound_loop(&broker, &mut ws_receiver, &tx, entry).await;
    }

    drop(tx);
    let _ = sender.await;
    broker.metrics.data_closed();
}

/// Before auth, the only acceptable frame is a JSON `auth`; everything
/// else closes the socket with 4001.
async fn unauthenticated_loop(
    broker: &Arc<Broker>,
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::Sender<Outbound>,
) -> Option<ClientEntry> {
    let shutdown = broker.shutdown_token();
    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match parse_data_frame(&text) {
                        Some(DataFrame::Auth {
                            token,
                            password,
                            client_id,
                        }) => {
                            match authenticate(broker, token, password, &client_id).await {
                                Some(entry) => {
                                    debug!(client = %client_id, "Data socket bound");
                                    return Some(entry);
                                }
                                None => {
                                    broker.metrics.auth_failure();
                                    let _ = tx
                                        .send(Outbound::Close {
                                            code: CLOSE_UNAUTHORIZED,
                                            reason: "unauthorized",
                                        })
                                        .await;
                                    return None;
                                }
                            }
                        }
                        _ => {
                            let _ = tx
                                .send(Outbound::Close {
                                    code: CLOSE_UNAUTHORIZED,
                                    reason: "auth required",
                                })
                                .await;
                            return None;
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let _ = tx
                        .send(Outbound::Close {
                            code: CLOSE_UNAUTHORIZED,
                            reason: "auth required",
                        })
                        .await;
                    return None;
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Data socket error: {}", e);
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

/// After binding: PTY bytes flow both ways, JSON `resize` frames adjust
/// dimensions, and teardown of the owning context closes the socket.
async fn bound_loop(
    broker: &Arc<Broker>,
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::Sender<Outbound>,
    entry: ClientEntry,
) {
    let closed = entry.closed.clone();
    let mut output_rx = entry.runtime.subscribe_output();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = entry.runtime.write_bytes(&data).await {
                        broker.metrics.pty_error();
                        warn!("PTY write failed: {}", e);
                    }
                }
                Some(Ok(Message::Text(text))) => match parse_data_frame(&text) {
                    Some(DataFrame::Resize { cols, rows }) => {
                        entry.runtime.resize(cols, rows).await;
                    }
                    // A repeated auth on a bound socket is ignored.
                    Some(DataFrame::Auth { .. }) => {}
                    None => {
                        if let Err(e) = entry.runtime.write_bytes(text.as_bytes()).await {
                            broker.metrics.pty_error();
                            warn!("PTY write failed: {}", e);
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Data socket error: {}", e);
                    break;
                }
            },
            _ = closed.cancelled() => {
                let _ = tx
                    .send(Outbound::Close {
                        code: 1000,
                        reason: "control closed",
                    })
                    .await;
                break;
            }
            output = output_rx.recv() => match output {
                Ok(data) => {
                    if tx.send(Outbound::Bytes(data)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Data socket lagged by {} output chunks", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Verify credentials and resolve the named control context. Returns
/// None when the credentials are bad or no authenticated context holds
/// the id.
async fn authenticate(
    broker: &Arc<Broker>,
    token: Option<String>,
    password: Option<String>,
    client_id: &str,
) -> Option<ClientEntry> {
    if broker
        .auth
        .verify(token.as_deref(), password.as_deref())
        .is_err()
    {
        return None;
    }
    broker.get_client(client_id).await
}
