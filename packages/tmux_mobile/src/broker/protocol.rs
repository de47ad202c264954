//! Wire protocol for both WebSocket planes.
//!
//! Tagged-variant JSON with a string `type` discriminator. Unknown tags
//! fail to parse and are answered with a protocol error on the control
//! plane; on the data plane unparseable text is PTY input.

use serde::{Deserialize, Serialize};

use crate::tmux::{SessionSummary, SplitOrientation, StateSnapshot};

/// Messages sent FROM the client TO the server on `/ws/control`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlRequest {
    /// First message on every control socket.
    Auth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        /// Reconnecting clients present their previous id to adopt it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    /// Pick a base session (from the picker or explicitly).
    SelectSession { session: String },
    /// Create a base session and attach to it.
    NewSession { name: String },
    /// Open a window. The session field is accepted for wire
    /// compatibility but the broker always targets the attached session.
    NewWindow { session: String },
    SelectWindow { window_index: usize },
    KillWindow { window_index: usize },
    SelectPane { pane_id: String },
    SplitPane {
        pane_id: String,
        orientation: SplitOrientation,
    },
    KillPane { pane_id: String },
    ZoomPane { pane_id: String },
    CaptureScrollback {
        pane_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lines: Option<u32>,
    },
    /// Composed line of input; the broker appends a carriage return.
    SendCompose { text: String },
}

/// Messages sent FROM the server TO the client on `/ws/control`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlResponse {
    AuthOk {
        client_id: String,
        requires_password: bool,
    },
    AuthError { reason: String },
    Attached { session: String },
    SessionPicker { sessions: Vec<SessionSummary> },
    TmuxState { state: StateSnapshot },
    Scrollback {
        pane_id: String,
        text: String,
        lines: u32,
    },
    Error { message: String },
    Info { message: String },
}

/// JSON text frames understood on `/ws/terminal`. Anything else
/// (binary frames, or text that does not parse to one of these) is raw
/// PTY input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DataFrame {
    Auth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        client_id: String,
    },
    Resize { cols: f64, rows: f64 },
}

/// Close codes used on the data plane (and for control eviction).
pub const CLOSE_RECONNECTED: u16 = 4000;
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
