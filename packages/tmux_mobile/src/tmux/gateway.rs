//! Abstract capability over the external tmux server.

use async_trait::async_trait;
use std::fmt;

use super::types::{PaneState, SessionSummary, WindowRecord};

/// Pane split direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SplitOrientation {
    #[serde(rename = "h")]
    Horizontal,
    #[serde(rename = "v")]
    Vertical,
}

impl SplitOrientation {
    pub fn flag(&self) -> &'static str {
        match self {
            SplitOrientation::Horizontal => "-h",
            SplitOrientation::Vertical => "-v",
        }
    }
}

/// Errors from tmux commands. "No server running" is distinguished so
/// callers can normalize it to an empty listing.
#[derive(Debug)]
pub enum GatewayError {
    /// The tmux server is not running
    NoServer,
    /// The command exceeded the configured timeout
    Timeout(String),
    /// The command failed for any other reason
    Failed { command: String, message: String },
}

impl GatewayError {
    pub fn is_no_server(&self) -> bool {
        matches!(self, GatewayError::NoServer)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoServer => write!(f, "no server running"),
            GatewayError::Timeout(cmd) => write!(f, "tmux command timed out: {}", cmd),
            GatewayError::Failed { command, message } => {
                write!(f, "tmux {} failed: {}", command, message)
            }
        }
    }
}

impl std::error::Error for GatewayError {}

/// Typed interface to the tmux CLI. The broker and monitor depend on
/// this trait; tests substitute scripted fakes.
#[async_trait]
pub trait MultiplexerGateway: Send + Sync {
    /// List sessions. "No server running" yields an empty list.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError>;
    async fn list_windows(&self, session: &str) -> Result<Vec<WindowRecord>, GatewayError>;
    async fn list_panes(
        &self,
        session: &str,
        window_index: usize,
    ) -> Result<Vec<PaneState>, GatewayError>;

    /// Create a detached session.
    async fn create_session(&self, name: &str) -> Result<(), GatewayError>;
    /// Create a detached session sharing the target's window set.
    async fn create_grouped_session(&self, name: &str, target: &str) -> Result<(), GatewayError>;
    async fn kill_session(&self, name: &str) -> Result<(), GatewayError>;
    /// May fail with "no current client"; callers with another attach
    /// path treat that as non-fatal.
    async fn switch_client(&self, session: &str) -> Result<(), GatewayError>;

    async fn new_window(&self, session: &str) -> Result<(), GatewayError>;
    async fn kill_window(&self, session: &str, window_index: usize) -> Result<(), GatewayError>;
    async fn select_window(&self, session: &str, window_index: usize)
    -> Result<(), GatewayError>;

    async fn split_window(
        &self,
        pane_id: &str,
        orientation: SplitOrientation,
    ) -> Result<(), GatewayError>;
    async fn kill_pane(&self, pane_id: &str) -> Result<(), GatewayError>;
    async fn select_pane(&self, pane_id: &str) -> Result<(), GatewayError>;
    /// Toggle zoom on the pane's window.
    async fn zoom_pane(&self, pane_id: &str) -> Result<(), GatewayError>;
    async fn is_pane_zoomed(&self, pane_id: &str) -> Result<bool, GatewayError>;

    /// Last `lines` lines of the pane's scrollback as UTF-8.
    async fn capture_pane(&self, pane_id: &str, lines: u32) -> Result<String, GatewayError>;
}
