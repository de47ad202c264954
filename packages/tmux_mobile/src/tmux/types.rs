//! Typed records parsed from tmux's tab-delimited listing output.
//!
//! Wire field names are camelCase to match the browser client.

use serde::{Deserialize, Serialize};

/// One row of `list-sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub name: String,
    pub attached: bool,
    pub windows: usize,
}

/// One row of `list-windows` (panes not yet resolved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRecord {
    pub index: usize,
    pub name: String,
    pub active: bool,
    pub pane_count: usize,
}

/// One row of `list-panes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneState {
    pub index: usize,
    /// Opaque tmux pane id, e.g. `%5`
    pub id: String,
    pub current_command: String,
    pub active: bool,
    pub width: u16,
    pub height: u16,
    /// Window is zoomed AND this pane is active
    pub zoomed: bool,
}

/// A window with its panes resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowState {
    pub index: usize,
    pub name: String,
    pub active: bool,
    pub zoomed: bool,
    pub pane_count: usize,
    pub panes: Vec<PaneState>,
}

/// A session with its full window tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub name: String,
    pub attached: bool,
    pub windows: Vec<WindowState>,
}

/// A full poll of the tmux server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub sessions: Vec<SessionState>,
    pub captured_at: String,
}

impl StateSnapshot {
    pub fn new(sessions: Vec<SessionState>) -> Self {
        Self {
            sessions,
            captured_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Canonical serialization of the sessions sequence. The capture
    /// timestamp is excluded so two polls of identical server state
    /// compare equal.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.sessions).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pane(id: &str, active: bool) -> PaneState {
        PaneState {
            index: 0,
            id: id.to_string(),
            current_command: "zsh".to_string(),
            active,
            width: 120,
            height: 40,
            zoomed: false,
        }
    }

    #[test]
    fn pane_state_serde_camel_case() {
        let p = pane("%3", true);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["id"], "%3");
        assert_eq!(json["currentCommand"], "zsh");
        assert_eq!(json["active"], true);
        assert!(json.get("current_command").is_none());
        let rt: PaneState = serde_json::from_value(json).unwrap();
        assert_eq!(rt, p);
    }

    #[test]
    fn window_state_serde_camel_case() {
        let w = WindowState {
            index: 1,
            name: "edit".to_string(),
            active: true,
            zoomed: false,
            pane_count: 2,
            panes: vec![pane("%0", true), pane("%1", false)],
        };
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["paneCount"], 2);
        assert_eq!(json["panes"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn snapshot_fingerprint_ignores_captured_at() {
        let sessions = vec![SessionState {
            name: "main".to_string(),
            attached: true,
            windows: vec![],
        }];
        let a = StateSnapshot {
            sessions: sessions.clone(),
            captured_at: "2025-01-01T00:00:00Z".to_string(),
        };
        let b = StateSnapshot {
            sessions,
            captured_at: "2025-06-30T12:00:00Z".to_string(),
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn snapshot_fingerprint_reflects_session_changes() {
        let a = StateSnapshot::new(vec![SessionState {
            name: "main".to_string(),
            attached: false,
            windows: vec![],
        }]);
        let b = StateSnapshot::new(vec![SessionState {
            name: "main".to_string(),
            attached: true,
            windows: vec![],
        }]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn snapshot_serde_shape() {
        let snap = StateSnapshot::new(vec![]);
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json["capturedAt"].is_string());
        assert!(json["sessions"].as_array().unwrap().is_empty());
    }
}
