//! CLI-backed gateway: runs the tmux binary and parses its tab-delimited
//! listing output into typed records.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::gateway::{GatewayError, MultiplexerGateway, SplitOrientation};
use super::types::{PaneState, SessionSummary, WindowRecord};

/// Field order: name, attached, window count.
const SESSION_FORMAT: &str = "#{session_name}\t#{?session_attached,1,0}\t#{session_windows}";
/// Field order: index, name, active, pane count.
const WINDOW_FORMAT: &str = "#{window_index}\t#{window_name}\t#{window_active}\t#{window_panes}";
/// Field order: index, id, current command, active, WxH, active-pane zoom.
const PANE_FORMAT: &str = "#{pane_index}\t#{pane_id}\t#{pane_current_command}\t#{pane_active}\t#{pane_width}x#{pane_height}\t#{?#{&&:#{window_zoomed_flag},#{pane_active}},1,0}";

/// Gateway invoking the external tmux binary. Every call is a fresh
/// child process with a bounded timeout; no in-process lock is needed.
pub struct CliGateway {
    tmux_bin: String,
    timeout: Duration,
}

impl CliGateway {
    pub fn new(tmux_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
            timeout,
        }
    }

    /// Run a tmux subcommand, returning stdout on success. Arguments are
    /// always passed as distinct argv elements; user-supplied strings
    /// never touch a shell.
    async fn run(&self, args: &[&str]) -> Result<String, GatewayError> {
        let command = args.first().copied().unwrap_or_default().to_string();
        debug!(command = %command, "tmux {}", args.join(" "));

        let child = Command::new(&self.tmux_bin)
            .args(args)
            .env_remove("TMUX")
            .env_remove("TMUX_PANE")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(GatewayError::Failed {
                    command,
                    message: e.to_string(),
                });
            }
            Err(_) => return Err(GatewayError::Timeout(command)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("no server running") {
                return Err(GatewayError::NoServer);
            }
            return Err(GatewayError::Failed {
                command,
                message: stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl MultiplexerGateway for CliGateway {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError> {
        match self.run(&["list-sessions", "-F", SESSION_FORMAT]).await {
            Ok(out) => Ok(parse_lines(&out, parse_session_line)),
            Err(e) if e.is_no_server() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn list_windows(&self, session: &str) -> Result<Vec<WindowRecord>, GatewayError> {
        let out = self
            .run(&["list-windows", "-t", session, "-F", WINDOW_FORMAT])
            .await?;
        Ok(parse_lines(&out, parse_window_line))
    }

    async fn list_panes(
        &self,
        session: &str,
        window_index: usize,
    ) -> Result<Vec<PaneState>, GatewayError> {
        let target = format!("{}:{}", session, window_index);
        let out = self
            .run(&["list-panes", "-t", &target, "-F", PANE_FORMAT])
            .await?;
        Ok(parse_lines(&out, parse_pane_line))
    }

    async fn create_session(&self, name: &str) -> Result<(), GatewayError> {
        self.run(&["new-session", "-d", "-s", name]).await.map(drop)
    }

    async fn create_grouped_session(&self, name: &str, target: &str) -> Result<(), GatewayError> {
        self.run(&["new-session", "-d", "-s", name, "-t", target])
            .await
            .map(drop)
    }

    async fn kill_session(&self, name: &str) -> Result<(), GatewayError> {
        self.run(&["kill-session", "-t", name]).await.map(drop)
    }

    async fn switch_client(&self, session: &str) -> Result<(), GatewayError> {
        self.run(&["switch-client", "-t", session]).await.map(drop)
    }

    async fn new_window(&self, session: &str) -> Result<(), GatewayError> {
        let target = format!("{}:", session);
        self.run(&["new-window", "-t", &target]).await.map(drop)
    }

    async fn kill_window(&self, session: &str, window_index: usize) -> Result<(), GatewayError> {
        let target = format!("{}:{}", session, window_index);
        self.run(&["kill-window", "-t", &target]).await.map(drop)
    }

    async fn select_window(
        &self,
        session: &str,
        window_index: usize,
    ) -> Result<(), GatewayError> {
        let target = format!("{}:{}", session, window_index);
        self.run(&["select-window", "-t", &target]).await.map(drop)
    }

    async fn split_window(
        &self,
        pane_id: &str,
        orientation: SplitOrientation,
    ) -> Result<(), GatewayError> {
        self.run(&["split-window", orientation.flag(), "-t", pane_id])
            .await
            .map(drop)
    }

    async fn kill_pane(&self, pane_id: &str) -> Result<(), GatewayError> {
        self.run(&["kill-pane", "-t", pane_id]).await.map(drop)
    }

    async fn select_pane(&self, pane_id: &str) -> Result<(), GatewayError> {
        self.run(&["select-pane", "-t", pane_id]).await.map(drop)
    }

    async fn zoom_pane(&self, pane_id: &str) -> Result<(), GatewayError> {
        self.run(&["resize-pane", "-Z", "-t", pane_id]).await.map(drop)
    }

    async fn is_pane_zoomed(&self, pane_id: &str) -> Result<bool, GatewayError> {
        let out = self
            .run(&[
                "display-message",
                "-p",
                "-t",
                pane_id,
                "#{window_zoomed_flag}",
            ])
            .await?;
        Ok(out.trim() == "1")
    }

    async fn capture_pane(&self, pane_id: &str, lines: u32) -> Result<String, GatewayError> {
        let start = format!("-{}", lines);
        self.run(&["capture-pane", "-p", "-t", pane_id, "-S", &start])
            .await
    }
}

/// Parse every non-empty line with `parse`, skipping lines that do not
/// match the expected shape.
fn parse_lines<T>(output: &str, parse: fn(&str) -> Option<T>) -> Vec<T> {
    output
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(parse)
        .collect()
}

fn parse_flag(field: &str) -> bool {
    field != "0"
}

fn parse_session_line(line: &str) -> Option<SessionSummary> {
    let mut fields = line.split('\t');
    let name = fields.next()?.to_string();
    let attached = parse_flag(fields.next()?);
    let windows = fields.next()?.parse().ok()?;
    Some(SessionSummary {
        name,
        attached,
        windows,
    })
}

fn parse_window_line(line: &str) -> Option<WindowRecord> {
    let mut fields = line.split('\t');
    let index = fields.next()?.parse().ok()?;
    let name = fields.next()?.to_string();
    let active = parse_flag(fields.next()?);
    let pane_count = fields.next()?.parse().ok()?;
    Some(WindowRecord {
        index,
        name,
        active,
        pane_count,
    })
}

fn parse_pane_line(line: &str) -> Option<PaneState> {
    let mut fields = line.split('\t');
    let index = fields.next()?.parse().ok()?;
    let id = fields.next()?.to_string();
    let current_command = fields.next()?.to_string();
    let active = parse_flag(fields.next()?);
    let (width, height) = fields.next()?.split_once('x')?;
    let width = width.parse().ok()?;
    let height = height.parse().ok()?;
    let zoomed = parse_flag(fields.next()?);
    Some(PaneState {
        index,
        id,
        current_command,
        active,
        width,
        height,
        zoomed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(b: bool) -> &'static str {
        if b { "1" } else { "0" }
    }

    fn format_session(s: &SessionSummary) -> String {
        format!("{}\t{}\t{}", s.name, flag(s.attached), s.windows)
    }

    fn format_window(w: &WindowRecord) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            w.index,
            w.name,
            flag(w.active),
            w.pane_count
        )
    }

    fn format_pane(p: &PaneState) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}x{}\t{}",
            p.index,
            p.id,
            p.current_command,
            flag(p.active),
            p.width,
            p.height,
            flag(p.zoomed)
        )
    }

    #[test]
    fn parse_session_basic() {
        let s = parse_session_line("work\t1\t3").unwrap();
        assert_eq!(s.name, "work");
        assert!(s.attached);
        assert_eq!(s.windows, 3);
    }

    #[test]
    fn parse_session_detached() {
        let s = parse_session_line("dev\t0\t1").unwrap();
        assert!(!s.attached);
    }

    #[test]
    fn parse_session_attach_count_treated_as_attached() {
        // tmux reports session_attached as a client count when the
        // conditional format is bypassed; anything nonzero is attached.
        let s = parse_session_line("work\t2\t1").unwrap();
        assert!(s.attached);
    }

    #[test]
    fn parse_session_malformed() {
        assert!(parse_session_line("only-a-name").is_none());
        assert!(parse_session_line("name\t1\tnot-a-number").is_none());
    }

    #[test]
    fn parse_window_basic() {
        let w = parse_window_line("2\tlogs\t0\t4").unwrap();
        assert_eq!(w.index, 2);
        assert_eq!(w.name, "logs");
        assert!(!w.active);
        assert_eq!(w.pane_count, 4);
    }

    #[test]
    fn parse_pane_basic() {
        let p = parse_pane_line("1\t%5\tvim\t1\t120x40\t1").unwrap();
        assert_eq!(p.index, 1);
        assert_eq!(p.id, "%5");
        assert_eq!(p.current_command, "vim");
        assert!(p.active);
        assert_eq!((p.width, p.height), (120, 40));
        assert!(p.zoomed);
    }

    #[test]
    fn parse_pane_bad_dimensions() {
        assert!(parse_pane_line("1\t%5\tvim\t1\t120-40\t0").is_none());
        assert!(parse_pane_line("1\t%5\tvim\t1\tx40\t0").is_none());
    }

    #[test]
    fn parse_lines_skips_empty() {
        let out = "work\t1\t3\n\ndev\t0\t1\n";
        let sessions = parse_lines(out, parse_session_line);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].name, "dev");
    }

    #[test]
    fn session_roundtrip() {
        let sessions = vec![
            SessionSummary {
                name: "work".to_string(),
                attached: true,
                windows: 3,
            },
            SessionSummary {
                name: "tmux-mobile-client-abc".to_string(),
                attached: false,
                windows: 3,
            },
        ];
        let formatted: String = sessions
            .iter()
            .map(|s| format_session(s) + "\n")
            .collect();
        assert_eq!(parse_lines(&formatted, parse_session_line), sessions);
    }

    #[test]
    fn window_roundtrip() {
        let windows = vec![
            WindowRecord {
                index: 0,
                name: "edit".to_string(),
                active: true,
                pane_count: 2,
            },
            WindowRecord {
                index: 1,
                name: "server logs".to_string(),
                active: false,
                pane_count: 1,
            },
        ];
        let formatted: String = windows.iter().map(|w| format_window(w) + "\n").collect();
        assert_eq!(parse_lines(&formatted, parse_window_line), windows);
    }

    #[test]
    fn pane_roundtrip() {
        let panes = vec![
            PaneState {
                index: 0,
                id: "%0".to_string(),
                current_command: "zsh".to_string(),
                active: false,
                width: 80,
                height: 24,
                zoomed: false,
            },
            PaneState {
                index: 1,
                id: "%7".to_string(),
                current_command: "htop".to_string(),
                active: true,
                width: 200,
                height: 50,
                zoomed: true,
            },
        ];
        let formatted: String = panes.iter().map(|p| format_pane(p) + "\n").collect();
        assert_eq!(parse_lines(&formatted, parse_pane_line), panes);
    }

    #[test]
    fn orientation_flags() {
        assert_eq!(SplitOrientation::Horizontal.flag(), "-h");
        assert_eq!(SplitOrientation::Vertical.flag(), "-v");
    }
}
