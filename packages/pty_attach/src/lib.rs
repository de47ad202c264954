//! PTY adapter for tmux attach children.
//!
//! This crate spawns `tmux attach-session` under a pseudo-terminal and
//! exposes byte I/O, resize, and exit notification. It has no HTTP or
//! protocol knowledge; the gateway consumes it through the
//! [`PtyFactory`]/[`PtyProcess`] traits so tests can substitute fakes.

mod error;
mod pty;

pub use error::PtyError;
pub use pty::{
    DEFAULT_COLS, DEFAULT_ROWS, PtyEvent, PtyFactory, PtyHandle, PtyProcess, TmuxAttachFactory,
};
