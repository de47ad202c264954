//! Typed gateway to the external tmux server: the trait the broker and
//! monitor program against, the CLI-backed implementation, and the
//! records parsed from tmux's listing output.

mod cli;
mod gateway;
mod types;

pub use cli::CliGateway;
pub use gateway::{GatewayError, MultiplexerGateway, SplitOrientation};
pub use types::{PaneState, SessionState, SessionSummary, StateSnapshot, WindowRecord, WindowState};
