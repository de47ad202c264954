//! Server metrics for observability
//!
//! Runtime counters for monitoring gateway health.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Currently open control sockets
    pub control_connections: AtomicU64,
    /// Currently open data sockets
    pub data_connections: AtomicU64,
    /// Total WebSocket connections since start (both planes)
    pub total_connections: AtomicU64,
    /// Currently registered (authenticated) clients
    pub active_clients: AtomicU64,
    /// Control messages received from clients
    pub messages_received: AtomicU64,
    /// Failed auth attempts on either plane
    pub auth_failures: AtomicU64,
    /// tmux gateway command failures
    pub gateway_errors: AtomicU64,
    /// PTY spawn/write failures
    pub pty_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn control_opened(&self) {
        self.control_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn control_closed(&self) {
        self.control_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn data_opened(&self) {
        self.data_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn data_closed(&self) {
        self.data_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn client_registered(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_unregistered(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gateway_error(&self) {
        self.gateway_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pty_error(&self) {
        self.pty_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                control: self.control_connections.load(Ordering::Relaxed),
                data: self.data_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            clients: self.active_clients.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            errors: ErrorMetrics {
                auth: self.auth_failures.load(Ordering::Relaxed),
                gateway: self.gateway_errors.load(Ordering::Relaxed),
                pty: self.pty_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub clients: u64,
    pub messages_received: u64,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub control: u64,
    pub data: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub auth: u64,
    pub gateway: u64,
    pub pty: u64,
}
