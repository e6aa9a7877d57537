//! Gateway counters, served as JSON at `/metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonically updated counter. Decrements stop at zero.
#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    fn decr(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ServerMetrics {
    started: Instant,
    connections_active: Counter,
    connections_total: Counter,
    /// Text frames read from clients.
    frames_received: Counter,
    /// Messages written to clients.
    frames_sent: Counter,
    /// Frames rejected as non-JSON or non-object.
    frames_dropped: Counter,
    auth_successes: Counter,
    auth_failures: Counter,
    replays: Counter,
    notices: Counter,
    sessions_expired: Counter,
    /// Extension, watch, timeout and command callbacks that returned an error.
    hook_failures: Counter,
    websocket_errors: Counter,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            connections_active: Counter::default(),
            connections_total: Counter::default(),
            frames_received: Counter::default(),
            frames_sent: Counter::default(),
            frames_dropped: Counter::default(),
            auth_successes: Counter::default(),
            auth_failures: Counter::default(),
            replays: Counter::default(),
            notices: Counter::default(),
            sessions_expired: Counter::default(),
            hook_failures: Counter::default(),
            websocket_errors: Counter::default(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_active.add(1);
        self.connections_total.add(1);
    }

    pub fn connection_closed(&self) {
        self.connections_active.decr();
    }

    pub fn message_received(&self) {
        self.frames_received.add(1);
    }

    pub fn message_sent(&self) {
        self.frames_sent.add(1);
    }

    pub fn message_dropped(&self) {
        self.frames_dropped.add(1);
    }

    pub fn auth_succeeded(&self) {
        self.auth_successes.add(1);
    }

    /// A failed authentication; `replay` marks a reused API signature.
    pub fn auth_failed(&self, replay: bool) {
        self.auth_failures.add(1);
        if replay {
            self.replays.add(1);
        }
    }

    pub fn notice_broadcast(&self) {
        self.notices.add(1);
    }

    pub fn sessions_expired(&self, n: usize) {
        self.sessions_expired.add(n as u64);
    }

    pub fn hook_failed(&self, n: usize) {
        self.hook_failures.add(n as u64);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.add(1);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionCounts {
                active: self.connections_active.get(),
                total: self.connections_total.get(),
            },
            messages: MessageCounts {
                received: self.frames_received.get(),
                sent: self.frames_sent.get(),
                dropped: self.frames_dropped.get(),
            },
            auth: AuthCounts {
                successes: self.auth_successes.get(),
                failures: self.auth_failures.get(),
                replays_detected: self.replays.get(),
            },
            sessions: SessionCounts {
                expired: self.sessions_expired.get(),
                notices_broadcast: self.notices.get(),
            },
            errors: ErrorCounts {
                hooks: self.hook_failures.get(),
                websocket: self.websocket_errors.get(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionCounts,
    pub messages: MessageCounts,
    pub auth: AuthCounts,
    pub sessions: SessionCounts,
    pub errors: ErrorCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCounts {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageCounts {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthCounts {
    pub successes: u64,
    pub failures: u64,
    pub replays_detected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCounts {
    pub expired: u64,
    pub notices_broadcast: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorCounts {
    pub hooks: u64,
    pub websocket: u64,
}

/// Body of `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `"healthy"`, or `"degraded"` once a transport error has been seen.
    pub status: &'static str,
    pub sessions: u64,
    pub connections: u64,
    pub uptime_secs: u64,
}
