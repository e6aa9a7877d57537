//! Per-session state shared by every connection that presents the same
//! session id, and the idle sweep that reclaims it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Invoked with the session id when a session expires or the server shuts down.
pub type TimeoutCallback = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

pub const DEFAULT_LOCATION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeen {
    /// At least one connection for the session is open.
    Connected,
    /// The last connection closed at this instant.
    Idle(Instant),
}

/// Per-tab state inside a session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LocationState {
    pub container: Option<String>,
    pub prefix: Option<String>,
    /// Free-form data owned by whichever extension put it there.
    pub data: Map<String, Value>,
}

pub struct SessionRecord {
    pub session_id: String,
    pub last_seen: LastSeen,
    connections: usize,
    pub locations: HashMap<String, LocationState>,
    timeout_callbacks: Vec<TimeoutCallback>,
}

impl SessionRecord {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            last_seen: LastSeen::Connected,
            connections: 0,
            locations: HashMap::new(),
            timeout_callbacks: Vec::new(),
        }
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_seen {
            LastSeen::Connected => false,
            LastSeen::Idle(since) => now.saturating_duration_since(since) > timeout,
        }
    }
}

/// Result of a sweep or shutdown pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub callback_failures: usize,
}

/// Snapshot of one session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub connections: usize,
    pub idle_secs: Option<u64>,
    pub locations: Vec<String>,
}

pub struct SessionRegistry {
    records: Mutex<HashMap<String, SessionRecord>>,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Attach one more connection to `session_id`, creating the record on
    /// first use, and make sure `location` exists. Returns `true` if the
    /// record was created.
    pub fn connect(&self, session_id: &str, location: &str) -> bool {
        let mut records = self.records.lock();
        let created = !records.contains_key(session_id);
        let record = records
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord::new(session_id));
        record.connections += 1;
        record.last_seen = LastSeen::Connected;
        record.locations.entry(location.to_string()).or_default();
        if created {
            debug!(session = %session_id, "Session created");
        }
        created
    }

    /// Detach one connection. The session goes idle when its last
    /// connection leaves.
    pub fn disconnect(&self, session_id: &str, now: Instant) {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(session_id) else {
            return;
        };
        record.connections = record.connections.saturating_sub(1);
        if record.connections == 0 {
            record.last_seen = LastSeen::Idle(now);
            debug!(session = %session_id, "Session idle");
        }
    }

    /// Register or replace the state for `location`. Returns `false` if the
    /// session does not exist.
    pub fn register_location(&self, session_id: &str, location: &str, state: LocationState) -> bool {
        let mut records = self.records.lock();
        match records.get_mut(session_id) {
            Some(record) => {
                record.locations.insert(location.to_string(), state);
                true
            }
            None => false,
        }
    }

    /// Run `f` against a location's state, creating the location if needed.
    pub fn with_location<R>(
        &self,
        session_id: &str,
        location: &str,
        f: impl FnOnce(&mut LocationState) -> R,
    ) -> Option<R> {
        let mut records = self.records.lock();
        let record = records.get_mut(session_id)?;
        Some(f(record.locations.entry(location.to_string()).or_default()))
    }

    /// Append a cleanup callback to run when the session expires. Returns
    /// `false` if the session does not exist.
    pub fn add_timeout_callback(&self, session_id: &str, callback: TimeoutCallback) -> bool {
        let mut records = self.records.lock();
        match records.get_mut(session_id) {
            Some(record) => {
                record.timeout_callbacks.push(callback);
                true
            }
            None => false,
        }
    }

    /// Remove every idle session whose idle time exceeds the timeout and run
    /// its callbacks in registration order.
    ///
    /// Records leave the map before any callback runs, so callbacks may use
    /// the registry freely.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let expired: Vec<SessionRecord> = {
            let mut records = self.records.lock();
            let ids: Vec<String> = records
                .values()
                .filter(|r| r.is_expired(now, self.timeout))
                .map(|r| r.session_id.clone())
                .collect();
            ids.iter().filter_map(|id| records.remove(id)).collect()
        };

        let mut report = SweepReport::default();
        for record in expired {
            info!(session = %record.session_id, "Session timed out");
            report.callback_failures += run_callbacks(&record);
            report.expired.push(record.session_id);
        }
        report
    }

    /// Drain every session and run all of its callbacks once, regardless of
    /// whether it is connected.
    pub fn shutdown(&self) -> SweepReport {
        let drained: Vec<SessionRecord> = {
            let mut records = self.records.lock();
            records.drain().map(|(_, r)| r).collect()
        };
        let mut report = SweepReport::default();
        for record in drained {
            report.callback_failures += run_callbacks(&record);
            report.expired.push(record.session_id);
        }
        report
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.records.lock().contains_key(session_id)
    }

    pub fn last_seen(&self, session_id: &str) -> Option<LastSeen> {
        self.records.lock().get(session_id).map(|r| r.last_seen)
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.records
            .lock()
            .get(session_id)
            .map_or(0, |r| r.connections)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn summaries(&self, now: Instant) -> Vec<SessionSummary> {
        let records = self.records.lock();
        let mut out: Vec<SessionSummary> = records
            .values()
            .map(|r| SessionSummary {
                session_id: r.session_id.clone(),
                connections: r.connections,
                idle_secs: match r.last_seen {
                    LastSeen::Connected => None,
                    LastSeen::Idle(since) => Some(now.saturating_duration_since(since).as_secs()),
                },
                locations: {
                    let mut names: Vec<String> = r.locations.keys().cloned().collect();
                    names.sort();
                    names
                },
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }
}

fn run_callbacks(record: &SessionRecord) -> usize {
    let mut failures = 0;
    for callback in &record.timeout_callbacks {
        if let Err(e) = callback(&record.session_id) {
            failures += 1;
            warn!(session = %record.session_id, error = %e, "Session timeout callback failed");
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn recorder() -> (Arc<Mutex<Vec<String>>>, TimeoutCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let cb: TimeoutCallback = Arc::new(move |id: &str| -> anyhow::Result<()> {
            s.lock().push(id.to_string());
            Ok(())
        });
        (seen, cb)
    }

    #[test]
    fn connect_creates_once() {
        let reg = SessionRegistry::new(TIMEOUT);
        assert!(reg.connect("s1", DEFAULT_LOCATION));
        assert!(!reg.connect("s1", "tab2"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.connection_count("s1"), 2);
        assert_eq!(reg.last_seen("s1"), Some(LastSeen::Connected));
    }

    #[test]
    fn idle_only_after_last_connection_closes() {
        let reg = SessionRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        reg.connect("s1", DEFAULT_LOCATION);
        reg.connect("s1", DEFAULT_LOCATION);

        reg.disconnect("s1", t0);
        assert_eq!(reg.last_seen("s1"), Some(LastSeen::Connected));

        reg.disconnect("s1", t0);
        assert_eq!(reg.last_seen("s1"), Some(LastSeen::Idle(t0)));

        reg.connect("s1", DEFAULT_LOCATION);
        assert_eq!(reg.last_seen("s1"), Some(LastSeen::Connected));
    }

    #[test]
    fn sweep_respects_strict_timeout() {
        let reg = SessionRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        reg.connect("s1", DEFAULT_LOCATION);
        reg.disconnect("s1", t0);

        assert!(reg.sweep(t0 + TIMEOUT).expired.is_empty());
        assert!(reg.contains("s1"));

        let report = reg.sweep(t0 + TIMEOUT + Duration::from_millis(1));
        assert_eq!(report.expired, vec!["s1".to_string()]);
        assert!(!reg.contains("s1"));
    }

    #[test]
    fn connected_sessions_never_expire() {
        let reg = SessionRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        reg.connect("s1", DEFAULT_LOCATION);
        assert!(reg.sweep(t0 + Duration::from_secs(86_400 * 365)).expired.is_empty());
        assert!(reg.contains("s1"));
    }

    #[test]
    fn callbacks_run_in_order_with_session_id() {
        let reg = SessionRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        reg.connect("s1", DEFAULT_LOCATION);

        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            reg.add_timeout_callback(
                "s1",
                Arc::new(move |id: &str| -> anyhow::Result<()> {
                    order.lock().push(format!("{n}:{id}"));
                    Ok(())
                }),
            );
        }
        reg.disconnect("s1", t0);
        reg.sweep(t0 + TIMEOUT * 2);
        assert_eq!(*order.lock(), vec!["0:s1", "1:s1", "2:s1"]);
    }

    #[test]
    fn failing_callback_does_not_block_others() {
        let reg = SessionRegistry::new(TIMEOUT);
        let t0 = Instant::now();
        reg.connect("s1", DEFAULT_LOCATION);
        reg.add_timeout_callback(
            "s1",
            Arc::new(|_: &str| -> anyhow::Result<()> { anyhow::bail!("cleanup failed") }),
        );
        let (seen, cb) = recorder();
        reg.add_timeout_callback("s1", cb);
        reg.disconnect("s1", t0);

        let report = reg.sweep(t0 + TIMEOUT * 2);
        assert_eq!(report.callback_failures, 1);
        assert_eq!(*seen.lock(), vec!["s1".to_string()]);
    }

    #[test]
    fn callback_may_reenter_registry() {
        let reg = Arc::new(SessionRegistry::new(TIMEOUT));
        let t0 = Instant::now();
        reg.connect("s1", DEFAULT_LOCATION);
        let r = reg.clone();
        reg.add_timeout_callback(
            "s1",
            Arc::new(move |_: &str| -> anyhow::Result<()> {
                assert!(r.is_empty());
                Ok(())
            }),
        );
        reg.disconnect("s1", t0);
        assert_eq!(reg.sweep(t0 + TIMEOUT * 2).callback_failures, 0);
    }

    #[test]
    fn shutdown_runs_every_callback_once() {
        let reg = SessionRegistry::new(TIMEOUT);
        let (seen, cb) = recorder();
        reg.connect("live", DEFAULT_LOCATION);
        reg.connect("idle", DEFAULT_LOCATION);
        reg.disconnect("idle", Instant::now());
        reg.add_timeout_callback("live", cb.clone());
        reg.add_timeout_callback("idle", cb);

        reg.shutdown();
        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["idle".to_string(), "live".to_string()]);
        assert!(reg.is_empty());
        assert!(reg.shutdown().expired.is_empty());
    }

    #[test]
    fn locations_are_tracked_per_session() {
        let reg = SessionRegistry::new(TIMEOUT);
        reg.connect("s1", DEFAULT_LOCATION);
        assert!(reg.register_location(
            "s1",
            "tab2",
            LocationState {
                container: Some("gateone".into()),
                ..Default::default()
            }
        ));
        assert!(!reg.register_location("missing", "tab", LocationState::default()));

        let container = reg.with_location("s1", "tab2", |loc| loc.container.clone());
        assert_eq!(container, Some(Some("gateone".to_string())));

        let summary = &reg.summaries(Instant::now())[0];
        assert_eq!(summary.locations, vec!["default", "tab2"]);
        assert_eq!(summary.idle_secs, None);
    }

    #[test]
    fn callbacks_for_unknown_session_are_rejected() {
        let reg = SessionRegistry::new(TIMEOUT);
        let (_, cb) = recorder();
        assert!(!reg.add_timeout_callback("nope", cb));
    }
}
