//! The gateway core: one object owning every registry, constructed once at
//! startup and shared (as `Arc<GatewayCore>`) with the HTTP layer.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use gatehouse_auth::{AuthError, Identity};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authenticator::{AuthRequest, Authenticated, Authenticator, RequestContext};
use crate::config::GatewayConfig;
use crate::connections::{ConnectionRegistry, DeliveryTarget, OutboundSender};
use crate::events::EventDispatcher;
use crate::hooks::Hooks;
use crate::log_cleaner::{CleanupReport, clean_user_logs};
use crate::metrics::{HealthStatus, ServerMetrics};
use crate::sessions::{DEFAULT_LOCATION, SessionRegistry, SweepReport};
use crate::user_store::UserStore;
use crate::watcher::{FileWatcher, PollReport};
use crate::ws::ServerMessage;

// =============================================================================
// Event names
// =============================================================================

pub const EVENT_AUTHENTICATE: &str = "go:authenticate";
pub const EVENT_BROADCAST: &str = "go:broadcast";
pub const EVENT_SEND_USER_MESSAGE: &str = "go:send_user_message";
pub const EVENT_SEND_MESSAGE: &str = "go:send_message";
pub const EVENT_CONNECTION_CLOSED: &str = "go:connection_closed";

// =============================================================================
// Background tasks
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Sweep,
    WatchFiles,
    CleanLogs,
}

impl Task {
    fn name(self) -> &'static str {
        match self {
            Self::Sweep => "session sweep",
            Self::WatchFiles => "file watcher",
            Self::CleanLogs => "log cleaner",
        }
    }
}

#[derive(Default)]
struct BackgroundTasks {
    sweep: Option<JoinHandle<()>>,
    watch_files: Option<JoinHandle<()>>,
    clean_logs: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn slot(&mut self, task: Task) -> &mut Option<JoinHandle<()>> {
        match task {
            Task::Sweep => &mut self.sweep,
            Task::WatchFiles => &mut self.watch_files,
            Task::CleanLogs => &mut self.clean_logs,
        }
    }
}

/// Runs `task` every `period`, first tick one period from now, until the
/// core is dropped or the task stops itself.
async fn run_periodic(core: Weak<GatewayCore>, task: Task, period: Duration) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    loop {
        ticker.tick().await;
        let Some(core) = core.upgrade() else {
            break;
        };
        if !core.tick(task) {
            break;
        }
    }
}

/// Monotonic "now" that follows tokio's clock, so paused-time tests can
/// drive the sweep.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

// =============================================================================
// GatewayCore
// =============================================================================

pub struct GatewayCore {
    config: GatewayConfig,
    authenticator: Authenticator,
    sessions: SessionRegistry,
    connections: ConnectionRegistry,
    events: EventDispatcher<Value>,
    watcher: FileWatcher,
    hooks: Hooks,
    metrics: Arc<ServerMetrics>,
    tasks: Mutex<BackgroundTasks>,
}

impl GatewayCore {
    pub fn new(config: GatewayConfig, hooks: Hooks) -> Result<Arc<Self>> {
        for dir in [&config.sessions.user_dir, &config.sessions.session_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        let users = UserStore::new(&config.sessions.user_dir);
        Ok(Arc::new(Self {
            authenticator: Authenticator::new(&config.auth, users),
            sessions: SessionRegistry::new(config.sessions.session_timeout),
            connections: ConnectionRegistry::new(),
            events: EventDispatcher::new(),
            watcher: FileWatcher::new(),
            hooks,
            metrics: Arc::new(ServerMetrics::new()),
            tasks: Mutex::new(BackgroundTasks::default()),
            config,
        }))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn events(&self) -> &EventDispatcher<Value> {
        &self.events
    }

    pub fn watcher(&self) -> &FileWatcher {
        &self.watcher
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    // ── Connections ─────────────────────────────────────────────────────

    /// Register a new connection and return its id.
    pub fn open_connection(&self, tx: OutboundSender) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.connections.register(&id, tx);
        self.metrics.connection_opened();
        self.metrics.hook_failed(self.hooks.run_open(&id));
        id
    }

    /// Forget a connection. Its session (if any) loses one live connection.
    pub fn close_connection(&self, id: &str) {
        let Some(handle) = self.connections.remove(id) else {
            return;
        };
        self.metrics.connection_closed();
        if let Some(identity) = &handle.identity {
            self.sessions.disconnect(&identity.session_id, now());
        }

        let mut failed = self.hooks.run_close(id, handle.identity.as_ref());
        let payload = json!({
            "connection": id,
            "upn": handle.identity.as_ref().map(|i| i.user_principal.as_str()),
            "session": handle.identity.as_ref().map(|i| i.session_id.as_str()),
        });
        failed += self.events.trigger(&[EVENT_CONNECTION_CLOSED], &payload).failed;
        self.metrics.hook_failed(failed);
    }

    /// Queue `msg` for one connection.
    pub fn send(&self, id: &str, msg: ServerMessage) -> bool {
        if self.events.listener_count(EVENT_SEND_MESSAGE) > 0 {
            let payload = json!({ "connection": id, "message": &msg });
            let outcome = self.events.trigger(&[EVENT_SEND_MESSAGE], &payload);
            self.metrics.hook_failed(outcome.failed);
        }
        self.connections.send(id, msg)
    }

    pub fn deliver(&self, msg: &ServerMessage, target: &DeliveryTarget) -> usize {
        self.connections.deliver(msg, target)
    }

    /// Notify every authenticated connection.
    pub fn broadcast_notice(&self, text: &str) -> usize {
        self.metrics.notice_broadcast();
        self.deliver(
            &ServerMessage::notice(text),
            &DeliveryTarget::all_authenticated(),
        )
    }

    // ── Authentication ──────────────────────────────────────────────────

    /// Authenticate connection `id` and join it to its session.
    ///
    /// On success the client receives `session_token` (freshly minted
    /// anonymous identities only) followed by `set_username`.
    pub fn authenticate_connection(
        self: &Arc<Self>,
        id: &str,
        request: &AuthRequest,
        ctx: &RequestContext,
    ) -> Result<Identity, AuthError> {
        let Authenticated {
            identity,
            session_token,
        } = self.authenticator.authenticate(request, ctx).inspect_err(|e| {
            self.metrics.auth_failed(e.is_security_event());
        })?;
        self.metrics.auth_succeeded();
        self.metrics
            .hook_failed(self.hooks.run_auth_post(&identity, request));

        if let Some(previous) = self.connections.bind_identity(id, identity.clone()) {
            debug!(conn_id = %id, session = %previous.session_id, "Releasing previous session binding");
            self.sessions.disconnect(&previous.session_id, now());
        }

        let location = request
            .location
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_LOCATION);
        self.sessions.connect(&identity.session_id, location);
        if request.container.is_some() || request.prefix.is_some() {
            self.sessions
                .with_location(&identity.session_id, location, |state| {
                    state.container = request.container.clone();
                    state.prefix = request.prefix.clone();
                });
        }
        self.ensure_background_tasks();

        info!(
            conn_id = %id,
            upn = %identity.user_principal,
            ip = %identity.ip_address,
            location,
            "Connection authenticated"
        );

        if let Some(token) = session_token {
            self.send(id, ServerMessage::SessionToken(token));
        }
        self.send(id, ServerMessage::SetUsername(identity.user_principal.clone()));

        let payload = json!({ "connection": id, "identity": &identity });
        let outcome = self.events.trigger(&[EVENT_AUTHENTICATE], &payload);
        self.metrics.hook_failed(outcome.failed);
        Ok(identity)
    }

    // ── Background tasks ────────────────────────────────────────────────

    /// Start whichever periodic tasks are not running. Called after every
    /// successful authentication.
    pub fn ensure_background_tasks(self: &Arc<Self>) {
        let sessions = &self.config.sessions;
        let mut tasks = self.tasks.lock();

        if tasks.sweep.is_none() {
            info!(interval = ?sessions.session_timeout_check_interval, "Starting session sweep");
            tasks.sweep = Some(self.spawn(Task::Sweep, sessions.session_timeout_check_interval));
        }
        if tasks.watch_files.is_none() {
            match self.start_broadcast_watch() {
                Ok(()) => {
                    info!(
                        path = %sessions.broadcast_file.display(),
                        interval = ?sessions.file_check_interval,
                        "Starting file watcher"
                    );
                    tasks.watch_files =
                        Some(self.spawn(Task::WatchFiles, sessions.file_check_interval));
                }
                Err(e) => warn!(error = %format!("{e:#}"), "Broadcast file unavailable"),
            }
        }
        if tasks.clean_logs.is_none() {
            tasks.clean_logs = Some(self.spawn(Task::CleanLogs, sessions.user_logs_cleanup_interval));
        }
    }

    /// Whether the named periodic tasks are currently scheduled.
    pub fn background_tasks_running(&self) -> bool {
        let tasks = self.tasks.lock();
        tasks.sweep.is_some() || tasks.watch_files.is_some() || tasks.clean_logs.is_some()
    }

    fn spawn(self: &Arc<Self>, task: Task, period: Duration) -> JoinHandle<()> {
        tokio::spawn(run_periodic(Arc::downgrade(self), task, period))
    }

    /// One tick of a periodic task. Returns `false` once the task has
    /// stopped itself because no sessions remain.
    fn tick(&self, task: Task) -> bool {
        match task {
            Task::Sweep => {
                self.sweep_sessions(now());
            }
            Task::WatchFiles => {
                self.poll_files();
            }
            Task::CleanLogs => {
                self.clean_logs(SystemTime::now());
            }
        }

        // Decided under the task lock so a concurrent authentication either
        // sees the slot still occupied or finds it empty and respawns.
        let mut tasks = self.tasks.lock();
        if !self.sessions.is_empty() {
            return true;
        }
        *tasks.slot(task) = None;
        if task == Task::WatchFiles {
            self.stop_broadcast_watch();
        }
        info!(task = task.name(), "No sessions left, stopping");
        false
    }

    pub fn sweep_sessions(&self, now: Instant) -> SweepReport {
        let report = self.sessions.sweep(now);
        if !report.expired.is_empty() {
            self.metrics.sessions_expired(report.expired.len());
        }
        self.metrics.hook_failed(report.callback_failures);
        debug!(expired = report.expired.len(), remaining = self.sessions.len(), "Swept sessions");
        report
    }

    pub fn poll_files(&self) -> PollReport {
        let report = self.watcher.poll();
        self.metrics.hook_failed(report.failed);
        report
    }

    pub fn clean_logs(&self, now: SystemTime) -> CleanupReport {
        let sessions = &self.config.sessions;
        clean_user_logs(&sessions.user_dir, sessions.user_logs_max_age, now)
    }

    fn start_broadcast_watch(self: &Arc<Self>) -> Result<()> {
        let path = &self.config.sessions.broadcast_file;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::File::create(path)
            .with_context(|| format!("Failed to create broadcast file {}", path.display()))?;

        let core = Arc::downgrade(self);
        self.watcher
            .watch(
                path.clone(),
                Arc::new(move |p: &Path| -> anyhow::Result<()> {
                    match core.upgrade() {
                        Some(core) => core.broadcast_file_changed(p),
                        None => Ok(()),
                    }
                }),
            )
            .with_context(|| format!("Failed to watch {}", path.display()))
    }

    fn stop_broadcast_watch(&self) {
        let path = &self.config.sessions.broadcast_file;
        if self.watcher.unwatch(path) {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "Broadcast file already gone");
            }
        }
    }

    /// Deliver the broadcast file's contents as a notice and empty it.
    fn broadcast_file_changed(&self, path: &Path) -> anyhow::Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if content.is_empty() {
            return Ok(());
        }
        std::fs::write(path, "").with_context(|| format!("Failed to truncate {}", path.display()))?;

        let notice = content.trim_end();
        if notice.is_empty() {
            return Ok(());
        }
        info!(message = %notice, "Broadcast (via broadcast file)");
        self.broadcast_notice(notice);
        let payload = json!({ "message": notice, "source": "broadcast_file" });
        let outcome = self.events.trigger(&[EVENT_BROADCAST], &payload);
        self.metrics.hook_failed(outcome.failed);
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Stop background tasks and run every session's timeout callbacks once.
    pub fn shutdown(&self) -> SweepReport {
        {
            let mut tasks = self.tasks.lock();
            for task in [Task::Sweep, Task::WatchFiles, Task::CleanLogs] {
                if let Some(handle) = tasks.slot(task).take() {
                    handle.abort();
                }
            }
        }
        self.stop_broadcast_watch();

        let report = self.sessions.shutdown();
        self.metrics.hook_failed(report.callback_failures);
        info!(
            sessions = report.expired.len(),
            failures = report.callback_failures,
            "Ran session cleanup callbacks"
        );
        report
    }

    pub fn health(&self) -> HealthStatus {
        let snapshot = self.metrics.snapshot();
        let status = if snapshot.errors.websocket == 0 {
            "healthy"
        } else {
            "degraded"
        };
        HealthStatus {
            status,
            sessions: self.sessions.len() as u64,
            connections: self.connections.len() as u64,
            uptime_secs: snapshot.uptime_secs,
        }
    }
}
