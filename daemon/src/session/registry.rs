use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use formbridge_core::errors::{FormError, FormResult};
use formbridge_core::layout::addon_config_path;
use formbridge_ipc::daemon_messages::UNKNOWN_ADDON;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::session::snapshot::SnapshotStoreRef;
use crate::session::store::{
    env_keys, parse_arguments, Environment, FormSession, HostResponse, SessionId,
};

/// Context key carried by the "unknown addon" error.
pub const ERROR_REASON: &str = "reason";

/// Source of wall-clock time for session timestamps and snapshot ages.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Limits applied by the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// One `<addon>.ini` per addon accepted by `open`
    pub addons_dir: PathBuf,
    pub idle_session_limit: Duration,
    pub idle_shutdown_after: Duration,
    pub snapshot_max_age: Duration,
}

impl RegistryConfig {
    pub fn new(addons_dir: impl Into<PathBuf>) -> Self {
        Self {
            addons_dir: addons_dir.into(),
            idle_session_limit: Duration::from_secs(300),
            idle_shutdown_after: Duration::from_secs(48 * 3600),
            snapshot_max_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Result of one sweep tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<SessionId>,
    /// How long the daemon has had nothing to serve
    pub idle_for: Duration,
    pub shutdown: bool,
}

/// Whether `err` is the registry's "unknown addon" rejection.
pub fn is_unknown_addon(err: &FormError) -> bool {
    err.context
        .iter()
        .any(|(name, value)| name == ERROR_REASON && value == UNKNOWN_ADDON)
}

#[derive(Debug)]
struct Inner {
    sessions: HashMap<SessionId, FormSession>,
    /// Idle time of the id-0 placeholder, `None` once it has been swept
    keepalive_idle: Option<Duration>,
    highest_issued: u64,
    idle_without_sessions: Duration,
}

impl Inner {
    fn not_found(&self, id: SessionId) -> FormError {
        let message = if id.0 <= self.highest_issued {
            format!("Session {} was discarded", id)
        } else {
            format!("Session {} never existed", id)
        };
        FormError::not_found(message).with_context("session", id.to_string())
    }
}

/// Marks a session as being with the host until dropped.
#[derive(Debug)]
pub struct SubmissionGuard<'a> {
    registry: &'a SessionRegistry,
    id: SessionId,
}

impl Drop for SubmissionGuard<'_> {
    fn drop(&mut self) {
        self.registry.in_flight().remove(&self.id);
    }
}

/// Every open form session of this daemon.
#[derive(Debug)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    /// Sessions whose message is currently with the host
    submitting: StdMutex<HashSet<SessionId>>,
    snapshots: SnapshotStoreRef,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, snapshots: SnapshotStoreRef, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                keepalive_idle: Some(Duration::ZERO),
                highest_issued: 0,
                idle_without_sessions: Duration::ZERO,
            }),
            submitting: StdMutex::new(HashSet::new()),
            snapshots,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub async fn highest_issued(&self) -> SessionId {
        SessionId(self.inner.lock().await.highest_issued)
    }

    /// Create a session from the host's `--key value` arguments.
    pub async fn open(&self, args: &[String]) -> FormResult<SessionId> {
        let arguments = parse_arguments(args)?;
        let environment = Environment::from_arguments(&arguments)?;
        let addon = environment.addon_name().to_string();
        let addon_config = addon_config_path(&self.config.addons_dir, &addon)?;
        if !tokio::fs::try_exists(&addon_config).await.unwrap_or(false) {
            return Err(FormError::configuration(format!("unknown addon '{}'", addon))
                .with_context(ERROR_REASON, UNKNOWN_ADDON)
                .with_context("addon_config", addon_config.display().to_string()));
        }
        Ok(self.register(arguments, environment).await)
    }

    /// Create an editable session for a form picked on the manual-entry page.
    pub async fn open_manual(&self, addon_name: &str, form_type: &str) -> FormResult<SessionId> {
        let arguments = vec![
            (env_keys::ADDON_NAME.to_string(), addon_name.to_string()),
            (env_keys::FORM_TYPE.to_string(), form_type.to_string()),
            (env_keys::MODE.to_string(), env_keys::EDITABLE.to_string()),
        ];
        let environment = Environment::from_arguments(&arguments)?;
        Ok(self.register(arguments, environment).await)
    }

    async fn register(&self, arguments: Vec<(String, String)>, environment: Environment) -> SessionId {
        let mut inner = self.inner.lock().await;
        let id = loop {
            inner.highest_issued += 1;
            let id = SessionId(inner.highest_issued);
            if !inner.sessions.contains_key(&id) {
                break id;
            }
        };
        let session = FormSession::new(id, arguments, environment, self.clock.now());
        info!(
            session = %id,
            addon = %session.environment.addon_name(),
            read_only = session.is_read_only(),
            "Opened session"
        );
        inner.sessions.insert(id, session);
        inner.idle_without_sessions = Duration::ZERO;
        id
    }

    /// Find a session in memory or restore it from its snapshot.
    async fn resolve<'a>(
        &self,
        inner: &'a mut Inner,
        id: SessionId,
    ) -> FormResult<&'a mut FormSession> {
        if id.is_keepalive() {
            return Err(FormError::not_found("Session 0 is a keep-alive placeholder")
                .with_context("session", id.to_string()));
        }
        if !inner.sessions.contains_key(&id) {
            let restored = match self.snapshots.load(id).await {
                Ok(restored) => restored,
                Err(e) => {
                    warn!(session = %id, error = %e, "Failed to read session snapshot");
                    None
                }
            };
            match restored {
                Some(session) => {
                    info!(session = %id, "Restored session from snapshot");
                    inner.sessions.insert(id, session);
                    // Restored ids count as issued so `open` never hands them out again.
                    inner.highest_issued = inner.highest_issued.max(id.0);
                }
                None => return Err(inner.not_found(id)),
            }
        }
        let found = inner.not_found(id);
        let session = inner.sessions.get_mut(&id).ok_or(found)?;
        session.touch();
        Ok(session)
    }

    pub async fn get(&self, id: SessionId) -> FormResult<FormSession> {
        let mut inner = self.inner.lock().await;
        let session = self.resolve(&mut inner, id).await?;
        Ok(session.clone())
    }

    /// Apply `f` to a session and return its new state.
    pub async fn update<F>(&self, id: SessionId, f: F) -> FormResult<FormSession>
    where
        F: FnOnce(&mut FormSession),
    {
        let mut inner = self.inner.lock().await;
        let session = self.resolve(&mut inner, id).await?;
        f(session);
        Ok(session.clone())
    }

    /// Reset a session's idle counter.
    pub async fn keep_alive(&self, id: SessionId) -> FormResult<()> {
        if id.is_keepalive() {
            let mut inner = self.inner.lock().await;
            inner.keepalive_idle = Some(Duration::ZERO);
            inner.idle_without_sessions = Duration::ZERO;
            return Ok(());
        }
        self.get(id).await.map(|_| ())
    }

    /// Close a session; `Ok(false)` when it was not open.
    pub async fn close(&self, id: SessionId) -> FormResult<bool> {
        if id.is_keepalive() {
            debug!("Ignoring close of the keep-alive placeholder");
            return Ok(false);
        }
        let removed = self.inner.lock().await.sessions.remove(&id);
        match removed {
            Some(session) => {
                self.retire(session).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<SessionId>> {
        match self.submitting.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store `message` and claim the session for one submission. Fails when
    /// the session is read-only or another submission of it is in flight.
    pub async fn begin_submission(
        &self,
        id: SessionId,
        message: String,
    ) -> FormResult<(FormSession, SubmissionGuard<'_>)> {
        let mut inner = self.inner.lock().await;
        let session = self.resolve(&mut inner, id).await?;
        if session.is_read_only() {
            return Err(FormError::configuration(format!("session {} is read-only", id)));
        }
        let claimed = self.in_flight().insert(id);
        if !claimed {
            return Err(FormError::configuration(format!(
                "session {} is already being submitted",
                id
            )));
        }
        session.message = Some(message);
        Ok((session.clone(), SubmissionGuard { registry: self, id }))
    }

    /// Record a successful submission: the session becomes read-only and its
    /// snapshot is dropped.
    pub async fn mark_submitted(
        &self,
        id: SessionId,
        message: String,
        response: Option<HostResponse>,
    ) -> FormResult<FormSession> {
        let session = self
            .update(id, |session| {
                session.message = Some(message);
                session.from_host_response = response;
                session.environment.set_read_only();
            })
            .await?;
        if let Err(e) = self.snapshots.delete(id).await {
            warn!(session = %id, error = %e, "Failed to delete snapshot of submitted session");
        }
        Ok(session)
    }

    /// Advance every idle counter by `tick` and evict idle sessions.
    pub async fn sweep(&self, tick: Duration) -> SweepReport {
        let limit = self.config.idle_session_limit;
        let (evicted, idle_for) = {
            let mut inner = self.inner.lock().await;
            let mut expired = Vec::new();
            for session in inner.sessions.values_mut() {
                session.idle += tick;
                if session.idle >= limit {
                    expired.push(session.id);
                }
            }
            expired.sort();
            let evicted: Vec<FormSession> = expired
                .iter()
                .filter_map(|id| inner.sessions.remove(id))
                .collect();

            if let Some(idle) = inner.keepalive_idle {
                let idle = idle + tick;
                inner.keepalive_idle = if idle >= limit { None } else { Some(idle) };
            }

            if inner.sessions.is_empty() && inner.keepalive_idle.is_none() {
                inner.idle_without_sessions += tick;
            } else {
                inner.idle_without_sessions = Duration::ZERO;
            }
            (evicted, inner.idle_without_sessions)
        };

        let mut report = SweepReport {
            evicted: Vec::with_capacity(evicted.len()),
            idle_for,
            shutdown: idle_for > self.config.idle_shutdown_after,
        };
        for session in evicted {
            info!(session = %session.id, idle_secs = session.idle.as_secs(), "Evicting idle session");
            report.evicted.push(session.id);
            self.retire(session).await;
        }
        report
    }

    /// Close every open session, returning how many there were.
    pub async fn shutdown_all(&self) -> usize {
        let sessions: Vec<FormSession> = {
            let mut inner = self.inner.lock().await;
            inner.keepalive_idle = None;
            inner.sessions.drain().map(|(_, session)| session).collect()
        };
        let count = sessions.len();
        for session in sessions {
            self.retire(session).await;
        }
        count
    }

    /// Delete every snapshot written by this daemon.
    pub async fn discard_own_snapshots(&self) -> usize {
        match self.snapshots.delete_own().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to delete own snapshots");
                0
            }
        }
    }

    /// Persist a removed session and clean up after it.
    async fn retire(&self, session: FormSession) {
        if !session.is_read_only() {
            if let Err(e) = self.snapshots.save(&session).await {
                warn!(session = %session.id, error = %e, "Failed to write session snapshot");
            }
            let now = self.clock.now();
            if let Err(e) = self
                .snapshots
                .purge_older_than(self.config.snapshot_max_age, now)
                .await
            {
                warn!(error = %e, "Failed to purge stale snapshots");
            }
        }
        if let Some(path) = session.environment.message_file() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(session = %session.id, path = %path.display(), "Removed message file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(session = %session.id, path = %path.display(), error = %e, "Failed to remove message file")
                }
            }
        }
        info!(session = %session.id, "Closed session");
    }
}
