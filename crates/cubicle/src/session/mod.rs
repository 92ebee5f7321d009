//! Session registry
//!
//! The process-wide table of live interactive and app-preview sessions. The
//! table lock is never held across an await; callers get `Arc<Session>`
//! clones and every mutation goes through the registry's own operations.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

pub use crate::session::ports::{PortAllocator, PortError, PortLease, PortPurpose};
pub use crate::session::reaper::Reaper;
use crate::types::ErrorKind;

mod ports;
mod reaper;

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    Duplicate(String),

    #[error("session {0} not found")]
    NotFound(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Duplicate(_) => ErrorKind::Internal,
            SessionError::NotFound(_) => ErrorKind::InputError,
        }
    }
}

/// Fresh random session identifier
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Interactive,
    App,
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    InstallingDependencies,
    Starting,
    Running,
    Stopped,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Stopped | SessionState::Failed | SessionState::TimedOut
        )
    }
}

/// Ports recorded for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPorts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<u16>,
}

impl SessionPorts {
    pub fn all(&self) -> impl Iterator<Item = u16> {
        self.frontend.into_iter().chain(self.backend)
    }
}

/// Bounded per-stream line buffer
#[derive(Debug)]
pub struct LogBuffer {
    max_lines: usize,
    streams: Mutex<BTreeMap<String, VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            streams: Mutex::new(BTreeMap::new()),
        }
    }

    /// Append a line to `stream`, evicting the oldest past the cap
    pub fn push(&self, stream: &str, line: impl Into<String>) {
        let mut streams = lock(&self.streams);
        let buffer = streams.entry(stream.to_owned()).or_default();
        if buffer.len() == self.max_lines {
            buffer.pop_front();
        }
        buffer.push_back(line.into());
    }

    pub fn lines(&self, stream: &str) -> Vec<String> {
        lock(&self.streams)
            .get(stream)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        lock(&self.streams)
            .iter()
            .map(|(name, lines)| (name.clone(), lines.iter().cloned().collect()))
            .collect()
    }
}

/// Resources owned by a session, released exactly once at teardown
#[async_trait]
pub trait SessionResources: Send + Sync {
    async fn release(&mut self);
}

/// One live interactive or app session
pub struct Session {
    id: String,
    kind: SessionKind,
    label: String,
    container: Option<String>,
    ports: SessionPorts,
    logs: Arc<LogBuffer>,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    state: Mutex<SessionState>,
    resources: tokio::sync::Mutex<Option<Box<dyn SessionResources>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(id: impl Into<String>, kind: SessionKind, label: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            container: None,
            ports: SessionPorts::default(),
            logs: Arc::new(LogBuffer::new(1)),
            created_at: now,
            created_wall: Utc::now(),
            last_activity: Mutex::new(now),
            state: Mutex::new(SessionState::Running),
            resources: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_container(mut self, id: impl Into<String>) -> Self {
        self.container = Some(id.into());
        self
    }

    pub fn with_ports(mut self, ports: SessionPorts) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_logs(mut self, logs: Arc<LogBuffer>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_resources(mut self, resources: Box<dyn SessionResources>) -> Self {
        self.resources = tokio::sync::Mutex::new(Some(resources));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Language for interactive sessions, project type for app sessions
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub fn ports(&self) -> SessionPorts {
        self.ports
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    /// Refresh the last-activity timestamp
    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_activity))
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Move to `state` unless already terminal and release owned resources
    ///
    /// Returns `true` for the call that actually released them.
    pub async fn close(&self, state: SessionState) -> bool {
        {
            let mut current = lock(&self.state);
            if !current.is_terminal() {
                *current = state;
            }
        }
        let resources = self.resources.lock().await.take();
        match resources {
            Some(mut resources) => {
                resources.release().await;
                debug!(session = %self.id, "session resources released");
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            kind: self.kind,
            label: self.label.clone(),
            state: self.state(),
            ports: self.ports,
            created_at: self.created_wall,
            age_secs: self.age(now).as_secs(),
            idle_secs: self.idle_for(now).as_secs(),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub kind: SessionKind,
    pub label: String,
    pub state: SessionState,
    pub ports: SessionPorts,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// Why the sweep removed a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Expiry {
    Idle,
    Lifetime,
}

/// Process-wide session table
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(session.id()) {
            return Err(SessionError::Duplicate(session.id().to_owned()));
        }
        info!(session = %session.id(), kind = ?session.kind(), "session registered");
        sessions.insert(session.id().to_owned(), session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        lock(&self.sessions).get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        lock(&self.sessions).remove(id)
    }

    /// Refresh a session's activity; `false` when unknown
    pub fn touch(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions sorted by creation time
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<_> = lock(&self.sessions)
            .values()
            .map(|s| s.snapshot(now))
            .collect();
        snapshots.sort_by(|a, b| {
            b.age_secs
                .cmp(&a.age_secs)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        snapshots
    }

    /// Remove and return sessions idle past `idle` or older than `max_lifetime`
    pub fn sweep(
        &self,
        now: Instant,
        idle: Duration,
        max_lifetime: Duration,
    ) -> Vec<(Arc<Session>, Expiry)> {
        let mut sessions = lock(&self.sessions);
        let expired: Vec<_> = sessions
            .values()
            .filter_map(|s| {
                if s.age(now) >= max_lifetime {
                    Some((s.id().to_owned(), Expiry::Lifetime))
                } else if s.idle_for(now) >= idle {
                    Some((s.id().to_owned(), Expiry::Idle))
                } else {
                    None
                }
            })
            .collect();
        expired
            .into_iter()
            .filter_map(|(id, why)| sessions.remove(&id).map(|s| (s, why)))
            .collect()
    }

    /// Remove every session
    pub fn drain(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).drain().map(|(_, s)| s).collect()
    }

    /// Remove a session and release its resources; `false` when unknown
    pub async fn stop(&self, id: &str) -> bool {
        match self.remove(id) {
            Some(session) => {
                session.close(SessionState::Stopped).await;
                info!(session = %id, "session stopped");
                true
            }
            None => false,
        }
    }

    /// Tear down every session
    pub async fn shutdown(&self) -> usize {
        let sessions = self.drain();
        let count = sessions.len();
        for session in sessions {
            session.close(SessionState::Stopped).await;
        }
        if count > 0 {
            info!(count, "sessions torn down");
        }
        count
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Resources that count their releases
    #[derive(Debug, Default)]
    pub(crate) struct Counted(pub(crate) Arc<AtomicUsize>);

    #[async_trait]
    impl SessionResources for Counted {
        async fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn counted_session(id: &str) -> (Arc<Session>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let session = Session::new(id, SessionKind::App, "test")
            .with_resources(Box::new(Counted(counter.clone())));
        (Arc::new(session), counter)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::counted_session;
    use super::*;

    #[test]
    fn insert_rejects_duplicates() {
        let registry = SessionRegistry::new();
        let (a, _) = counted_session("a");
        let (dup, _) = counted_session("a");
        registry.insert(a).unwrap();
        assert!(matches!(registry.insert(dup), Err(SessionError::Duplicate(_))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn stop_releases_once_and_removes() {
        let registry = SessionRegistry::new();
        let (session, counter) = counted_session("s1");
        registry.insert(session.clone()).unwrap();

        assert!(registry.stop("s1").await);
        assert!(!registry.stop("s1").await);
        assert!(!session.close(SessionState::Stopped).await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(registry.get("s1").is_none());
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn close_keeps_first_terminal_state() {
        let (session, _) = counted_session("s");
        session.close(SessionState::Failed).await;
        session.close(SessionState::Stopped).await;
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_idle_and_expired() {
        let registry = SessionRegistry::new();
        let (old, _) = counted_session("old");
        registry.insert(old).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        let (fresh, _) = counted_session("fresh");
        registry.insert(fresh.clone()).unwrap();
        let (busy, _) = counted_session("busy");
        registry.insert(busy.clone()).unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        busy.touch();
        tokio::time::advance(Duration::from_secs(50)).await;

        let swept = registry.sweep(Instant::now(), Duration::from_secs(90), Duration::from_secs(150));
        let mut ids: Vec<_> = swept.iter().map(|(s, why)| (s.id().to_owned(), *why)).collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ("fresh".to_owned(), Expiry::Idle),
                ("old".to_owned(), Expiry::Lifetime),
            ]
        );
        assert!(registry.get("busy").is_some());
        assert!(registry.get("fresh").is_none());
        assert!(registry.get("old").is_none());
    }

    #[tokio::test]
    async fn concurrent_touch_and_stop_are_safe() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, counter) = counted_session("c");
        registry.insert(session).unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    registry.stop("c").await;
                } else {
                    registry.touch("c");
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_everything() {
        let registry = SessionRegistry::new();
        let (a, ca) = counted_session("a");
        let (b, cb) = counted_session("b");
        registry.insert(a).unwrap();
        registry.insert(b).unwrap();
        assert_eq!(registry.shutdown().await, 2);
        assert!(registry.is_empty());
        assert_eq!(ca.load(Ordering::SeqCst) + cb.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn log_buffer_is_bounded_per_stream() {
        let logs = LogBuffer::new(2);
        logs.push("backend:stdout", "one");
        logs.push("backend:stdout", "two");
        logs.push("backend:stdout", "three");
        logs.push("backend:stderr", "oops");
        assert_eq!(logs.lines("backend:stdout"), vec!["two", "three"]);
        assert_eq!(logs.snapshot().len(), 2);
        assert!(logs.lines("frontend:stdout").is_empty());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let session = Session::new("id1", SessionKind::Interactive, "Python 3")
            .with_ports(SessionPorts { frontend: None, backend: Some(5000) });
        let value = serde_json::to_value(session.snapshot(Instant::now())).unwrap();
        assert_eq!(value["sessionId"], "id1");
        assert_eq!(value["kind"], "interactive");
        assert_eq!(value["state"], "running");
        assert_eq!(value["ports"]["backend"], 5000);
        assert!(value["ports"].get("frontend").is_none());
    }
}
