use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beach_pier_core::SessionId;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Session, SessionError};
use crate::config::{HostConfig, DEFAULT_OUTPUT_CAPACITY, DEFAULT_REAP_INTERVAL};
use crate::terminal::{Command, SpawnConfig, TerminalSize, TerminalSpawner};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub shell: Option<String>,
    pub snapshot_capacity: usize,
    pub output_capacity: usize,
    pub grace: Duration,
    pub reap_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&HostConfig::default())
    }
}

impl From<&HostConfig> for SessionConfig {
    fn from(config: &HostConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            snapshot_capacity: config.snapshot_capacity_bytes(),
            output_capacity: if config.output_capacity == 0 {
                DEFAULT_OUTPUT_CAPACITY
            } else {
                config.output_capacity
            },
            grace: config.session_grace,
            reap_interval: if config.reap_interval.is_zero() {
                DEFAULT_REAP_INTERVAL
            } else {
                config.reap_interval
            },
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    sessions: DashMap<SessionId, Arc<Session>>,
    next_id: AtomicU64,
    spawner: Arc<dyn TerminalSpawner>,
    config: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReapReason {
    Exited,
    GraceExpired,
}

impl ReapReason {
    fn label(self) -> &'static str {
        match self {
            ReapReason::Exited => "exited",
            ReapReason::GraceExpired => "grace_expired",
        }
    }
}

impl SessionManager {
    pub fn new(config: SessionConfig, spawner: Arc<dyn TerminalSpawner>) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                sessions: DashMap::new(),
                next_id: AtomicU64::new(1),
                spawner,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Spawns a shell at `size` and registers it.
    pub fn spawn_session(&self, size: TerminalSize) -> Result<Arc<Session>, SessionError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let command = Command::shell(self.inner.config.shell.as_deref());
        let spawn = SpawnConfig::new(command, size);
        let session = Session::spawn(
            id,
            self.inner.spawner.as_ref(),
            &spawn,
            self.inner.config.snapshot_capacity,
            self.inner.config.output_capacity,
        )?;
        self.inner.sessions.insert(id, session.clone());

        counter!("beach_pier_sessions_created_total", 1);
        gauge!("beach_pier_sessions_active", self.inner.sessions.len() as f64);
        info!(
            session_id = id,
            rows = size.rows,
            cols = size.cols,
            program = %spawn.command.program,
            "session created"
        );
        Ok(session)
    }

    pub fn create_session(&self, size: TerminalSize) -> Result<SessionId, SessionError> {
        self.spawn_session(size).map(|session| session.id())
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Looks up a session a reconnecting client names. Dead sessions are
    /// treated as gone.
    pub fn resume(&self, id: SessionId) -> Option<Arc<Session>> {
        self.get(id).filter(|session| session.is_alive())
    }

    pub fn write(&self, id: SessionId, bytes: &[u8]) -> Result<(), SessionError> {
        let session = self.get(id).ok_or(SessionError::NotFound(id))?;
        session.write(bytes)?;
        Ok(())
    }

    pub fn resize(&self, id: SessionId, rows: u16, cols: u16) -> Result<TerminalSize, SessionError> {
        let session = self.get(id).ok_or(SessionError::NotFound(id))?;
        Ok(session.resize(rows, cols)?)
    }

    /// Unregisters and kills a session.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.inner.sessions.remove(&id)?;
        session.kill();
        gauge!("beach_pier_sessions_active", self.inner.sessions.len() as f64);
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.inner.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Removes sessions whose process exited or whose grace period ran out.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let grace = self.inner.config.grace;
        let candidates: Vec<(SessionId, ReapReason)> = self
            .inner
            .sessions
            .iter()
            .filter_map(|entry| reap_reason(entry.value(), now, grace).map(|r| (*entry.key(), r)))
            .collect();

        let mut reaped = 0usize;
        for (id, reason) in candidates {
            let removed = self
                .inner
                .sessions
                .remove_if(&id, |_, session| reap_reason(session, now, grace).is_some());
            let Some((_, session)) = removed else {
                continue;
            };
            session.kill();
            reaped += 1;
            counter!(
                "beach_pier_sessions_reaped_total",
                1,
                "reason" => reason.label()
            );
            info!(session_id = id, reason = reason.label(), "session reaped");
        }

        if reaped > 0 {
            gauge!("beach_pier_sessions_active", self.inner.sessions.len() as f64);
        }
        reaped
    }

    /// Kills every session. Used at process shutdown.
    pub fn shutdown(&self) -> usize {
        let ids = self.ids();
        let mut killed = 0;
        for id in ids {
            if self.remove(id).is_some() {
                killed += 1;
            }
        }
        killed
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.config.reap_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let reaped = manager.cleanup();
                if reaped > 0 {
                    debug!(reaped, remaining = manager.len(), "session reaper pass");
                }
            }
        })
    }
}

fn reap_reason(session: &Session, now: Instant, grace: Duration) -> Option<ReapReason> {
    if !session.is_alive() {
        Some(ReapReason::Exited)
    } else if session.grace_expired(now, grace) {
        Some(ReapReason::GraceExpired)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SESSION_GRACE;
    use crate::terminal::{LoopbackSpawner, TerminalBackend, LOOPBACK_PROMPT};

    fn manager() -> (SessionManager, LoopbackSpawner) {
        let spawner = LoopbackSpawner::new();
        let config = SessionConfig {
            grace: DEFAULT_SESSION_GRACE,
            snapshot_capacity: 4096,
            output_capacity: 32,
            ..SessionConfig::default()
        };
        (SessionManager::new(config, Arc::new(spawner.clone())), spawner)
    }

    #[tokio::test]
    async fn create_write_and_read_back() {
        let (manager, _spawner) = manager();
        let id = manager.create_session(TerminalSize::default()).unwrap();
        let session = manager.get(id).unwrap();
        let mut output = session.lock_output().await;
        assert_eq!(output.recv().await.unwrap().data.as_ref(), LOOPBACK_PROMPT);

        manager.write(id, b"whoami\n").unwrap();
        let chunk = output.recv().await.unwrap();
        assert!(chunk.data.starts_with(b"whoami\r\n"));
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let (manager, spawner) = manager();
        let a = manager.create_session(TerminalSize::default()).unwrap();
        let b = manager.create_session(TerminalSize::default()).unwrap();
        assert_ne!(a, b);
        assert_eq!(manager.len(), 2);
        assert_eq!(spawner.spawned_count(), 2);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (manager, _spawner) = manager();
        assert!(matches!(
            manager.write(42, b"ls"),
            Err(SessionError::NotFound(42))
        ));
        assert!(matches!(
            manager.resize(42, 10, 10),
            Err(SessionError::NotFound(42))
        ));
    }

    #[tokio::test]
    async fn resize_through_manager() {
        let (manager, spawner) = manager();
        let id = manager.create_session(TerminalSize::default()).unwrap();
        manager.resize(id, 40, 120).unwrap();
        assert_eq!(
            spawner.last().unwrap().size(),
            TerminalSize { rows: 40, cols: 120 }
        );
    }

    #[tokio::test]
    async fn detached_session_survives_grace_then_is_reaped() {
        let (manager, _spawner) = manager();
        let session = manager.spawn_session(TerminalSize::default()).unwrap();
        let attach = session.attach();

        // Attached sessions never age out.
        assert_eq!(manager.cleanup_at(Instant::now() + Duration::from_secs(3600)), 0);

        session.detach(attach.generation);
        let detached = session.detached_since().unwrap();
        assert_eq!(manager.cleanup_at(detached + Duration::from_secs(10 * 60)), 0);
        assert!(manager.resume(session.id()).is_some());

        assert_eq!(manager.cleanup_at(detached + Duration::from_secs(16 * 60)), 1);
        assert!(manager.get(session.id()).is_none());
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn exited_sessions_are_reaped_on_next_pass() {
        let (manager, spawner) = manager();
        let id = manager.create_session(TerminalSize::default()).unwrap();
        let session = manager.get(id).unwrap();
        let _attach = session.attach();

        spawner.last().unwrap().kill();
        assert!(manager.resume(id).is_none());
        assert_eq!(manager.cleanup(), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn shutdown_kills_everything() {
        let (manager, _spawner) = manager();
        let a = manager.spawn_session(TerminalSize::default()).unwrap();
        let b = manager.spawn_session(TerminalSize::default()).unwrap();
        assert_eq!(manager.shutdown(), 2);
        assert!(manager.is_empty());
        assert!(!a.is_alive() && !b.is_alive());
    }
}
