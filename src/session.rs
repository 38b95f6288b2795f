//! Session bookkeeping: identity, lifecycle state, activity tracking and
//! orphan policy for concurrent debuggees.

use crate::driver::{Driver, DriverKind};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use strum_macros::{Display, EnumString};

/// Session lifecycle state. Transitions form a DAG: `launching` leads to
/// `stopped` or `terminated`, `stopped` and `running` alternate, every state
/// may reach `terminated`, and `terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Launching,
    Running,
    Stopped,
    Terminated,
}

impl SessionStatus {
    fn may_become(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (_, Terminated) => !matches!(self, Terminated),
            (Launching, Stopped) => true,
            (Stopped, Running) | (Running, Stopped) => true,
            _ => false,
        }
    }
}

/// What to do with the debuggee when the owning agent process disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum OrphanAction {
    None,
    #[default]
    Terminate,
    Detach,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("session {id} is {status}, operation needs {needed}")]
    WrongState {
        id: String,
        status: SessionStatus,
        needed: SessionStatus,
    },
}

/// The anchor for one active debuggee.
pub struct Session {
    id: String,
    pub driver: Box<dyn Driver>,
    status: SessionStatus,
    owner_pid: Option<Pid>,
    orphan_action: OrphanAction,
    /// Milliseconds since the manager epoch, bumped on every lookup.
    last_activity: u64,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    /// Apply a status transition, enforcing the lifecycle DAG. Illegal
    /// transitions are refused and logged; the caller sees the old state.
    pub fn set_status(&mut self, next: SessionStatus) {
        if self.status == next {
            return;
        }
        if !self.status.may_become(next) {
            log::warn!(
                target: "gateway",
                "refusing illegal status transition {} -> {next} for {}",
                self.status, self.id
            );
            return;
        }
        log::debug!(target: "gateway", "{}: {} -> {next}", self.id, self.status);
        self.status = next;
    }

    /// Require the session to be paused before a stateful operation.
    pub fn ensure_stopped(&self) -> Result<(), SessionError> {
        if self.status != SessionStatus::Stopped {
            return Err(SessionError::WrongState {
                id: self.id.clone(),
                status: self.status,
                needed: SessionStatus::Stopped,
            });
        }
        Ok(())
    }
}

/// Triple returned by enumeration; the driver itself is never exposed.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub driver: DriverKind,
}

/// Owns the id → session table. Ids are `session-N` with N monotonically
/// assigned and never reused while the gateway lives.
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    next_id: u64,
    epoch: Instant,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Register a launched driver and mint a fresh session id. The session
    /// starts in `launching`; the dispatcher moves it to `stopped` once the
    /// launch result is known.
    pub fn create(
        &mut self,
        driver: Box<dyn Driver>,
        owner_pid: Option<Pid>,
        orphan_action: OrphanAction,
    ) -> String {
        let id = format!("session-{}", self.next_id);
        self.next_id += 1;

        let session = Session {
            id: id.clone(),
            driver,
            status: SessionStatus::Launching,
            owner_pid,
            orphan_action,
            last_activity: self.now_ms(),
        };
        log::info!(target: "gateway", "created {id} (owner pid {owner_pid:?})");
        self.sessions.insert(id.clone(), session);
        id
    }

    /// Look a session up and bump its activity timestamp.
    pub fn get(&mut self, id: &str) -> Result<&mut Session, SessionError> {
        let now = self.now_ms();
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;
        session.last_activity = session.last_activity.max(now);
        Ok(session)
    }

    /// Remove a session, releasing its driver and every resource the driver
    /// holds.
    pub fn destroy(&mut self, id: &str) -> Result<(), SessionError> {
        match self.sessions.remove(id) {
            Some(_) => {
                log::info!(target: "gateway", "destroyed {id}");
                Ok(())
            }
            None => Err(SessionError::UnknownSession(id.to_string())),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut all: Vec<_> = self
            .sessions
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                status: s.status,
                driver: s.driver.kind(),
            })
            .collect();
        all.sort_by_key(|s| creation_index(&s.id));
        all
    }

    /// Stop and destroy every session, oldest first.
    pub fn shutdown(&mut self) {
        let mut ids: Vec<_> = self.sessions.keys().cloned().collect();
        ids.sort_by_key(|id| creation_index(id));
        for id in ids {
            if let Some(mut session) = self.sessions.remove(&id) {
                log::info!(target: "gateway", "shutdown: stopping {id}");
                session.driver.stop();
            }
        }
    }

    /// Apply the orphan policy to sessions whose owner process is gone.
    /// Invoked between messages; no background thread involved.
    pub fn reap_orphans(&mut self) {
        let orphaned: Vec<_> = self
            .sessions
            .values()
            .filter(|s| {
                s.orphan_action != OrphanAction::None
                    && matches!(s.owner_pid, Some(pid) if !process_alive(pid))
            })
            .map(|s| (s.id.clone(), s.orphan_action))
            .collect();

        for (id, action) in orphaned {
            if let Some(mut session) = self.sessions.remove(&id) {
                log::warn!(target: "gateway", "owner of {id} is gone, applying {action}");
                match action {
                    OrphanAction::Terminate => session.driver.stop(),
                    OrphanAction::Detach => session.driver.detach(),
                    OrphanAction::None => unreachable!("filtered above"),
                }
            }
        }
    }
}

/// `kill(pid, 0)` liveness probe: EPERM still means the process exists.
fn process_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn creation_index(id: &str) -> u64 {
    id.strip_prefix("session-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::*;
    use std::path::Path;

    struct NopDriver;

    impl Driver for NopDriver {
        fn kind(&self) -> DriverKind {
            DriverKind::Dwarf
        }
        fn launch(&mut self, _: &LaunchConfig) -> crate::driver::Result<()> {
            Ok(())
        }
        fn run(&mut self, _: RunAction) -> crate::driver::Result<StopState> {
            Ok(StopState::new(StopReason::Step))
        }
        fn set_breakpoint(
            &mut self,
            _: &Path,
            _: u32,
            _: Option<&str>,
            _: Option<&str>,
        ) -> crate::driver::Result<BreakpointView> {
            Err(DriverError::NotPaused)
        }
        fn remove_breakpoint(&mut self, _: u32) -> crate::driver::Result<()> {
            Ok(())
        }
        fn list_breakpoints(&self) -> Vec<BreakpointView> {
            vec![]
        }
        fn inspect(&mut self, _: &InspectRequest) -> crate::driver::Result<InspectOutcome> {
            Ok(InspectOutcome::Variables(vec![]))
        }
        fn stop(&mut self) {}
    }

    fn manager_with_one() -> (SessionManager, String) {
        let mut mgr = SessionManager::new();
        let id = mgr.create(Box::new(NopDriver), None, OrphanAction::None);
        (mgr, id)
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut mgr = SessionManager::new();
        let a = mgr.create(Box::new(NopDriver), None, OrphanAction::None);
        let b = mgr.create(Box::new(NopDriver), None, OrphanAction::None);
        assert_eq!(a, "session-1");
        assert_eq!(b, "session-2");

        mgr.destroy(&a).unwrap();
        let c = mgr.create(Box::new(NopDriver), None, OrphanAction::None);
        assert_eq!(c, "session-3");
    }

    #[test]
    fn created_session_listed_until_destroyed() {
        let (mut mgr, id) = manager_with_one();
        assert!(mgr.list().iter().any(|s| s.id == id));

        mgr.destroy(&id).unwrap();
        assert!(mgr.list().is_empty());
        assert!(matches!(
            mgr.get(&id),
            Err(SessionError::UnknownSession(_))
        ));
        assert!(matches!(
            mgr.destroy(&id),
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[test]
    fn last_activity_is_monotonic() {
        let (mut mgr, id) = manager_with_one();
        let mut previous = 0;
        for _ in 0..10 {
            let t = mgr.get(&id).unwrap().last_activity();
            assert!(t >= previous);
            previous = t;
        }
    }

    #[test]
    fn status_follows_the_dag() {
        let (mut mgr, id) = manager_with_one();
        let session = mgr.get(&id).unwrap();
        assert_eq!(session.status(), SessionStatus::Launching);

        session.set_status(SessionStatus::Stopped);
        assert_eq!(session.status(), SessionStatus::Stopped);

        session.set_status(SessionStatus::Running);
        session.set_status(SessionStatus::Stopped);
        assert_eq!(session.status(), SessionStatus::Stopped);

        // no edge from stopped back to launching
        session.set_status(SessionStatus::Launching);
        assert_eq!(session.status(), SessionStatus::Stopped);

        session.set_status(SessionStatus::Terminated);
        assert_eq!(session.status(), SessionStatus::Terminated);

        // terminated is final
        session.set_status(SessionStatus::Running);
        assert_eq!(session.status(), SessionStatus::Terminated);
    }

    #[test]
    fn wrong_state_is_reported_with_context() {
        let (mut mgr, id) = manager_with_one();
        let session = mgr.get(&id).unwrap();
        let err = session.ensure_stopped().unwrap_err();
        assert!(err.to_string().contains(&id));
        assert!(err.to_string().contains("launching"));
    }

    #[test]
    fn dead_owner_reaps_session() {
        let mut mgr = SessionManager::new();
        // pid 1 is always alive; an absurdly large pid is not
        let alive = mgr.create(
            Box::new(NopDriver),
            Some(Pid::from_raw(1)),
            OrphanAction::Terminate,
        );
        let dead = mgr.create(
            Box::new(NopDriver),
            Some(Pid::from_raw(i32::MAX - 1)),
            OrphanAction::Terminate,
        );

        mgr.reap_orphans();
        assert!(mgr.contains(&alive));
        assert!(!mgr.contains(&dead));
    }
}
