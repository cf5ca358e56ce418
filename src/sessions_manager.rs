//! The registry of sessions: lookup by id, the "current session" pointer,
//! and the shutdown cascade.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SoupError;
use crate::fields::SessionId;
use crate::heartbeat::HeartbeatTicker;
use crate::session::Session;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct ManagerState {
    sessions: Vec<Arc<Session>>,
    current: Option<Arc<Session>>,
}

pub struct SessionsManager {
    /// `None` marks the manager as shut down
    state: RwLock<Option<ManagerState>>,
    running: AtomicU8,
    ticker: Arc<HeartbeatTicker>,
    ticker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionsManager {
    pub fn new() -> Arc<SessionsManager> {
        Arc::new(SessionsManager {
            state: RwLock::new(Some(ManagerState {
                sessions: Vec::new(),
                current: None,
            })),
            running: AtomicU8::new(NOT_STARTED),
            ticker: HeartbeatTicker::new(),
            ticker_handle: Mutex::new(None),
        })
    }

    /// Starts the heartbeat ticker and the broadcast workers of all sessions
    /// adopted so far. Returns false if the manager was already started.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let handle = tokio::spawn(self.ticker.clone().run());
        *self.ticker_handle.lock().unwrap() = Some(handle);

        if let Some(state) = self.state.read().unwrap().as_ref() {
            for session in &state.sessions {
                tokio::spawn(session.clone().run());
            }
        }
        true
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst) == RUNNING
    }

    /// Looks a session up by id; a blank id resolves to the current session.
    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        let guard = self.state.read().unwrap();
        let state = guard.as_ref()?;
        if id.is_blank() {
            return state.current.clone();
        }
        state.sessions.iter().find(|s| s.id() == id).cloned()
    }

    /// Adopts a session. Fails with [`SoupError::SessionExists`] on a
    /// duplicate id, [`SoupError::SessionOwned`] if some manager already owns
    /// the session, and [`SoupError::Shutdown`] after shutdown.
    pub fn try_add(self: &Arc<Self>, session: Arc<Session>) -> Result<(), SoupError> {
        self.add(session, false)
    }

    /// Like [`try_add`](Self::try_add), additionally making the session the
    /// current one.
    pub fn try_add_current(self: &Arc<Self>, session: Arc<Session>) -> Result<(), SoupError> {
        self.add(session, true)
    }

    fn add(self: &Arc<Self>, session: Arc<Session>, make_current: bool) -> Result<(), SoupError> {
        {
            let mut guard = self.state.write().unwrap();
            let Some(state) = guard.as_mut() else {
                return Err(SoupError::Shutdown);
            };
            if state.sessions.iter().any(|s| s.id() == session.id()) {
                return Err(SoupError::SessionExists);
            }
            session.try_adopt(self)?;
            self.ticker.register(&session);
            state.sessions.push(session.clone());
            if make_current {
                state.current = Some(session.clone());
            }
        }
        if self.running() {
            tokio::spawn(session.run());
        }
        Ok(())
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.state.read().unwrap().as_ref()?.current.clone()
    }

    pub fn set_current_session(&self, id: SessionId) -> bool {
        let mut guard = self.state.write().unwrap();
        let Some(state) = guard.as_mut() else {
            return false;
        };
        match state.sessions.iter().find(|s| s.id() == id).cloned() {
            Some(session) => {
                state.current = Some(session);
                true
            }
            None => false,
        }
    }

    /// Removes a session by id and detaches its ownership. If the removed
    /// session was current, `replacement` selects the new current session: a
    /// blank id promotes the last remaining session, a concrete id is looked
    /// up, `None` leaves no current session. Returns the removed session and
    /// whether a replacement was promoted.
    pub fn remove_session(
        &self,
        id: SessionId,
        replacement: Option<SessionId>,
    ) -> Option<(Arc<Session>, bool)> {
        let mut guard = self.state.write().unwrap();
        let state = guard.as_mut()?;
        let idx = state.sessions.iter().position(|s| s.id() == id)?;
        let session = state.sessions.remove(idx);
        session.clear_manager();

        let was_current = state.current.as_ref().map_or(false, |c| c.id() == id);
        let mut promoted = false;
        if was_current {
            state.current = match replacement {
                Some(rid) if rid.is_blank() => state.sessions.last().cloned(),
                Some(rid) => state.sessions.iter().find(|s| s.id() == rid).cloned(),
                None => None,
            };
            promoted = state.current.is_some();
        }
        Some((session, promoted))
    }

    /// Ends every session and marks the manager closed. Each session's
    /// manager pointer is cleared *before* the session is ended, so the
    /// session's teardown does not re-enter this manager.
    pub fn shutdown(&self) -> bool {
        let state = self.state.write().unwrap().take();
        if let Some(handle) = self.ticker_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.running.store(STOPPED, Ordering::SeqCst);

        let Some(state) = state else {
            return false;
        };
        debug!("shutting down {} session(s)", state.sessions.len());
        for session in &state.sessions {
            session.clear_manager();
            session.close_with_err(SoupError::SessionEnded);
            session.do_end();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOpts;

    fn session(id: &str) -> Arc<Session> {
        Session::new(
            None,
            None,
            SessionOpts {
                id: SessionId::from_string_trunc(id),
                ..Default::default()
            },
        )
    }

    fn id(s: &str) -> SessionId {
        SessionId::from_string_trunc(s)
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let manager = SessionsManager::new();
        let a = session("a");
        let b = session("b");

        manager.try_add_current(a.clone()).unwrap();
        manager.try_add(b.clone()).unwrap();

        assert!(Arc::ptr_eq(&manager.get_session(id("a")).unwrap(), &a));
        assert!(Arc::ptr_eq(&manager.get_session(id("b")).unwrap(), &b));
        // blank resolves to the current session
        assert!(Arc::ptr_eq(&manager.get_session(SessionId::BLANK).unwrap(), &a));
        assert!(manager.get_session(id("c")).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = SessionsManager::new();
        manager.try_add(session("a")).unwrap();
        assert!(matches!(
            manager.try_add(session("a")),
            Err(SoupError::SessionExists)
        ));
    }

    #[tokio::test]
    async fn test_owned_session_rejected() {
        let first = SessionsManager::new();
        let second = SessionsManager::new();
        let s = session("a");

        first.try_add(s.clone()).unwrap();
        assert!(matches!(
            second.try_add(s),
            Err(SoupError::SessionOwned)
        ));
    }

    #[tokio::test]
    async fn test_set_current() {
        let manager = SessionsManager::new();
        manager.try_add(session("a")).unwrap();
        manager.try_add(session("b")).unwrap();
        assert!(manager.current_session().is_none());

        assert!(manager.set_current_session(id("b")));
        assert_eq!(manager.current_session().unwrap().id(), id("b"));
        assert!(!manager.set_current_session(id("c")));
    }

    #[tokio::test]
    async fn test_remove_session_promotion() {
        let manager = SessionsManager::new();
        manager.try_add(session("a")).unwrap();
        manager.try_add(session("b")).unwrap();
        manager.try_add_current(session("c")).unwrap();

        // a blank replacement promotes the last remaining session
        let (removed, promoted) = manager.remove_session(id("c"), Some(SessionId::BLANK)).unwrap();
        assert_eq!(removed.id(), id("c"));
        assert!(promoted);
        assert_eq!(manager.current_session().unwrap().id(), id("b"));

        // removing a non-current session leaves the current pointer alone
        let (_, promoted) = manager.remove_session(id("a"), None).unwrap();
        assert!(!promoted);
        assert_eq!(manager.current_session().unwrap().id(), id("b"));

        // removing the current session without a replacement clears it
        let (_, promoted) = manager.remove_session(id("b"), None).unwrap();
        assert!(!promoted);
        assert!(manager.current_session().is_none());

        assert!(manager.remove_session(id("b"), None).is_none());
    }

    #[tokio::test]
    async fn test_removed_session_can_be_adopted_again() {
        let manager = SessionsManager::new();
        let s = session("a");
        manager.try_add(s.clone()).unwrap();
        manager.remove_session(id("a"), None).unwrap();

        let other = SessionsManager::new();
        other.try_add(s).unwrap();
    }

    #[tokio::test]
    async fn test_session_end_detaches_from_manager() {
        let manager = SessionsManager::new();
        let s = session("a");
        manager.try_add_current(s.clone()).unwrap();

        s.end().unwrap();

        assert!(manager.get_session(id("a")).is_none());
        assert!(manager.current_session().is_none());
        assert!(!manager.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_cascades_and_closes() {
        let manager = SessionsManager::new();
        manager.start();
        let a = session("a");
        let b = session("b");
        manager.try_add(a.clone()).unwrap();
        manager.try_add(b.clone()).unwrap();

        assert!(manager.shutdown());
        assert!(manager.is_closed());
        assert!(!manager.shutdown());

        assert!(matches!(a.close_err(), Some(SoupError::SessionEnded)));
        assert!(matches!(b.close_err(), Some(SoupError::SessionEnded)));
        assert!(manager.get_session(id("a")).is_none());
        assert!(matches!(
            manager.try_add(session("c")),
            Err(SoupError::Shutdown)
        ));
        assert!(!manager.set_current_session(id("a")));
        assert!(manager.remove_session(id("a"), None).is_none());
    }
}
