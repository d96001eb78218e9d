//! Session identity, sampling and activity tracking

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ReplayConfig;
use crate::storage::SessionStore;

/// Minimum activity advance before a continued session is written back to
/// the store
pub const ACTIVITY_PERSIST_INTERVAL_MS: i64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub started_at: i64,
    pub last_activity: i64,
    pub sampled: bool,
    pub segment_id: u64,
}

impl Session {
    pub fn new(now: i64, sampled: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            started_at: now,
            last_activity: now,
            sampled,
            segment_id: 0,
        }
    }

    /// Expired once idle for longer than `inactivity_ms` or older than
    /// `max_duration_ms`
    pub fn is_expired(&self, now: i64, inactivity_ms: u64, max_duration_ms: u64) -> bool {
        let idle = now.saturating_sub(self.last_activity);
        let age = now.saturating_sub(self.started_at);
        idle > inactivity_ms as i64 || age > max_duration_ms as i64
    }
}

/// What [`SessionManager::refresh`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRefresh {
    /// A new session id was allocated
    Created,
    /// A stored, still valid session was loaded
    Resumed,
    /// The current session stays; its activity timestamp moved
    Continued,
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    inactivity_ms: u64,
    max_duration_ms: u64,
    sample_rate: f64,
    current: Option<Session>,
    /// `last_activity` of the most recently stored record
    persisted_activity: i64,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, config: &ReplayConfig) -> Self {
        Self {
            store,
            inactivity_ms: config.session_inactivity_threshold_ms,
            max_duration_ms: config.max_session_duration_ms,
            sample_rate: config.session_sample_rate,
            current: None,
            persisted_activity: 0,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Start a brand new session and roll the sampling dice for it
    pub fn initialize_session_for_sampling(&mut self, now: i64) -> &Session {
        let sampled = self.sample();
        let session = Session::new(now, sampled);
        info!(
            "Initialized replay session {} (sampled: {})",
            session.id, session.sampled
        );
        self.persist(&session);
        self.current.insert(session)
    }

    /// Keep the current session alive, or replace it when missing or expired.
    /// A stored session is resumed if it has not expired.
    pub fn refresh(&mut self, now: i64) -> SessionRefresh {
        if self.current.is_none() {
            if let Some(mut stored) = self.load_stored() {
                if !self.expired(&stored, now) {
                    stored.last_activity = now;
                    info!(
                        "Resumed replay session {} at segment {}",
                        stored.id, stored.segment_id
                    );
                    self.persist(&stored);
                    self.current = Some(stored);
                    return SessionRefresh::Resumed;
                }
                debug!("Stored replay session {} has expired", stored.id);
            }
        }

        let expired = match self.current.as_ref() {
            Some(session) => self.expired(session, now),
            None => true,
        };

        if !expired {
            let mut stale = None;
            if let Some(session) = self.current.as_mut() {
                session.last_activity = now;
                if now - self.persisted_activity >= ACTIVITY_PERSIST_INTERVAL_MS {
                    stale = Some(session.clone());
                }
            }
            if let Some(session) = stale {
                self.persist(&session);
            }
            return SessionRefresh::Continued;
        }

        let sampled = self.current.as_ref().map_or(true, |session| session.sampled);
        let session = Session::new(now, sampled);
        match self.current.as_ref() {
            Some(previous) => info!(
                "Replay session {} expired, continuing as {}",
                previous.id, session.id
            ),
            None => info!("Created replay session {}", session.id),
        }
        self.persist(&session);
        self.current = Some(session);
        SessionRefresh::Created
    }

    /// True when there is no session or the current one has expired
    pub fn is_expired(&self, now: i64) -> bool {
        self.current
            .as_ref()
            .map_or(true, |session| self.expired(session, now))
    }

    /// Force the sampling decision on, used when recording is started explicitly
    pub fn mark_sampled(&mut self) {
        let updated = match self.current.as_mut() {
            Some(session) if !session.sampled => {
                session.sampled = true;
                session.clone()
            }
            _ => return,
        };
        self.persist(&updated);
    }

    /// Advance the segment counter after a delivered segment
    pub fn increment_segment(&mut self) -> Option<u64> {
        let session = self.current.as_mut()?;
        session.segment_id += 1;
        let updated = session.clone();
        self.persist(&updated);
        Some(updated.segment_id)
    }

    pub fn clear_session(&mut self) {
        if let Some(session) = self.current.take() {
            debug!("Cleared replay session {}", session.id);
        }
        if let Err(e) = self.store.remove_session() {
            warn!("Failed to remove stored replay session: {}", e);
        }
    }

    fn expired(&self, session: &Session, now: i64) -> bool {
        session.is_expired(now, self.inactivity_ms, self.max_duration_ms)
    }

    fn sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(self.sample_rate)
    }

    fn load_stored(&self) -> Option<Session> {
        match self.store.read_session() {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to read stored replay session: {}", e);
                None
            }
        }
    }

    fn persist(&mut self, session: &Session) {
        self.persisted_activity = session.last_activity;
        if let Err(e) = self.store.write_session(session) {
            warn!("Failed to persist replay session {}: {}", session.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ReplayError, ReplayResult};
    use crate::storage::MemorySessionStore;

    const MINUTE: i64 = 60_000;

    fn config() -> ReplayConfig {
        ReplayConfig {
            session_inactivity_threshold_ms: 15 * MINUTE as u64,
            max_session_duration_ms: 60 * MINUTE as u64,
            ..Default::default()
        }
    }

    fn manager() -> (SessionManager, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        (SessionManager::new(store.clone(), &config()), store)
    }

    struct BrokenStore;

    impl SessionStore for BrokenStore {
        fn read_session(&self) -> ReplayResult<Option<Session>> {
            Err(ReplayError::Storage("unavailable".to_string()))
        }

        fn write_session(&self, _session: &Session) -> ReplayResult<()> {
            Err(ReplayError::Storage("unavailable".to_string()))
        }

        fn remove_session(&self) -> ReplayResult<()> {
            Err(ReplayError::Storage("unavailable".to_string()))
        }
    }

    #[test]
    fn test_initialize_session_sets_timestamps() {
        let (mut sessions, store) = manager();
        let session = sessions.initialize_session_for_sampling(5_000).clone();

        assert_eq!(session.started_at, 5_000);
        assert_eq!(session.last_activity, 5_000);
        assert_eq!(session.segment_id, 0);
        assert!(session.sampled);
        assert_eq!(session.id.len(), 32);
        assert_eq!(store.read_session().unwrap(), Some(session));
    }

    #[test]
    fn test_sampling_rate_zero_never_samples() {
        let store = Arc::new(MemorySessionStore::new());
        let config = ReplayConfig {
            session_sample_rate: 0.0,
            ..config()
        };
        let mut sessions = SessionManager::new(store, &config);

        for i in 0..20 {
            assert!(!sessions.initialize_session_for_sampling(i).sampled);
        }
    }

    #[test]
    fn test_refresh_creates_when_missing() {
        let (mut sessions, _) = manager();
        assert!(sessions.is_expired(0));

        assert_eq!(sessions.refresh(1_000), SessionRefresh::Created);
        let session = sessions.session().unwrap();
        assert_eq!(session.started_at, 1_000);
        assert_eq!(session.segment_id, 0);
    }

    #[test]
    fn test_refresh_updates_last_activity() {
        let (mut sessions, _) = manager();
        sessions.refresh(0);
        let id = sessions.session().unwrap().id.clone();

        assert_eq!(sessions.refresh(5 * MINUTE), SessionRefresh::Continued);
        let session = sessions.session().unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.started_at, 0);
        assert_eq!(session.last_activity, 5 * MINUTE);
    }

    #[test]
    fn test_refresh_after_inactivity_allocates_new_session() {
        let (mut sessions, _) = manager();
        sessions.refresh(0);
        sessions.increment_segment();
        sessions.increment_segment();
        let first = sessions.session().unwrap().clone();
        assert_eq!(first.segment_id, 2);

        let now = 15 * MINUTE + 1;
        assert!(sessions.is_expired(now));
        assert_eq!(sessions.refresh(now), SessionRefresh::Created);

        let second = sessions.session().unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.segment_id, 0);
        assert_eq!(second.started_at, now);
    }

    #[test]
    fn test_inactivity_boundary_is_exclusive() {
        let (mut sessions, _) = manager();
        sessions.refresh(0);
        assert!(!sessions.is_expired(15 * MINUTE));
        assert!(sessions.is_expired(15 * MINUTE + 1));
    }

    #[test]
    fn test_max_duration_expires_active_session() {
        let (mut sessions, _) = manager();
        sessions.refresh(0);
        // keep the session busy so inactivity never triggers
        for minute in 1..=60 {
            assert_eq!(sessions.refresh(minute * MINUTE), SessionRefresh::Continued);
        }
        assert!(sessions.is_expired(60 * MINUTE + 1));
        assert_eq!(sessions.refresh(60 * MINUTE + 1), SessionRefresh::Created);
    }

    #[test]
    fn test_continued_activity_is_persisted_periodically() {
        let (mut sessions, store) = manager();
        sessions.refresh(0);

        sessions.refresh(ACTIVITY_PERSIST_INTERVAL_MS - 1);
        assert_eq!(store.read_session().unwrap().unwrap().last_activity, 0);

        sessions.refresh(ACTIVITY_PERSIST_INTERVAL_MS);
        assert_eq!(
            store.read_session().unwrap().unwrap().last_activity,
            ACTIVITY_PERSIST_INTERVAL_MS
        );

        // a restarted host judges expiry by the stored activity
        let now = ACTIVITY_PERSIST_INTERVAL_MS + 14 * MINUTE;
        let mut restarted = SessionManager::new(store.clone(), &config());
        assert_eq!(restarted.refresh(now), SessionRefresh::Resumed);
    }

    #[test]
    fn test_refresh_resumes_stored_session() {
        let stored = Session {
            id: "stored".to_string(),
            started_at: 0,
            last_activity: MINUTE,
            sampled: true,
            segment_id: 7,
        };
        let store = Arc::new(MemorySessionStore::with_session(stored));
        let mut sessions = SessionManager::new(store, &config());

        assert_eq!(sessions.refresh(2 * MINUTE), SessionRefresh::Resumed);
        let session = sessions.session().unwrap();
        assert_eq!(session.id, "stored");
        assert_eq!(session.segment_id, 7);
        assert_eq!(session.last_activity, 2 * MINUTE);
    }

    #[test]
    fn test_refresh_ignores_expired_stored_session() {
        let stored = Session {
            id: "stale".to_string(),
            started_at: 0,
            last_activity: 0,
            sampled: true,
            segment_id: 4,
        };
        let store = Arc::new(MemorySessionStore::with_session(stored));
        let mut sessions = SessionManager::new(store.clone(), &config());

        assert_eq!(sessions.refresh(16 * MINUTE), SessionRefresh::Created);
        let session = sessions.session().unwrap().clone();
        assert_ne!(session.id, "stale");
        assert_eq!(session.segment_id, 0);
        assert_eq!(store.read_session().unwrap(), Some(session));
    }

    #[test]
    fn test_increment_segment_is_monotonic_and_persisted() {
        let (mut sessions, store) = manager();
        assert_eq!(sessions.increment_segment(), None);

        sessions.refresh(0);
        assert_eq!(sessions.increment_segment(), Some(1));
        assert_eq!(sessions.increment_segment(), Some(2));
        assert_eq!(store.read_session().unwrap().unwrap().segment_id, 2);
    }

    #[test]
    fn test_mark_sampled_overrides_decision() {
        let store = Arc::new(MemorySessionStore::new());
        let config = ReplayConfig {
            session_sample_rate: 0.0,
            ..config()
        };
        let mut sessions = SessionManager::new(store.clone(), &config);
        sessions.initialize_session_for_sampling(0);
        assert!(!sessions.session().unwrap().sampled);

        sessions.mark_sampled();
        assert!(sessions.session().unwrap().sampled);
        assert!(store.read_session().unwrap().unwrap().sampled);
    }

    #[test]
    fn test_clear_session_removes_record() {
        let (mut sessions, store) = manager();
        sessions.refresh(0);

        sessions.clear_session();
        assert!(sessions.session().is_none());
        assert!(store.read_session().unwrap().is_none());
    }

    #[test]
    fn test_storage_failures_are_not_fatal() {
        let mut sessions = SessionManager::new(Arc::new(BrokenStore), &config());

        assert_eq!(sessions.refresh(0), SessionRefresh::Created);
        assert_eq!(sessions.increment_segment(), Some(1));
        sessions.clear_session();
        assert!(sessions.session().is_none());
    }
}
