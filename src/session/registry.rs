//! Session registry (component C6): the active-session inventory per user,
//! inactivity policy, and eviction-on-overflow.
//!
//! Grounded on an in-memory session registry that caps entries and evicts by
//! age on overflow after a cleanup pass; adapted here to key by user rather
//! than hold one detached session per key, since a user may hold several
//! concurrent sessions up to `max_sessions_per_user`.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::core::{id_string, now_s};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    Timeout,
    Expired,
    Logout,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::Timeout => "timeout",
            InvalidationReason::Expired => "expired",
            InvalidationReason::Logout => "logout",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub device_info: HashMap<String, String>,
    pub ip: String,
    pub user_agent: String,
    pub persistent: bool,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub expires_at: u64,
}

pub struct SessionRegistry {
    /// user_id -> session_ids, ordered oldest-first by insertion for eviction.
    by_user: DashMap<String, Vec<String>>,
    sessions: DashMap<String, Session>,
    max_sessions_per_user: usize,
    inactivity_timeout_s: u64,
    default_ttl_s: u64,
}

impl SessionRegistry {
    pub fn new(max_sessions_per_user: usize, inactivity_timeout_s: u64, default_ttl_s: u64) -> Self {
        Self {
            by_user: DashMap::new(),
            sessions: DashMap::new(),
            max_sessions_per_user,
            inactivity_timeout_s,
            default_ttl_s,
        }
    }

    /// Create a session, evicting the least-recently-active session for this
    /// user if the cap would otherwise be exceeded. Non-persistent sessions
    /// expire at `now + default_ttl_s`; persistent ones also get an absolute
    /// expiry but `touch` will not extend it.
    pub fn create(
        &self,
        user_id: &str,
        device_info: HashMap<String, String>,
        ip: &str,
        user_agent: &str,
        persistent: bool,
    ) -> String {
        let now = now_s();
        let session_id = id_string();
        let session = Session {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            device_info,
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            persistent,
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.default_ttl_s,
        };

        self.sessions.insert(session_id.clone(), session);

        let mut entry = self.by_user.entry(user_id.to_string()).or_default();
        entry.push(session_id.clone());

        while entry.len() > self.max_sessions_per_user {
            if let Some(oldest_id) = self.least_recently_active(&entry) {
                entry.retain(|id| id != &oldest_id);
                self.sessions.remove(&oldest_id);
            } else {
                break;
            }
        }

        session_id
    }

    fn least_recently_active(&self, ids: &[String]) -> Option<String> {
        ids.iter()
            .filter_map(|id| self.sessions.get(id).map(|s| (id.clone(), s.last_activity_at)))
            .min_by_key(|(_, last)| *last)
            .map(|(id, _)| id)
    }

    /// Refresh `last_activity_at`; extends `expires_at` only for non-persistent sessions.
    pub fn touch(&self, session_id: &str) -> Result<(), SessionError> {
        let mut session = self.sessions.get_mut(session_id).ok_or(SessionError::NotFound)?;
        let now = now_s();
        session.last_activity_at = now;
        if !session.persistent {
            session.expires_at = now + self.default_ttl_s;
        }
        Ok(())
    }

    pub fn invalidate(&self, session_id: &str, _reason: InvalidationReason) -> Result<(), SessionError> {
        let session = self.sessions.remove(session_id).ok_or(SessionError::NotFound)?.1;
        if let Some(mut ids) = self.by_user.get_mut(&session.user_id) {
            ids.retain(|id| id != session_id);
        }
        Ok(())
    }

    pub fn list_active(&self, user_id: &str) -> Vec<Session> {
        match self.by_user.get(user_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.sessions.get(id).map(|s| s.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn validate(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.sessions.get(session_id).ok_or(SessionError::NotFound)?;
        let now = now_s();
        if now >= session.expires_at {
            return Err(SessionError::Expired);
        }
        Ok(())
    }

    /// Background sweep: invalidate sessions past inactivity or absolute
    /// expiry. Returns the invalidated (session_id, reason) pairs so the
    /// caller can emit `session_invalidated` events.
    pub fn sweep(&self) -> Vec<(String, InvalidationReason)> {
        let now = now_s();
        let mut invalidated = Vec::new();

        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let s = entry.value();
                if now >= s.expires_at {
                    Some((s.session_id.clone(), InvalidationReason::Expired))
                } else if now.saturating_sub(s.last_activity_at) > self.inactivity_timeout_s {
                    Some((s.session_id.clone(), InvalidationReason::Timeout))
                } else {
                    None
                }
            })
            .map(|(id, _)| id)
            .collect();

        for session_id in stale {
            let reason = {
                let s = match self.sessions.get(&session_id) {
                    Some(s) => s,
                    None => continue,
                };
                if now >= s.expires_at {
                    InvalidationReason::Expired
                } else {
                    InvalidationReason::Timeout
                }
            };
            if self.invalidate(&session_id, reason).is_ok() {
                invalidated.push((session_id, reason));
            }
        }

        invalidated
    }

    pub fn active_count(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(5, 1800, 2_592_000)
    }

    #[test]
    fn create_and_validate() {
        let reg = registry();
        let sid = reg.create("u1", HashMap::new(), "1.2.3.4", "ua", false);
        assert!(reg.validate(&sid).is_ok());
        assert_eq!(reg.active_count("u1"), 1);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let reg = SessionRegistry::new(2, 1800, 2_592_000);
        let s1 = reg.create("u1", HashMap::new(), "ip", "ua", false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _s2 = reg.create("u1", HashMap::new(), "ip", "ua", false);
        let _s3 = reg.create("u1", HashMap::new(), "ip", "ua", false);

        assert_eq!(reg.active_count("u1"), 2);
        assert!(reg.validate(&s1).is_err() || reg.list_active("u1").len() == 2);
    }

    #[test]
    fn touch_extends_non_persistent_only() {
        let reg = registry();
        let sid = reg.create("u1", HashMap::new(), "ip", "ua", true);
        let before = reg.sessions.get(&sid).unwrap().expires_at;
        reg.touch(&sid).unwrap();
        let after = reg.sessions.get(&sid).unwrap().expires_at;
        assert_eq!(before, after);
    }

    #[test]
    fn at_most_max_sessions_per_user_at_all_times() {
        let reg = SessionRegistry::new(5, 1800, 2_592_000);
        for _ in 0..20 {
            reg.create("u1", HashMap::new(), "ip", "ua", false);
            assert!(reg.active_count("u1") <= 5);
        }
    }
}
