//! Per-user conversation sessions.
//!
//! One table for both flows: the `/create` flow (style choice, then name
//! entry) and the admin broadcast flow (draft text, then confirmation).
//! A user has at most one live session; any terminal transition removes it.
//! Sessions left mid-flow are pruned after a configurable idle period.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatState {
    ChoosingStyle { page: usize },
    TypingName { style: String },
    AwaitingBroadcastText,
    AwaitingConfirmation { draft: String },
}

#[derive(Debug, Clone)]
struct Session {
    state: ChatState,
    last_activity: DateTime<Utc>,
}

pub struct SessionMap {
    inner: DashMap<u64, Session>,
    idle: Duration,
}

impl SessionMap {
    pub fn new(idle_minutes: i64) -> Self {
        Self {
            inner: DashMap::new(),
            idle: Duration::minutes(idle_minutes),
        }
    }

    /// Creates or replaces the user's session and stamps its activity time.
    pub fn set(&self, user_id: u64, state: ChatState) {
        self.inner.insert(
            user_id,
            Session {
                state,
                last_activity: Utc::now(),
            },
        );
    }

    pub fn get(&self, user_id: u64) -> Option<ChatState> {
        self.inner.get(&user_id).map(|s| s.state.clone())
    }

    /// Removes and returns the session state, if any.
    pub fn take(&self, user_id: u64) -> Option<ChatState> {
        self.inner.remove(&user_id).map(|(_, s)| s.state)
    }

    /// Clears the session; true if one existed.
    pub fn clear(&self, user_id: u64) -> bool {
        self.inner.remove(&user_id).is_some()
    }

    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Utc::now())
    }

    fn prune_idle_at(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<u64> = self
            .inner
            .iter()
            .filter(|e| now - e.value().last_activity > self.idle)
            .map(|e| *e.key())
            .collect();
        for uid in &stale {
            self.inner.remove(uid);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_take_round_trips() {
        let sessions = SessionMap::new(30);
        sessions.set(1, ChatState::ChoosingStyle { page: 1 });
        assert_eq!(sessions.get(1), Some(ChatState::ChoosingStyle { page: 1 }));
        assert_eq!(sessions.take(1), Some(ChatState::ChoosingStyle { page: 1 }));
        assert_eq!(sessions.take(1), None);
    }

    #[test]
    fn replacing_state_keeps_one_session_per_user() {
        let sessions = SessionMap::new(30);
        sessions.set(1, ChatState::ChoosingStyle { page: 1 });
        sessions.set(
            1,
            ChatState::TypingName {
                style: "style3".into(),
            },
        );
        assert_eq!(sessions.len(), 1);
        assert_eq!(
            sessions.get(1),
            Some(ChatState::TypingName {
                style: "style3".into()
            })
        );
    }

    #[test]
    fn clear_reports_whether_anything_existed() {
        let sessions = SessionMap::new(30);
        assert!(!sessions.clear(1));
        sessions.set(1, ChatState::AwaitingBroadcastText);
        assert!(sessions.clear(1));
        assert!(!sessions.clear(1));
    }

    #[test]
    fn prune_removes_only_stale_sessions() {
        let sessions = SessionMap::new(30);
        sessions.set(1, ChatState::ChoosingStyle { page: 1 });
        sessions.set(2, ChatState::AwaitingBroadcastText);
        // nothing is stale yet
        assert_eq!(sessions.prune_idle(), 0);
        assert_eq!(sessions.len(), 2);

        let removed = sessions.prune_idle_at(Utc::now() + Duration::minutes(31));
        assert_eq!(removed, 2);
        assert_eq!(sessions.len(), 0);
    }
}
