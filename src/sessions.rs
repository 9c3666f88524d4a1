use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// key: sessions -> TTL'd dialogue state
///
/// Closed state machine for a user's place in the purchase dialogue. Adding
/// a state forces every match over it to be revisited; there is no silent
/// string fallthrough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DialogState {
    MainMenu,
    SelectingPlan,
    AwaitingPayment { payment_id: String },
}

#[derive(Debug, Clone)]
struct Session {
    state: DialogState,
    touched_at: DateTime<Utc>,
}

/// In-process session store keyed by user id. Entries carry an idle TTL and
/// are evicted lazily on read plus periodically by the scheduler sweep, so
/// abandoned dialogues do not accumulate for the process lifetime.
pub struct SessionStore {
    sessions: DashMap<i64, Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn set(&self, user_id: i64, state: DialogState, now: DateTime<Utc>) {
        self.sessions.insert(
            user_id,
            Session {
                state,
                touched_at: now,
            },
        );
    }

    pub fn get(&self, user_id: i64, now: DateTime<Utc>) -> Option<DialogState> {
        let expired = match self.sessions.get(&user_id) {
            Some(session) if now - session.touched_at < self.ttl => {
                return Some(session.state.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sessions.remove(&user_id);
        }
        None
    }

    pub fn clear(&self, user_id: i64) {
        self.sessions.remove(&user_id);
    }

    /// Drops every session idle past the TTL; returns the eviction count.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now - session.touched_at < self.ttl);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Periodic eviction task; runs until the process exits.
pub fn spawn_sweeper(store: std::sync::Arc<SessionStore>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let evicted = store.sweep(Utc::now());
            if evicted > 0 {
                tracing::debug!(evicted, "evicted idle dialogue sessions");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_expire_after_idle_ttl() {
        let store = SessionStore::new(Duration::minutes(30));
        let t0 = Utc::now();
        store.set(1, DialogState::SelectingPlan, t0);

        assert_eq!(
            store.get(1, t0 + Duration::minutes(29)),
            Some(DialogState::SelectingPlan)
        );
        assert_eq!(store.get(1, t0 + Duration::minutes(31)), None);
        // Lazy eviction removed the entry.
        assert!(store.is_empty());
    }

    #[test]
    fn sweep_evicts_only_stale_sessions() {
        let store = SessionStore::new(Duration::minutes(30));
        let t0 = Utc::now();
        store.set(1, DialogState::MainMenu, t0 - Duration::hours(1));
        store.set(
            2,
            DialogState::AwaitingPayment {
                payment_id: "p-1".into(),
            },
            t0,
        );

        assert_eq!(store.sweep(t0), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(2, t0),
            Some(DialogState::AwaitingPayment {
                payment_id: "p-1".into()
            })
        );
    }

    #[test]
    fn set_refreshes_the_ttl() {
        let store = SessionStore::new(Duration::minutes(30));
        let t0 = Utc::now();
        store.set(1, DialogState::SelectingPlan, t0);
        store.set(1, DialogState::SelectingPlan, t0 + Duration::minutes(20));

        assert!(store.get(1, t0 + Duration::minutes(45)).is_some());
    }
}
