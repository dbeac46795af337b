//! Per-session conversation storage for long-running callers
//!
//! Each session sits behind its own mutex. A turn holds it from load to
//! save, so two requests for one session run one after the other while
//! different sessions proceed in parallel.
//!
//! Kept in memory only. The map is capped at `max_sessions`; when a new
//! session would exceed it, the idle session updated longest ago is
//! dropped. A session's message history is not trimmed.

use super::conversation::ConversationState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

type SessionSlot = Arc<Mutex<ConversationState>>;

/// In-memory map of session id to its latest conversation state
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionSlot>>>,
    max_sessions: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_max_sessions(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Exclusive access to the state for `session_id`, created if absent.
    ///
    /// Waits while another caller holds the same session. Assigning
    /// through the guard replaces the stored state.
    pub async fn checkout(&self, session_id: &str) -> OwnedMutexGuard<ConversationState> {
        self.slot(session_id).await.lock_owned().await
    }

    /// Copy of the stored state. Waits for a running turn on that session.
    pub async fn get(&self, session_id: &str) -> Option<ConversationState> {
        let slot = self.sessions.read().await.get(session_id).cloned()?;
        let state = slot.lock().await;
        Some(state.clone())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn slot(&self, session_id: &str) -> SessionSlot {
        if let Some(slot) = self.sessions.read().await.get(session_id) {
            return slot.clone();
        }

        let mut sessions = self.sessions.write().await;
        if let Some(slot) = sessions.get(session_id) {
            return slot.clone();
        }

        if sessions.len() >= self.max_sessions {
            evict_idle(&mut sessions);
        }

        let slot = Arc::new(Mutex::new(ConversationState::new(session_id)));
        sessions.insert(session_id.to_string(), slot.clone());
        slot
    }
}

/// Drop the least recently updated session nobody is using.
///
/// Handles to a slot are only cloned under the map lock, so under the
/// write lock a strong count of one means no caller holds or awaits it.
fn evict_idle(sessions: &mut HashMap<String, SessionSlot>) {
    let oldest = sessions
        .iter()
        .filter(|(_, slot)| Arc::strong_count(slot) == 1)
        .filter_map(|(id, slot)| slot.try_lock().ok().map(|state| (id.clone(), state.updated_at)))
        .min_by_key(|(_, updated_at)| *updated_at)
        .map(|(id, _)| id);

    match oldest {
        Some(id) => {
            debug!(session_id = %id, "Evicting idle session");
            sessions.remove(&id);
        }
        None => warn!(
            session_count = sessions.len(),
            "Session limit reached with every session busy"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkout_then_replace() {
        let store = SessionStore::new();
        assert!(store.get("s1").await.is_none());

        {
            let mut state = store.checkout("s1").await;
            assert_eq!(state.session_id, "s1");
            state.add_user_message("hello");
        }
        assert_eq!(store.len().await, 1);

        let loaded = store.get("s1").await.unwrap();
        assert_eq!(loaded.message_count(), 1);

        let mut guard = store.checkout("s1").await;
        let mut next = guard.clone();
        next.add_user_message("again");
        *guard = next;
        drop(guard);
        assert_eq!(store.get("s1").await.unwrap().message_count(), 2);
    }

    #[tokio::test]
    async fn test_same_session_is_exclusive() {
        let store = SessionStore::new();
        let first = store.checkout("s").await;

        let waiting = tokio::time::timeout(Duration::from_millis(20), store.checkout("s")).await;
        assert!(waiting.is_err());

        // other sessions are not blocked
        let other = tokio::time::timeout(Duration::from_millis(20), store.checkout("t")).await;
        assert!(other.is_ok());

        drop(first);
        assert!(tokio::time::timeout(Duration::from_millis(20), store.checkout("s"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_oldest_idle_session_is_evicted_at_capacity() {
        let store = SessionStore::with_max_sessions(2);

        store.checkout("old").await.add_user_message("first");
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.checkout("newer").await.add_user_message("second");

        drop(store.checkout("third").await);

        assert_eq!(store.len().await, 2);
        assert!(store.get("old").await.is_none());
        assert!(store.get("newer").await.is_some());
        assert!(store.get("third").await.is_some());
    }

    #[tokio::test]
    async fn test_busy_session_is_never_evicted() {
        let store = SessionStore::with_max_sessions(1);
        let busy = store.checkout("busy").await;

        drop(store.checkout("other").await);

        assert_eq!(store.len().await, 2);
        drop(busy);
        assert_eq!(store.get("busy").await.unwrap().session_id, "busy");
    }
}
