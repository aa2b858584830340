//! In-memory conversation store keyed by session id.
//!
//! Each session owns its own lock, so appends and snapshots on different
//! sessions never contend. The outer map lock is only held long enough to
//! find or create a session slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One immutable entry in a session's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

type SessionLog = Arc<Mutex<Vec<Message>>>;

#[derive(Debug, Default)]
pub struct ConversationStore {
    sessions: RwLock<HashMap<String, SessionLog>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty session if absent. Idempotent.
    pub fn ensure(&self, session_id: &str) {
        self.slot(session_id);
    }

    /// Append a message, creating the session on first reference.
    ///
    /// Returns the message's position in the session log.
    pub fn append(&self, session_id: &str, message: Message) -> usize {
        let slot = self.slot(session_id);
        let mut log = lock(&slot);
        log.push(message);
        let position = log.len() - 1;
        debug!(session_id, position, "Appended conversation message");
        position
    }

    /// Snapshot of the session's messages in append order.
    pub fn get(&self, session_id: &str) -> Vec<Message> {
        let slot = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned();
        match slot {
            Some(slot) => lock(&slot).clone(),
            None => Vec::new(),
        }
    }

    /// History to send with the prompt for the user turn at `turn_position`.
    ///
    /// Excludes that turn itself and any user turns that arrived after it.
    /// Assistant replies are always kept.
    pub fn prompt_history(&self, session_id: &str, turn_position: usize) -> Vec<Message> {
        self.get(session_id)
            .into_iter()
            .enumerate()
            .filter(|(pos, m)| m.role == Role::Assistant || *pos < turn_position)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    /// Number of messages in a session (0 if absent).
    pub fn len(&self, session_id: &str) -> usize {
        self.get(session_id).len()
    }

    /// Drop a session and its log.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some();
        if removed {
            debug!(session_id, "Removed conversation");
        }
        removed
    }

    /// Drop every session whose newest message is older than `cutoff`,
    /// except those `keep` accepts. Sessions with no messages count as idle.
    pub fn evict_idle(&self, cutoff: DateTime<Utc>, keep: impl Fn(&str) -> bool) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|id, slot| keep(id) || lock(slot).last().is_some_and(|m| m.created_at >= cutoff));
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle conversations");
        }
        evicted
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn slot(&self, session_id: &str) -> SessionLog {
        if let Some(slot) = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
        {
            return slot.clone();
        }
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }
}

fn lock(slot: &SessionLog) -> MutexGuard<'_, Vec<Message>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_get_in_order() {
        let store = ConversationStore::new();
        assert_eq!(store.append("s1", Message::user("hello")), 0);
        assert_eq!(store.append("s1", Message::assistant("hi there")), 1);

        let log = store.get("s1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].role, Role::User);
        assert_eq!(log[0].text, "hello");
        assert_eq!(log[1].role, Role::Assistant);
    }

    #[test]
    fn test_get_returns_snapshot() {
        let store = ConversationStore::new();
        store.append("s1", Message::user("one"));
        let mut snapshot = store.get("s1");
        snapshot.push(Message::user("not stored"));
        store.append("s1", Message::user("two"));

        assert_eq!(snapshot.len(), 2);
        let log = store.get("s1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].text, "two");
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let store = ConversationStore::new();
        store.ensure("s1");
        store.append("s1", Message::user("kept"));
        store.ensure("s1");
        assert!(store.contains("s1"));
        assert_eq!(store.len("s1"), 1);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn test_unknown_session_is_empty() {
        let store = ConversationStore::new();
        assert!(store.get("missing").is_empty());
        assert!(!store.contains("missing"));
    }

    #[test]
    fn test_sessions_are_isolated_and_removable() {
        let store = ConversationStore::new();
        store.append("a", Message::user("for a"));
        store.append("b", Message::user("for b"));
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.get("a").is_empty());
        assert_eq!(store.get("b")[0].text, "for b");
    }

    #[test]
    fn test_evict_idle_spares_recent_and_kept_sessions() {
        let store = ConversationStore::new();
        let mut stale = Message::user("old");
        stale.created_at = Utc::now() - chrono::TimeDelta::hours(2);
        store.append("stale", stale.clone());
        store.append("pinned", stale);
        store.append("fresh", Message::user("new"));
        store.ensure("empty");

        let cutoff = Utc::now() - chrono::TimeDelta::hours(1);
        assert_eq!(store.evict_idle(cutoff, |id| id == "pinned"), 2);
        assert!(!store.contains("stale"));
        assert!(!store.contains("empty"));
        assert!(store.contains("pinned"));
        assert!(store.contains("fresh"));
        assert_eq!(store.evict_idle(cutoff, |_| false), 1);
    }

    #[test]
    fn test_prompt_history_excludes_current_and_later_turns() {
        let store = ConversationStore::new();
        store.append("s", Message::user("first"));
        let second = store.append("s", Message::user("second"));
        store.append("s", Message::assistant("reply to first"));
        store.append("s", Message::user("third"));

        let history = store.prompt_history("s", second);
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "reply to first"]);
    }

    #[test]
    fn test_concurrent_appends() {
        let store = Arc::new(ConversationStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        store.append(&format!("s{}", i % 2), Message::user(format!("{i}-{j}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len("s0") + store.len("s1"), 400);
    }
}
