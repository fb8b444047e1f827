use chrono::{DateTime, Utc};
use runner_domain::event::{Event, StateDelta};
use runner_domain::invocation::ConversationKey;
use serde::{Deserialize, Serialize};

/// A stable shard index for a conversation, used by workers that partition
/// sessions across themselves.
pub fn shard_for(key: &ConversationKey, shard_count: u64) -> u64 {
    if shard_count == 0 {
        return 0;
    }
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.as_key().bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash % shard_count
}

/// A per-filter-key summary of a branch of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

/// The materialized conversation: events plus layered state plus summaries.
///
/// State is merged app-scoped, then user-scoped, then conversation-scoped,
/// in increasing priority — a later layer's keys shadow an earlier one's.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: ConversationKey,
    pub events: Vec<Event>,
    pub app_state: StateDelta,
    pub user_state: StateDelta,
    pub conversation_state: StateDelta,
    pub summaries: std::collections::HashMap<String, Summary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: ConversationKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            events: Vec::new(),
            app_state: StateDelta::new(),
            user_state: StateDelta::new(),
            conversation_state: StateDelta::new(),
            summaries: std::collections::HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge the three state layers, conversation-scoped wins ties.
    pub fn merged_state(&self) -> StateDelta {
        let mut merged = self.app_state.clone();
        merged.extend(self.user_state.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.extend(self.conversation_state.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    pub fn last_user_event(&self) -> Option<&Event> {
        self.events.iter().rev().find(|e| e.is_user_message())
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_stable_for_same_key() {
        let key = ConversationKey::new("app", "u1", "c1");
        assert_eq!(shard_for(&key, 8), shard_for(&key, 8));
    }

    #[test]
    fn shard_zero_count_is_zero() {
        let key = ConversationKey::new("app", "u1", "c1");
        assert_eq!(shard_for(&key, 0), 0);
    }

    #[test]
    fn merged_state_conversation_layer_wins() {
        let mut session = Session::new(ConversationKey::new("app", "u1", "c1"));
        session.app_state.insert("k".into(), b"app".to_vec());
        session.conversation_state.insert("k".into(), b"conv".to_vec());
        let merged = session.merged_state();
        assert_eq!(merged.get("k").unwrap(), b"conv");
    }

    #[test]
    fn new_session_is_empty() {
        let session = Session::new(ConversationKey::new("app", "u1", "c1"));
        assert!(session.is_empty());
        assert!(session.last_user_event().is_none());
    }
}
