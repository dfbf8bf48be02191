//! Active-session state: the working-memory ring buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use memory_core::{Message, MessageRole, SessionInfo};

/// Mutable state of one active session, guarded by the handle's mutex.
pub(crate) struct SessionState {
    pub info: SessionInfo,
    next_seq: u64,
    capacity: usize,
    ring: VecDeque<Message>,
}

impl SessionState {
    pub fn new(info: SessionInfo, capacity: usize) -> Self {
        Self {
            info,
            next_seq: 0,
            capacity,
            ring: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a message, assigning the next sequence number and dropping the
    /// oldest entries above capacity.
    pub fn push(&mut self, role: MessageRole, text: &str, now: DateTime<Utc>) -> Message {
        let message = Message {
            seq: self.next_seq,
            role,
            text: text.to_string(),
            timestamp: now,
        };
        self.next_seq += 1;
        self.ring.push_back(message.clone());
        while self.ring.len() > self.capacity {
            self.ring.pop_front();
        }
        message
    }

    pub fn messages(&self) -> Vec<Message> {
        self.ring.iter().cloned().collect()
    }

    /// Number of turns recorded: one turn is one user message (with an
    /// optional assistant reply).
    pub fn user_turns(&self) -> usize {
        self.ring
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count()
    }
}

/// Shared handle to an active session. The per-session mutex serializes
/// appends and the end-of-session freeze.
pub(crate) struct SessionHandle {
    pub user_id: String,
    pub state: Mutex<SessionState>,
}

impl SessionHandle {
    pub fn new(info: SessionInfo, capacity: usize) -> Self {
        Self {
            user_id: info.user_id.clone(),
            state: Mutex::new(SessionState::new(info, capacity)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn ring_drops_oldest_above_capacity() {
        let info = SessionInfo {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            started_at: Utc::now(),
            ended_at: None,
        };
        let mut state = SessionState::new(info, 4);
        for i in 0..6 {
            state.push(MessageRole::User, &format!("m{i}"), Utc::now());
        }
        let messages = state.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].text, "m2");
        // Sequence numbers stay monotonic across drops.
        assert_eq!(messages.last().unwrap().seq, 5);
        assert_eq!(state.user_turns(), 4);
    }
}
