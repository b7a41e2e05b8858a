use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ViewerId = Uuid;
pub type ThreadId = Uuid;

/// Message content copied at hydration time; never re-synced afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub thread_id: ThreadId,
}

/// Public profile fields of the sender, copied at hydration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderSnapshot {
    pub name: String,
    pub avatar_url: Option<String>,
    pub role: Option<String>,
}

/// A display-ready notification held in a viewer's inbox cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub viewed: bool,
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub message: MessageSnapshot,
    pub sender: SenderSnapshot,
}

/// Joined projection (message + sender + thread) returned by the store lookups.
#[derive(Debug, Clone, PartialEq, Queryable)]
pub struct ResolvedMessage {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub thread_id: ThreadId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub sender_role: Option<String>,
}

impl ResolvedMessage {
    /// Build an unviewed record keyed by `id`.
    pub fn into_record(self, id: Uuid) -> NotificationRecord {
        self.into_record_with(id, false)
    }

    pub fn into_record_with(self, id: Uuid, viewed: bool) -> NotificationRecord {
        NotificationRecord {
            id,
            viewed,
            message_id: self.message_id,
            sender_id: self.sender_id,
            message: MessageSnapshot {
                content: self.content,
                sent_at: self.sent_at,
                thread_id: self.thread_id,
            },
            sender: SenderSnapshot {
                name: self.sender_name,
                avatar_url: self.sender_avatar,
                role: self.sender_role,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_carries_snapshots() {
        let thread = Uuid::new_v4();
        let resolved = ResolvedMessage {
            message_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            thread_id: thread,
            content: "field visit moved to Thursday".into(),
            sent_at: Utc::now(),
            sender_name: "Amara".into(),
            sender_avatar: None,
            sender_role: Some("coordinator".into()),
        };
        let id = Uuid::new_v4();
        let record = resolved.clone().into_record(id);

        assert_eq!(record.id, id);
        assert!(!record.viewed);
        assert_eq!(record.message_id, resolved.message_id);
        assert_eq!(record.message.thread_id, thread);
        assert_eq!(record.sender.role.as_deref(), Some("coordinator"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["message"]["content"], "field visit moved to Thursday");
        assert_eq!(json["sender"]["name"], "Amara");
    }
}
