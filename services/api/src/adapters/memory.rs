//! services/api/src/adapters/memory.rs
//!
//! An in-process implementation of the `DatabaseService` and `DocumentService`
//! ports. Used when no `DATABASE_URL` is configured and by the test suites.
//!
//! Every operation runs under the map shard lock of the entry it touches, which
//! makes each call atomic with respect to concurrent calls for the same key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use research_assistant_core::domain::{
    Conversation, DocumentExcerpt, Message, SubscriptionTier, UsageCounters, UsageKind, User,
};
use research_assistant_core::ports::{
    CounterUpdate, DatabaseService, DocumentService, PortError, PortResult,
};
use uuid::Uuid;

struct StoredDocument {
    owner_id: Uuid,
    excerpt: DocumentExcerpt,
}

#[derive(Default)]
pub struct InMemoryDatabase {
    users: DashMap<Uuid, User>,
    conversations: DashMap<Uuid, Conversation>,
    documents: DashMap<Uuid, StoredDocument>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a document for `owner_id` and returns its id.
    pub fn insert_document(&self, owner_id: Uuid, title: &str, text: &str) -> Uuid {
        let document_id = Uuid::new_v4();
        self.documents.insert(
            document_id,
            StoredDocument {
                owner_id,
                excerpt: DocumentExcerpt {
                    document_id,
                    title: title.to_string(),
                    text: text.to_string(),
                },
            },
        );
        document_id
    }

    /// Overwrites a user's counters, creating the user if needed.
    pub fn set_usage(&self, user_id: Uuid, tier: SubscriptionTier, usage: UsageCounters) {
        let now = Utc::now();
        self.users.insert(
            user_id,
            User {
                user_id,
                tier,
                usage,
                created_at: now,
            },
        );
    }

    fn user_not_found(user_id: Uuid) -> PortError {
        PortError::NotFound(format!("User {} not found", user_id))
    }
}

#[async_trait]
impl DatabaseService for InMemoryDatabase {
    async fn get_or_create_user(&self, user_id: Uuid, tier: SubscriptionTier) -> PortResult<User> {
        let mut entry = self.users.entry(user_id).or_insert_with(|| {
            let now = Utc::now();
            User {
                user_id,
                tier,
                usage: UsageCounters::new(now),
                created_at: now,
            }
        });
        entry.tier = tier;
        Ok(entry.clone())
    }

    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        self.users
            .get(&user_id)
            .map(|u| u.clone())
            .ok_or_else(|| Self::user_not_found(user_id))
    }

    async fn reset_usage_before(
        &self,
        user_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| Self::user_not_found(user_id))?;
        if user.usage.last_reset_date >= cutoff {
            return Ok(false);
        }
        user.usage.reset_rolling(now);
        Ok(true)
    }

    async fn increment_usage_within(
        &self,
        user_id: Uuid,
        kind: UsageKind,
        limit: Option<i64>,
    ) -> PortResult<CounterUpdate> {
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| Self::user_not_found(user_id))?;
        let current = user.usage.get(kind);
        match limit {
            Some(limit) if current >= limit => Ok(CounterUpdate::AtLimit(current)),
            _ => Ok(CounterUpdate::Applied(user.usage.adjust(kind, 1))),
        }
    }

    async fn adjust_usage(&self, user_id: Uuid, kind: UsageKind, delta: i64) -> PortResult<i64> {
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| Self::user_not_found(user_id))?;
        Ok(user.usage.adjust(kind, delta))
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> PortResult<Conversation> {
        self.conversations
            .get(&conversation_id)
            .map(|c| c.clone())
            .ok_or_else(|| PortError::NotFound(format!("Conversation {} not found", conversation_id)))
    }

    async fn save_appended_message(
        &self,
        conversation: &Conversation,
        appended: &Message,
    ) -> PortResult<()> {
        if conversation.messages.last() != Some(appended) {
            return Err(PortError::Unexpected(
                "appended message is not the last message of the conversation".to_string(),
            ));
        }
        self.conversations.insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn list_active_conversations(
        &self,
        user_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> PortResult<Vec<Conversation>> {
        let mut active: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.is_visible_to(user_id))
            .map(|c| c.clone())
            .collect();
        active.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(active.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_conversation_title(&self, conversation_id: Uuid, title: &str) -> PortResult<()> {
        let mut conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| PortError::NotFound(format!("Conversation {} not found", conversation_id)))?;
        conversation.title = title.to_string();
        Ok(())
    }

    async fn deactivate_conversation(&self, conversation_id: Uuid) -> PortResult<()> {
        let mut conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| PortError::NotFound(format!("Conversation {} not found", conversation_id)))?;
        conversation.is_active = false;
        Ok(())
    }
}

#[async_trait]
impl DocumentService for InMemoryDatabase {
    async fn get_document(&self, document_id: Uuid, user_id: Uuid) -> PortResult<DocumentExcerpt> {
        let stored = self
            .documents
            .get(&document_id)
            .ok_or_else(|| PortError::NotFound(format!("Document {} not found", document_id)))?;
        if stored.owner_id != user_id {
            return Err(PortError::Forbidden(format!(
                "Document {} belongs to another user",
                document_id
            )));
        }
        Ok(stored.excerpt.clone())
    }
}
