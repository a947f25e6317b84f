//! services/api/src/chat/conversations.rs
//!
//! The conversation store: ownership checks, serialized appends and listing.
//!
//! Appends to the same conversation are serialized through a per-conversation
//! async mutex held only for the reload-push-save sequence. Each append reloads
//! the stored transcript inside the lock, so two callers holding stale copies
//! never overwrite each other's messages.

use chrono::Utc;
use dashmap::DashMap;
use research_assistant_core::domain::{
    char_prefix, ContextHints, Conversation, MessageMetadata, Role,
};
use research_assistant_core::ports::{DatabaseService, PortError, PortResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Longest title a user may set by hand.
pub const MAX_TITLE_CHARS: usize = 100;

/// Largest page a listing may request.
pub const MAX_PAGE_SIZE: usize = 100;

pub struct ConversationStore {
    db: Arc<dyn DatabaseService>,
    append_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ConversationStore {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self {
            db,
            append_locks: DashMap::new(),
        }
    }

    fn not_found(conversation_id: Uuid) -> PortError {
        PortError::NotFound(format!("Conversation {} not found", conversation_id))
    }

    /// Resolves an existing conversation owned by `user_id`, or builds a new
    /// unsaved one from `hints`. Nothing is persisted here.
    pub async fn get_or_create(
        &self,
        conversation_id: Option<Uuid>,
        user_id: Uuid,
        hints: &ContextHints,
    ) -> PortResult<Conversation> {
        match conversation_id {
            Some(id) => self.get(id, user_id).await,
            None => Ok(Conversation::new(user_id, hints.to_context())),
        }
    }

    /// Loads an active conversation owned by `user_id`.
    /// Absent, inactive and foreign conversations are all `NotFound`.
    pub async fn get(&self, conversation_id: Uuid, user_id: Uuid) -> PortResult<Conversation> {
        let conversation = self.db.get_conversation(conversation_id).await?;
        if !conversation.is_visible_to(user_id) {
            return Err(Self::not_found(conversation_id));
        }
        Ok(conversation)
    }

    fn lock_for(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        self.append_locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `f` under the conversation's append lock, then forgets the lock if
    /// nobody else is waiting on it.
    async fn with_lock<T, F, Fut>(&self, conversation_id: Uuid, f: F) -> PortResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = PortResult<T>>,
    {
        let lock = self.lock_for(conversation_id);
        let result = {
            let _guard = lock.lock().await;
            f().await
        };
        drop(lock);
        self.append_locks
            .remove_if(&conversation_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Appends one message and persists the conversation as a single unit.
    ///
    /// `conversation` is only used as the seed when the conversation has never
    /// been saved; otherwise the stored transcript is the base.
    pub async fn append(
        &self,
        conversation: &Conversation,
        role: Role,
        content: String,
        metadata: MessageMetadata,
        is_error: bool,
    ) -> PortResult<Conversation> {
        self.with_lock(conversation.id, || async {
            let mut current = match self.db.get_conversation(conversation.id).await {
                Ok(stored) => stored,
                Err(PortError::NotFound(_)) => conversation.clone(),
                Err(e) => return Err(e),
            };

            let appended = current
                .push_message(role, content, metadata, is_error, Utc::now())
                .clone();
            self.db.save_appended_message(&current, &appended).await?;
            debug!(
                conversation_id = %current.id,
                role = role.as_str(),
                messages = current.messages.len(),
                "Message appended"
            );
            Ok(current)
        })
        .await
    }

    /// The conversational memory handed to the prompt builder.
    pub fn recent_context(&self, conversation: &Conversation, limit: usize) -> String {
        conversation.recent_context(limit)
    }

    /// Read-only recent context of an owned conversation.
    pub async fn get_recent_context(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        limit: usize,
    ) -> PortResult<String> {
        let conversation = self.get(conversation_id, user_id).await?;
        Ok(self.recent_context(&conversation, limit))
    }

    /// One page of the user's active conversations, most recent activity first.
    /// `page` is 1-based.
    pub async fn list_active(
        &self,
        user_id: Uuid,
        page: usize,
        page_size: usize,
    ) -> PortResult<Vec<Conversation>> {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = page.saturating_sub(1).saturating_mul(page_size);
        self.db
            .list_active_conversations(user_id, offset, page_size)
            .await
    }

    /// Replaces the title of an owned conversation. A renamed conversation is
    /// never retitled automatically.
    pub async fn rename(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        title: &str,
    ) -> PortResult<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(PortError::Validation("Title cannot be empty".to_string()));
        }
        if char_prefix(title, MAX_TITLE_CHARS).is_some() {
            return Err(PortError::Validation(format!(
                "Title cannot exceed {} characters",
                MAX_TITLE_CHARS
            )));
        }

        self.with_lock(conversation_id, || async {
            let mut conversation = self.get(conversation_id, user_id).await?;
            self.db
                .update_conversation_title(conversation_id, title)
                .await?;
            conversation.title = title.to_string();
            info!(%conversation_id, "Conversation renamed");
            Ok(conversation)
        })
        .await
    }

    /// Marks an owned conversation inactive. A second delete is `NotFound`.
    pub async fn soft_delete(&self, conversation_id: Uuid, user_id: Uuid) -> PortResult<()> {
        self.with_lock(conversation_id, || async {
            self.get(conversation_id, user_id).await?;
            self.db.deactivate_conversation(conversation_id).await?;
            info!(%conversation_id, "Conversation deactivated");
            Ok(())
        })
        .await
    }
}
