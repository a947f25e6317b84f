//! crates/research_assistant_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    AuthenticatedUser, Conversation, DocumentExcerpt, Message, SubscriptionTier, UsageKind, User,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Port Payloads
//=========================================================================================

/// Outcome of a conditional counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    /// The increment was applied; carries the new value.
    Applied(i64),
    /// The counter was already at the limit; nothing changed.
    AtLimit(i64),
}

/// Text returned by the generation provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedText {
    pub text: String,
    pub token_count: u32,
    pub model: String,
}

/// A provider-agnostic prompt: system instructions plus the user's query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub instructions: String,
    pub query: String,
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- User Management ---
    /// Returns the user, creating it if absent. The stored tier is synchronised
    /// with `tier`.
    async fn get_or_create_user(&self, user_id: Uuid, tier: SubscriptionTier) -> PortResult<User>;

    async fn get_user(&self, user_id: Uuid) -> PortResult<User>;

    // --- Usage Counters ---
    /// Atomically zeroes the rolling counters and sets `last_reset_date = now`,
    /// but only if the stored `last_reset_date` is before `cutoff`.
    /// Returns whether the reset was applied.
    async fn reset_usage_before(
        &self,
        user_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PortResult<bool>;

    /// Atomically increments a counter by one unless it is already at or
    /// above `limit`. A `None` limit always increments.
    async fn increment_usage_within(
        &self,
        user_id: Uuid,
        kind: UsageKind,
        limit: Option<i64>,
    ) -> PortResult<CounterUpdate>;

    /// Unconditionally adjusts a counter by `delta`, flooring at zero.
    async fn adjust_usage(&self, user_id: Uuid, kind: UsageKind, delta: i64) -> PortResult<i64>;

    // --- Conversation Management ---
    /// Loads a conversation with its full transcript, regardless of state.
    async fn get_conversation(&self, conversation_id: Uuid) -> PortResult<Conversation>;

    /// Persists `appended` as the last message of `conversation`, together with
    /// the conversation's title and activity, as one transactional unit.
    /// Creates the conversation if it does not exist yet.
    async fn save_appended_message(
        &self,
        conversation: &Conversation,
        appended: &Message,
    ) -> PortResult<()>;

    async fn list_active_conversations(
        &self,
        user_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> PortResult<Vec<Conversation>>;

    async fn update_conversation_title(&self, conversation_id: Uuid, title: &str) -> PortResult<()>;

    async fn deactivate_conversation(&self, conversation_id: Uuid) -> PortResult<()>;
}

#[async_trait]
pub trait DocumentService: Send + Sync {
    /// Fetches a document owned by `user_id`.
    /// Fails with `NotFound` if absent and `Forbidden` if owned by someone else.
    async fn get_document(&self, document_id: Uuid, user_id: Uuid) -> PortResult<DocumentExcerpt>;
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Resolves a bearer credential to a user id and subscription tier.
    async fn authenticate(&self, credential: &str) -> PortResult<AuthenticatedUser>;
}

#[async_trait]
pub trait TextGenerationService: Send + Sync {
    /// Generates a complete reply for the prompt.
    async fn generate(&self, prompt: &Prompt) -> PortResult<GeneratedText>;
}
