//! services/api/src/chat/dispatcher.rs
//!
//! The channel dispatcher: the single orchestration path behind both the REST
//! and the push channel.
//!
//! A chat turn moves through
//! `Received -> QuotaChecked -> ContextBuilt -> Generating -> Persisted -> Delivered`,
//! with `Failed` reachable from any step. The conversation is resolved before
//! quota is reserved, so a request naming an invalid conversation is never
//! charged. The provider call happens outside every lock.

use chrono::{DateTime, Utc};
use research_assistant_core::domain::{
    AnalysisType, AuthenticatedUser, ContextHints, Conversation, DocumentExcerpt,
    MessageMetadata, Role, StatusEvent, UsageKind, FALLBACK_REPLY,
};
use research_assistant_core::ports::{
    DatabaseService, DocumentService, PortError, Prompt, TextGenerationService,
};
use research_assistant_core::prompt::{analysis_prompt, ContextAssembler, BASE_INSTRUCTIONS};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::conversations::ConversationStore;
use super::gateway::GenerationGateway;
use super::hub::{ConnectionHub, ConnectionId};
use super::quota::{QuotaLedger, Reservation, UsageReport};
use crate::config::{ChatSettings, QuotaLimits};

//=========================================================================================
// Requests, Replies and Errors
//=========================================================================================

/// Bounds, in characters after trimming, of text submitted for analysis.
pub const MIN_ANALYSIS_TEXT_CHARS: usize = 10;
pub const MAX_ANALYSIS_TEXT_CHARS: usize = 10_000;

/// Which channel a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Request,
    Connection(ConnectionId),
}

impl Origin {
    fn channel(&self) -> &'static str {
        match self {
            Self::Request => "rest",
            Self::Connection(_) => "push",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendMessageRequest {
    pub text: String,
    pub conversation_id: Option<Uuid>,
    pub hints: ContextHints,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReply {
    pub conversation_id: Uuid,
    pub reply_text: String,
    pub token_count: u32,
    /// The reply is the fallback text recorded after a provider failure.
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisReply {
    /// `None` when raw text was analysed.
    pub document_id: Option<Uuid>,
    pub analysis_type: AnalysisType,
    pub result: String,
    pub token_count: u32,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Monthly usage limit reached ({current_usage}/{limit}), resets {reset_date}")]
    QuotaExceeded {
        current_usage: i64,
        limit: i64,
        reset_date: DateTime<Utc>,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Internal(String),
}

impl From<PortError> for DispatchError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::NotFound(msg) => Self::NotFound(msg),
            PortError::Forbidden(msg) => Self::Forbidden(msg),
            PortError::Validation(msg) => Self::Validation(msg),
            PortError::Unauthorized => Self::Forbidden("Unauthorized".to_string()),
            PortError::Unexpected(msg) => Self::Internal(msg),
        }
    }
}

//=========================================================================================
// State Machine
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Received,
    QuotaChecked,
    ContextBuilt,
    Generating,
    Persisted,
    Delivered,
    Failed,
}

/// Tracks and logs the progress of one unit of work.
struct Turn {
    id: Uuid,
    user_id: Uuid,
    origin: Origin,
    state: DispatchState,
}

impl Turn {
    fn start(user_id: Uuid, origin: Origin) -> Self {
        let turn = Self {
            id: Uuid::new_v4(),
            user_id,
            origin,
            state: DispatchState::Received,
        };
        debug!(turn_id = %turn.id, user_id = %user_id, channel = origin.channel(), state = ?turn.state, "Dispatch started");
        turn
    }

    fn advance(&mut self, next: DispatchState) {
        debug!(
            turn_id = %self.id,
            user_id = %self.user_id,
            channel = self.origin.channel(),
            from = ?self.state,
            to = ?next,
            "Dispatch transition"
        );
        self.state = next;
    }

    fn fail(&mut self, err: DispatchError) -> DispatchError {
        self.advance(DispatchState::Failed);
        match &err {
            DispatchError::Internal(msg) => error!(turn_id = %self.id, error = %msg, "Dispatch failed"),
            other => debug!(turn_id = %self.id, error = %other, "Dispatch rejected"),
        }
        err
    }
}

//=========================================================================================
// The Dispatcher
//=========================================================================================

pub struct ChannelDispatcher {
    quota: QuotaLedger,
    conversations: ConversationStore,
    documents: Arc<dyn DocumentService>,
    assembler: ContextAssembler,
    gateway: GenerationGateway,
    hub: Arc<ConnectionHub>,
    settings: ChatSettings,
}

impl ChannelDispatcher {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        documents: Arc<dyn DocumentService>,
        generator: Arc<dyn TextGenerationService>,
        hub: Arc<ConnectionHub>,
        limits: QuotaLimits,
        settings: ChatSettings,
    ) -> Self {
        Self {
            quota: QuotaLedger::new(db.clone(), limits),
            conversations: ConversationStore::new(db),
            documents,
            assembler: ContextAssembler::new(BASE_INSTRUCTIONS, settings.document_excerpt_chars),
            gateway: GenerationGateway::new(generator, settings.generation_timeout),
            hub,
            settings,
        }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Trims and bounds a chat message before anything else is touched.
    fn validate_message(&self, text: &str) -> Result<String, DispatchError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DispatchError::Validation("Message cannot be empty".to_string()));
        }
        if text.chars().count() > self.settings.max_message_chars {
            return Err(DispatchError::Validation(format!(
                "Message cannot exceed {} characters",
                self.settings.max_message_chars
            )));
        }
        Ok(text.to_string())
    }

    /// Missing or foreign documents are dropped from the prompt, never surfaced.
    async fn soft_document(&self, document_id: Option<Uuid>, user_id: Uuid) -> Option<DocumentExcerpt> {
        let document_id = document_id?;
        match self.documents.get_document(document_id, user_id).await {
            Ok(document) => Some(document),
            Err(e) => {
                warn!(%document_id, %user_id, error = %e, "Document context omitted");
                None
            }
        }
    }

    //-------------------------------------------------------------------------------------
    // sendMessage
    //-------------------------------------------------------------------------------------

    pub async fn send_message(
        &self,
        user: &AuthenticatedUser,
        request: SendMessageRequest,
        origin: Origin,
    ) -> Result<MessageReply, DispatchError> {
        let mut turn = Turn::start(user.user_id, origin);

        let text = match self.validate_message(&request.text) {
            Ok(text) => text,
            Err(e) => return Err(turn.fail(e)),
        };

        let conversation = match self
            .conversations
            .get_or_create(request.conversation_id, user.user_id, &request.hints)
            .await
        {
            Ok(conversation) => conversation,
            Err(e) => return Err(turn.fail(e.into())),
        };

        match self.quota.reserve(user.user_id, UsageKind::Request).await {
            Ok(Reservation::Granted { .. }) => turn.advance(DispatchState::QuotaChecked),
            Ok(Reservation::Denied {
                current_usage,
                limit,
                reset_date,
            }) => {
                return Err(turn.fail(DispatchError::QuotaExceeded {
                    current_usage,
                    limit,
                    reset_date,
                }))
            }
            Err(e) => return Err(turn.fail(e.into())),
        }

        let conversation = match self
            .conversations
            .append(&conversation, Role::User, text.clone(), MessageMetadata::default(), false)
            .await
        {
            Ok(conversation) => conversation,
            Err(e) => {
                // Nothing was persisted, so the unit is given back.
                if let Err(release_err) = self.quota.release(user.user_id, UsageKind::Request, 1).await {
                    error!(user_id = %user.user_id, error = %release_err, "Failed to release quota unit");
                }
                return Err(turn.fail(e.into()));
            }
        };

        let prompt = self.build_prompt(&conversation, &request.hints, user.user_id, text).await;
        turn.advance(DispatchState::ContextBuilt);

        let conversation_id = conversation.id;
        self.hub.notify(user.user_id, &StatusEvent::ProcessingStarted { conversation_id }, None);
        turn.advance(DispatchState::Generating);

        let (reply_text, metadata, token_count, is_error) = match self.gateway.generate(&prompt).await {
            Ok(generated) => {
                let metadata = MessageMetadata {
                    token_count: Some(generated.token_count),
                    model: Some(generated.model),
                };
                (generated.text, metadata, generated.token_count, false)
            }
            Err(_) => (FALLBACK_REPLY.to_string(), MessageMetadata::default(), 0, true),
        };

        let persisted = self
            .conversations
            .append(&conversation, Role::Assistant, reply_text.clone(), metadata, is_error)
            .await;
        self.hub.notify(user.user_id, &StatusEvent::ProcessingStopped { conversation_id }, None);
        if let Err(e) = persisted {
            return Err(turn.fail(e.into()));
        }
        turn.advance(DispatchState::Persisted);

        turn.advance(DispatchState::Delivered);
        info!(%conversation_id, user_id = %user.user_id, channel = origin.channel(), token_count, is_error, "Message answered");
        Ok(MessageReply {
            conversation_id,
            reply_text,
            token_count,
            is_error,
        })
    }

    async fn build_prompt(
        &self,
        conversation: &Conversation,
        hints: &ContextHints,
        user_id: Uuid,
        query: String,
    ) -> Prompt {
        let context = hints.resolve_against(&conversation.context);
        let document = self.soft_document(context.document_id, user_id).await;
        let recent = self
            .conversations
            .recent_context(conversation, self.settings.recent_context_limit);
        Prompt {
            instructions: self.assembler.assemble(&context, document.as_ref(), &recent),
            query,
        }
    }

    //-------------------------------------------------------------------------------------
    // analyzeDocument and analyzeText
    //-------------------------------------------------------------------------------------

    /// One-shot document analysis. The document is resolved before any unit is
    /// charged.
    pub async fn analyze_document(
        &self,
        user: &AuthenticatedUser,
        document_id: Uuid,
        analysis_type: AnalysisType,
        origin: Origin,
    ) -> Result<AnalysisReply, DispatchError> {
        let mut turn = Turn::start(user.user_id, origin);

        let document = match self.documents.get_document(document_id, user.user_id).await {
            Ok(document) => document,
            Err(e) => return Err(turn.fail(e.into())),
        };

        self.run_analysis(turn, user, Some(document_id), analysis_type, &document.text)
            .await
    }

    /// One-shot analysis of text pasted by the user. Nothing is persisted.
    pub async fn analyze_text(
        &self,
        user: &AuthenticatedUser,
        text: &str,
        analysis_type: AnalysisType,
        origin: Origin,
    ) -> Result<AnalysisReply, DispatchError> {
        let mut turn = Turn::start(user.user_id, origin);

        let text = text.trim();
        let chars = text.chars().count();
        if !(MIN_ANALYSIS_TEXT_CHARS..=MAX_ANALYSIS_TEXT_CHARS).contains(&chars) {
            return Err(turn.fail(DispatchError::Validation(format!(
                "Text must be between {} and {} characters",
                MIN_ANALYSIS_TEXT_CHARS, MAX_ANALYSIS_TEXT_CHARS
            ))));
        }

        self.run_analysis(turn, user, None, analysis_type, text).await
    }

    /// Charges one request unit, plus a plagiarism unit for plagiarism checks,
    /// then generates the analysis. A denied plagiarism unit gives the request
    /// unit back. Only document analyses emit status events.
    async fn run_analysis(
        &self,
        mut turn: Turn,
        user: &AuthenticatedUser,
        document_id: Option<Uuid>,
        analysis_type: AnalysisType,
        text: &str,
    ) -> Result<AnalysisReply, DispatchError> {
        if let Err(e) = self.reserve_or_deny(user.user_id, UsageKind::Request).await {
            return Err(turn.fail(e));
        }
        if analysis_type == AnalysisType::Plagiarism {
            if let Err(e) = self.reserve_or_deny(user.user_id, UsageKind::PlagiarismCheck).await {
                if let Err(release_err) = self.quota.release(user.user_id, UsageKind::Request, 1).await {
                    error!(user_id = %user.user_id, error = %release_err, "Failed to release quota unit");
                }
                return Err(turn.fail(e));
            }
        }
        turn.advance(DispatchState::QuotaChecked);

        let prompt = analysis_prompt(analysis_type, text);
        turn.advance(DispatchState::ContextBuilt);

        if let Some(document_id) = document_id {
            self.hub.notify(user.user_id, &StatusEvent::AnalysisStarted { document_id }, None);
        }
        turn.advance(DispatchState::Generating);
        let outcome = self.gateway.generate(&prompt).await;
        if let Some(document_id) = document_id {
            self.hub.notify(user.user_id, &StatusEvent::AnalysisStopped { document_id }, None);
        }

        let reply = match outcome {
            Ok(generated) => AnalysisReply {
                document_id,
                analysis_type,
                result: generated.text,
                token_count: generated.token_count,
                is_error: false,
            },
            Err(_) => AnalysisReply {
                document_id,
                analysis_type,
                result: FALLBACK_REPLY.to_string(),
                token_count: 0,
                is_error: true,
            },
        };
        turn.advance(DispatchState::Delivered);
        info!(
            document_id = ?document_id,
            user_id = %user.user_id,
            channel = turn.origin.channel(),
            analysis = analysis_type.as_str(),
            is_error = reply.is_error,
            "Analysis produced"
        );
        Ok(reply)
    }

    async fn reserve_or_deny(&self, user_id: Uuid, kind: UsageKind) -> Result<(), DispatchError> {
        match self.quota.reserve(user_id, kind).await? {
            Reservation::Granted { .. } => Ok(()),
            Reservation::Denied {
                current_usage,
                limit,
                reset_date,
            } => Err(DispatchError::QuotaExceeded {
                current_usage,
                limit,
                reset_date,
            }),
        }
    }

    //-------------------------------------------------------------------------------------
    // Typing relay
    //-------------------------------------------------------------------------------------

    /// Relays a typing indicator to the user's other connections.
    pub fn relay_typing(
        &self,
        user_id: Uuid,
        from: ConnectionId,
        conversation_id: Option<Uuid>,
        typing: bool,
    ) -> usize {
        let event = if typing {
            StatusEvent::UserTyping { conversation_id }
        } else {
            StatusEvent::UserStoppedTyping { conversation_id }
        };
        self.hub.notify(user_id, &event, Some(from))
    }

    //-------------------------------------------------------------------------------------
    // Read and housekeeping operations (no quota consumed)
    //-------------------------------------------------------------------------------------

    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<Conversation>, DispatchError> {
        Ok(self.conversations.list_active(user_id, page, page_size).await?)
    }

    pub async fn get_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation, DispatchError> {
        Ok(self.conversations.get(conversation_id, user_id).await?)
    }

    pub async fn get_recent_context(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        limit: Option<usize>,
    ) -> Result<String, DispatchError> {
        let limit = limit.unwrap_or(self.settings.recent_context_limit);
        Ok(self
            .conversations
            .get_recent_context(conversation_id, user_id, limit)
            .await?)
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        title: &str,
    ) -> Result<Conversation, DispatchError> {
        Ok(self.conversations.rename(conversation_id, user_id, title).await?)
    }

    pub async fn delete_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), DispatchError> {
        Ok(self.conversations.soft_delete(conversation_id, user_id).await?)
    }

    pub async fn usage_report(&self, user_id: Uuid) -> Result<UsageReport, DispatchError> {
        Ok(self.quota.usage_report(user_id).await?)
    }
}
