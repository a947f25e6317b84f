//! services/api/src/web/protocol.rs
//!
//! Defines the wire types shared by the WebSocket protocol and the REST API,
//! and their mapping to and from the orchestrator's types.

use crate::chat::{AnalysisReply, DispatchError, MessageReply};
use chrono::{DateTime, Utc};
use research_assistant_core::domain::{AnalysisType, ContextHints, PaperType, Stage, StatusEvent};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// Shared Payloads
//=========================================================================================

/// Optional context hints attached to a chat message.
#[derive(Deserialize, Debug, Default, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContextPayload {
    #[serde(default, alias = "document_id")]
    pub document_id: Option<Uuid>,
    /// One of `research`, `review`, `thesis`, `conference`, `journal`.
    #[serde(default, alias = "paper_type")]
    pub paper_type: Option<String>,
    /// One of `planning`, `writing`, `editing`, `reviewing`.
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

impl ContextPayload {
    pub fn into_hints(self) -> Result<ContextHints, DispatchError> {
        let paper_type = self
            .paper_type
            .as_deref()
            .map(|raw| {
                PaperType::parse(raw)
                    .ok_or_else(|| DispatchError::Validation(format!("Unknown paper type '{}'", raw)))
            })
            .transpose()?;
        let stage = self
            .stage
            .as_deref()
            .map(|raw| {
                Stage::parse(raw)
                    .ok_or_else(|| DispatchError::Validation(format!("Unknown stage '{}'", raw)))
            })
            .transpose()?;

        Ok(ContextHints {
            document_id: self.document_id,
            paper_type,
            stage,
            subject: self.subject.filter(|s| !s.trim().is_empty()),
        })
    }
}

/// Parses an analysis type, defaulting to `general` when absent.
pub fn parse_analysis_type(raw: Option<&str>) -> Result<AnalysisType, DispatchError> {
    match raw {
        None => Ok(AnalysisType::default()),
        Some(raw) => AnalysisType::parse(raw)
            .ok_or_else(|| DispatchError::Validation(format!("Unknown analysis type '{}'", raw))),
    }
}

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Sends a chat message, optionally continuing an existing conversation.
    ChatMessage {
        message: String,
        #[serde(default)]
        conversation_id: Option<Uuid>,
        #[serde(default)]
        context: Option<ContextPayload>,
    },

    /// The user started typing; relayed to their other connections.
    TypingStart {
        #[serde(default)]
        conversation_id: Option<Uuid>,
    },

    /// The user stopped typing.
    TypingStop {
        #[serde(default)]
        conversation_id: Option<Uuid>,
    },

    /// Requests a one-shot analysis of a stored document.
    AnalyzeDocument {
        document_id: Uuid,
        #[serde(default)]
        analysis_type: Option<String>,
    },

    /// Requests a one-shot analysis of pasted text.
    AnalyzeText {
        text: String,
        #[serde(default)]
        analysis_type: Option<String>,
    },

    Ping,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the upgrade; identifies this connection.
    Connected { connection_id: Uuid },

    /// The assistant's answer to a `chat_message` sent on this connection.
    MessageReply {
        conversation_id: Uuid,
        reply: String,
        token_count: u32,
        is_error: bool,
    },

    /// `document_id` is null for pasted-text analyses.
    AnalysisResult {
        document_id: Option<Uuid>,
        analysis_type: String,
        result: String,
        is_error: bool,
    },

    /// The monthly allowance is exhausted.
    QuotaExceeded {
        current_usage: i64,
        limit: i64,
        reset_date: DateTime<Utc>,
    },

    /// Reports a per-request error. The connection stays open.
    Error { message: String },

    ProcessingStarted { conversation_id: Uuid },
    ProcessingStopped { conversation_id: Uuid },
    AnalysisStarted { document_id: Uuid },
    AnalysisStopped { document_id: Uuid },
    UserTyping { conversation_id: Option<Uuid> },
    UserStoppedTyping { conversation_id: Option<Uuid> },

    Pong,
}

impl From<StatusEvent> for ServerMessage {
    fn from(event: StatusEvent) -> Self {
        match event {
            StatusEvent::ProcessingStarted { conversation_id } => Self::ProcessingStarted { conversation_id },
            StatusEvent::ProcessingStopped { conversation_id } => Self::ProcessingStopped { conversation_id },
            StatusEvent::AnalysisStarted { document_id } => Self::AnalysisStarted { document_id },
            StatusEvent::AnalysisStopped { document_id } => Self::AnalysisStopped { document_id },
            StatusEvent::UserTyping { conversation_id } => Self::UserTyping { conversation_id },
            StatusEvent::UserStoppedTyping { conversation_id } => Self::UserStoppedTyping { conversation_id },
        }
    }
}

impl From<MessageReply> for ServerMessage {
    fn from(reply: MessageReply) -> Self {
        Self::MessageReply {
            conversation_id: reply.conversation_id,
            reply: reply.reply_text,
            token_count: reply.token_count,
            is_error: reply.is_error,
        }
    }
}

impl From<AnalysisReply> for ServerMessage {
    fn from(reply: AnalysisReply) -> Self {
        Self::AnalysisResult {
            document_id: reply.document_id,
            analysis_type: reply.analysis_type.as_str().to_string(),
            result: reply.result,
            is_error: reply.is_error,
        }
    }
}

impl From<DispatchError> for ServerMessage {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::QuotaExceeded {
                current_usage,
                limit,
                reset_date,
            } => Self::QuotaExceeded {
                current_usage,
                limit,
                reset_date,
            },
            DispatchError::Internal(_) => Self::Error {
                message: "Failed to process request".to_string(),
            },
            other => Self::Error {
                message: other.to_string(),
            },
        }
    }
}
