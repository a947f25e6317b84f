//! services/api/src/chat/mod.rs
//!
//! The conversation orchestrator shared by every channel.

pub mod conversations;
pub mod dispatcher;
pub mod gateway;
pub mod hub;
pub mod quota;

pub use conversations::ConversationStore;
pub use dispatcher::{
    AnalysisReply, ChannelDispatcher, DispatchError, MessageReply, Origin, SendMessageRequest,
};
pub use gateway::{GenerationFailure, GenerationGateway};
pub use hub::{ConnectionHub, ConnectionId};
pub use quota::{QuotaLedger, Reservation, UsageReport};
