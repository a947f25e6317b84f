pub mod domain;
pub mod ports;
pub mod prompt;

pub use domain::{
    AnalysisType, AuthenticatedUser, Conversation, ConversationContext, ContextHints,
    DocumentExcerpt, Message, MessageMetadata, PaperType, Role, Stage, StatusEvent,
    SubscriptionTier, UsageCounters, UsageKind, User,
};
pub use ports::{
    CounterUpdate, DatabaseService, DocumentService, GeneratedText, IdentityService, PortError,
    PortResult, Prompt, TextGenerationService,
};
pub use prompt::ContextAssembler;
