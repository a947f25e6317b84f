//! crates/research_assistant_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use uuid::Uuid;

/// Title every conversation starts with until its first user message arrives.
pub const DEFAULT_TITLE: &str = "New Conversation";

/// Number of characters of the first user message kept in a derived title.
pub const TITLE_PREVIEW_CHARS: usize = 50;

/// Reply persisted and returned whenever the generation provider fails.
pub const FALLBACK_REPLY: &str =
    "I apologize, but I encountered an error processing your request. Please try again.";

//=========================================================================================
// Users and Usage
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }

    /// Premium users are never gated, their counters only accumulate.
    pub fn is_metered(&self) -> bool {
        matches!(self, Self::Free)
    }
}

/// The counters a metered action can consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageKind {
    Request,
    Document,
    PlagiarismCheck,
    VoiceMinute,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Document => "document",
            Self::PlagiarismCheck => "plagiarism",
            Self::VoiceMinute => "voice",
        }
    }
}

/// Per-user usage counters, persisted alongside the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounters {
    pub monthly_requests: i64,
    pub documents_count: i64,
    pub plagiarism_checks: i64,
    pub voice_minutes: i64,
    pub last_reset_date: DateTime<Utc>,
}

impl UsageCounters {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            monthly_requests: 0,
            documents_count: 0,
            plagiarism_checks: 0,
            voice_minutes: 0,
            last_reset_date: now,
        }
    }

    pub fn get(&self, kind: UsageKind) -> i64 {
        match kind {
            UsageKind::Request => self.monthly_requests,
            UsageKind::Document => self.documents_count,
            UsageKind::PlagiarismCheck => self.plagiarism_checks,
            UsageKind::VoiceMinute => self.voice_minutes,
        }
    }

    fn slot(&mut self, kind: UsageKind) -> &mut i64 {
        match kind {
            UsageKind::Request => &mut self.monthly_requests,
            UsageKind::Document => &mut self.documents_count,
            UsageKind::PlagiarismCheck => &mut self.plagiarism_checks,
            UsageKind::VoiceMinute => &mut self.voice_minutes,
        }
    }

    /// Applies `delta` to a counter, never letting it drop below zero.
    /// Returns the new value.
    pub fn adjust(&mut self, kind: UsageKind, delta: i64) -> i64 {
        let slot = self.slot(kind);
        *slot = (*slot + delta).max(0);
        *slot
    }

    /// True when the last reset happened in a calendar month before `now`'s.
    pub fn needs_rollover(&self, now: DateTime<Utc>) -> bool {
        self.last_reset_date < month_start(now)
    }

    /// Zeroes every counter that rolls over monthly and stamps the reset time.
    pub fn reset_rolling(&mut self, now: DateTime<Utc>) {
        self.monthly_requests = 0;
        self.plagiarism_checks = 0;
        self.voice_minutes = 0;
        self.last_reset_date = now;
    }
}

/// First instant (00:00 UTC on day 1) of the calendar month containing `at`.
pub fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(at)
}

/// First instant of the calendar month following the one containing `at`.
pub fn next_reset_date(at: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(at)
}

// Represents a user - used throughout app
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub usage: UsageCounters,
    pub created_at: DateTime<Utc>,
}

/// The identity a verified bearer credential resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
}

//=========================================================================================
// Conversations
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub token_count: Option<u32>,
    pub model: Option<String>,
}

/// A single entry of a conversation transcript. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: MessageMetadata,
    /// Set on the assistant turn recorded when generation failed.
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaperType {
    #[default]
    Research,
    Review,
    Thesis,
    Conference,
    Journal,
}

impl PaperType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Review => "review",
            Self::Thesis => "thesis",
            Self::Conference => "conference",
            Self::Journal => "journal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "research" => Some(Self::Research),
            "review" => Some(Self::Review),
            "thesis" => Some(Self::Thesis),
            "conference" => Some(Self::Conference),
            "journal" => Some(Self::Journal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Planning,
    Writing,
    Editing,
    Reviewing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Writing => "writing",
            Self::Editing => "editing",
            Self::Reviewing => "reviewing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planning" => Some(Self::Planning),
            "writing" => Some(Self::Writing),
            "editing" => Some(Self::Editing),
            "reviewing" => Some(Self::Reviewing),
            _ => None,
        }
    }
}

/// The context stored with a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationContext {
    pub document_id: Option<Uuid>,
    pub paper_type: PaperType,
    pub stage: Stage,
    pub subject: Option<String>,
}

/// Context hints supplied with a request. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextHints {
    pub document_id: Option<Uuid>,
    pub paper_type: Option<PaperType>,
    pub stage: Option<Stage>,
    pub subject: Option<String>,
}

impl ContextHints {
    /// Context for a brand-new conversation: the hints with defaults applied.
    pub fn to_context(&self) -> ConversationContext {
        self.resolve_against(&ConversationContext::default())
    }

    /// Field-wise override of a stored context by these hints.
    pub fn resolve_against(&self, stored: &ConversationContext) -> ConversationContext {
        ConversationContext {
            document_id: self.document_id.or(stored.document_id),
            paper_type: self.paper_type.unwrap_or(stored.paper_type),
            stage: self.stage.unwrap_or(stored.stage),
            subject: self.subject.clone().or_else(|| stored.subject.clone()),
        }
    }
}

/// A titled, ordered transcript owned by exactly one user.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub messages: Vec<Message>,
    pub context: ConversationContext,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: Uuid, context: ConversationContext) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            context,
            is_active: true,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_TITLE
    }

    /// Active and owned by `user_id`; anything else is invisible to that user.
    pub fn is_visible_to(&self, user_id: Uuid) -> bool {
        self.is_active && self.user_id == user_id
    }

    /// Appends a message and returns a reference to it.
    ///
    /// The timestamp is clamped so the transcript never goes backwards in time.
    /// The title is derived from the first user message while it is still the
    /// default.
    pub fn push_message(
        &mut self,
        role: Role,
        content: String,
        metadata: MessageMetadata,
        is_error: bool,
        now: DateTime<Utc>,
    ) -> &Message {
        let timestamp = match self.messages.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };

        let first_user_message =
            role == Role::User && !self.messages.iter().any(|m| m.role == Role::User);
        if first_user_message && self.has_default_title() {
            self.title = derive_title(&content);
        }

        self.messages.push(Message {
            role,
            content,
            timestamp,
            metadata,
            is_error,
        });
        self.last_activity = timestamp;
        &self.messages[self.messages.len() - 1]
    }

    /// The last `limit` messages as `role: content` lines, oldest first,
    /// separated by blank lines.
    pub fn recent_context(&self, limit: usize) -> String {
        let start = self.messages.len().saturating_sub(limit);
        self.messages[start..]
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// The first `TITLE_PREVIEW_CHARS` characters of `text`, with `...` when cut.
pub fn derive_title(text: &str) -> String {
    match char_prefix(text, TITLE_PREVIEW_CHARS) {
        Some(prefix) => format!("{}...", prefix),
        None => text.to_string(),
    }
}

/// Returns the first `max_chars` characters of `text` if it is longer than that.
pub fn char_prefix(text: &str, max_chars: usize) -> Option<&str> {
    text.char_indices().nth(max_chars).map(|(idx, _)| &text[..idx])
}

//=========================================================================================
// Documents and Analysis
//=========================================================================================

/// A document as seen by the assistant: its title and extracted text.
#[derive(Debug, Clone)]
pub struct DocumentExcerpt {
    pub document_id: Uuid,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisType {
    #[default]
    General,
    Grammar,
    Plagiarism,
    Structure,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Grammar => "grammar",
            Self::Plagiarism => "plagiarism",
            Self::Structure => "structure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "general" => Some(Self::General),
            "grammar" => Some(Self::Grammar),
            "plagiarism" => Some(Self::Plagiarism),
            "structure" => Some(Self::Structure),
            _ => None,
        }
    }
}

//=========================================================================================
// Status Events
//=========================================================================================

/// Best-effort notifications fanned out to a user's live connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    ProcessingStarted { conversation_id: Uuid },
    ProcessingStopped { conversation_id: Uuid },
    AnalysisStarted { document_id: Uuid },
    AnalysisStopped { document_id: Uuid },
    UserTyping { conversation_id: Option<Uuid> },
    UserStoppedTyping { conversation_id: Option<Uuid> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn month_helpers_handle_year_end() {
        assert_eq!(month_start(at(2024, 3, 17)), Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(next_reset_date(at(2024, 12, 31)), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(next_reset_date(at(2024, 2, 10)), Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn rollover_resets_rolling_counters_once() {
        let mut usage = UsageCounters::new(at(2024, 1, 20));
        usage.monthly_requests = 50;
        usage.plagiarism_checks = 5;
        usage.voice_minutes = 3;
        usage.documents_count = 7;

        assert!(!usage.needs_rollover(at(2024, 1, 31)));

        let feb = at(2024, 2, 1);
        assert!(usage.needs_rollover(feb));
        usage.reset_rolling(feb);
        assert_eq!(usage.monthly_requests, 0);
        assert_eq!(usage.plagiarism_checks, 0);
        assert_eq!(usage.voice_minutes, 0);
        assert_eq!(usage.documents_count, 7);
        assert_eq!(usage.last_reset_date, feb);

        assert!(!usage.needs_rollover(feb + Duration::hours(1)));
    }

    #[test]
    fn rollover_applies_across_years_in_same_month() {
        let usage = UsageCounters::new(at(2023, 5, 2));
        assert!(usage.needs_rollover(at(2024, 5, 2)));
    }

    #[test]
    fn adjust_never_goes_negative() {
        let mut usage = UsageCounters::new(Utc::now());
        usage.adjust(UsageKind::Document, 2);
        assert_eq!(usage.adjust(UsageKind::Document, -5), 0);
    }

    #[test]
    fn long_first_message_becomes_truncated_title() {
        let mut conversation = Conversation::new(Uuid::new_v4(), ConversationContext::default());
        let text = "Help me structure my research paper and also improve my thesis statement for clarity";
        conversation.push_message(Role::User, text.to_string(), MessageMetadata::default(), false, Utc::now());

        assert_eq!(conversation.title, format!("{}...", &text[..50]));
        assert_eq!(conversation.title.chars().count(), 53);
    }

    #[test]
    fn short_first_message_is_title_verbatim_and_never_retitled() {
        let mut conversation = Conversation::new(Uuid::new_v4(), ConversationContext::default());
        conversation.push_message(Role::User, "Outline help".into(), MessageMetadata::default(), false, Utc::now());
        conversation.push_message(Role::Assistant, "Sure".into(), MessageMetadata::default(), false, Utc::now());
        conversation.push_message(Role::User, "Another question".into(), MessageMetadata::default(), false, Utc::now());

        assert_eq!(conversation.title, "Outline help");
    }

    #[test]
    fn assistant_message_does_not_derive_title() {
        let mut conversation = Conversation::new(Uuid::new_v4(), ConversationContext::default());
        conversation.push_message(Role::Assistant, "Welcome".into(), MessageMetadata::default(), false, Utc::now());
        assert!(conversation.has_default_title());
    }

    #[test]
    fn timestamps_never_decrease() {
        let mut conversation = Conversation::new(Uuid::new_v4(), ConversationContext::default());
        let later = Utc::now() + Duration::seconds(30);
        conversation.push_message(Role::User, "a".into(), MessageMetadata::default(), false, later);
        conversation.push_message(Role::Assistant, "b".into(), MessageMetadata::default(), false, Utc::now());

        assert_eq!(conversation.messages[1].timestamp, later);
        assert_eq!(conversation.last_activity, later);
    }

    #[test]
    fn recent_context_returns_last_messages_oldest_first() {
        let mut conversation = Conversation::new(Uuid::new_v4(), ConversationContext::default());
        for i in 0..12 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            conversation.push_message(role, format!("m{}", i), MessageMetadata::default(), false, Utc::now());
        }

        let context = conversation.recent_context(5);
        assert_eq!(
            context,
            "assistant: m7\n\nuser: m8\n\nassistant: m9\n\nuser: m10\n\nassistant: m11"
        );
        assert_eq!(Conversation::new(Uuid::new_v4(), ConversationContext::default()).recent_context(5), "");
    }

    #[test]
    fn hints_override_stored_context_field_wise() {
        let stored = ConversationContext {
            document_id: Some(Uuid::new_v4()),
            paper_type: PaperType::Thesis,
            stage: Stage::Editing,
            subject: Some("biology".into()),
        };
        let hints = ContextHints {
            stage: Some(Stage::Reviewing),
            ..Default::default()
        };

        let resolved = hints.resolve_against(&stored);
        assert_eq!(resolved.paper_type, PaperType::Thesis);
        assert_eq!(resolved.stage, Stage::Reviewing);
        assert_eq!(resolved.document_id, stored.document_id);
        assert_eq!(ContextHints::default().to_context(), ConversationContext::default());
    }

    #[test]
    fn char_prefix_respects_multibyte_text() {
        assert_eq!(char_prefix("héllo wörld", 4), Some("héll"));
        assert_eq!(char_prefix("short", 10), None);
    }
}
