//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` and `DocumentService` ports from the `core` crate. It
//! handles all interactions with the PostgreSQL database using `sqlx`.
//!
//! Quota counters are only ever changed through single conditional `UPDATE`
//! statements, so concurrent reservations from any number of service instances
//! cannot both pass the same limit check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use research_assistant_core::domain::{
    Conversation, ConversationContext, DocumentExcerpt, Message, MessageMetadata, PaperType, Role,
    Stage, SubscriptionTier, UsageCounters, UsageKind, User,
};
use research_assistant_core::ports::{
    CounterUpdate, DatabaseService, DocumentService, PortError, PortResult,
};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn load_messages(&self, conversation_ids: &[Uuid]) -> PortResult<HashMap<Uuid, Vec<Message>>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            "SELECT conversation_id, role, content, is_error, token_count, model, created_at \
             FROM messages WHERE conversation_id = ANY($1) ORDER BY conversation_id, seq ASC",
        )
        .bind(conversation_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        let mut grouped: HashMap<Uuid, Vec<Message>> = HashMap::new();
        for record in records {
            let conversation_id = record.conversation_id;
            grouped
                .entry(conversation_id)
                .or_default()
                .push(record.to_domain()?);
        }
        Ok(grouped)
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

/// `messages.token_count` is an INTEGER column; larger counts are refused.
fn token_count_column(token_count: Option<u32>) -> PortResult<Option<i32>> {
    token_count
        .map(i32::try_from)
        .transpose()
        .map_err(|_| PortError::Unexpected("token count does not fit the messages table".to_string()))
}

/// Column backing each usage counter. Only these static names are ever
/// interpolated into SQL.
fn usage_column(kind: UsageKind) -> &'static str {
    match kind {
        UsageKind::Request => "monthly_requests",
        UsageKind::Document => "documents_count",
        UsageKind::PlagiarismCheck => "plagiarism_checks",
        UsageKind::VoiceMinute => "voice_minutes",
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    subscription: String,
    monthly_requests: i64,
    documents_count: i64,
    plagiarism_checks: i64,
    voice_minutes: i64,
    last_reset_date: DateTime<Utc>,
    created_at: DateTime<Utc>,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            user_id: self.user_id,
            tier: SubscriptionTier::parse(&self.subscription).unwrap_or_default(),
            usage: UsageCounters {
                monthly_requests: self.monthly_requests,
                documents_count: self.documents_count,
                plagiarism_checks: self.plagiarism_checks,
                voice_minutes: self.voice_minutes,
                last_reset_date: self.last_reset_date,
            },
            created_at: self.created_at,
        }
    }
}

const USER_COLUMNS: &str = "user_id, subscription, monthly_requests, documents_count, \
     plagiarism_checks, voice_minutes, last_reset_date, created_at";

#[derive(FromRow)]
struct ConversationRecord {
    id: Uuid,
    user_id: Uuid,
    title: String,
    document_id: Option<Uuid>,
    paper_type: String,
    stage: String,
    subject: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}
impl ConversationRecord {
    fn to_domain(self, messages: Vec<Message>) -> Conversation {
        Conversation {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            messages,
            context: ConversationContext {
                document_id: self.document_id,
                paper_type: PaperType::parse(&self.paper_type).unwrap_or_default(),
                stage: Stage::parse(&self.stage).unwrap_or_default(),
                subject: self.subject,
            },
            is_active: self.is_active,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

const CONVERSATION_COLUMNS: &str = "id, user_id, title, document_id, paper_type, stage, subject, \
     is_active, created_at, last_activity";

#[derive(FromRow)]
struct MessageRecord {
    conversation_id: Uuid,
    role: String,
    content: String,
    is_error: bool,
    token_count: Option<i32>,
    model: Option<String>,
    created_at: DateTime<Utc>,
}
impl MessageRecord {
    fn to_domain(self) -> PortResult<Message> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| PortError::Unexpected(format!("Unknown message role '{}'", self.role)))?;
        Ok(Message {
            role,
            content: self.content,
            timestamp: self.created_at,
            metadata: MessageMetadata {
                token_count: self.token_count.map(|t| t.max(0) as u32),
                model: self.model,
            },
            is_error: self.is_error,
        })
    }
}

#[derive(FromRow)]
struct DocumentRecord {
    id: Uuid,
    user_id: Uuid,
    title: String,
    extracted_text: String,
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn get_or_create_user(&self, user_id: Uuid, tier: SubscriptionTier) -> PortResult<User> {
        let sql = format!(
            "INSERT INTO users (user_id, subscription) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE SET subscription = EXCLUDED.subscription \
             RETURNING {}",
            USER_COLUMNS
        );
        let record = sqlx::query_as::<_, UserRecord>(&sql)
            .bind(user_id)
            .bind(tier.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(record.to_domain())
    }

    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        let sql = format!("SELECT {} FROM users WHERE user_id = $1", USER_COLUMNS);
        let record = sqlx::query_as::<_, UserRecord>(&sql)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => PortError::NotFound(format!("User {} not found", user_id)),
                _ => PortError::Unexpected(e.to_string()),
            })?;
        Ok(record.to_domain())
    }

    async fn reset_usage_before(
        &self,
        user_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET monthly_requests = 0, plagiarism_checks = 0, voice_minutes = 0, \
             last_reset_date = $2 WHERE user_id = $1 AND last_reset_date < $3",
        )
        .bind(user_id)
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_usage_within(
        &self,
        user_id: Uuid,
        kind: UsageKind,
        limit: Option<i64>,
    ) -> PortResult<CounterUpdate> {
        let column = usage_column(kind);
        let sql = format!(
            "UPDATE users SET {col} = {col} + 1 \
             WHERE user_id = $1 AND ($2::BIGINT IS NULL OR {col} < $2) RETURNING {col}",
            col = column
        );
        let updated: Option<i64> = sqlx::query_scalar(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?;

        if let Some(value) = updated {
            return Ok(CounterUpdate::Applied(value));
        }

        let current: Option<i64> =
            sqlx::query_scalar(&format!("SELECT {} FROM users WHERE user_id = $1", column))
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unexpected)?;
        current
            .map(CounterUpdate::AtLimit)
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }

    async fn adjust_usage(&self, user_id: Uuid, kind: UsageKind, delta: i64) -> PortResult<i64> {
        let sql = format!(
            "UPDATE users SET {col} = GREATEST({col} + $2, 0) WHERE user_id = $1 RETURNING {col}",
            col = usage_column(kind)
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(user_id)
            .bind(delta)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> PortResult<Conversation> {
        let sql = format!("SELECT {} FROM conversations WHERE id = $1", CONVERSATION_COLUMNS);
        let record = sqlx::query_as::<_, ConversationRecord>(&sql)
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => {
                    PortError::NotFound(format!("Conversation {} not found", conversation_id))
                }
                _ => PortError::Unexpected(e.to_string()),
            })?;
        let mut messages = self.load_messages(&[conversation_id]).await?;
        Ok(record.to_domain(messages.remove(&conversation_id).unwrap_or_default()))
    }

    async fn save_appended_message(
        &self,
        conversation: &Conversation,
        appended: &Message,
    ) -> PortResult<()> {
        let seq = conversation
            .messages
            .len()
            .checked_sub(1)
            .ok_or_else(|| PortError::Unexpected("conversation has no messages".to_string()))?;

        let seq = i32::try_from(seq)
            .map_err(|_| PortError::Unexpected(format!("conversation {} is too long", conversation.id)))?;
        let token_count = token_count_column(appended.metadata.token_count)?;

        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, document_id, paper_type, stage, subject, \
             is_active, created_at, last_activity) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title, last_activity = EXCLUDED.last_activity",
        )
        .bind(conversation.id)
        .bind(conversation.user_id)
        .bind(&conversation.title)
        .bind(conversation.context.document_id)
        .bind(conversation.context.paper_type.as_str())
        .bind(conversation.context.stage.as_str())
        .bind(&conversation.context.subject)
        .bind(conversation.is_active)
        .bind(conversation.created_at)
        .bind(conversation.last_activity)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query(
            "INSERT INTO messages (conversation_id, seq, role, content, is_error, token_count, model, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(conversation.id)
        .bind(seq)
        .bind(appended.role.as_str())
        .bind(&appended.content)
        .bind(appended.is_error)
        .bind(token_count)
        .bind(&appended.metadata.model)
        .bind(appended.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    async fn list_active_conversations(
        &self,
        user_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> PortResult<Vec<Conversation>> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE user_id = $1 AND is_active \
             ORDER BY last_activity DESC, id ASC LIMIT $2 OFFSET $3",
            CONVERSATION_COLUMNS
        );
        let records = sqlx::query_as::<_, ConversationRecord>(&sql)
            .bind(user_id)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut messages = self.load_messages(&ids).await?;
        Ok(records
            .into_iter()
            .map(|r| {
                let transcript = messages.remove(&r.id).unwrap_or_default();
                r.to_domain(transcript)
            })
            .collect())
    }

    async fn update_conversation_title(&self, conversation_id: Uuid, title: &str) -> PortResult<()> {
        let result = sqlx::query("UPDATE conversations SET title = $2 WHERE id = $1")
            .bind(conversation_id)
            .bind(title)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Conversation {} not found", conversation_id)));
        }
        Ok(())
    }

    async fn deactivate_conversation(&self, conversation_id: Uuid) -> PortResult<()> {
        let result = sqlx::query("UPDATE conversations SET is_active = FALSE WHERE id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Conversation {} not found", conversation_id)));
        }
        Ok(())
    }
}

//=========================================================================================
// `DocumentService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DocumentService for DbAdapter {
    async fn get_document(&self, document_id: Uuid, user_id: Uuid) -> PortResult<DocumentExcerpt> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            "SELECT id, user_id, title, extracted_text FROM documents WHERE id = $1",
        )
        .bind(document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Document {} not found", document_id)),
            _ => PortError::Unexpected(e.to_string()),
        })?;

        if record.user_id != user_id {
            return Err(PortError::Forbidden(format!(
                "Document {} belongs to another user",
                document_id
            )));
        }
        Ok(DocumentExcerpt {
            document_id: record.id,
            title: record.title,
            text: record.extracted_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_usage_kind_maps_to_a_distinct_column() {
        let columns = [
            usage_column(UsageKind::Request),
            usage_column(UsageKind::Document),
            usage_column(UsageKind::PlagiarismCheck),
            usage_column(UsageKind::VoiceMinute),
        ];
        let unique: std::collections::HashSet<_> = columns.iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(USER_COLUMNS.contains(usage_column(UsageKind::PlagiarismCheck)));
    }

    #[test]
    fn oversized_token_count_is_refused() {
        assert_eq!(token_count_column(Some(1_200)).unwrap(), Some(1_200));
        assert_eq!(token_count_column(None).unwrap(), None);
        assert!(matches!(
            token_count_column(Some(u32::MAX)),
            Err(PortError::Unexpected(_))
        ));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let record = MessageRecord {
            conversation_id: Uuid::new_v4(),
            role: "system".into(),
            content: "x".into(),
            is_error: false,
            token_count: None,
            model: None,
            created_at: Utc::now(),
        };
        assert!(matches!(record.to_domain(), Err(PortError::Unexpected(_))));
    }
}
