//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::chat::{AnalysisReply, DispatchError, Origin, SendMessageRequest, UsageReport};
use crate::web::protocol::{parse_analysis_type, ContextPayload};
use crate::web::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::{DateTime, Utc};
use research_assistant_core::domain::{
    AnalysisType, AuthenticatedUser, Conversation, ConversationContext, Message,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::error;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{IntoParams, Modify, OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        send_message_handler,
        list_conversations_handler,
        get_conversation_handler,
        recent_context_handler,
        rename_conversation_handler,
        delete_conversation_handler,
        usage_handler,
        analyze_document_handler,
        plagiarism_check_handler,
        grammar_check_handler,
        health_handler,
    ),
    components(
        schemas(
            SendMessageBody, ContextPayload, SendMessageData, ConversationSummary,
            ConversationBody, MessageBody, ContextBody, RecentContextData, RenameBody,
            UsageData, UsageLimits, AnalyzeDocumentBody, AnalyzeTextBody, AnalysisData,
            HealthResponse,
            FailureBody,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Research Assistant API", description = "Quota-metered academic writing assistant.")
    )
)]
pub struct ApiDoc;

/// Registers the bearer JWT scheme referenced by the protected operations.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

//=========================================================================================
// Response Envelope and Error Mapping
//=========================================================================================

/// Every successful response is wrapped as `{ "success": true, "data": ... }`.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: None,
            data,
        })
    }

    fn with_message(message: &str, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.to_string()),
            data,
        })
    }
}

/// The body of every failed response.
#[derive(Serialize, Debug, ToSchema)]
pub struct FailureBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    data: Option<serde_json::Value>,
}

/// Maps orchestration errors onto HTTP status codes.
#[derive(Debug)]
pub struct ApiFailure(pub DispatchError);

impl From<DispatchError> for ApiFailure {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let (status, message, data) = match self.0 {
            DispatchError::QuotaExceeded {
                current_usage,
                limit,
                reset_date,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Monthly request limit exceeded. Please upgrade to premium.".to_string(),
                Some(json!({
                    "currentUsage": current_usage,
                    "limit": limit,
                    "resetDate": reset_date,
                })),
            ),
            DispatchError::NotFound(message) => (StatusCode::NOT_FOUND, message, None),
            DispatchError::Forbidden(message) => (StatusCode::FORBIDDEN, message, None),
            DispatchError::Validation(message) => (StatusCode::BAD_REQUEST, message, None),
            DispatchError::Internal(message) => {
                error!("Request failed: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        let body = FailureBody {
            success: false,
            message,
            data,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiFailure>;

/// Runs a metered turn on its own task. A client that hangs up drops the
/// handler future, but the turn still runs to completion and is persisted.
async fn detached<T, F>(turn: F) -> Result<T, DispatchError>
where
    F: Future<Output = Result<T, DispatchError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(turn)
        .await
        .map_err(|e| DispatchError::Internal(format!("Turn task failed: {}", e)))?
}

//=========================================================================================
// API Payload Structs
//=========================================================================================

#[derive(Deserialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    /// The user's message, 1 to 2000 characters after trimming.
    #[serde(default)]
    message: String,
    /// Continue this conversation; a new one is started when absent.
    #[serde(default, alias = "chatId")]
    conversation_id: Option<Uuid>,
    #[serde(default)]
    context: Option<ContextPayload>,
}

#[derive(Serialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageData {
    conversation_id: Uuid,
    response: String,
    tokens: u32,
    is_error: bool,
}

#[derive(Serialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContextBody {
    document_id: Option<Uuid>,
    paper_type: String,
    stage: String,
    subject: Option<String>,
}

impl From<&ConversationContext> for ContextBody {
    fn from(context: &ConversationContext) -> Self {
        Self {
            document_id: context.document_id,
            paper_type: context.paper_type.as_str().to_string(),
            stage: context.stage.as_str().to_string(),
            subject: context.subject.clone(),
        }
    }
}

#[derive(Serialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    id: Uuid,
    title: String,
    context: ContextBody,
    message_count: usize,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id,
            title: conversation.title.clone(),
            context: ContextBody::from(&conversation.context),
            message_count: conversation.messages.len(),
            created_at: conversation.created_at,
            last_activity: conversation.last_activity,
        }
    }
}

#[derive(Serialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    role: String,
    content: String,
    timestamp: DateTime<Utc>,
    token_count: Option<u32>,
    model: Option<String>,
    is_error: bool,
}

impl From<&Message> for MessageBody {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            token_count: message.metadata.token_count,
            model: message.metadata.model.clone(),
            is_error: message.is_error,
        }
    }
}

#[derive(Serialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationBody {
    id: Uuid,
    title: String,
    context: ContextBody,
    messages: Vec<MessageBody>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl From<&Conversation> for ConversationBody {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id,
            title: conversation.title.clone(),
            context: ContextBody::from(&conversation.context),
            messages: conversation.messages.iter().map(MessageBody::from).collect(),
            created_at: conversation.created_at,
            last_activity: conversation.last_activity,
        }
    }
}

#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// 1-based page number.
    page: Option<usize>,
    /// Page size, at most 100.
    limit: Option<usize>,
}

#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ContextQuery {
    /// Number of recent messages, defaults to 5.
    limit: Option<usize>,
}

#[derive(Serialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecentContextData {
    conversation_id: Uuid,
    context: String,
}

#[derive(Deserialize, Debug, ToSchema)]
pub struct RenameBody {
    title: String,
}

#[derive(Serialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    /// `null` means unlimited.
    requests: Option<i64>,
    plagiarism_checks: Option<i64>,
    documents: Option<i64>,
}

#[derive(Serialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageData {
    tier: String,
    monthly_requests: i64,
    documents_count: i64,
    plagiarism_checks: i64,
    voice_minutes: i64,
    last_reset_date: DateTime<Utc>,
    reset_date: DateTime<Utc>,
    limits: UsageLimits,
}

impl From<UsageReport> for UsageData {
    fn from(report: UsageReport) -> Self {
        Self {
            tier: report.tier.as_str().to_string(),
            monthly_requests: report.usage.monthly_requests,
            documents_count: report.usage.documents_count,
            plagiarism_checks: report.usage.plagiarism_checks,
            voice_minutes: report.usage.voice_minutes,
            last_reset_date: report.usage.last_reset_date,
            reset_date: report.reset_date,
            limits: UsageLimits {
                requests: report.request_limit,
                plagiarism_checks: report.plagiarism_limit,
                documents: report.document_limit,
            },
        }
    }
}

#[derive(Deserialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeDocumentBody {
    document_id: Uuid,
    /// One of `general`, `grammar`, `plagiarism`, `structure`.
    #[serde(default)]
    analysis_type: Option<String>,
}

#[derive(Deserialize, Debug, ToSchema)]
pub struct AnalyzeTextBody {
    /// 10 to 10000 characters after trimming.
    #[serde(default)]
    text: String,
}

#[derive(Serialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisData {
    /// Null for pasted-text checks.
    document_id: Option<Uuid>,
    analysis_type: String,
    result: String,
    tokens: u32,
    is_error: bool,
}

impl From<AnalysisReply> for AnalysisData {
    fn from(reply: AnalysisReply) -> Self {
        Self {
            document_id: reply.document_id,
            analysis_type: reply.analysis_type.as_str().to_string(),
            result: reply.result,
            tokens: reply.token_count,
            is_error: reply.is_error,
        }
    }
}

#[derive(Serialize, Debug, ToSchema)]
pub struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Send a chat message and receive the assistant's reply.
///
/// Consumes one unit of the monthly request allowance.
#[utoipa::path(
    post,
    path = "/chat/message",
    request_body = SendMessageBody,
    responses(
        (status = 200, description = "Reply generated (or the fallback reply on provider failure)", body = SendMessageData),
        (status = 400, description = "Empty or oversized message", body = FailureBody),
        (status = 404, description = "Conversation not found", body = FailureBody),
        (status = 429, description = "Monthly limit reached", body = FailureBody)
    ),
    security(("bearer" = []))
)]
pub async fn send_message_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<SendMessageData> {
    let hints = body.context.unwrap_or_default().into_hints()?;
    let request = SendMessageRequest {
        text: body.message,
        conversation_id: body.conversation_id,
        hints,
    };

    let dispatcher = app_state.dispatcher.clone();
    let reply = detached(async move {
        dispatcher
            .send_message(&user, request, Origin::Request)
            .await
    })
    .await?;

    Ok(ApiResponse::with_message(
        "Message sent successfully",
        SendMessageData {
            conversation_id: reply.conversation_id,
            response: reply.reply_text,
            tokens: reply.token_count,
            is_error: reply.is_error,
        },
    ))
}

/// List the caller's active conversations, most recent activity first.
#[utoipa::path(
    get,
    path = "/chat/history",
    params(HistoryQuery),
    responses(
        (status = 200, description = "One page of conversations", body = [ConversationSummary])
    ),
    security(("bearer" = []))
)]
pub async fn list_conversations_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<ConversationSummary>> {
    let conversations = app_state
        .dispatcher
        .list_conversations(user.user_id, query.page.unwrap_or(1), query.limit.unwrap_or(10))
        .await?;
    Ok(ApiResponse::ok(
        conversations.iter().map(ConversationSummary::from).collect(),
    ))
}

/// Fetch one conversation with its full transcript.
#[utoipa::path(
    get,
    path = "/chat/{id}",
    params(("id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, description = "The conversation", body = ConversationBody),
        (status = 404, description = "Conversation not found", body = FailureBody)
    ),
    security(("bearer" = []))
)]
pub async fn get_conversation_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<ConversationBody> {
    let conversation = app_state
        .dispatcher
        .get_conversation(conversation_id, user.user_id)
        .await?;
    Ok(ApiResponse::ok(ConversationBody::from(&conversation)))
}

/// Read the recent-context window of a conversation. Consumes no quota.
#[utoipa::path(
    get,
    path = "/chat/{id}/context",
    params(("id" = Uuid, Path, description = "Conversation id"), ContextQuery),
    responses(
        (status = 200, description = "Recent messages as `role: content` lines", body = RecentContextData),
        (status = 404, description = "Conversation not found", body = FailureBody)
    ),
    security(("bearer" = []))
)]
pub async fn recent_context_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<ContextQuery>,
) -> ApiResult<RecentContextData> {
    let context = app_state
        .dispatcher
        .get_recent_context(conversation_id, user.user_id, query.limit)
        .await?;
    Ok(ApiResponse::ok(RecentContextData {
        conversation_id,
        context,
    }))
}

/// Rename a conversation.
#[utoipa::path(
    put,
    path = "/chat/{id}",
    params(("id" = Uuid, Path, description = "Conversation id")),
    request_body = RenameBody,
    responses(
        (status = 200, description = "Conversation renamed", body = ConversationSummary),
        (status = 400, description = "Empty or oversized title", body = FailureBody),
        (status = 404, description = "Conversation not found", body = FailureBody)
    ),
    security(("bearer" = []))
)]
pub async fn rename_conversation_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<RenameBody>,
) -> ApiResult<ConversationSummary> {
    let conversation = app_state
        .dispatcher
        .rename_conversation(conversation_id, user.user_id, &body.title)
        .await?;
    Ok(ApiResponse::with_message(
        "Chat updated successfully",
        ConversationSummary::from(&conversation),
    ))
}

/// Delete (deactivate) a conversation.
#[utoipa::path(
    delete,
    path = "/chat/{id}",
    params(("id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, description = "Conversation deleted"),
        (status = 404, description = "Conversation not found", body = FailureBody)
    ),
    security(("bearer" = []))
)]
pub async fn delete_conversation_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Option<()>> {
    app_state
        .dispatcher
        .delete_conversation(conversation_id, user.user_id)
        .await?;
    Ok(ApiResponse::with_message("Chat deleted successfully", None))
}

/// Report the caller's usage counters and limits. Consumes no quota.
#[utoipa::path(
    get,
    path = "/usage",
    responses(
        (status = 200, description = "Current usage", body = UsageData)
    ),
    security(("bearer" = []))
)]
pub async fn usage_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<UsageData> {
    let report = app_state.dispatcher.usage_report(user.user_id).await?;
    Ok(ApiResponse::ok(UsageData::from(report)))
}

/// Run a one-shot analysis of a stored document.
///
/// Consumes one request unit; plagiarism checks also consume a plagiarism unit.
#[utoipa::path(
    post,
    path = "/analysis/document",
    request_body = AnalyzeDocumentBody,
    responses(
        (status = 200, description = "Analysis produced (or the fallback text on provider failure)", body = AnalysisData),
        (status = 403, description = "Document belongs to another user", body = FailureBody),
        (status = 404, description = "Document not found", body = FailureBody),
        (status = 429, description = "Monthly limit reached", body = FailureBody)
    ),
    security(("bearer" = []))
)]
pub async fn analyze_document_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<AnalyzeDocumentBody>,
) -> ApiResult<AnalysisData> {
    let analysis_type = parse_analysis_type(body.analysis_type.as_deref())?;
    let dispatcher = app_state.dispatcher.clone();
    let reply = detached(async move {
        dispatcher
            .analyze_document(&user, body.document_id, analysis_type, Origin::Request)
            .await
    })
    .await?;
    Ok(ApiResponse::ok(AnalysisData::from(reply)))
}

/// Check pasted text for originality issues.
///
/// Consumes one request unit and one plagiarism-check unit.
#[utoipa::path(
    post,
    path = "/analysis/plagiarism",
    request_body = AnalyzeTextBody,
    responses(
        (status = 200, description = "Plagiarism check completed", body = AnalysisData),
        (status = 400, description = "Text shorter than 10 or longer than 10000 characters", body = FailureBody),
        (status = 429, description = "Monthly limit reached", body = FailureBody)
    ),
    security(("bearer" = []))
)]
pub async fn plagiarism_check_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<AnalyzeTextBody>,
) -> ApiResult<AnalysisData> {
    analyze_text(app_state, user, body, AnalysisType::Plagiarism, "Plagiarism check completed").await
}

/// Check pasted text for grammar, spelling and style issues.
///
/// Consumes one request unit.
#[utoipa::path(
    post,
    path = "/analysis/grammar",
    request_body = AnalyzeTextBody,
    responses(
        (status = 200, description = "Grammar check completed", body = AnalysisData),
        (status = 400, description = "Text shorter than 10 or longer than 10000 characters", body = FailureBody),
        (status = 429, description = "Monthly limit reached", body = FailureBody)
    ),
    security(("bearer" = []))
)]
pub async fn grammar_check_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<AnalyzeTextBody>,
) -> ApiResult<AnalysisData> {
    analyze_text(app_state, user, body, AnalysisType::Grammar, "Grammar check completed").await
}

async fn analyze_text(
    app_state: Arc<AppState>,
    user: AuthenticatedUser,
    body: AnalyzeTextBody,
    analysis_type: AnalysisType,
    message: &str,
) -> ApiResult<AnalysisData> {
    let dispatcher = app_state.dispatcher.clone();
    let reply = detached(async move {
        dispatcher
            .analyze_text(&user, &body.text, analysis_type, Origin::Request)
            .await
    })
    .await?;
    Ok(ApiResponse::with_message(message, AnalysisData::from(reply)))
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn quota_failure_is_429_with_usage_data() {
        let reset_date = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let response = ApiFailure(DispatchError::QuotaExceeded {
            current_usage: 50,
            limit: 50,
            reset_date,
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["data"]["currentUsage"], 50);
        assert_eq!(body["data"]["resetDate"], "2024-07-01T00:00:00Z");
    }

    #[tokio::test]
    async fn internal_failure_hides_details() {
        let response = ApiFailure(DispatchError::Internal("connection refused".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Internal server error");
        assert!(body.get("data").is_none());
    }

    #[test]
    fn status_codes_follow_the_error_kind() {
        let cases = [
            (DispatchError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (DispatchError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (DispatchError::Validation("x".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(ApiFailure(err).into_response().status(), status);
        }
    }
}
