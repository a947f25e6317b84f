mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use common::{bearer, harness, Harness, Script, SCRIPTED_REPLY, SCRIPTED_TOKENS};
use http_body_util::BodyExt;
use research_assistant_core::domain::{
    AuthenticatedUser, Role, StatusEvent, SubscriptionTier, UsageCounters,
};
use research_assistant_core::ports::DatabaseService;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

async fn call(
    app: Router,
    method: Method,
    uri: &str,
    user: Option<&AuthenticatedUser>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("authorization", bearer(user));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn start_conversation(h: &Harness, user: &AuthenticatedUser, text: &str) -> String {
    let (status, body) = call(
        h.app(),
        Method::POST,
        "/chat/message",
        Some(user),
        Some(json!({ "message": text })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["conversationId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_needs_no_credential() {
    let h = harness(Script::Answer);
    let (status, body) = call(h.app(), Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn protected_routes_reject_missing_or_bad_tokens() {
    let h = harness(Script::Answer);
    let (status, _) = call(h.app(), Method::GET, "/usage", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/chat/history")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let response = h.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn query_token_is_ignored_outside_websocket_upgrades() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;
    let token = bearer(&user).trim_start_matches("Bearer ").to_string();

    let (status, _) = call(h.app(), Method::GET, &format!("/usage?token={}", token), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn send_message_returns_reply_envelope() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;

    let (status, body) = call(
        h.app(),
        Method::POST,
        "/chat/message",
        Some(&user),
        Some(json!({
            "message": "How should I frame my literature review?",
            "context": { "paperType": "review", "stage": "writing" }
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Message sent successfully");
    assert_eq!(body["data"]["response"], SCRIPTED_REPLY);
    assert_eq!(body["data"]["tokens"], SCRIPTED_TOKENS);
    assert_eq!(body["data"]["isError"], false);
    assert!(body["data"]["conversationId"].is_string());
}

#[tokio::test]
async fn invalid_context_hint_is_bad_request() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;

    let (status, body) = call(
        h.app(),
        Method::POST,
        "/chat/message",
        Some(&user),
        Some(json!({ "message": "hi", "context": { "stage": "procrastinating" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn exhausted_allowance_is_429_with_usage() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;
    let mut usage = UsageCounters::new(Utc::now());
    usage.monthly_requests = 50;
    h.db.set_usage(user.user_id, SubscriptionTier::Free, usage);

    let (status, body) = call(
        h.app(),
        Method::POST,
        "/chat/message",
        Some(&user),
        Some(json!({ "message": "one more please" })),
    )
    .await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);
    assert_eq!(body["data"]["currentUsage"], 50);
    assert_eq!(body["data"]["limit"], 50);
    assert!(body["data"]["resetDate"].is_string());
    assert_eq!(h.generator.calls(), 0);
}

#[tokio::test]
async fn history_lists_active_conversations_newest_first() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;
    let older = start_conversation(&h, &user, "first topic").await;
    let newer = start_conversation(&h, &user, "second topic").await;

    let (status, body) = call(h.app(), Method::GET, "/chat/history", Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"], newer.as_str());
    assert_eq!(items[1]["id"], older.as_str());
    assert_eq!(items[0]["messageCount"], 2);

    let (_, page) = call(h.app(), Method::GET, "/chat/history?page=2&limit=1", Some(&user), None).await;
    assert_eq!(page["data"].as_array().unwrap().len(), 1);
    assert_eq!(page["data"][0]["id"], older.as_str());
}

#[tokio::test]
async fn conversation_lifecycle_over_rest() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;
    let id = start_conversation(&h, &user, "Methods section feedback").await;
    let uri = format!("/chat/{}", id);

    let (status, body) = call(h.app(), Method::GET, &uri, Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["title"], "Methods section feedback");
    assert_eq!(body["data"]["messages"][0]["role"], "user");
    assert_eq!(body["data"]["messages"][1]["role"], "assistant");
    assert_eq!(body["data"]["messages"][1]["content"], SCRIPTED_REPLY);

    let (status, body) = call(
        h.app(),
        Method::PUT,
        &uri,
        Some(&user),
        Some(json!({ "title": "  Methods  " })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Chat updated successfully");
    assert_eq!(body["data"]["title"], "Methods");

    let (status, _) = call(
        h.app(),
        Method::PUT,
        &uri,
        Some(&user),
        Some(json!({ "title": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(h.app(), Method::GET, &format!("{}/context", uri), Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"]["context"],
        format!("user: Methods section feedback\n\nassistant: {}", SCRIPTED_REPLY)
    );

    let (status, body) = call(h.app(), Method::DELETE, &uri, Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Chat deleted successfully");
    assert!(body["data"].is_null());

    let (status, body) = call(h.app(), Method::DELETE, &uri, Some(&user), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = call(h.app(), Method::GET, &uri, Some(&user), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn another_users_conversation_is_hidden() {
    let h = harness(Script::Answer);
    let owner = h.user(SubscriptionTier::Free).await;
    let other = h.user(SubscriptionTier::Free).await;
    let id = start_conversation(&h, &owner, "mine").await;

    let (status, _) = call(h.app(), Method::GET, &format!("/chat/{}", id), Some(&other), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn usage_reports_counters_and_limits() {
    let h = harness(Script::Answer);
    let free = h.user(SubscriptionTier::Free).await;
    start_conversation(&h, &free, "count me").await;

    let (status, body) = call(h.app(), Method::GET, "/usage", Some(&free), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["tier"], "free");
    assert_eq!(body["data"]["monthlyRequests"], 1);
    assert_eq!(body["data"]["limits"]["requests"], 50);
    assert!(body["data"]["resetDate"].is_string());

    let premium = h.user(SubscriptionTier::Premium).await;
    let (_, body) = call(h.app(), Method::GET, "/usage", Some(&premium), None).await;
    assert_eq!(body["data"]["tier"], "premium");
    assert!(body["data"]["limits"]["requests"].is_null());
}

#[tokio::test]
async fn document_analysis_over_rest() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;
    let document_id = h.db.insert_document(user.user_id, "Draft", "Our results show...");

    let (status, body) = call(
        h.app(),
        Method::POST,
        "/analysis/document",
        Some(&user),
        Some(json!({ "documentId": document_id, "analysisType": "structure" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["analysisType"], "structure");
    assert_eq!(body["data"]["result"], SCRIPTED_REPLY);

    let (status, _) = call(
        h.app(),
        Method::POST,
        "/analysis/document",
        Some(&user),
        Some(json!({ "documentId": document_id, "analysisType": "vibes" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        h.app(),
        Method::POST,
        "/analysis/document",
        Some(&user),
        Some(json!({ "documentId": uuid::Uuid::new_v4() })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn client_hanging_up_mid_turn_still_records_the_reply() {
    let h = harness(Script::Slow);
    let user = h.user(SubscriptionTier::Free).await;
    let (_, mut sibling) = h.dispatcher.hub().register(user.user_id);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/chat/message")
        .header("authorization", bearer(&user))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "message": "hello there" }).to_string()))
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(50), h.app().oneshot(request)).await;
    assert!(outcome.is_err(), "the reply should still be generating");

    let Some(StatusEvent::ProcessingStarted { conversation_id }) = sibling.recv().await else {
        panic!("expected processing_started");
    };
    let stopped = tokio::time::timeout(Duration::from_secs(2), sibling.recv())
        .await
        .unwrap();
    assert_eq!(stopped, Some(StatusEvent::ProcessingStopped { conversation_id }));

    let conversation = h.db.get_conversation(conversation_id).await.unwrap();
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[0].content, "hello there");
    assert_eq!(conversation.messages[1].role, Role::Assistant);
    assert_eq!(conversation.messages[1].content, SCRIPTED_REPLY);
    assert_eq!(h.db.get_user(user.user_id).await.unwrap().usage.monthly_requests, 1);
}

#[tokio::test]
async fn pasted_text_checks_are_metered() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;
    let text = "Recent studies suggest that sleep improves memory consolidation.";

    let (status, body) = call(
        h.app(),
        Method::POST,
        "/analysis/plagiarism",
        Some(&user),
        Some(json!({ "text": text })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Plagiarism check completed");
    assert_eq!(body["data"]["analysisType"], "plagiarism");
    assert!(body["data"]["documentId"].is_null());
    assert_eq!(body["data"]["result"], SCRIPTED_REPLY);

    let (status, body) = call(
        h.app(),
        Method::POST,
        "/analysis/grammar",
        Some(&user),
        Some(json!({ "text": text })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["analysisType"], "grammar");

    let usage = h.db.get_user(user.user_id).await.unwrap().usage;
    assert_eq!(usage.monthly_requests, 2);
    assert_eq!(usage.plagiarism_checks, 1);
}

#[tokio::test]
async fn pasted_text_outside_bounds_is_bad_request() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;

    for text in ["short".to_string(), "z".repeat(10_001)] {
        let (status, body) = call(
            h.app(),
            Method::POST,
            "/analysis/grammar",
            Some(&user),
            Some(json!({ "text": text })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }
    assert_eq!(h.generator.calls(), 0);
}

#[tokio::test]
async fn plagiarism_allowance_is_separate_from_requests() {
    let h = harness(Script::Answer);
    let user = h.user(SubscriptionTier::Free).await;
    let mut usage = UsageCounters::new(Utc::now());
    usage.monthly_requests = 10;
    usage.plagiarism_checks = 5;
    h.db.set_usage(user.user_id, SubscriptionTier::Free, usage);

    let (status, body) = call(
        h.app(),
        Method::POST,
        "/analysis/plagiarism",
        Some(&user),
        Some(json!({ "text": "An entirely original paragraph of prose." })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["data"]["currentUsage"], 5);
    assert_eq!(h.db.get_user(user.user_id).await.unwrap().usage.monthly_requests, 10);
}
