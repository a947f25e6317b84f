//! Common test utilities for the api integration tests.
#![allow(dead_code)]

use api_lib::adapters::identity::AccessClaims;
use api_lib::adapters::{InMemoryDatabase, JwtIdentityAdapter};
use api_lib::chat::{ChannelDispatcher, ConnectionHub};
use api_lib::config::{ChatSettings, QuotaLimits};
use api_lib::web::{self, AppState};
use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use research_assistant_core::domain::{AuthenticatedUser, SubscriptionTier};
use research_assistant_core::ports::{
    DatabaseService, GeneratedText, PortError, PortResult, Prompt, TextGenerationService,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-test-secret";
pub const SCRIPTED_REPLY: &str = "Start with a clear research question.";
pub const SCRIPTED_TOKENS: u32 = 17;

/// Provider deadline used by the harness.
pub const GENERATION_TIMEOUT: Duration = Duration::from_millis(500);

/// How long `Script::Slow` takes to answer, well inside the deadline.
pub const SLOW_ANSWER: Duration = Duration::from_millis(150);

/// How the scripted provider answers.
#[derive(Clone, Copy, Debug)]
pub enum Script {
    Answer,
    /// Answers after `SLOW_ANSWER`.
    Slow,
    Fail,
    /// Never answers within the harness timeout.
    Hang,
}

/// A generation provider that follows a fixed script and counts its calls.
pub struct ScriptedGenerator {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerationService for ScriptedGenerator {
    async fn generate(&self, _prompt: &Prompt) -> PortResult<GeneratedText> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Answer => Ok(GeneratedText {
                text: SCRIPTED_REPLY.to_string(),
                token_count: SCRIPTED_TOKENS,
                model: "scripted".to_string(),
            }),
            Script::Slow => {
                tokio::time::sleep(SLOW_ANSWER).await;
                Ok(GeneratedText {
                    text: SCRIPTED_REPLY.to_string(),
                    token_count: SCRIPTED_TOKENS,
                    model: "scripted".to_string(),
                })
            }
            Script::Fail => Err(PortError::Unexpected("provider exploded".to_string())),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(PortError::Unexpected("unreachable".to_string()))
            }
        }
    }
}

pub struct Harness {
    pub db: Arc<InMemoryDatabase>,
    pub generator: Arc<ScriptedGenerator>,
    pub dispatcher: Arc<ChannelDispatcher>,
}

pub fn harness(script: Script) -> Harness {
    let db = Arc::new(InMemoryDatabase::new());
    let generator = Arc::new(ScriptedGenerator::new(script));
    let settings = ChatSettings {
        generation_timeout: GENERATION_TIMEOUT,
        ..ChatSettings::default()
    };
    let dispatcher = Arc::new(ChannelDispatcher::new(
        db.clone(),
        db.clone(),
        generator.clone(),
        Arc::new(ConnectionHub::default()),
        QuotaLimits::default(),
        settings,
    ));
    Harness {
        db,
        generator,
        dispatcher,
    }
}

impl Harness {
    pub async fn user(&self, tier: SubscriptionTier) -> AuthenticatedUser {
        let user_id = Uuid::new_v4();
        self.db.get_or_create_user(user_id, tier).await.unwrap();
        AuthenticatedUser { user_id, tier }
    }

    /// The full router, wired the way the server binary wires it.
    pub fn app(&self) -> Router {
        web::router(Arc::new(AppState {
            db: self.db.clone(),
            identity: Arc::new(JwtIdentityAdapter::new(JWT_SECRET)),
            dispatcher: self.dispatcher.clone(),
        }))
    }
}

/// A bearer token the harness' identity adapter accepts.
pub fn bearer(user: &AuthenticatedUser) -> String {
    let claims = AccessClaims {
        sub: user.user_id.to_string(),
        tier: Some(user.tier.as_str().to_string()),
        exp: (Utc::now() + chrono::Duration::hours(1)).timestamp(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}
