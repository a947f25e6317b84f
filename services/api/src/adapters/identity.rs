//! services/api/src/adapters/identity.rs
//!
//! This module contains the adapter for bearer credential verification.
//! It implements the `IdentityService` port from the `core` crate using HS256 JWTs.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use research_assistant_core::{
    domain::{AuthenticatedUser, SubscriptionTier},
    ports::{IdentityService, PortError, PortResult},
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// The claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Subscription tier; absent means free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// Verifies tokens issued by the identity provider with a shared secret.
#[derive(Clone)]
pub struct JwtIdentityAdapter {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityAdapter {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

//=========================================================================================
// `IdentityService` Trait Implementation
//=========================================================================================

#[async_trait]
impl IdentityService for JwtIdentityAdapter {
    async fn authenticate(&self, credential: &str) -> PortResult<AuthenticatedUser> {
        let token = decode::<AccessClaims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "Rejected bearer token");
                PortError::Unauthorized
            })?;

        let user_id = Uuid::parse_str(&token.claims.sub).map_err(|_| PortError::Unauthorized)?;
        let tier = match token.claims.tier.as_deref() {
            None => SubscriptionTier::Free,
            Some(raw) => SubscriptionTier::parse(raw).ok_or(PortError::Unauthorized)?,
        };

        Ok(AuthenticatedUser { user_id, tier })
    }
}
