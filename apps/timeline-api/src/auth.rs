//! Caller identity from signed bearer tokens and connection tickets.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use timeline_protocol::{ActorType, ContextPatch, TimelineError, TimelineResult};
use tracing::debug;

pub const TOKEN_AUDIENCE: &str = "timeline";
pub const TICKET_AUDIENCE: &str = "timeline-ticket";

/// Claims carried by both tokens and tickets; they differ only in `aud`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub tenant_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    pub aud: String,
    pub exp: i64,
}

impl From<TimelineClaims> for ContextPatch {
    fn from(claims: TimelineClaims) -> Self {
        let actor_type = claims.sub.as_ref().map(|_| ActorType::Human);
        Self {
            tenant_id: Some(claims.tenant_id),
            project_id: Some(claims.project_id),
            mode: claims.mode,
            env: claims.env,
            actor_id: claims.sub,
            actor_type,
            ..Self::default()
        }
    }
}

pub trait ContextResolver: Send + Sync {
    fn resolve_ticket(&self, ticket: &str) -> TimelineResult<ContextPatch>;
    fn resolve_token(&self, token: &str) -> TimelineResult<ContextPatch>;
}

/// HS256 verifier for tokens and tickets signed with a shared secret.
#[derive(Clone)]
pub struct JwtContextResolver {
    decoding_key: DecodingKey,
}

impl JwtContextResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    fn verify(&self, raw: &str, audience: &str) -> TimelineResult<ContextPatch> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);

        let claims = decode::<TimelineClaims>(raw, &self.decoding_key, &validation)
            .map_err(|error| {
                TimelineError::protocol("invalid_token", format!("{audience} credential rejected: {error}"))
            })?
            .claims;
        debug!(tenant_id = %claims.tenant_id, audience, "credential verified");
        Ok(claims.into())
    }
}

impl ContextResolver for JwtContextResolver {
    fn resolve_ticket(&self, ticket: &str) -> TimelineResult<ContextPatch> {
        self.verify(ticket, TICKET_AUDIENCE)
    }

    fn resolve_token(&self, token: &str) -> TimelineResult<ContextPatch> {
        self.verify(token, TOKEN_AUDIENCE)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{SECRET, mint};
    use super::*;

    #[test]
    fn token_resolves_to_context_patch() {
        let resolver = JwtContextResolver::new(SECRET);
        let patch = resolver
            .resolve_token(&mint(TOKEN_AUDIENCE, "t_demo", "p1"))
            .unwrap();
        assert_eq!(patch.tenant_id.as_deref(), Some("t_demo"));
        assert_eq!(patch.project_id.as_deref(), Some("p1"));
        assert_eq!(patch.actor_id.as_deref(), Some("user-1"));
        assert_eq!(patch.env.as_deref(), Some("lab"));
    }

    #[test]
    fn ticket_is_not_accepted_as_token() {
        let resolver = JwtContextResolver::new(SECRET);
        let ticket = mint(TICKET_AUDIENCE, "t_demo", "p1");
        assert!(resolver.resolve_ticket(&ticket).is_ok());
        let err = resolver.resolve_token(&ticket).unwrap_err();
        assert_eq!(err.code(), "invalid_token");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let resolver = JwtContextResolver::new("another-secret");
        assert!(
            resolver
                .resolve_token(&mint(TOKEN_AUDIENCE, "t_demo", "p1"))
                .is_err()
        );
        assert!(resolver.resolve_token("not-a-jwt").is_err());
    }
}
