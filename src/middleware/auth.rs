//! Authentication and authorization stages.
//!
//! [`Authenticate`] turns a bearer token into an [`Identity`];
//! [`Authorize`] checks that identity against the route's capability. Both
//! are no-ops on public routes.

use std::sync::Arc;

use super::{Flow, Stage};
use crate::auth::{Identity, TokenKeys};
use crate::error::ApiError;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::store::IdentityStore;

pub struct Authenticate {
    tokens: Arc<TokenKeys>,
    identities: Arc<dyn IdentityStore>,
}

impl Authenticate {
    pub fn new(tokens: Arc<TokenKeys>, identities: Arc<dyn IdentityStore>) -> Self {
        Self { tokens, identities }
    }

    async fn resolve(&self, req: &Request) -> Result<Identity, ApiError> {
        let token = bearer_token(req)?;
        let claims = self.tokens.verify(token)?;

        let user = self
            .identities
            .find_user(claims.sub)
            .await
            .map_err(|e| ApiError::internal(format!("identity lookup failed: {e}")))?
            .ok_or(ApiError::InvalidCredential)?;

        if !user.active {
            return Err(ApiError::InactiveAccount);
        }
        Ok(user.identity())
    }
}

impl Stage for Authenticate {
    fn name(&self) -> &'static str { "authenticate" }

    fn call<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Flow> {
        Box::pin(async move {
            if !req.capability().requires_identity() {
                return Flow::Continue;
            }
            match self.resolve(req).await {
                Ok(identity) => {
                    req.set_identity(identity);
                    Flow::Continue
                }
                Err(err) => {
                    tracing::debug!(path = req.path(), reason = %err, "authentication failed");
                    Flow::reject(err)
                }
            }
        })
    }
}

/// Extracts the token from `Authorization: Bearer <token>`.
fn bearer_token(req: &Request) -> Result<&str, ApiError> {
    let header = req.header("authorization").ok_or(ApiError::MissingCredential)?;
    let (scheme, token) = header.split_once(' ').ok_or(ApiError::InvalidCredential)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(ApiError::InvalidCredential);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::InvalidCredential);
    }
    Ok(token)
}

/// Role check against the route's capability.
pub struct Authorize;

impl Authorize {
    fn check(req: &Request) -> Result<(), ApiError> {
        let required = req.capability();
        if !required.requires_identity() {
            return Ok(());
        }
        let identity = req.identity().ok_or(ApiError::MissingCredential)?;
        if identity.role.satisfies(required) {
            Ok(())
        } else {
            Err(ApiError::InsufficientRole)
        }
    }
}

impl Stage for Authorize {
    fn name(&self) -> &'static str { "authorize" }

    fn call<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Flow> {
        let flow = match Self::check(req) {
            Ok(()) => Flow::Continue,
            Err(err) => {
                tracing::debug!(path = req.path(), reason = %err, "authorization failed");
                Flow::reject(err)
            }
        };
        Box::pin(std::future::ready(flow))
    }
}
