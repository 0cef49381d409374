//! The per-request allow/deny decision

use aliri::{Jwt, JwtRef};
use thiserror::Error;

use crate::{
    AuthorizationError, AuthorizedIdentity, Claims, GroupPolicy, KeySetCache, TokenValidator,
    ValidationError,
};

const BEARER_PREFIX: &str = "Bearer ";

/// Why a request was denied
///
/// The reason is meant for logs and the caller's own diagnostics. It should
/// not be rendered into a response, where it would let clients probe which
/// check their token fails.
#[derive(Debug, Error)]
pub enum GateError {
    /// The `Authorization` header is missing or is not a bearer credential
    #[error("missing or malformed authorization header")]
    InvalidAuthorizationHeader,
    /// The token failed verification
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The token was verified but does not satisfy the group policy
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
}

/// A request that passed the gate
#[derive(Clone, Debug)]
pub struct Authenticated {
    identity: AuthorizedIdentity,
    claims: Claims,
    token: Jwt,
}

impl Authenticated {
    /// The authorized caller
    pub fn identity(&self) -> &AuthorizedIdentity {
        &self.identity
    }

    /// All verified claims of the token
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// The raw token, for forwarding to downstream services
    pub fn token(&self) -> &JwtRef {
        &self.token
    }

    /// Splits into the identity, claims, and raw token
    pub fn into_parts(self) -> (AuthorizedIdentity, Claims, Jwt) {
        (self.identity, self.claims, self.token)
    }
}

/// The outcome of gating one request
#[derive(Debug)]
#[must_use]
pub enum AuthDecision {
    /// The request may proceed
    Allowed {
        /// The authorized caller
        identity: AuthorizedIdentity,
        /// The raw token
        token: Jwt,
    },
    /// The request must be answered with `401 Unauthorized`
    Denied {
        /// The internal reason, not to be shown to the caller
        reason: GateError,
    },
}

impl AuthDecision {
    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

impl From<Result<Authenticated, GateError>> for AuthDecision {
    fn from(result: Result<Authenticated, GateError>) -> Self {
        match result {
            Ok(Authenticated {
                identity, token, ..
            }) => Self::Allowed { identity, token },
            Err(reason) => Self::Denied { reason },
        }
    }
}

/// Authenticates and authorizes requests against one user pool
///
/// Cloning is cheap and clones share the same key set.
#[derive(Clone, Debug)]
pub struct RequestGate {
    keys: KeySetCache,
    validator: TokenValidator,
}

impl RequestGate {
    /// Gates requests using the keys in `keys` and the checks of `validator`
    pub fn new(keys: KeySetCache, validator: TokenValidator) -> Self {
        Self { keys, validator }
    }

    /// The key set the gate verifies against
    pub fn keys(&self) -> &KeySetCache {
        &self.keys
    }

    /// Decides whether a request bearing `authorization` may proceed
    ///
    /// Every failure becomes [`AuthDecision::Denied`]; nothing here panics
    /// or performs I/O on the request path.
    pub fn gate(&self, authorization: Option<&str>, policy: &GroupPolicy) -> AuthDecision {
        let result = self.authenticate(authorization, policy);

        match &result {
            Ok(authenticated) => tracing::trace!(
                subject = ?authenticated.identity.subject(),
                "request authorized"
            ),
            Err(reason) => {
                let error: &dyn std::error::Error = reason;
                tracing::debug!(error, "request denied");
            }
        }

        result.into()
    }

    /// Authenticates a request bearing `authorization`, keeping the verified
    /// claims
    ///
    /// # Errors
    ///
    /// Returns the first check the request fails.
    pub fn authenticate(
        &self,
        authorization: Option<&str>,
        policy: &GroupPolicy,
    ) -> Result<Authenticated, GateError> {
        let token = authorization
            .and_then(extract_bearer)
            .ok_or(GateError::InvalidAuthorizationHeader)?;

        let key_set = self.keys.current_key_set();
        let claims = self.validator.validate(token, &key_set)?;
        let identity = policy.authorize(&claims)?;

        Ok(Authenticated {
            identity,
            claims,
            token: token.to_owned(),
        })
    }
}

/// Strips the case-sensitive `Bearer ` prefix
///
/// At least one character must follow the prefix.
fn extract_bearer(authorization: &str) -> Option<&JwtRef> {
    authorization
        .strip_prefix(BEARER_PREFIX)
        .filter(|token| !token.is_empty())
        .map(JwtRef::from_str)
}
