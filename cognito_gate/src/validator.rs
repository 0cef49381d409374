//! Verification of compact-serialized, signed tokens against a [`KeySet`]

use std::{fmt, sync::Arc, time::Duration};

use aliri::{
    error::{ClaimsRejected, JwtVerifyError},
    jwa,
    jwt::{self, CoreClaims, CoreHeaders, HasAlgorithm},
    JwtRef,
};
use aliri_clock::{Clock, System};
use thiserror::Error;

use crate::{jwks::KeySet, Claims};

const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(1);

/// A token failed verification
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The token is not three base64url segments with JSON header and payload,
    /// or names an unknown algorithm
    #[error("malformed token")]
    MalformedToken(#[source] JwtVerifyError),
    /// No trusted key matches the token, or the signature does not verify
    #[error("token signature is invalid")]
    SignatureInvalid,
    /// The `exp` claim lies in the past beyond the tolerated skew
    #[error("token expired")]
    TokenExpired,
    /// The `nbf` claim lies in the future beyond the tolerated skew
    #[error("token not yet valid")]
    TokenNotYetValid,
    /// Any other claim check failed, such as the issuer or algorithm
    #[error("token claims rejected")]
    ClaimsRejected(#[source] ClaimsRejected),
}

impl From<JwtVerifyError> for ValidationError {
    fn from(err: JwtVerifyError) -> Self {
        match err {
            JwtVerifyError::MalformedToken(_)
            | JwtVerifyError::MalformedTokenHeader(_)
            | JwtVerifyError::MalformedTokenPayload(_)
            | JwtVerifyError::MalformedTokenSignature(_) => Self::MalformedToken(err),
            JwtVerifyError::JwkVerifyError(_) | JwtVerifyError::Unexpected(_) => {
                Self::SignatureInvalid
            }
            JwtVerifyError::ClaimsRejected(rejected) => rejected.into(),
        }
    }
}

impl From<ClaimsRejected> for ValidationError {
    fn from(rejected: ClaimsRejected) -> Self {
        match rejected {
            ClaimsRejected::TokenExpired => Self::TokenExpired,
            ClaimsRejected::TokenNotYetValid => Self::TokenNotYetValid,
            other => Self::ClaimsRejected(other),
        }
    }
}

/// Checks `exp` and `nbf` against an injectable clock
///
/// `exp` is required; `nbf` is only checked when present.
struct Temporal<'a> {
    clock: &'a (dyn Clock + Send + Sync),
    skew: Duration,
}

impl<H> jwt::ClaimsValidator<Claims, H> for Temporal<'_> {
    fn validate(&self, _: &H, claims: &Claims) -> Result<(), ClaimsRejected> {
        let now = self.clock.now().0;
        let skew = self
            .skew
            .as_secs()
            .saturating_add(u64::from(self.skew.subsec_nanos() > 0));

        let exp = claims
            .exp()
            .ok_or(ClaimsRejected::MissingRequiredClaim("exp"))?;
        if exp.0 < now.saturating_sub(skew) {
            return Err(ClaimsRejected::TokenExpired);
        }

        if let Some(nbf) = claims.nbf() {
            if nbf.0 > now.saturating_add(skew) {
                return Err(ClaimsRejected::TokenNotYetValid);
            }
        }

        Ok(())
    }
}

/// Verifies signatures and time-based claims of presented tokens
///
/// The validator performs no I/O and holds no per-call state; one instance
/// can be shared across all requests.
#[derive(Clone)]
#[must_use]
pub struct TokenValidator {
    core: jwt::CoreValidator,
    approved_algorithms: Vec<jwa::Algorithm>,
    clock_skew: Duration,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("core", &self.core)
            .field("clock_skew", &self.clock_skew)
            .finish_non_exhaustive()
    }
}

impl Default for TokenValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenValidator {
    /// A validator with a one-second clock skew and no approved algorithms
    ///
    /// At least one algorithm must be approved before any token can pass.
    pub fn new() -> Self {
        Self {
            core: jwt::CoreValidator::default().ignore_expiration(),
            approved_algorithms: Vec::new(),
            clock_skew: DEFAULT_CLOCK_SKEW,
            clock: Arc::new(System),
        }
    }

    /// Tolerates clocks disagreeing by up to `skew` when checking `exp` and `nbf`
    ///
    /// Token times have whole-second precision, so a fractional skew is
    /// rounded up to the next second.
    pub fn with_clock_skew(self, skew: Duration) -> Self {
        Self {
            clock_skew: skew,
            ..self
        }
    }

    /// Accepts tokens signed with `alg`
    pub fn add_approved_algorithm(mut self, alg: jwa::Algorithm) -> Self {
        self.approved_algorithms.push(alg);
        self.core = self.core.add_approved_algorithm(alg);
        self
    }

    /// Rejects tokens whose `iss` claim is not `issuer`
    pub fn require_issuer(self, issuer: jwt::Issuer) -> Self {
        Self {
            core: self.core.require_issuer(issuer),
            ..self
        }
    }

    /// Reads the current time from `clock` instead of the system clock
    pub fn with_clock<C>(self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    /// The tolerated clock skew
    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    /// Verifies `token` against the keys in `key_set`
    ///
    /// The signature is verified before the payload is decoded, so nothing in
    /// the payload of a forged token is ever interpreted.
    ///
    /// # Errors
    ///
    /// Returns the first check the token fails.
    pub fn validate(&self, token: &JwtRef, key_set: &KeySet) -> Result<Claims, ValidationError> {
        let decomposed: jwt::Decomposed = token.decompose()?;

        let alg = decomposed.alg();
        if !self.approved_algorithms.contains(&alg) {
            tracing::debug!(%alg, "token algorithm not approved");
            return Err(ValidationError::ClaimsRejected(
                ClaimsRejected::InvalidAlgorithm,
            ));
        }

        let kid = decomposed.kid();
        let key = key_set.get_key(kid, alg).ok_or_else(|| {
            if let Some(kid) = kid {
                tracing::debug!(%kid, %alg, "unable to find matching key");
            } else {
                tracing::debug!(%alg, "unable to find matching key");
            }
            ValidationError::SignatureInvalid
        })?;

        let temporal = Temporal {
            clock: &*self.clock,
            skew: self.clock_skew,
        };
        let validated: jwt::Validated<Claims> =
            decomposed.verify_with_custom(key, &self.core, temporal)?;

        let (_, claims) = validated.extract();
        Ok(claims)
    }
}
