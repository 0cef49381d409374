//! Bearer-token authentication and group authorization for services that
//! trust an AWS Cognito user pool
//!
//! The user pool publishes its signing keys as a JSON Web Key Set (JWKS) at a
//! well-known URL. A [`KeySetCache`] fetches that set once at start-up and
//! keeps it fresh in the background. Each inbound request is then checked by
//! a [`RequestGate`], which pulls the token out of the `Authorization` header,
//! verifies it with a [`TokenValidator`], and, if the route requires it,
//! checks the token's `cognito:groups` claim against a [`GroupPolicy`].
//!
//! ```no_run
//! use cognito_gate::{AuthDecision, GroupPolicy, KeySetCache, RequestGate, UserPoolConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UserPoolConfig::new("eu-west-1", "eu-west-1_xxR9l9k82");
//!
//! // Fails if the key set cannot be fetched; nothing can be verified without it.
//! let keys = KeySetCache::from_config(&config).await?;
//! let _refresh = keys.spawn_refresh();
//!
//! let gate = RequestGate::new(keys, config.validator());
//! let traffickers = GroupPolicy::require_any_of(["trafficker".parse()?]);
//!
//! match gate.gate(Some("Bearer eyJraWQiOi..."), &traffickers) {
//!     AuthDecision::Allowed { identity, .. } => println!("hello {:?}", identity.username()),
//!     AuthDecision::Denied { .. } => println!("401"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Feature flags
//!
//! `rustls-tls` (default) and `default-tls` select the TLS backend used by
//! `reqwest` when fetching the key set.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod claims;
mod config;
pub mod gate;
pub mod groups;
pub mod jwks;
pub mod validator;


pub use claims::{ClaimValue, Claims};
pub use config::{ConfigError, UserPoolConfig};
pub use gate::{AuthDecision, Authenticated, GateError, RequestGate};
pub use groups::{AuthorizationError, AuthorizedIdentity, Group, GroupPolicy};
pub use jwks::{KeySet, KeySetCache, KeySetUnavailable, RefreshFailed, RefreshTask};
pub use validator::{TokenValidator, ValidationError};
