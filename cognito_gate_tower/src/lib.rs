//! Authorizers for working with `tower_http` and other constructs in the
//! ecosystem, including `axum`, backed by a [`cognito_gate::RequestGate`].
//!
//! ```
//! # use aliri::{jwa, jwk, Jwk, Jwks};
//! # use aliri_base64::Base64UrlRef;
//! use axum::routing::get;
//! use cognito_gate::{KeySetCache, RequestGate, TokenValidator};
//! use cognito_gate_tower::CognitoAuthorizer;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! # // The key set might otherwise come from `KeySetCache::from_config`
//! # let secret = Base64UrlRef::from_slice(b"test").to_owned();
//! # let mut jwks = Jwks::default();
//! # jwks.add_key(
//! #     Jwk::from(jwa::Hmac::new(secret))
//! #         .with_algorithm(jwa::Algorithm::HS256)
//! #         .with_key_id(jwk::KeyId::from_static("test key")),
//! # );
//! let keys = KeySetCache::with_source(jwks, std::time::Duration::from_secs(900)).await?;
//! let validator = TokenValidator::new().add_approved_algorithm(jwa::Algorithm::HS256);
//! let authorizer = CognitoAuthorizer::new(RequestGate::new(keys, validator));
//!
//! let app: axum::Router = axum::Router::new()
//!     .route(
//!         "/traffic",
//!         get(handle_traffic).route_layer(authorizer.require_groups(["trafficker".parse()?])),
//!     )
//!     .route("/me", get(handle_me).route_layer(authorizer.layer()));
//! # Ok(())
//! # }
//! #
//! # async fn handle_traffic() {}
//! #
//! # async fn handle_me() {}
//! ```
//!
//! Requests that fail any check are answered with an empty
//! `401 Unauthorized`; the reason is only logged.

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

mod authorizer;
pub mod util;

pub use crate::authorizer::{CognitoAuthorizer, VerifyCognito};
