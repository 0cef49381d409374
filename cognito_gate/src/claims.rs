//! Decoded token claims
//!
//! Registered claims are decoded into typed fields. Every other claim is
//! decoded into a [`ClaimValue`], so that a claim of an unexpected shape is
//! something the caller can inspect and reject rather than a decoding
//! failure or a panic.

use std::{collections::BTreeMap, fmt};

use aliri::jwt;
use aliri_clock::UnixTime;
use serde::{Deserialize, Serialize};

/// Name of the claim distinguishing access tokens from ID tokens
pub const TOKEN_USE: &str = "token_use";

/// Name of the claim listing the groups the subject belongs to
pub const GROUPS: &str = "cognito:groups";

/// A single non-registered claim value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimValue {
    /// A string
    String(String),
    /// A number
    Number(serde_json::Number),
    /// A boolean
    Bool(bool),
    /// A list made up entirely of strings
    StringList(Vec<String>),
    /// Any other JSON value, such as an object or a mixed list
    Other(serde_json::Value),
}

impl ClaimValue {
    /// The value as a string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a list of strings, if it is one
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(l) => Some(l),
            _ => None,
        }
    }

    /// A short name for the kind of value held
    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Bool(_) => "boolean",
            Self::StringList(_) => "list of strings",
            Self::Other(serde_json::Value::Array(_)) => "list",
            Self::Other(serde_json::Value::Object(_)) => "object",
            Self::Other(serde_json::Value::Null) => "null",
            Self::Other(_) => "value",
        }
    }
}

impl fmt::Display for ClaimValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// The verified payload of a token
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<jwt::Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<jwt::Issuer>,
    #[serde(default, skip_serializing_if = "jwt::Audiences::is_empty")]
    aud: jwt::Audiences,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<UnixTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nbf: Option<UnixTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<UnixTime>,
    #[serde(flatten)]
    other: BTreeMap<String, ClaimValue>,
}

impl Claims {
    /// Time at which the token was issued
    pub fn iat(&self) -> Option<UnixTime> {
        self.iat
    }

    /// Looks up a non-registered claim by name
    pub fn get(&self, name: &str) -> Option<&ClaimValue> {
        self.other.get(name)
    }

    /// Iterates over all non-registered claims
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClaimValue)> {
        self.other.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The `token_use` claim, `"access"` or `"id"` for Cognito tokens
    pub fn token_use(&self) -> Option<&ClaimValue> {
        self.get(TOKEN_USE)
    }

    /// The `cognito:groups` claim
    pub fn groups(&self) -> Option<&ClaimValue> {
        self.get(GROUPS)
    }

    /// The user name of the subject
    ///
    /// Access tokens carry it as `username`, ID tokens as `cognito:username`.
    pub fn username(&self) -> Option<&str> {
        self.get("username")
            .or_else(|| self.get("cognito:username"))
            .and_then(ClaimValue::as_str)
    }

    /// The app client the token was issued to
    pub fn client_id(&self) -> Option<&str> {
        self.get("client_id").and_then(ClaimValue::as_str)
    }

    /// The space-delimited OAuth2 scopes granted to the token
    pub fn scope(&self) -> impl Iterator<Item = &str> {
        self.get("scope")
            .and_then(ClaimValue::as_str)
            .unwrap_or_default()
            .split_whitespace()
    }
}

impl jwt::CoreClaims for Claims {
    fn nbf(&self) -> Option<UnixTime> {
        self.nbf
    }

    fn exp(&self) -> Option<UnixTime> {
        self.exp
    }

    fn aud(&self) -> &jwt::Audiences {
        &self.aud
    }

    fn iss(&self) -> Option<&jwt::IssuerRef> {
        self.iss.as_deref()
    }

    fn sub(&self) -> Option<&jwt::SubjectRef> {
        self.sub.as_deref()
    }
}
