//! Group-based authorization of verified tokens

use aliri::jwt::{self, CoreClaims};
use aliri_braid::braid;
use serde::Serialize;
use thiserror::Error;

use crate::{
    claims::{ClaimValue, GROUPS},
    Claims,
};

/// The `token_use` value carried by access tokens
const ACCESS: &str = "access";

/// An invalid group name
#[derive(Debug, Error)]
pub enum InvalidGroup {
    /// The group name was the empty string
    #[error("group name cannot be empty")]
    EmptyString,
}

impl From<std::convert::Infallible> for InvalidGroup {
    fn from(x: std::convert::Infallible) -> Self {
        match x {}
    }
}

/// The name of a user pool group
#[braid(
    serde,
    validator,
    ref_doc = "A borrowed reference to a user pool [`Group`]"
)]
pub struct Group;

impl aliri_braid::Validator for Group {
    type Error = InvalidGroup;

    fn validate(s: &str) -> Result<(), Self::Error> {
        if s.is_empty() {
            Err(InvalidGroup::EmptyString)
        } else {
            Ok(())
        }
    }
}

/// A token was verified but does not satisfy the group policy
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    /// The token has no `token_use` claim
    #[error("token has no token_use claim")]
    MissingTokenUseClaim,
    /// The token is not an access token
    #[error("token is not an access token")]
    WrongTokenType,
    /// The token has no `cognito:groups` claim
    #[error("token has no cognito:groups claim")]
    MissingGroupsClaim,
    /// A claim holds a value of an unexpected kind
    #[error("{claim} claim should be a {expected}, found a {found}")]
    TypeMismatch {
        /// The claim name
        claim: &'static str,
        /// The kind of value required
        expected: &'static str,
        /// The kind of value found
        found: &'static str,
    },
    /// The subject belongs to none of the required groups
    #[error("insufficient group membership")]
    InsufficientGroupMembership,
}

/// The caller a token was issued to, as far as the gate is concerned
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuthorizedIdentity {
    subject: Option<jwt::Subject>,
    username: Option<String>,
    groups: Vec<Group>,
}

impl AuthorizedIdentity {
    fn from_claims(claims: &Claims, groups: Vec<Group>) -> Self {
        Self {
            subject: claims.sub().map(ToOwned::to_owned),
            username: claims.username().map(ToOwned::to_owned),
            groups,
        }
    }

    /// The `sub` claim
    pub fn subject(&self) -> Option<&jwt::SubjectRef> {
        self.subject.as_deref()
    }

    /// The user name of the subject
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The groups listed in the token
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Whether the token lists `group`
    pub fn is_member_of(&self, group: &GroupRef) -> bool {
        self.groups.iter().any(|g| g.as_str() == group.as_str())
    }
}

/// A set of groups, membership in any one of which grants access
///
/// An empty policy grants access to any verified token without looking at
/// its `token_use` or group claims.
///
/// # Examples
///
/// ## Allow any verified token
/// ```
/// use cognito_gate::{Claims, GroupPolicy};
///
/// let policy = GroupPolicy::allow_any();
///
/// assert!(policy.authorize(&Claims::default()).is_ok());
/// ```
///
/// ## Require one of several groups
/// ```
/// use cognito_gate::{AuthorizationError, Claims, GroupPolicy};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let policy = GroupPolicy::require_any_of(["admin".parse()?, "trafficker".parse()?]);
///
/// let claims: Claims = serde_json::from_str(
///     r#"{ "token_use": "access", "cognito:groups": ["trafficker"] }"#,
/// )?;
/// assert!(policy.authorize(&claims).is_ok());
///
/// let claims: Claims = serde_json::from_str(
///     r#"{ "token_use": "access", "cognito:groups": ["viewer"] }"#,
/// )?;
/// assert_eq!(
///     policy.authorize(&claims).unwrap_err(),
///     AuthorizationError::InsufficientGroupMembership,
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct GroupPolicy {
    required: Vec<Group>,
}

impl GroupPolicy {
    /// A policy requiring no group membership
    pub const fn allow_any() -> Self {
        Self {
            required: Vec::new(),
        }
    }

    /// A policy requiring membership in at least one of `groups`
    pub fn require_any_of<I>(groups: I) -> Self
    where
        I: IntoIterator<Item = Group>,
    {
        Self {
            required: groups.into_iter().collect(),
        }
    }

    /// Adds an alternative group
    pub fn or_require(mut self, group: Group) -> Self {
        self.required.push(group);
        self
    }

    /// The groups, any one of which grants access
    pub fn required(&self) -> &[Group] {
        &self.required
    }

    /// Whether this policy grants access without any group membership
    pub fn is_open(&self) -> bool {
        self.required.is_empty()
    }

    /// Checks verified claims against this policy
    ///
    /// # Errors
    ///
    /// Returns the first requirement the claims fail to meet.
    pub fn authorize(&self, claims: &Claims) -> Result<AuthorizedIdentity, AuthorizationError> {
        if self.is_open() {
            let groups = claims
                .groups()
                .and_then(ClaimValue::as_string_list)
                .map(to_groups)
                .unwrap_or_default();
            return Ok(AuthorizedIdentity::from_claims(claims, groups));
        }

        match claims.token_use() {
            None => return Err(AuthorizationError::MissingTokenUseClaim),
            Some(value) if value.as_str() != Some(ACCESS) => {
                return Err(AuthorizationError::WrongTokenType)
            }
            Some(_) => {}
        }

        let held = match claims.groups() {
            None => return Err(AuthorizationError::MissingGroupsClaim),
            Some(ClaimValue::StringList(list)) => list,
            Some(other) => {
                return Err(AuthorizationError::TypeMismatch {
                    claim: GROUPS,
                    expected: "list of strings",
                    found: other.kind(),
                })
            }
        };

        let permitted = self
            .required
            .iter()
            .any(|r| held.iter().any(|h| h == r.as_str()));

        if permitted {
            Ok(AuthorizedIdentity::from_claims(claims, to_groups(held)))
        } else {
            Err(AuthorizationError::InsufficientGroupMembership)
        }
    }
}

fn to_groups(names: &[String]) -> Vec<Group> {
    names
        .iter()
        .filter_map(|n| Group::new(n.clone()).ok())
        .collect()
}
