use std::{env, time::Duration};

use aliri::{jwa, jwt};
use serde::Deserialize;
use thiserror::Error;

use crate::TokenValidator;

const DEFAULT_MIN_REFRESH_SECS: u64 = 15 * 60;
const DEFAULT_CLOCK_SKEW_SECS: u64 = 1;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// A configuration value could not be read from the environment
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable was not set
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    /// A variable was set to something that could not be parsed
    #[error("environment variable {name} has an invalid value: {value:?}")]
    Invalid {
        /// The variable name
        name: &'static str,
        /// The offending value
        value: String,
    },
}

/// Construction-time settings for one Cognito user pool
///
/// Durations are expressed in whole seconds when deserialized.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserPoolConfig {
    /// AWS region hosting the user pool, e.g. `eu-west-1`
    pub region: String,
    /// The user pool identifier, e.g. `eu-west-1_xxR9l9k82`
    pub user_pool_id: String,
    /// Minimum time between two fetches of the key set
    #[serde(default = "default_min_refresh", with = "secs")]
    pub min_refresh_interval: Duration,
    /// Tolerated clock disagreement when checking `exp` and `nbf`
    #[serde(default = "default_clock_skew", with = "secs")]
    pub clock_skew: Duration,
    /// Timeout applied to each key set request
    #[serde(default = "default_request_timeout", with = "secs")]
    pub request_timeout: Duration,
    /// Overrides the key set URL derived from the region and pool
    #[serde(default)]
    pub jwks_url: Option<String>,
    /// Overrides the issuer derived from the region and pool
    #[serde(default)]
    pub issuer: Option<String>,
}

fn default_min_refresh() -> Duration {
    Duration::from_secs(DEFAULT_MIN_REFRESH_SECS)
}

fn default_clock_skew() -> Duration {
    Duration::from_secs(DEFAULT_CLOCK_SKEW_SECS)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl UserPoolConfig {
    /// Settings for a user pool with all defaults applied
    pub fn new(region: impl Into<String>, user_pool_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            user_pool_id: user_pool_id.into(),
            min_refresh_interval: default_min_refresh(),
            clock_skew: default_clock_skew(),
            request_timeout: default_request_timeout(),
            jwks_url: None,
            issuer: None,
        }
    }

    /// Reads settings from the process environment
    ///
    /// `AWS_REGION` and `AWS_COGNITO_POOL_ID` are required.
    /// `COGNITO_JWKS_MIN_REFRESH_SECS`, `COGNITO_CLOCK_SKEW_SECS`, and
    /// `COGNITO_JWKS_URL` are optional.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a numeric
    /// variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name| lookup(name).ok_or(ConfigError::Missing(name));
        let seconds = |name| -> Result<Option<Duration>, ConfigError> {
            lookup(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| ConfigError::Invalid { name, value })
                })
                .transpose()
        };

        let mut config = Self::new(required("AWS_REGION")?, required("AWS_COGNITO_POOL_ID")?);

        if let Some(interval) = seconds("COGNITO_JWKS_MIN_REFRESH_SECS")? {
            config.min_refresh_interval = interval;
        }
        if let Some(skew) = seconds("COGNITO_CLOCK_SKEW_SECS")? {
            config.clock_skew = skew;
        }
        config.jwks_url = lookup("COGNITO_JWKS_URL");

        Ok(config)
    }

    /// Sets the minimum interval between key set refreshes
    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Sets the clock skew tolerance
    #[must_use]
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Fetches the key set from `url` instead of the Cognito endpoint
    #[must_use]
    pub fn with_jwks_url(mut self, url: impl Into<String>) -> Self {
        self.jwks_url = Some(url.into());
        self
    }

    /// The issuer URL of the user pool
    pub fn issuer(&self) -> String {
        self.issuer.clone().unwrap_or_else(|| {
            format!(
                "https://cognito-idp.{}.amazonaws.com/{}",
                self.region, self.user_pool_id
            )
        })
    }

    /// The well-known URL at which the user pool publishes its signing keys
    pub fn jwks_url(&self) -> String {
        self.jwks_url.clone().unwrap_or_else(|| {
            format!(
                "https://cognito-idp.{}.amazonaws.com/{}/.well-known/jwks.json",
                self.region, self.user_pool_id
            )
        })
    }

    /// A token validator that accepts `RS256` tokens from this user pool
    pub fn validator(&self) -> TokenValidator {
        TokenValidator::new()
            .with_clock_skew(self.clock_skew)
            .add_approved_algorithm(jwa::Algorithm::RS256)
            .require_issuer(jwt::Issuer::new(self.issuer()))
    }
}
