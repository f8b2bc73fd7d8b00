//! ============================================================================
//! OAuth Configuration - Provider endpoints and client settings
//! ============================================================================
//! Defaults target the Twitter/X OAuth 2.0 endpoints. Every field can be
//! overridden from the environment (or a `.env` file) via `from_env`.
//! ============================================================================

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::debug;

use crate::auth::ChallengeMethod;
use crate::types::DEFAULT_EXPIRES_IN_SECS;

pub const TWITTER_AUTH_URL: &str = "https://twitter.com/i/oauth2/authorize";
pub const TWITTER_TOKEN_URL: &str = "https://api.twitter.com/2/oauth2/token";
pub const TWITTER_REVOKE_URL: &str = "https://api.twitter.com/2/oauth2/revoke";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:9876/callback";

/// Scopes needed for bookmark access with long-lived sessions
pub const DEFAULT_SCOPES: &str = "offline.access tweet.read users.read bookmark.read";

/// Bound on every provider call
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// How long an authorization request waits for its callback
pub const DEFAULT_AUTHORIZATION_TIMEOUT_SECS: i64 = 300;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set. Configure it in .env or the environment")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// OAuth 2.0 public/confidential client configuration
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Only set for confidential clients; sent as HTTP Basic credentials
    pub client_secret: Option<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub redirect_uri: String,
    pub scopes: BTreeSet<String>,
    pub challenge_method: ChallengeMethod,
    pub request_timeout: Duration,
    /// Seconds an outstanding authorization request stays valid
    pub authorization_timeout_secs: i64,
    /// Lifetime assumed when the provider omits `expires_in`
    pub default_expires_in: i64,
}

impl OAuthConfig {
    /// Twitter defaults for the given client
    pub fn twitter(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            authorize_url: TWITTER_AUTH_URL.to_string(),
            token_url: TWITTER_TOKEN_URL.to_string(),
            revoke_url: TWITTER_REVOKE_URL.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: parse_scopes(DEFAULT_SCOPES),
            challenge_method: ChallengeMethod::S256,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            authorization_timeout_secs: DEFAULT_AUTHORIZATION_TIMEOUT_SECS,
            default_expires_in: DEFAULT_EXPIRES_IN_SECS,
        }
    }

    /// Load from process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let client_id = get("TWITTER_CLIENT_ID").ok_or(ConfigError::Missing("TWITTER_CLIENT_ID"))?;
        let mut config = Self::twitter(client_id);

        config.client_secret = get("TWITTER_CLIENT_SECRET");

        if let Some(uri) = get("TWITTER_REDIRECT_URI") {
            config.redirect_uri = uri;
        }
        if let Some(url) = get("TWITTER_AUTH_URL") {
            config.authorize_url = url;
        }
        if let Some(url) = get("TWITTER_TOKEN_URL") {
            config.token_url = url;
        }
        if let Some(url) = get("TWITTER_REVOKE_URL") {
            config.revoke_url = url;
        }

        if let Some(scopes) = get("TWITTER_SCOPES") {
            config.scopes = parse_scopes(&scopes);
        }

        if let Some(method) = get("TWITTER_PKCE_METHOD") {
            config.challenge_method =
                ChallengeMethod::parse(&method).ok_or(ConfigError::Invalid {
                    var: "TWITTER_PKCE_METHOD",
                    value: method,
                })?;
        }

        if let Some(secs) = get("BIRDAUTH_HTTP_TIMEOUT_SECS") {
            let parsed = secs
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or(ConfigError::Invalid {
                    var: "BIRDAUTH_HTTP_TIMEOUT_SECS",
                    value: secs,
                })?;
            config.request_timeout = Duration::from_secs(parsed);
        }

        Ok(config)
    }

    /// Scopes joined with single spaces, as sent on the wire
    pub fn scope_string(&self) -> String {
        self.scopes.iter().cloned().collect::<Vec<_>>().join(" ")
    }
}

/// Split a space/comma separated scope list
pub fn parse_scopes(raw: &str) -> BTreeSet<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
