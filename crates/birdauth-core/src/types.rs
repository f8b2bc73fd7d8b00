//! ============================================================================
//! Core Types for the Birdauth Session
//! ============================================================================
//! Token records, session states and the error taxonomy shared by the PKCE
//! generator, redirect handler, token client, credential store and the
//! session manager.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds before declared expiry at which a refresh becomes due.
/// Covers clock skew plus in-flight request latency.
pub const REFRESH_SAFETY_MARGIN_SECS: i64 = 600;

/// Access token lifetime assumed when the provider does not declare one.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 7200;

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of the single user session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No tokens and no login in progress
    #[default]
    Unauthenticated,
    /// An authorization request is outstanding
    Authorizing,
    /// Tokens are cached and persisted
    Authorized,
    /// A refresh call is in flight
    Refreshing,
    /// Logout in progress; behaves like Unauthenticated
    Revoked,
}

impl SessionState {
    /// True when a bearer token can be served (possibly after a refresh)
    pub fn has_session(&self) -> bool {
        matches!(self, SessionState::Authorized | SessionState::Refreshing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authorizing => "authorizing",
            SessionState::Authorized => "authorized",
            SessionState::Refreshing => "refreshing",
            SessionState::Revoked => "revoked",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tokens
// ============================================================================

/// Raw result of a token endpoint call, before the session stamps it
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the provider did not rotate the refresh token
    pub refresh_token: Option<String>,
    /// Provider-declared lifetime in seconds
    pub expires_in: Option<i64>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Access/refresh token pair held by an authorized session.
/// Both tokens are always present together.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp (seconds) when the pair was obtained
    pub obtained_at: i64,
    /// Lifetime of the access token in seconds
    pub expires_in: i64,
}

impl TokenSet {
    /// Build a token set from a grant obtained at `now`.
    /// `previous_refresh` is kept when the grant does not rotate it.
    pub fn from_grant(
        grant: TokenGrant,
        previous_refresh: Option<&str>,
        now: i64,
        default_expires_in: i64,
    ) -> Option<Self> {
        let refresh_token = grant
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string))?;

        Some(Self {
            access_token: grant.access_token,
            refresh_token,
            obtained_at: now,
            expires_in: grant
                .expires_in
                .filter(|secs| *secs > 0)
                .unwrap_or(default_expires_in),
        })
    }

    /// Unix timestamp at which the access token expires
    pub fn expires_at(&self) -> i64 {
        self.obtained_at.saturating_add(self.expires_in)
    }

    /// Refresh is due once `now - obtained_at >= expires_in - safety margin`
    pub fn is_refresh_due(&self, now: i64) -> bool {
        now.saturating_sub(self.obtained_at) >= self.expires_in - REFRESH_SAFETY_MARGIN_SECS
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Which token a revocation request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTypeHint {
    AccessToken,
    RefreshToken,
}

impl TokenTypeHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenTypeHint::AccessToken => "access_token",
            TokenTypeHint::RefreshToken => "refresh_token",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failures of the token endpoint calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Transport failure, timeout or transient provider status. Retriable.
    #[error("Network error: {0}")]
    Network(String),

    /// Authorization code or refresh token rejected. Forces re-login.
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// Malformed or unexpected provider response
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TokenError {
    /// Only transport-level failures may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, TokenError::Network(_))
    }
}

/// Failures validating the authorization redirect
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("State mismatch - possible CSRF attack")]
    StateMismatch,

    #[error("No authorization code in callback")]
    MissingCode,

    #[error("Authorization denied: {error} - {description}")]
    AuthorizationDenied { error: String, description: String },
}

/// Failures of the durable credential storage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt credential record: {0}")]
    Corrupt(String),
}

/// Errors returned by the session manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Not authenticated - login required")]
    NotAuthenticated,

    #[error("No pending authorization request")]
    NoPendingRequest,

    #[error("Already authenticated - logout first")]
    AlreadyAuthenticated,

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// True when the user has to run the login flow again
    pub fn requires_login(&self) -> bool {
        match self {
            AuthError::NotAuthenticated
            | AuthError::NoPendingRequest
            | AuthError::Callback(_)
            | AuthError::Token(TokenError::InvalidGrant(_)) => true,
            AuthError::AlreadyAuthenticated
            | AuthError::Token(_)
            | AuthError::Store(_) => false,
        }
    }

    /// True when repeating the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Token(e) if e.is_retryable())
    }
}
