//! ============================================================================
//! Authorization Redirect - URL construction and callback validation
//! ============================================================================
//! Builds the provider authorize URL for an attempt and validates the
//! redirect the browser delivers back. State is verified before anything
//! else so a forged redirect never reaches the token endpoint.
//! ============================================================================

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use super::pkce::{ChallengeMethod, PkceParameters};
use crate::config::OAuthConfig;
use crate::types::CallbackError;

/// One outstanding login attempt
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Anti-CSRF nonce echoed back by the provider
    pub state: String,
    pub redirect_uri: String,
    pub scope: BTreeSet<String>,
    pub pkce: PkceParameters,
    /// Unix timestamp when the attempt started
    pub created_at: i64,
}

impl AuthorizationRequest {
    /// Start a new attempt with fresh state and PKCE parameters
    pub fn new(
        redirect_uri: impl Into<String>,
        scope: BTreeSet<String>,
        method: ChallengeMethod,
        now: i64,
    ) -> Self {
        Self {
            state: generate_state(),
            redirect_uri: redirect_uri.into(),
            scope,
            pkce: PkceParameters::generate(method),
            created_at: now,
        }
    }

    /// Whether the attempt has outlived `timeout_secs`
    pub fn is_expired(&self, now: i64, timeout_secs: i64) -> bool {
        now.saturating_sub(self.created_at) >= timeout_secs
    }
}

/// Generate a random state parameter for CSRF protection
pub fn generate_state() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Build the provider authorize URL for `req`
pub fn build_authorization_url(config: &OAuthConfig, req: &AuthorizationRequest) -> String {
    let scope = req.scope.iter().cloned().collect::<Vec<_>>().join(" ");

    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method={}",
        config.authorize_url,
        urlencoding::encode(&config.client_id),
        urlencoding::encode(&req.redirect_uri),
        urlencoding::encode(&scope),
        urlencoding::encode(&req.state),
        urlencoding::encode(&req.pkce.code_challenge),
        req.pkce.method.as_str(),
    )
}

/// Validate a redirect callback and extract the authorization code.
///
/// Accepts custom-scheme (`app://?code=..`) and loopback http URIs.
pub fn parse_callback(uri: &str, expected_state: &str) -> Result<String, CallbackError> {
    let params = query_params(uri);

    // Verify state to prevent CSRF
    let state = params.get("state").map(String::as_str).unwrap_or_default();
    if expected_state.is_empty() || !constant_time_eq(state.as_bytes(), expected_state.as_bytes()) {
        warn!("Callback state mismatch (present: {})", !state.is_empty());
        return Err(CallbackError::StateMismatch);
    }

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .cloned()
            .unwrap_or_else(|| "Unknown error".to_string());
        debug!("Provider returned authorization error: {}", error);
        return Err(CallbackError::AuthorizationDenied {
            error: error.clone(),
            description,
        });
    }

    match params.get("code") {
        Some(code) if !code.is_empty() => Ok(code.clone()),
        _ => Err(CallbackError::MissingCode),
    }
}

/// Decode the query component of `uri`, ignoring any fragment
fn query_params(uri: &str) -> HashMap<String, String> {
    let without_fragment = uri.split('#').next().unwrap_or_default();
    let query = match without_fragment.split_once('?') {
        Some((_, query)) => query,
        None => return HashMap::new(),
    };

    // First occurrence wins so a duplicated parameter cannot override it
    let mut params = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
