//! ============================================================================
//! Token Client - Code exchange, refresh and revocation
//! ============================================================================
//! Talks to the provider token and revocation endpoints with form-encoded
//! POSTs. Failures are classified so the session knows whether a retry can
//! help (Network) or the user must log in again (InvalidGrant).
//! ============================================================================

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::pkce::PkceParameters;
use crate::config::OAuthConfig;
use crate::types::{TokenError, TokenGrant, TokenTypeHint};

/// Provider token operations used by the session manager
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange an authorization code for a token pair
    async fn exchange(
        &self,
        code: &str,
        pkce: &PkceParameters,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenError>;

    /// Obtain a new access token with a refresh token
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError>;

    /// Revoke a token. Unknown tokens count as revoked.
    async fn revoke(&self, token: &str, hint: TokenTypeHint) -> Result<(), TokenError>;
}

/// Token endpoint client for Twitter OAuth 2.0
pub struct TwitterTokenClient {
    config: OAuthConfig,
    client: Client,
}

impl TwitterTokenClient {
    /// Create a client whose requests are bounded by `config.request_timeout`
    pub fn new(config: OAuthConfig) -> Result<Self, TokenError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TokenError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Confidential clients authenticate with HTTP Basic credentials
    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.client_secret {
            Some(secret) => request.basic_auth(&self.config.client_id, Some(secret)),
            None => request,
        }
    }

    async fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<(StatusCode, String), TokenError> {
        let response = self
            .authenticate(self.client.post(url))
            .form(params)
            .send()
            .await
            .map_err(|e| TokenError::Network(describe_transport_error(&e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenError::Network(describe_transport_error(&e)))?;

        Ok((status, body))
    }

    async fn request_tokens(&self, params: &[(&str, &str)]) -> Result<TokenGrant, TokenError> {
        let (status, body) = self.post_form(&self.config.token_url, params).await?;

        if !status.is_success() {
            let err = classify_failure(status, &body);
            error!("Token request failed: {} - {}", status, err);
            return Err(err);
        }

        parse_token_response(&body)
    }
}

#[async_trait]
impl TokenEndpoint for TwitterTokenClient {
    async fn exchange(
        &self,
        code: &str,
        pkce: &PkceParameters,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenError> {
        info!("Exchanging authorization code for tokens");

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", pkce.code_verifier.as_str()),
        ];

        let grant = self.request_tokens(&params).await?;
        if grant.refresh_token.as_deref().unwrap_or_default().is_empty() {
            return Err(TokenError::Protocol(
                "Token response has no refresh_token (is offline.access granted?)".to_string(),
            ));
        }

        info!(
            "Successfully obtained tokens, expires in {:?} seconds",
            grant.expires_in
        );
        Ok(grant)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError> {
        info!("Refreshing access token");

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];

        let grant = self.request_tokens(&params).await?;
        info!("Successfully refreshed tokens");
        Ok(grant)
    }

    async fn revoke(&self, token: &str, hint: TokenTypeHint) -> Result<(), TokenError> {
        debug!("Revoking {}", hint.as_str());

        let params = [
            ("token", token),
            ("token_type_hint", hint.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];

        let (status, body) = self.post_form(&self.config.revoke_url, &params).await?;

        if status.is_success() || is_token_not_found(status, &body) {
            debug!("Revoked {} ({})", hint.as_str(), status);
            return Ok(());
        }

        let err = classify_failure(status, &body);
        warn!("Token revocation failed: {} - {}", status, err);
        Err(err)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// Parse a successful token endpoint body
pub(crate) fn parse_token_response(body: &str) -> Result<TokenGrant, TokenError> {
    let response: TokenResponse = serde_json::from_str(body)
        .map_err(|e| TokenError::Protocol(format!("Failed to parse token response: {}", e)))?;

    if let Some(token_type) = &response.token_type {
        if !token_type.eq_ignore_ascii_case("bearer") {
            return Err(TokenError::Protocol(format!(
                "Unsupported token_type: {}",
                token_type
            )));
        }
    }

    let access_token = response
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TokenError::Protocol("Token response has no access_token".to_string()))?;

    Ok(TokenGrant {
        access_token,
        refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
        expires_in: response.expires_in,
    })
}

/// Map a non-success status to the error taxonomy
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> TokenError {
    let detail = describe_error_body(body);

    match status.as_u16() {
        408 | 429 => TokenError::Network(format!("{}: {}", status, detail)),
        // Client misconfiguration; the grant itself was never judged
        400 | 401 | 403 if is_client_error_code(body) => {
            TokenError::Protocol(format!("Client rejected ({}): {}", status, detail))
        }
        400 | 401 | 403 => TokenError::InvalidGrant(detail),
        _ if status.is_server_error() => TokenError::Network(format!("{}: {}", status, detail)),
        _ => TokenError::Protocol(format!("Unexpected status {}: {}", status, detail)),
    }
}

fn is_client_error_code(body: &str) -> bool {
    matches!(
        serde_json::from_str::<ErrorResponse>(body),
        Ok(ErrorResponse { error: Some(code), .. })
            if matches!(code.as_str(), "invalid_client" | "unauthorized_client" | "unsupported_grant_type")
    )
}

fn is_token_not_found(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::NOT_FOUND {
        return true;
    }
    if status != StatusCode::BAD_REQUEST {
        return false;
    }
    let lower = body.to_lowercase();
    lower.contains("invalid_token") || lower.contains("not found")
}

fn describe_error_body(body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(ErrorResponse {
            error: Some(error),
            error_description,
        }) => match error_description {
            Some(desc) => format!("{} - {}", error, desc),
            None => error,
        },
        _ if body.trim().is_empty() => "empty response body".to_string(),
        _ => body.chars().take(200).collect(),
    }
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("Request timed out: {}", e)
    } else {
        format!("Request failed: {}", e)
    }
}
