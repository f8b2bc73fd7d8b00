//! ============================================================================
//! Bookmarks Executor - Authorized reads via Twitter API v2
//! ============================================================================
//! Every request asks the session for a valid bearer token first, so the
//! token is refreshed transparently when it is close to expiry.
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::SessionManager;

/// Twitter API v2 base URL
pub const TWITTER_API_BASE: &str = "https://api.twitter.com";

/// Tweet as returned by the bookmarks endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    pub text: String,
}

/// One page of bookmarks
#[derive(Debug, Clone, Default, Serialize)]
pub struct BookmarksPage {
    pub tweets: Vec<Tweet>,
    pub next_token: Option<String>,
}

/// Executor for bookmark reads on behalf of the signed-in user
pub struct BookmarksExecutor {
    client: reqwest::Client,
    session: Arc<SessionManager>,
    api_base: String,
}

impl BookmarksExecutor {
    pub fn new(session: Arc<SessionManager>) -> Result<Self> {
        Self::with_base(session, TWITTER_API_BASE)
    }

    /// Point at a different API host. Requests share the session's
    /// provider-call timeout.
    pub fn with_base(session: Arc<SessionManager>, api_base: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(session.config().request_timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            session,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Numeric id of the authorized user
    pub async fn me(&self) -> Result<String> {
        let url = format!("{}/2/users/me", self.api_base);
        let response: UserResponse = self.get_json(&url, &[]).await?;
        debug!("Authorized as @{}", response.data.username);
        Ok(response.data.id)
    }

    /// Fetch one page of a user's bookmarks
    pub async fn fetch_bookmarks(
        &self,
        user_id: &str,
        max_results: u32,
        pagination_token: Option<&str>,
    ) -> Result<BookmarksPage> {
        info!("Fetching bookmarks for user {}", user_id);

        let url = format!("{}/2/users/{}/bookmarks", self.api_base, user_id);
        let max_results = max_results.clamp(1, 100).to_string();
        let mut query = vec![("max_results", max_results.as_str())];
        if let Some(token) = pagination_token {
            query.push(("pagination_token", token));
        }

        let response: BookmarksResponse = self.get_json(&url, &query).await?;
        let page = BookmarksPage {
            tweets: response.data,
            next_token: response.meta.and_then(|m| m.next_token),
        };

        info!("Fetched {} bookmarks", page.tweets.len());
        Ok(page)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let access_token = self
            .session
            .get_valid_access_token()
            .await
            .map_err(|e| anyhow!("No usable session: {}", e))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| anyhow!("Twitter API request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Twitter API error {}: {}", status, body));
        }

        response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse Twitter API response: {}", e))
    }
}

// ============================================================================
// Twitter API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct UserResponse {
    data: UserData,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct BookmarksResponse {
    #[serde(default)]
    data: Vec<Tweet>,
    meta: Option<BookmarksMeta>,
}

#[derive(Debug, Deserialize)]
struct BookmarksMeta {
    next_token: Option<String>,
}
