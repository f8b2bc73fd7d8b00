//! ============================================================================
//! BIRDAUTH-CORE: Twitter OAuth 2.0 session lifecycle
//! ============================================================================
//! This crate handles the token lifecycle for a Twitter API client:
//! - PKCE authorization-code login with state validation
//! - Token exchange, proactive refresh and revocation
//! - Durable credential storage via redb
//! - Bookmark reads with an always-valid bearer token
//! ============================================================================

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod executor;
pub mod retry;
pub mod types;

// Re-export main types for convenience
pub use auth::{CallbackListener, SessionManager, TokenEndpoint, TwitterTokenClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OAuthConfig;
pub use db::{CredentialStore, KeyValueStore, MemoryStore, RedbStore};
pub use executor::BookmarksExecutor;
pub use retry::{retry_transient, RetryConfig};
pub use types::*;
