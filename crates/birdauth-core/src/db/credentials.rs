//! Maps the session token pair onto three key-value fields.

use std::sync::Arc;

use tracing::{debug, warn};

use super::KeyValueStore;
use crate::types::{StoreError, TokenSet};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const OBTAINED_AT_KEY: &str = "obtained_at";

/// The durable credential record as found in storage
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialSnapshot {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub obtained_at: Option<i64>,
}

impl CredentialSnapshot {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.obtained_at.is_none()
    }

    /// A complete record becomes a token set; anything partial is rejected.
    /// The lifetime is not persisted, so `expires_in` is supplied by the caller.
    pub fn into_token_set(self, expires_in: i64) -> Option<TokenSet> {
        match self {
            CredentialSnapshot {
                access_token: Some(access_token),
                refresh_token: Some(refresh_token),
                obtained_at: Some(obtained_at),
            } => Some(TokenSet {
                access_token,
                refresh_token,
                obtained_at,
                expires_in,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Debug for CredentialSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSnapshot")
            .field("access_token", &self.access_token.is_some())
            .field("refresh_token", &self.refresh_token.is_some())
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// Credential persistence on top of an injected key-value store
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Read whatever is persisted
    pub fn load(&self) -> Result<CredentialSnapshot, StoreError> {
        let obtained_at = match self.backend.get(OBTAINED_AT_KEY)? {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                StoreError::Corrupt(format!("{} is not a timestamp", OBTAINED_AT_KEY))
            })?),
            None => None,
        };

        Ok(CredentialSnapshot {
            access_token: self.backend.get(ACCESS_TOKEN_KEY)?.filter(|t| !t.is_empty()),
            refresh_token: self.backend.get(REFRESH_TOKEN_KEY)?.filter(|t| !t.is_empty()),
            obtained_at,
        })
    }

    /// Persist a token set in one write. On failure the previous record,
    /// if any, is left as it was.
    pub fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        let obtained_at = tokens.obtained_at.to_string();
        self.backend
            .set_many(&[
                (ACCESS_TOKEN_KEY, tokens.access_token.as_str()),
                (REFRESH_TOKEN_KEY, tokens.refresh_token.as_str()),
                (OBTAINED_AT_KEY, obtained_at.as_str()),
            ])
            .map_err(|e| {
                warn!("Credential write failed: {}", e);
                e
            })?;

        debug!("Persisted credentials (obtained_at {})", tokens.obtained_at);
        Ok(())
    }

    /// Remove all persisted fields
    pub fn clear(&self) -> Result<(), StoreError> {
        self.backend.clear()?;
        debug!("Cleared persisted credentials");
        Ok(())
    }
}
