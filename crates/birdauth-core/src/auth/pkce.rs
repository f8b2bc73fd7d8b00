//! ============================================================================
//! PKCE - Proof Key for Code Exchange (RFC 7636)
//! ============================================================================
//! Generates the code verifier / code challenge pair bound to one
//! authorization attempt. No client secret is needed for public clients.
//! ============================================================================

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, Rng};
use sha2::{Digest, Sha256};

/// Unreserved characters allowed in a code verifier
const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Verifier length (RFC 7636 allows 43..=128)
pub const VERIFIER_LEN: usize = 64;

/// Code challenge derivation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChallengeMethod {
    Plain,
    #[default]
    S256,
}

impl ChallengeMethod {
    /// Wire value of `code_challenge_method`
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeMethod::Plain => "plain",
            ChallengeMethod::S256 => "S256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" => Some(ChallengeMethod::Plain),
            "s256" => Some(ChallengeMethod::S256),
            _ => None,
        }
    }
}

/// Verifier/challenge pair for a single authorization attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceParameters {
    pub code_verifier: String,
    pub code_challenge: String,
    pub method: ChallengeMethod,
}

impl PkceParameters {
    /// Generate a fresh random verifier and its challenge
    pub fn generate(method: ChallengeMethod) -> Self {
        let mut rng = OsRng;
        let verifier: String = (0..VERIFIER_LEN)
            .map(|_| VERIFIER_CHARSET[rng.gen_range(0..VERIFIER_CHARSET.len())] as char)
            .collect();

        Self::from_verifier(verifier, method)
    }

    /// Derive the challenge for a known verifier
    pub fn from_verifier(verifier: impl Into<String>, method: ChallengeMethod) -> Self {
        let code_verifier = verifier.into();
        let code_challenge = match method {
            ChallengeMethod::Plain => code_verifier.clone(),
            ChallengeMethod::S256 => {
                let mut hasher = Sha256::new();
                hasher.update(code_verifier.as_bytes());
                URL_SAFE_NO_PAD.encode(hasher.finalize())
            }
        };

        Self {
            code_verifier,
            code_challenge,
            method,
        }
    }
}
