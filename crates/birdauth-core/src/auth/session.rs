//! ============================================================================
//! Session Manager - Token lifecycle state machine
//! ============================================================================
//! Owns the single user session: the outstanding authorization request, the
//! cached token pair and the lifecycle state.
//!
//! ```text
//! Unauthenticated --start_login--> Authorizing --callback ok--> Authorized
//!        ^                              |                          |
//!        +------- callback failure -----+          refresh due --> Refreshing
//!        +------- refresh InvalidGrant ------------------------------+
//!        +------- logout (Revoked, then cleared) <---- Authorized
//! ```
//!
//! All transitions run under one async mutex that is held across the network
//! call. Concurrent token requests therefore share a single refresh, and a
//! logout issued during a refresh waits for it, then revokes and clears the
//! refreshed pair.
//! ============================================================================

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::redirect::{build_authorization_url, parse_callback, AuthorizationRequest};
use super::token_client::{TokenEndpoint, TwitterTokenClient};
use crate::clock::{Clock, SystemClock};
use crate::config::OAuthConfig;
use crate::db::{CredentialStore, KeyValueStore};
use crate::types::{AuthError, SessionState, StoreError, TokenError, TokenSet, TokenTypeHint};

#[derive(Debug, Default)]
struct SessionInner {
    state: SessionState,
    tokens: Option<TokenSet>,
    pending: Option<AuthorizationRequest>,
}

/// Token lifecycle manager for one user session
pub struct SessionManager {
    config: OAuthConfig,
    endpoint: Arc<dyn TokenEndpoint>,
    store: CredentialStore,
    clock: Arc<dyn Clock>,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionManager {
    /// Create a manager and restore any persisted session
    pub fn new(
        config: OAuthConfig,
        endpoint: Arc<dyn TokenEndpoint>,
        store: CredentialStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        let tokens = restore_tokens(&store, config.default_expires_in)?;
        let state = if tokens.is_some() {
            info!("Restored persisted session");
            SessionState::Authorized
        } else {
            SessionState::Unauthenticated
        };

        let (state_tx, _) = watch::channel(state);

        Ok(Self {
            config,
            endpoint,
            store,
            clock,
            inner: Mutex::new(SessionInner {
                state,
                tokens,
                pending: None,
            }),
            state_tx,
        })
    }

    /// Production wiring: Twitter token client and the system clock
    pub fn twitter(config: OAuthConfig, backend: Arc<dyn KeyValueStore>) -> Result<Self, AuthError> {
        let endpoint = Arc::new(TwitterTokenClient::new(config.clone())?);
        Self::new(
            config,
            endpoint,
            CredentialStore::new(backend),
            Arc::new(SystemClock),
        )
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Current lifecycle state (does not wait for an in-flight transition)
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the cached token pair
    pub async fn tokens(&self) -> Option<TokenSet> {
        self.inner.lock().await.tokens.clone()
    }

    // ========================================================================
    // Login
    // ========================================================================

    /// Begin a login attempt and return the URL to open in a browser.
    /// A previous outstanding attempt is superseded.
    pub async fn start_login(&self) -> Result<String, AuthError> {
        let mut inner = self.inner.lock().await;
        self.recover(&mut inner);

        if inner.tokens.is_some() {
            return Err(AuthError::AlreadyAuthenticated);
        }
        if inner.pending.is_some() {
            info!("Superseding previous authorization request");
        }

        let request = AuthorizationRequest::new(
            &self.config.redirect_uri,
            self.config.scopes.clone(),
            self.config.challenge_method,
            self.clock.now(),
        );
        let url = build_authorization_url(&self.config, &request);
        debug!("Generated auth URL with state: {}", request.state);

        inner.pending = Some(request);
        self.transition(&mut inner, SessionState::Authorizing);
        Ok(url)
    }

    /// Abandon the outstanding login attempt, if any
    pub async fn cancel_login(&self) {
        let mut inner = self.inner.lock().await;
        if inner.pending.take().is_some() {
            info!("Authorization request cancelled");
            self.transition(&mut inner, SessionState::Unauthenticated);
        }
    }

    /// Consume the redirect delivered by the browser.
    ///
    /// The pending request is discarded whatever the outcome; on any failure
    /// the session returns to `Unauthenticated`.
    pub async fn handle_callback(&self, callback_uri: &str) -> Result<(), AuthError> {
        let mut inner = self.inner.lock().await;
        self.recover(&mut inner);

        let request = match inner.pending.take() {
            Some(request) => request,
            None => {
                warn!("Callback received with no pending authorization request");
                return Err(AuthError::NoPendingRequest);
            }
        };

        let now = self.clock.now();
        if request.is_expired(now, self.config.authorization_timeout_secs) {
            warn!(
                "Authorization request expired after {}s",
                now - request.created_at
            );
            self.transition(&mut inner, SessionState::Unauthenticated);
            return Err(AuthError::NoPendingRequest);
        }

        let code = match parse_callback(callback_uri, &request.state) {
            Ok(code) => code,
            Err(e) => {
                warn!("Rejected authorization callback: {}", e);
                self.transition(&mut inner, SessionState::Unauthenticated);
                return Err(e.into());
            }
        };

        info!("Received authorization code, exchanging");
        let grant = match self
            .endpoint
            .exchange(&code, &request.pkce, &request.redirect_uri)
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                error!("Token exchange failed: {}", e);
                self.transition(&mut inner, SessionState::Unauthenticated);
                return Err(e.into());
            }
        };

        let tokens = match TokenSet::from_grant(
            grant,
            None,
            self.clock.now(),
            self.config.default_expires_in,
        ) {
            Some(tokens) => tokens,
            None => {
                error!("Token exchange returned no refresh token");
                self.transition(&mut inner, SessionState::Unauthenticated);
                return Err(TokenError::Protocol("exchange returned no refresh token".to_string()).into());
            }
        };

        self.persist(&tokens);
        inner.tokens = Some(tokens);
        self.transition(&mut inner, SessionState::Authorized);
        info!("Authorization complete");
        Ok(())
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    /// Bearer token for an API call, refreshed first when due
    pub async fn get_valid_access_token(&self) -> Result<String, AuthError> {
        let mut inner = self.inner.lock().await;
        self.recover(&mut inner);

        let tokens = inner.tokens.as_ref().ok_or(AuthError::NotAuthenticated)?;
        if !tokens.is_refresh_due(self.clock.now()) {
            return Ok(tokens.access_token.clone());
        }

        self.refresh_locked(&mut inner).await?;
        inner
            .tokens
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or(AuthError::NotAuthenticated)
    }

    /// Whether the cached pair has reached the refresh threshold
    pub async fn is_refresh_due(&self) -> bool {
        let inner = self.inner.lock().await;
        inner
            .tokens
            .as_ref()
            .map(|t| t.is_refresh_due(self.clock.now()))
            .unwrap_or(false)
    }

    /// Foreground check: refresh only when due. Returns whether a refresh ran.
    pub async fn refresh_if_due(&self) -> Result<bool, AuthError> {
        let mut inner = self.inner.lock().await;
        self.recover(&mut inner);

        let due = match inner.tokens.as_ref() {
            Some(tokens) => tokens.is_refresh_due(self.clock.now()),
            None => return Err(AuthError::NotAuthenticated),
        };
        if !due {
            debug!("Refresh not due yet");
            return Ok(false);
        }

        self.refresh_locked(&mut inner).await?;
        Ok(true)
    }

    async fn refresh_locked(&self, inner: &mut SessionInner) -> Result<(), AuthError> {
        let refresh_token = match inner.tokens.as_ref() {
            Some(tokens) => tokens.refresh_token.clone(),
            None => return Err(AuthError::NotAuthenticated),
        };

        self.transition(inner, SessionState::Refreshing);

        match self.endpoint.refresh(&refresh_token).await {
            Ok(grant) => {
                let tokens = TokenSet::from_grant(
                    grant,
                    Some(&refresh_token),
                    self.clock.now(),
                    self.config.default_expires_in,
                )
                .ok_or_else(|| TokenError::Protocol("refresh returned no token pair".to_string()));

                match tokens {
                    Ok(tokens) => {
                        self.persist(&tokens);
                        inner.tokens = Some(tokens);
                        self.transition(inner, SessionState::Authorized);
                        info!("Access token refreshed");
                        Ok(())
                    }
                    Err(e) => {
                        self.transition(inner, SessionState::Authorized);
                        Err(e.into())
                    }
                }
            }
            Err(e @ TokenError::InvalidGrant(_)) => {
                warn!("Refresh token rejected, session ended: {}", e);
                inner.tokens = None;
                if let Err(store_err) = self.store.clear() {
                    error!("Failed to clear credentials: {}", store_err);
                }
                self.transition(inner, SessionState::Unauthenticated);
                Err(e.into())
            }
            Err(e) => {
                // Credentials stay; the caller decides when to try again
                warn!("Token refresh failed, keeping current tokens: {}", e);
                self.transition(inner, SessionState::Authorized);
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Logout
    // ========================================================================

    /// End the session. The in-memory session always ends and revocation
    /// failures are only logged; an `Err(Store)` means the persisted pair
    /// could not be removed and would come back on the next start.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let mut inner = self.inner.lock().await;
        self.recover(&mut inner);

        inner.pending = None;
        let tokens = inner.tokens.take();

        if tokens.is_some() {
            self.transition(&mut inner, SessionState::Revoked);
        }

        let cleared = self.store.clear().or_else(|e| {
            warn!("Failed to clear credentials, retrying: {}", e);
            self.store.clear()
        });

        if let Some(tokens) = tokens {
            let targets = [
                (tokens.refresh_token.as_str(), TokenTypeHint::RefreshToken),
                (tokens.access_token.as_str(), TokenTypeHint::AccessToken),
            ];
            for (token, hint) in targets {
                if let Err(e) = self.endpoint.revoke(token, hint).await {
                    warn!("Failed to revoke {}: {}", hint.as_str(), e);
                }
            }
        }

        self.transition(&mut inner, SessionState::Unauthenticated);

        match cleared {
            Ok(()) => {
                info!("Logged out, credentials removed");
                Ok(())
            }
            Err(e) => {
                error!("Logged out, but stored credentials remain: {}", e);
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn transition(&self, inner: &mut SessionInner, next: SessionState) {
        if inner.state != next {
            debug!("Session state {} -> {}", inner.state, next);
        }
        inner.state = next;
        self.state_tx.send_replace(next);
    }

    /// Repair a transient state left behind by a cancelled call
    fn recover(&self, inner: &mut SessionInner) {
        let settled = match (inner.state, inner.tokens.is_some(), inner.pending.is_some()) {
            (SessionState::Refreshing, true, _) => SessionState::Authorized,
            (SessionState::Authorizing, false, false) | (SessionState::Revoked, false, _) => {
                SessionState::Unauthenticated
            }
            (state, _, _) => state,
        };
        if settled != inner.state {
            debug!("Recovering interrupted transition from {}", inner.state);
            self.transition(inner, settled);
        }
    }

    fn persist(&self, tokens: &TokenSet) {
        if let Err(e) = self.store.save(tokens) {
            error!("Failed to persist credentials, session continues in memory: {}", e);
        }
    }
}

/// Load the persisted pair; partial or corrupt records are cleared
fn restore_tokens(store: &CredentialStore, expires_in: i64) -> Result<Option<TokenSet>, AuthError> {
    let snapshot = match store.load() {
        Ok(snapshot) => snapshot,
        Err(StoreError::Corrupt(msg)) => {
            warn!("Discarding corrupt credential record: {}", msg);
            store.clear()?;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if snapshot.is_empty() {
        return Ok(None);
    }

    match snapshot.into_token_set(expires_in) {
        Some(tokens) => Ok(Some(tokens)),
        None => {
            warn!("Discarding incomplete credential record");
            store.clear()?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::pkce::PkceParameters;
    use crate::clock::ManualClock;
    use crate::db::MemoryStore;
    use crate::types::{CallbackError, TokenGrant, DEFAULT_EXPIRES_IN_SECS};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const START: i64 = 1_700_000_000;

    #[derive(Default)]
    struct FakeEndpoint {
        exchange_results: StdMutex<VecDeque<Result<TokenGrant, TokenError>>>,
        refresh_results: StdMutex<VecDeque<Result<TokenGrant, TokenError>>>,
        revoke_error: StdMutex<Option<TokenError>>,
        exchanges: StdMutex<Vec<(String, String)>>,
        refreshes: StdMutex<Vec<String>>,
        revoked: StdMutex<Vec<(String, TokenTypeHint)>>,
        delay: Option<Duration>,
    }

    impl FakeEndpoint {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn push_exchange(&self, result: Result<TokenGrant, TokenError>) {
            self.exchange_results.lock().unwrap().push_back(result);
        }

        fn push_refresh(&self, result: Result<TokenGrant, TokenError>) {
            self.refresh_results.lock().unwrap().push_back(result);
        }

        fn refresh_count(&self) -> usize {
            self.refreshes.lock().unwrap().len()
        }

        async fn pause(&self) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        async fn exchange(
            &self,
            code: &str,
            pkce: &PkceParameters,
            _redirect_uri: &str,
        ) -> Result<TokenGrant, TokenError> {
            self.exchanges
                .lock()
                .unwrap()
                .push((code.to_string(), pkce.code_verifier.clone()));
            self.pause().await;
            self.exchange_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TokenError::Network("no scripted exchange".into())))
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError> {
            self.refreshes.lock().unwrap().push(refresh_token.to_string());
            self.pause().await;
            self.refresh_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TokenError::Network("no scripted refresh".into())))
        }

        async fn revoke(&self, token: &str, hint: TokenTypeHint) -> Result<(), TokenError> {
            self.revoked.lock().unwrap().push((token.to_string(), hint));
            match self.revoke_error.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn grant(access: &str, refresh: &str) -> TokenGrant {
        TokenGrant {
            access_token: access.to_string(),
            refresh_token: Some(refresh.to_string()),
            expires_in: Some(7200),
        }
    }

    struct Harness {
        manager: Arc<SessionManager>,
        endpoint: Arc<FakeEndpoint>,
        backend: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn store(&self) -> CredentialStore {
            CredentialStore::new(self.backend.clone())
        }
    }

    fn harness_with(endpoint: FakeEndpoint, backend: Arc<MemoryStore>) -> Harness {
        let endpoint = Arc::new(endpoint);
        let clock = Arc::new(ManualClock::new(START));
        let mut config = OAuthConfig::twitter("test_client_id");
        config.redirect_uri = "app://".to_string();

        let manager = SessionManager::new(
            config,
            endpoint.clone(),
            CredentialStore::new(backend.clone()),
            clock.clone(),
        )
        .unwrap();

        Harness {
            manager: Arc::new(manager),
            endpoint,
            backend,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeEndpoint::default(), Arc::new(MemoryStore::new()))
    }

    fn state_param(url: &str) -> String {
        let query = url.split_once('?').unwrap().1;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    async fn login(h: &Harness, code: &str) -> Result<(), AuthError> {
        let url = h.manager.start_login().await.unwrap();
        let state = state_param(&url);
        h.manager
            .handle_callback(&format!("app://?code={}&state={}", code, state))
            .await
    }

    #[tokio::test]
    async fn test_login_then_refresh_scenario() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));

        let url = h.manager.start_login().await.unwrap();
        assert_eq!(h.manager.state(), SessionState::Authorizing);
        assert!(url.contains("code_challenge_method=S256"));

        let state = state_param(&url);
        h.manager
            .handle_callback(&format!("app://?code=abc123&state={}", state))
            .await
            .unwrap();

        assert_eq!(h.manager.state(), SessionState::Authorized);
        let (code, verifier) = h.endpoint.exchanges.lock().unwrap()[0].clone();
        assert_eq!(code, "abc123");
        assert_eq!(verifier.len(), 64);

        let persisted = h.store().load().unwrap().into_token_set(7200).unwrap();
        assert_eq!(persisted.access_token, "AT1");
        assert_eq!(persisted.refresh_token, "RT1");
        assert_eq!(persisted.obtained_at, START);
        assert_eq!(h.manager.get_valid_access_token().await.unwrap(), "AT1");

        h.endpoint.push_refresh(Ok(grant("AT2", "RT2")));
        h.clock.advance(7200 - 600 + 1);

        assert_eq!(h.manager.get_valid_access_token().await.unwrap(), "AT2");
        assert_eq!(*h.endpoint.refreshes.lock().unwrap(), vec!["RT1".to_string()]);

        let persisted = h.store().load().unwrap().into_token_set(7200).unwrap();
        assert_eq!(persisted.access_token, "AT2");
        assert_eq!(persisted.refresh_token, "RT2");
        assert_eq!(persisted.obtained_at, START + 6601);
        assert_eq!(h.manager.state(), SessionState::Authorized);
    }

    #[tokio::test]
    async fn test_refresh_fires_exactly_at_threshold() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));
        login(&h, "abc123").await.unwrap();

        h.clock.set(START + 7200 - 600 - 1);
        assert!(!h.manager.is_refresh_due().await);
        assert_eq!(h.manager.get_valid_access_token().await.unwrap(), "AT1");
        assert_eq!(h.endpoint.refresh_count(), 0);

        h.endpoint.push_refresh(Ok(grant("AT2", "RT2")));
        h.clock.set(START + 7200 - 600 + 1);
        assert!(h.manager.is_refresh_due().await);
        assert_eq!(h.manager.get_valid_access_token().await.unwrap(), "AT2");
        assert_eq!(h.endpoint.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let h = harness_with(
            FakeEndpoint::with_delay(Duration::from_millis(50)),
            Arc::new(MemoryStore::new()),
        );
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));
        login(&h, "abc123").await.unwrap();

        h.endpoint.push_refresh(Ok(grant("AT2", "RT2")));
        h.endpoint.push_refresh(Ok(grant("AT3", "RT3")));
        h.clock.advance(7000);

        let a = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.get_valid_access_token().await }
        });
        let b = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.get_valid_access_token().await }
        });

        assert_eq!(a.await.unwrap().unwrap(), "AT2");
        assert_eq!(b.await.unwrap().unwrap(), "AT2");
        assert_eq!(h.endpoint.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_exchange_invalid_grant_returns_to_unauthenticated() {
        let h = harness();
        h.endpoint
            .push_exchange(Err(TokenError::InvalidGrant("code already used".into())));

        let err = login(&h, "abc123").await.unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenError::InvalidGrant(_))));
        assert!(err.requires_login());

        assert_eq!(h.manager.state(), SessionState::Unauthenticated);
        assert!(h.backend.is_empty());
        assert!(h.manager.tokens().await.is_none());
        assert_eq!(
            h.manager.get_valid_access_token().await,
            Err(AuthError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn test_state_mismatch_rejected_before_exchange() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));

        let url = h.manager.start_login().await.unwrap();
        let err = h
            .manager
            .handle_callback("app://?code=abc123&state=forged")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Callback(CallbackError::StateMismatch));
        assert_eq!(h.manager.state(), SessionState::Unauthenticated);
        assert!(h.endpoint.exchanges.lock().unwrap().is_empty());

        // The request was consumed; the genuine redirect arrives too late
        let late = format!("app://?code=abc123&state={}", state_param(&url));
        assert_eq!(
            h.manager.handle_callback(&late).await,
            Err(AuthError::NoPendingRequest)
        );
    }

    #[tokio::test]
    async fn test_denied_and_missing_code() {
        let h = harness();

        let url = h.manager.start_login().await.unwrap();
        let denied = format!(
            "app://?error=access_denied&error_description=denied&state={}",
            state_param(&url)
        );
        assert!(matches!(
            h.manager.handle_callback(&denied).await,
            Err(AuthError::Callback(CallbackError::AuthorizationDenied { .. }))
        ));
        assert_eq!(h.manager.state(), SessionState::Unauthenticated);

        let url = h.manager.start_login().await.unwrap();
        let no_code = format!("app://?state={}", state_param(&url));
        assert_eq!(
            h.manager.handle_callback(&no_code).await,
            Err(AuthError::Callback(CallbackError::MissingCode))
        );
        assert_eq!(h.manager.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_callback_without_request() {
        let h = harness();
        assert_eq!(
            h.manager.handle_callback("app://?code=a&state=b").await,
            Err(AuthError::NoPendingRequest)
        );
        assert_eq!(h.manager.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_expired_request_is_discarded() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));

        let url = h.manager.start_login().await.unwrap();
        h.clock.advance(h.manager.config().authorization_timeout_secs);

        let callback = format!("app://?code=abc&state={}", state_param(&url));
        assert_eq!(
            h.manager.handle_callback(&callback).await,
            Err(AuthError::NoPendingRequest)
        );
        assert_eq!(h.manager.state(), SessionState::Unauthenticated);
        assert!(h.endpoint.exchanges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_login_supersedes_first() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));

        let first = h.manager.start_login().await.unwrap();
        let second = h.manager.start_login().await.unwrap();
        assert_ne!(state_param(&first), state_param(&second));

        let stale = format!("app://?code=abc&state={}", state_param(&first));
        assert_eq!(
            h.manager.handle_callback(&stale).await,
            Err(AuthError::Callback(CallbackError::StateMismatch))
        );
    }

    #[tokio::test]
    async fn test_cancel_login() {
        let h = harness();
        let url = h.manager.start_login().await.unwrap();
        h.manager.cancel_login().await;
        assert_eq!(h.manager.state(), SessionState::Unauthenticated);

        let callback = format!("app://?code=abc&state={}", state_param(&url));
        assert_eq!(
            h.manager.handle_callback(&callback).await,
            Err(AuthError::NoPendingRequest)
        );
    }

    #[tokio::test]
    async fn test_login_while_authorized_is_rejected() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));
        login(&h, "abc123").await.unwrap();

        assert_eq!(
            h.manager.start_login().await,
            Err(AuthError::AlreadyAuthenticated)
        );
        assert_eq!(h.manager.state(), SessionState::Authorized);
    }

    #[tokio::test]
    async fn test_refresh_invalid_grant_ends_session() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));
        login(&h, "abc123").await.unwrap();

        h.endpoint
            .push_refresh(Err(TokenError::InvalidGrant("refresh token revoked".into())));
        h.clock.advance(7000);

        let err = h.manager.get_valid_access_token().await.unwrap_err();
        assert!(err.requires_login());
        assert_eq!(h.manager.state(), SessionState::Unauthenticated);
        assert!(h.backend.is_empty());
        assert_eq!(
            h.manager.get_valid_access_token().await,
            Err(AuthError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn test_refresh_network_error_keeps_credentials() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));
        login(&h, "abc123").await.unwrap();

        h.endpoint
            .push_refresh(Err(TokenError::Network("connection reset".into())));
        h.clock.advance(7000);

        let err = h.manager.refresh_if_due().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.requires_login());
        assert_eq!(h.manager.state(), SessionState::Authorized);

        let persisted = h.store().load().unwrap().into_token_set(7200).unwrap();
        assert_eq!(persisted.access_token, "AT1");
        assert_eq!(persisted.refresh_token, "RT1");

        // Caller-driven retry succeeds
        h.endpoint.push_refresh(Ok(TokenGrant {
            access_token: "AT2".to_string(),
            refresh_token: None,
            expires_in: None,
        }));
        assert!(h.manager.refresh_if_due().await.unwrap());
        let tokens = h.manager.tokens().await.unwrap();
        assert_eq!(tokens.access_token, "AT2");
        assert_eq!(tokens.refresh_token, "RT1");
        assert_eq!(tokens.expires_in, DEFAULT_EXPIRES_IN_SECS);
        assert!(!h.manager.refresh_if_due().await.unwrap());
    }

    #[tokio::test]
    async fn test_logout_revokes_and_clears() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));
        login(&h, "abc123").await.unwrap();

        *h.endpoint.revoke_error.lock().unwrap() =
            Some(TokenError::Network("offline".into()));
        h.manager.logout().await.unwrap();

        let revoked = h.endpoint.revoked.lock().unwrap().clone();
        assert_eq!(
            revoked,
            vec![
                ("RT1".to_string(), TokenTypeHint::RefreshToken),
                ("AT1".to_string(), TokenTypeHint::AccessToken),
            ]
        );
        assert_eq!(h.manager.state(), SessionState::Unauthenticated);
        assert!(h.backend.is_empty());
        assert_eq!(
            h.manager.get_valid_access_token().await,
            Err(AuthError::NotAuthenticated)
        );

        // A fresh login is possible afterwards
        assert!(h.manager.start_login().await.is_ok());
    }

    #[tokio::test]
    async fn test_logout_during_refresh_discards_result() {
        let h = harness_with(
            FakeEndpoint::with_delay(Duration::from_millis(100)),
            Arc::new(MemoryStore::new()),
        );
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));
        login(&h, "abc123").await.unwrap();

        h.endpoint.push_refresh(Ok(grant("AT2", "RT2")));
        h.clock.advance(7000);

        let refreshing = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.get_valid_access_token().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.manager.state(), SessionState::Refreshing);

        h.manager.logout().await.unwrap();
        assert_eq!(refreshing.await.unwrap().unwrap(), "AT2");

        // The refreshed pair is what gets revoked; nothing survives locally
        let revoked: Vec<String> = h
            .endpoint
            .revoked
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect();
        assert_eq!(revoked, vec!["RT2".to_string(), "AT2".to_string()]);
        assert!(h.backend.is_empty());
        assert_eq!(
            h.manager.get_valid_access_token().await,
            Err(AuthError::NotAuthenticated)
        );
    }

    /// Storage whose `clear` never succeeds
    struct StuckClear {
        inner: MemoryStore,
    }

    impl KeyValueStore for StuckClear {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set(key, value)
        }

        fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
            self.inner.set_many(entries)
        }

        fn clear(&self) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only filesystem".to_string()))
        }
    }

    #[tokio::test]
    async fn test_logout_reports_uncleared_store() {
        let backend = Arc::new(StuckClear {
            inner: MemoryStore::new(),
        });
        CredentialStore::new(backend.clone())
            .save(&TokenSet {
                access_token: "AT9".to_string(),
                refresh_token: "RT9".to_string(),
                obtained_at: START,
                expires_in: 7200,
            })
            .unwrap();

        let endpoint = Arc::new(FakeEndpoint::default());
        let manager = SessionManager::new(
            OAuthConfig::twitter("test_client_id"),
            endpoint.clone(),
            CredentialStore::new(backend.clone()),
            Arc::new(ManualClock::new(START)),
        )
        .unwrap();
        assert_eq!(manager.state(), SessionState::Authorized);

        let err = manager.logout().await.unwrap_err();
        assert!(matches!(err, AuthError::Store(StoreError::Backend(_))));

        // In-memory session is gone and both tokens were still revoked
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert_eq!(
            manager.get_valid_access_token().await,
            Err(AuthError::NotAuthenticated)
        );
        assert_eq!(endpoint.revoked.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_client_rejection_keeps_credentials() {
        let h = harness();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));
        login(&h, "abc123").await.unwrap();

        h.endpoint.push_refresh(Err(TokenError::Protocol(
            "Client rejected (401 Unauthorized): invalid_client".into(),
        )));
        h.clock.advance(7000);

        let err = h.manager.get_valid_access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenError::Protocol(_))));
        assert!(!err.requires_login());
        assert_eq!(h.manager.state(), SessionState::Authorized);

        let persisted = h.store().load().unwrap().into_token_set(7200).unwrap();
        assert_eq!(persisted.refresh_token, "RT1");
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let backend = Arc::new(MemoryStore::new());
        CredentialStore::new(backend.clone())
            .save(&TokenSet {
                access_token: "AT9".to_string(),
                refresh_token: "RT9".to_string(),
                obtained_at: START,
                expires_in: 7200,
            })
            .unwrap();

        let h = harness_with(FakeEndpoint::default(), backend);
        assert_eq!(h.manager.state(), SessionState::Authorized);
        assert_eq!(h.manager.get_valid_access_token().await.unwrap(), "AT9");
    }

    #[tokio::test]
    async fn test_partial_record_is_cleared_on_restore() {
        let backend = Arc::new(MemoryStore::new());
        backend.set("access_token", "orphan").unwrap();

        let h = harness_with(FakeEndpoint::default(), backend);
        assert_eq!(h.manager.state(), SessionState::Unauthenticated);
        assert!(h.backend.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let h = harness();
        let mut rx = h.manager.subscribe();
        h.endpoint.push_exchange(Ok(grant("AT1", "RT1")));

        login(&h, "abc123").await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SessionState::Authorized);

        h.manager.logout().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SessionState::Unauthenticated);
    }
}
