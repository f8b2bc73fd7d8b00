//! ============================================================================
//! Auth Module - Twitter OAuth 2.0 + PKCE session lifecycle
//! ============================================================================
//! - PKCE verifier/challenge generation
//! - Authorize URL construction and redirect validation
//! - Token endpoint client (exchange, refresh, revoke)
//! - Session manager owning the token lifecycle
//! ============================================================================

mod callback_listener;
mod pkce;
mod redirect;
mod session;
mod token_client;

pub use callback_listener::CallbackListener;
pub use pkce::{ChallengeMethod, PkceParameters, VERIFIER_LEN};
pub use redirect::{build_authorization_url, generate_state, parse_callback, AuthorizationRequest};
pub use session::SessionManager;
pub use token_client::{TokenEndpoint, TwitterTokenClient};
