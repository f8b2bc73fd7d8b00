// ============================================================================
// birdauth - Twitter OAuth 2.0 session tool
// ============================================================================
// Usage:
//   birdauth login [--no-browser]          Run the PKCE login flow
//   birdauth status [--json]               Show session state (no secrets)
//   birdauth token                         Print a valid access token
//   birdauth refresh                       Refresh if the token is due
//   birdauth logout                        Revoke tokens and clear storage
//   birdauth bookmarks [USER_ID]           List bookmarks of a user
// ============================================================================

use anyhow::{anyhow, Result};
use birdauth_core::{
    retry_transient, AuthError, BookmarksExecutor, CallbackListener, OAuthConfig, RedbStore,
    RetryConfig, SessionManager,
};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Twitter OAuth 2.0 session tool
#[derive(Parser)]
#[command(name = "birdauth", version, about = "Log in to Twitter and keep the session fresh")]
struct Cli {
    /// Path to the credential database (default: ~/.birdauth/credentials.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize with Twitter in the browser
    Login {
        /// Print the URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Show session state
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Print a valid access token, refreshing first when due
    Token,

    /// Refresh the token pair if it is within the safety margin
    Refresh,

    /// Revoke tokens and remove stored credentials
    Logout,

    /// List bookmarks (defaults to the signed-in user)
    Bookmarks {
        user_id: Option<String>,

        #[arg(long, default_value = "10")]
        max_results: u32,

        /// Continue from a previous page
        #[arg(long)]
        page: Option<String>,
    },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

/// Point the user at `login` when the session is gone
fn explain(e: AuthError) -> anyhow::Error {
    if e.requires_login() {
        anyhow!("{} (run `birdauth login`)", e)
    } else {
        e.into()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = OAuthConfig::from_env()?;
    let store = RedbStore::open(cli.db_path.as_deref())?;
    let session = Arc::new(SessionManager::twitter(config, Arc::new(store))?);

    match cli.command {
        Commands::Login { no_browser } => cmd_login(&session, no_browser).await,
        Commands::Status { json } => cmd_status(&session, json).await,
        Commands::Token => cmd_token(&session).await,
        Commands::Refresh => cmd_refresh(&session).await,
        Commands::Logout => {
            session.logout().await?;
            println!("Logged out.");
            Ok(())
        }
        Commands::Bookmarks {
            user_id,
            max_results,
            page,
        } => cmd_bookmarks(session, user_id, max_results, page).await,
    }
}

async fn cmd_login(session: &SessionManager, no_browser: bool) -> Result<()> {
    let redirect_uri = session.config().redirect_uri.clone();
    let timeout = Duration::from_secs(session.config().authorization_timeout_secs.max(1) as u64);

    // Bind before the browser opens so the redirect can't race the listener
    let listener = if redirect_uri.starts_with("http://") {
        Some(CallbackListener::bind(&redirect_uri)?)
    } else {
        None
    };

    let url = session.start_login().await.map_err(explain)?;

    if no_browser {
        println!("Open this URL to authorize:\n\n{}\n", url);
    } else if let Err(e) = open::that(&url) {
        warn!("Could not open browser: {}", e);
        println!("Open this URL to authorize:\n\n{}\n", url);
    }

    let callback = match listener {
        Some(listener) => tokio::task::spawn_blocking(move || listener.wait(timeout))
            .await
            .map_err(|e| anyhow!("Callback listener panicked: {}", e))?,
        None => {
            println!("Paste the full redirect URL ({}...):", redirect_uri);
            tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                std::io::stdin()
                    .read_line(&mut line)
                    .map(|_| line.trim().to_string())
                    .map_err(|e| anyhow!("Failed to read redirect URL: {}", e))
            })
            .await
            .map_err(|e| anyhow!("Input reader panicked: {}", e))?
        }
    };

    let callback = match callback {
        Ok(uri) => uri,
        Err(e) => {
            session.cancel_login().await;
            return Err(e);
        }
    };

    session.handle_callback(&callback).await.map_err(explain)?;
    println!("Logged in.");
    Ok(())
}

async fn cmd_status(session: &SessionManager, json: bool) -> Result<()> {
    let state = session.state();
    let tokens = session.tokens().await;
    let due = session.is_refresh_due().await;

    if json {
        let status = serde_json::json!({
            "state": state,
            "obtained_at": tokens.as_ref().map(|t| t.obtained_at),
            "expires_at": tokens.as_ref().map(|t| t.expires_at()),
            "refresh_due": due,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("=== Twitter Session ===");
    println!("State:       {}", state);
    if let Some(tokens) = tokens {
        println!("Obtained:    {}", format_timestamp(tokens.obtained_at));
        println!("Expires:     {}", format_timestamp(tokens.expires_at()));
        println!("Refresh due: {}", if due { "yes" } else { "no" });
    }
    Ok(())
}

async fn cmd_token(session: &SessionManager) -> Result<()> {
    let token = retry_transient(&RetryConfig::default(), "Token refresh", move || {
        session.get_valid_access_token()
    })
    .await
    .map_err(explain)?;

    println!("{}", token);
    Ok(())
}

async fn cmd_refresh(session: &SessionManager) -> Result<()> {
    let refreshed = retry_transient(&RetryConfig::default(), "Token refresh", move || {
        session.refresh_if_due()
    })
    .await
    .map_err(explain)?;

    if refreshed {
        info!("Token pair rotated");
        println!("Refreshed.");
    } else {
        println!("Token still fresh; nothing to do.");
    }
    Ok(())
}

async fn cmd_bookmarks(
    session: Arc<SessionManager>,
    user_id: Option<String>,
    max_results: u32,
    page: Option<String>,
) -> Result<()> {
    let executor = BookmarksExecutor::new(session)?;
    let user_id = match user_id {
        Some(id) => id,
        None => executor.me().await?,
    };

    let result = executor
        .fetch_bookmarks(&user_id, max_results, page.as_deref())
        .await?;

    if result.tweets.is_empty() {
        println!("No bookmarks found.");
        return Ok(());
    }

    println!("{:<20}  {}", "TWEET ID", "TEXT");
    println!("{}", "-".repeat(90));
    for tweet in &result.tweets {
        let text = tweet
            .text
            .replace('\n', " ")
            .chars()
            .take(66)
            .collect::<String>();
        println!("{:<20}  {}", tweet.id, text);
    }

    println!("\nTotal: {} bookmarks", result.tweets.len());
    if let Some(next) = result.next_token {
        println!("Next page: --page {}", next);
    }
    Ok(())
}
