//! ============================================================================
//! Callback Listener - Loopback HTTP server for the browser redirect
//! ============================================================================
//! Desktop stand-in for the mobile deep link: binds the redirect URI's
//! host/port and hands back the first request that hits its path.
//! Blocking; run it on a blocking thread from async code.
//! ============================================================================

use anyhow::{anyhow, bail, Result};
use std::time::{Duration, Instant};
use tiny_http::{Header, Response, Server};
use tracing::{debug, info, warn};

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Birdauth - Twitter Connected</title>
    <style>
        body {
            font-family: 'SF Mono', 'Monaco', monospace;
            background: #0a0a0a;
            color: #1d9bf0;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
        }
        .container {
            text-align: center;
            border: 1px solid #1d9bf0;
            padding: 40px;
        }
        h1 { margin: 0 0 20px 0; }
    </style>
</head>
<body>
    <div class="container">
        <h1>&#x2713; Authorization received</h1>
        <p>You can close this window and return to the terminal.</p>
    </div>
</body>
</html>
"#;

pub struct CallbackListener {
    server: Server,
    origin: String,
    path: String,
}

impl CallbackListener {
    /// Listen on the host and port of an `http://` redirect URI
    pub fn bind(redirect_uri: &str) -> Result<Self> {
        let parsed = url::Url::parse(redirect_uri)
            .map_err(|e| anyhow!("Invalid redirect URI {}: {}", redirect_uri, e))?;

        if parsed.scheme() != "http" {
            bail!(
                "Redirect URI {} is not an http:// loopback address; deliver the callback manually",
                redirect_uri
            );
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow!("Redirect URI {} has no host", redirect_uri))?;
        let port = parsed.port_or_known_default().unwrap_or(80);

        Self::bind_addr(&format!("{}:{}", host, port), parsed.path())
    }

    /// Listen on an explicit address; port 0 picks a free one
    pub fn bind_addr(addr: &str, path: &str) -> Result<Self> {
        let server = Server::http(addr)
            .map_err(|e| anyhow!("Failed to start callback server on {}: {}", addr, e))?;

        let local = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow!("Callback server is not bound to an IP address"))?;

        info!("Waiting for OAuth callback on {}{}", local, path);

        Ok(Self {
            server,
            origin: format!("http://{}", local),
            path: path.to_string(),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    /// Block until the redirect arrives and return the full callback URI.
    /// Requests for other paths (favicon probes) get a 404 and are ignored.
    pub fn wait(&self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("Callback server timed out waiting for response");
            }

            let request = self
                .server
                .recv_timeout(remaining)
                .map_err(|e| anyhow!("Callback server error: {}", e))?
                .ok_or_else(|| anyhow!("Callback server timed out waiting for response"))?;

            let target = request.url().to_string();
            let path = target.split(['?', '#']).next().unwrap_or_default();

            if path != self.path {
                debug!("Ignoring request for {}", path);
                let _ = request.respond(Response::from_string("Not Found").with_status_code(404));
                continue;
            }

            let mut response = Response::from_string(SUCCESS_PAGE);
            if let Ok(header) =
                Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
            {
                response = response.with_header(header);
            }
            if let Err(e) = request.respond(response) {
                warn!("Failed to answer browser: {}", e);
            }

            debug!("Received callback on {}", self.path);
            return Ok(format!("{}{}", self.origin, target));
        }
    }
}
