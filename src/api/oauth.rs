//! Wire side of the OAuth2 authorization-code flow against the Spotify accounts service.
//!
//! 1. `authorize_url` builds the consent URL (with `state` and a PKCE challenge).
//! 2. The browser is sent there; Spotify redirects back to `CallbackListener`,
//!    a tiny HTTP listener on 127.0.0.1 that waits for the `code`.
//! 3. `exchange_code` trades the code for access + refresh tokens.
//! 4. `refresh_access_token` renews the access token later without user interaction.
//!
//! State handling (who is authenticated, what gets persisted) is not done here,
//! see `credentials`.
use super::pkce;
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::debug;
use url::Url;

/// How long a redirect connection may take to send its request line.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const SCOPES: &[&str] = &[
    "user-read-currently-playing",
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-read-recently-played",
];

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

/// Everything needed to finish a grant once the browser comes back.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub url: Url,
    pub state: String,
    pub code_verifier: String,
    pub redirect_uri: String,
}

pub fn authorize_url(auth_base: &str, client_id: &str, redirect_uri: &str) -> Result<PendingAuthorization> {
    let state = uuid::Uuid::new_v4().simple().to_string();
    let code_verifier = pkce::generate_code_verifier();
    let mut url = Url::parse(&format!("{}/authorize", auth_base.trim_end_matches('/')))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("scope", &SCOPES.join(" "))
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", &state)
        .append_pair("code_challenge_method", "S256")
        .append_pair("code_challenge", &pkce::code_challenge_s256(&code_verifier));
    Ok(PendingAuthorization {
        url,
        state,
        code_verifier,
        redirect_uri: redirect_uri.to_string(),
    })
}

fn basic_auth(client_id: &str, client_secret: &str) -> String {
    format!(
        "Basic {}",
        general_purpose::STANDARD.encode(format!("{}:{}", client_id, client_secret))
    )
}

pub async fn exchange_code(
    http: &Client,
    auth_base: &str,
    client_id: &str,
    client_secret: &str,
    code: &str,
    pending: &PendingAuthorization,
) -> Result<TokenResponse> {
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", pending.redirect_uri.as_str()),
        ("code_verifier", pending.code_verifier.as_str()),
    ];
    // public (PKCE only) clients identify themselves in the body
    let auth = if client_secret.is_empty() {
        params.push(("client_id", client_id));
        None
    } else {
        Some(basic_auth(client_id, client_secret))
    };
    token_request(http, auth_base, auth, &params).await
}

/// Refresh requests repeat the client credentials in the body; some providers
/// only look there, others only at the Authorization header.
pub async fn refresh_access_token(
    http: &Client,
    auth_base: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ];
    token_request(http, auth_base, Some(basic_auth(client_id, client_secret)), &params).await
}

async fn token_request(
    http: &Client,
    auth_base: &str,
    auth_header: Option<String>,
    params: &[(&str, &str)],
) -> Result<TokenResponse> {
    let url = format!("{}/api/token", auth_base.trim_end_matches('/'));
    let mut req = http.post(&url).form(params);
    if let Some(h) = auth_header {
        req = req.header(AUTHORIZATION, h);
    }
    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("token request failed: {} => {}", status, body));
    }
    let tr: TokenResponse = resp.json().await?;
    Ok(tr)
}

#[derive(Debug, PartialEq)]
enum Callback {
    Code(String),
    Denied(String),
    Ignored,
}

/// Local redirect target for the consent page.
pub struct CallbackListener {
    listener: TcpListener,
    port: u16,
    path: String,
}

impl CallbackListener {
    /// Port 0 picks a free port; `redirect_uri` reports the real one.
    pub async fn bind(port: u16, callback_path: &str) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| anyhow!("bind redirect listener on port {}: {}", port, e))?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            path: format!("/{}", callback_path.trim_start_matches('/')),
        })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.path)
    }

    /// Serve requests until one carries our `state` with a `code` (or an `error`).
    ///
    /// Each connection is read on its own task, so an idle or half-open
    /// connection cannot hold up the real redirect.
    pub async fn wait_for_code(self, expected_state: &str) -> Result<String> {
        let (tx, mut rx) = mpsc::channel::<Result<String>>(1);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    let tx = tx.clone();
                    let path = self.path.clone();
                    let state = expected_state.to_string();
                    tokio::spawn(async move {
                        if let Some(outcome) = serve_callback(stream, &path, &state).await {
                            let _ = tx.send(outcome).await;
                        }
                    });
                }
                Some(outcome) = rx.recv() => return outcome,
            }
        }
    }
}

/// Answer one connection; `Some` once it settles the grant either way.
async fn serve_callback(
    mut stream: TcpStream,
    path: &str,
    expected_state: &str,
) -> Option<Result<String>> {
    let target = match timeout(REQUEST_READ_TIMEOUT, read_request_target(&mut stream)).await {
        Ok(Ok(t)) => t,
        Ok(Err(e)) => {
            debug!("unreadable request on redirect listener: {}", e);
            return None;
        }
        Err(_) => {
            debug!("dropping idle connection on redirect listener");
            return None;
        }
    };
    match parse_callback(path, &target, expected_state) {
        Callback::Code(code) => {
            respond(&mut stream, "200 OK", "Authorization complete. You can close this tab.").await;
            Some(Ok(code))
        }
        Callback::Denied(err) => {
            respond(&mut stream, "200 OK", "Authorization failed. You can close this tab.").await;
            Some(Err(anyhow!("authorization denied: {}", err)))
        }
        Callback::Ignored => {
            debug!("ignoring request for {} on redirect listener", target);
            respond(&mut stream, "404 Not Found", "Not Found").await;
            None
        }
    }
}

fn parse_callback(path: &str, target: &str, expected_state: &str) -> Callback {
    let Ok(url) = Url::parse(&format!("http://localhost{}", target)) else {
        return Callback::Ignored;
    };
    if url.path() != path {
        return Callback::Ignored;
    }
    let (mut code, mut state, mut error) = (None, None, None);
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            "error" => error = Some(v.into_owned()),
            _ => {}
        }
    }
    if state.as_deref() != Some(expected_state) {
        return Callback::Ignored;
    }
    if let Some(e) = error {
        return Callback::Denied(e);
    }
    code.map_or(Callback::Ignored, Callback::Code)
}

/// Read the request head and return the target of a GET request line.
async fn read_request_target(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.len() < 8192 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf);
    let first_line = head.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Ok(target.to_string()),
        _ => Err(anyhow!("not a GET request: {:?}", first_line)),
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let resp = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(resp.as_bytes()).await;
    let _ = stream.shutdown().await;
}
