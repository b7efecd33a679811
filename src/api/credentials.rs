//! OAuth2 credential lifecycle: load the persisted refresh token, refresh or
//! re-grant when the access token runs out, and persist every new refresh token.
use super::oauth::{self, CallbackListener, TokenResponse};
use crate::config::Config;
use crate::host::{Browser, Storage};
use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Storage key of the persisted refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshtoken";
/// How long `grant` waits for a refresh to land before falling back.
pub const REFRESH_WAIT: Duration = Duration::from_secs(1);
/// Lockout between interactive grants.
pub const GRANT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Granting,
    Authenticated,
    Expired,
}

#[derive(Debug, Default)]
struct Credential {
    client_id: String,
    client_secret: String,
    refresh_token: Option<String>,
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    authenticated: bool,
    expired: bool,
    // set when an interactive grant starts; counts as granting for GRANT_COOLDOWN
    granting_since: Option<Instant>,
}

impl Credential {
    fn granting(&self) -> bool {
        self.granting_since.map_or(false, |t| t.elapsed() < GRANT_COOLDOWN)
    }

    fn ready(&self) -> bool {
        self.authenticated && !self.expired
    }
}

struct Shared {
    cred: Mutex<Credential>,
    status_changed: Notify,
    http: Client,
    storage: Arc<dyn Storage>,
    browser: Arc<dyn Browser>,
    auth_base: String,
    redirect_port: u16,
    callback_path: String,
}

/// Owns the authorization-code flow state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CredentialManager {
    shared: Arc<Shared>,
}

impl CredentialManager {
    pub fn new(cfg: &Config, storage: Arc<dyn Storage>, browser: Arc<dyn Browser>) -> Result<Self> {
        let refresh_token = storage
            .get_string(REFRESH_TOKEN_KEY)?
            .filter(|t| !t.is_empty());
        if refresh_token.is_some() {
            debug!("Loaded persisted refresh token");
        }
        let cred = Credential {
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            refresh_token,
            ..Default::default()
        };
        Ok(Self {
            shared: Arc::new(Shared {
                cred: Mutex::new(cred),
                status_changed: Notify::new(),
                http: Client::new(),
                storage,
                browser,
                auth_base: cfg.auth_base.clone(),
                redirect_port: cfg.redirect_port,
                callback_path: cfg.callback_path.clone(),
            }),
        })
    }

    /// Update the client credentials. Only changed values are replaced and the
    /// current session is kept.
    pub fn set_client_ids(&self, client_id: &str, client_secret: &str) {
        let mut c = self.shared.lock();
        if c.client_id != client_id {
            c.client_id = client_id.to_string();
        }
        if c.client_secret != client_secret {
            c.client_secret = client_secret.to_string();
        }
    }

    /// Kick off a refresh/grant if the access token is missing or past its
    /// expiry. Returns whether requests may be sent right now.
    pub async fn ensure_authenticated(&self) -> bool {
        let expired = {
            let mut c = self.shared.lock();
            let expired = c.expires_at.map_or(true, |at| Utc::now() > at);
            if expired {
                c.expired = true;
            }
            expired
        };
        if expired {
            self.grant().await;
        }
        self.shared.lock().ready()
    }

    pub async fn grant(&self) {
        let (client_id, client_secret, refresh_token) = {
            let c = self.shared.lock();
            (c.client_id.clone(), c.client_secret.clone(), c.refresh_token.clone())
        };

        if client_id.is_empty() {
            warn!("Client ID not set for authentication");
            return;
        }

        if let Some(refresh_token) = refresh_token.filter(|_| !client_secret.is_empty()) {
            info!("Refreshing authorization tokens");
            let notified = self.shared.status_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let shared = self.shared.clone();
            let (id, secret) = (client_id.clone(), client_secret.clone());
            tokio::spawn(async move { shared.refresh(&id, &secret, &refresh_token).await });

            let timed_out = timeout(REFRESH_WAIT, notified).await.is_err();
            if timed_out {
                debug!("Refresh did not complete within {:?}", REFRESH_WAIT);
            } else if self.shared.lock().ready() {
                return;
            }
        }

        {
            let mut c = self.shared.lock();
            if c.granting() {
                debug!("Authorization grant already in progress");
                return;
            }
            c.granting_since = Some(Instant::now());
        }

        info!("Obtaining authorization grant");
        if let Err(e) = self.start_interactive(client_id, client_secret).await {
            error!("Authorization grant failed to start: {:#}", e);
        }
    }

    /// Bind the redirect listener and open the consent page; the wait for the
    /// callback and the code exchange continue on a spawned task.
    async fn start_interactive(&self, client_id: String, client_secret: String) -> Result<()> {
        let s = &self.shared;
        let listener = CallbackListener::bind(s.redirect_port, &s.callback_path).await?;
        let pending = oauth::authorize_url(&s.auth_base, &client_id, &listener.redirect_uri())?;
        s.browser.open_url(pending.url.as_str())?;

        let shared = s.clone();
        tokio::spawn(async move {
            let result: Result<TokenResponse> = async {
                let code = timeout(GRANT_COOLDOWN, listener.wait_for_code(&pending.state))
                    .await
                    .map_err(|_| {
                        anyhow::anyhow!("no authorization callback within {:?}", GRANT_COOLDOWN)
                    })??;
                oauth::exchange_code(
                    &shared.http,
                    &shared.auth_base,
                    &client_id,
                    &client_secret,
                    &code,
                    &pending,
                )
                .await
            }
            .await;
            match result {
                Ok(tr) => shared.apply_token(tr),
                Err(e) => warn!("Authorization grant failed: {:#}", e),
            }
        });
        Ok(())
    }

    pub fn state(&self) -> AuthState {
        let c = self.shared.lock();
        match (c.authenticated, c.expired) {
            (true, false) => AuthState::Authenticated,
            (true, true) => AuthState::Expired,
            _ if c.granting() => AuthState::Granting,
            _ => AuthState::Unauthenticated,
        }
    }

    pub fn is_granting(&self) -> bool {
        self.shared.lock().granting()
    }

    /// `Authorization` header value for API calls, if a token has been obtained.
    pub fn bearer(&self) -> Option<String> {
        self.shared
            .lock()
            .access_token
            .as_ref()
            .map(|t| format!("Bearer {}", t))
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.shared.lock().refresh_token.clone()
    }

    /// Time until the access token runs out, if one is held.
    pub fn expires_in(&self) -> Option<chrono::Duration> {
        self.shared.lock().expires_at.map(|at| at - Utc::now())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Credential> {
        // state stays consistent field by field, so a poisoned lock is still usable
        self.cred.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn refresh(&self, client_id: &str, client_secret: &str, refresh_token: &str) {
        let refreshed = oauth::refresh_access_token(
            &self.http,
            &self.auth_base,
            client_id,
            client_secret,
            refresh_token,
        )
        .await;
        match refreshed {
            Ok(tr) => self.apply_token(tr),
            Err(e) => {
                warn!("Token refresh failed: {:#}", e);
                self.status_changed.notify_waiters();
            }
        }
    }

    fn apply_token(&self, tr: TokenResponse) {
        let expires_at = Utc::now() + chrono::Duration::seconds(tr.expires_in);
        let changed_refresh = {
            let mut c = self.lock();
            c.access_token = Some(tr.access_token);
            tr.refresh_token
                .filter(|t| !t.is_empty() && c.refresh_token.as_deref() != Some(t.as_str()))
        };
        if let Some(t) = changed_refresh {
            self.on_refresh_token_changed(t);
        }
        self.on_expiry_changed(expires_at);
        self.on_granted();
    }

    fn on_refresh_token_changed(&self, token: String) {
        if let Err(e) = self.storage.set_string(REFRESH_TOKEN_KEY, &token) {
            error!("Failed to persist refresh token: {:#}", e);
        }
        self.lock().refresh_token = Some(token);
    }

    fn on_expiry_changed(&self, expires_at: DateTime<Utc>) {
        let mut c = self.lock();
        c.expires_at = Some(expires_at);
        c.expired = Utc::now() > expires_at;
    }

    fn on_granted(&self) {
        {
            let mut c = self.lock();
            c.authenticated = true;
            c.granting_since = None;
        }
        info!("Authenticated");
        self.status_changed.notify_waiters();
    }
}
