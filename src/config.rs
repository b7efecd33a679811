use serde::Deserialize;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_client_secret")]
    pub client_secret: String,

    // OAuth redirect listener
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,

    /// Sqlite file backing the host key/value storage (refresh token).
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Web API root, without the `/me/player` suffix.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Accounts service root hosting `/authorize` and `/api/token`.
    #[serde(default = "default_auth_base")]
    pub auth_base: String,
}

fn default_client_id() -> String { env::var("SPOTIFY_CLIENT_ID").unwrap_or_default() }
fn default_client_secret() -> String { env::var("SPOTIFY_CLIENT_SECRET").unwrap_or_default() }
fn default_redirect_port() -> u16 { 1337 }
fn default_callback_path() -> String { "callback".into() }
fn default_log_dir() -> PathBuf { data_dir().join("logs") }
fn default_storage_path() -> PathBuf { data_dir().join("storage.db") }

fn default_api_base() -> String {
    // include v1 path by default
    env::var("SPOTIFY_API_BASE").unwrap_or_else(|_| "https://api.spotify.com/v1".into())
}

fn default_auth_base() -> String {
    env::var("SPOTIFY_AUTH_BASE").unwrap_or_else(|_| "https://accounts.spotify.com".into())
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spotify-player-control")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            client_secret: default_client_secret(),
            redirect_port: default_redirect_port(),
            callback_path: default_callback_path(),
            storage_path: default_storage_path(),
            log_dir: default_log_dir(),
            api_base: default_api_base(),
            auth_base: default_auth_base(),
        }
    }
}

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }
}
