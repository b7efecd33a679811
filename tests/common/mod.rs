#![allow(dead_code)]

use mockito::{Mock, Server};
use serde_json::json;
use spotify_player_control::api::credentials::REFRESH_TOKEN_KEY;
use spotify_player_control::api::PlayerClient;
use spotify_player_control::config::Config;
use spotify_player_control::host::{Browser, ChannelNotifier, MemoryStorage};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;

/// Browser that only records the URLs it was asked to open.
#[derive(Default)]
pub struct RecordingBrowser {
    pub urls: Mutex<Vec<String>>,
}

impl RecordingBrowser {
    pub fn opened(&self) -> usize {
        self.urls.lock().unwrap().len()
    }
}

impl Browser for RecordingBrowser {
    fn open_url(&self, url: &str) -> anyhow::Result<()> {
        self.urls.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

pub fn test_config(api_base: &str, auth_base: &str) -> Config {
    Config {
        client_id: "cid".into(),
        client_secret: "csecret".into(),
        redirect_port: 0,
        callback_path: "callback".into(),
        storage_path: PathBuf::from("unused.db"),
        log_dir: PathBuf::from("unused-logs"),
        api_base: api_base.into(),
        auth_base: auth_base.into(),
    }
}

pub struct Harness {
    pub client: PlayerClient,
    pub rx: UnboundedReceiver<String>,
    pub storage: Arc<MemoryStorage>,
    pub browser: Arc<RecordingBrowser>,
}

pub fn harness(cfg: &Config, refresh_token: Option<&str>) -> Harness {
    let storage = Arc::new(match refresh_token {
        Some(t) => MemoryStorage::with_value(REFRESH_TOKEN_KEY, t),
        None => MemoryStorage::new(),
    });
    let browser = Arc::new(RecordingBrowser::default());
    let (notifier, rx) = ChannelNotifier::new();
    let client = PlayerClient::new(cfg, storage.clone(), Arc::new(notifier), browser.clone()).expect("client");
    Harness { client, rx, storage, browser }
}

/// Token endpoint answering `hits` requests with a fresh access token.
pub fn token_mock(server: &mut Server, hits: usize) -> Mock {
    server
        .mock("POST", "/api/token")
        .expect(hits)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"access_token": "access-1", "token_type": "Bearer", "expires_in": 3600}).to_string(),
        )
        .create()
}

/// Single threaded runtime: spawned requests only make progress while the
/// test awaits, which keeps "still processing" observations deterministic.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("rt")
}

/// Token endpoint that answers a single request only after `delay`.
/// Returns its base URL; must be called inside the runtime that will serve it.
pub async fn delayed_token_endpoint(delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let base = format!("http://{}", listener.local_addr().expect("addr"));
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        read_full_request(&mut stream).await;
        tokio::time::sleep(delay).await;
        let body = json!({"access_token": "access-1", "token_type": "Bearer", "expires_in": 3600})
            .to_string();
        let resp = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(resp.as_bytes()).await.expect("write");
        let _ = stream.shutdown().await;
    });
    base
}

async fn read_full_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break i + 4;
        }
        let n = stream.read(&mut chunk).await.expect("read");
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    let body_len = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + body_len {
        let n = stream.read(&mut chunk).await.expect("read");
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
