//! Interfaces to the host environment the client runs inside.
//!
//! The core never talks to disk, the UI or the desktop directly: it goes through
//! these traits. Simple implementations live here for the CLI and tests; the
//! sqlite storage is in `crate::db`.
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Mutex;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// Opaque key/value persistence.
pub trait Storage: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>>;
    fn set_string(&self, key: &str, value: &str) -> Result<()>;
}

/// Per-call output written by a drain.
pub trait DataSink: Send {
    fn set_null(&mut self);
    fn set_json(&mut self, json: &[u8]);
    fn append_error(&mut self, err: &str);
}

/// Fire-and-forget "data ready" signal, one per completed command.
pub trait Notifier: Send + Sync {
    fn signal_data_ready(&self, source: &str);
}

/// Starts the interactive consent step of the authorization flow.
pub trait Browser: Send + Sync {
    fn open_url(&self, url: &str) -> Result<()>;
}

/// In-process storage. Keeps a log of writes so callers can see what was persisted.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(String, String)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(key: &str, value: &str) -> Self {
        let s = Self::default();
        s.values.lock().unwrap_or_else(|e| e.into_inner()).insert(key.into(), value.into());
        s
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Storage for MemoryStorage {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().map_err(|_| anyhow!("storage lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("storage lock poisoned"))?
            .insert(key.to_string(), value.to_string());
        self.writes
            .lock()
            .map_err(|_| anyhow!("storage lock poisoned"))?
            .push((key.to_string(), value.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SinkData {
    #[default]
    Unset,
    Null,
    Json(serde_json::Value),
}

/// Sink that keeps whatever was written to it.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub data: SinkData,
    pub errors: Vec<String>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if nothing has been written.
    pub fn is_untouched(&self) -> bool {
        self.data == SinkData::Unset && self.errors.is_empty()
    }
}

impl DataSink for BufferSink {
    fn set_null(&mut self) {
        self.data = SinkData::Null;
    }

    fn set_json(&mut self, json: &[u8]) {
        // keep non-JSON bodies visible rather than dropping them
        let value = serde_json::from_slice(json).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(json).into_owned())
        });
        self.data = SinkData::Json(value);
    }

    fn append_error(&mut self, err: &str) {
        self.errors.push(err.to_string());
    }
}

/// Forwards source ids over a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: UnboundedSender<String>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn signal_data_ready(&self, source: &str) {
        if self.tx.send(source.to_string()).is_err() {
            debug!("data-ready for {} dropped, receiver gone", source);
        }
    }
}

/// Prints the consent URL and asks the desktop to open it.
#[derive(Debug, Default, Clone)]
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open_url(&self, url: &str) -> Result<()> {
        println!(
            "Open this URL in your browser and authorize the application:\n\n{}\n",
            url
        );
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else if cfg!(target_os = "windows") {
            "explorer"
        } else {
            "xdg-open"
        };
        let mut cmd = std::process::Command::new(opener);
        cmd.arg(url);
        match spawn_reaped(cmd) {
            Ok(_) => info!("launched {} for authorization", opener),
            Err(e) => debug!("could not launch {}: {}", opener, e),
        }
        Ok(())
    }
}

/// Spawn `cmd` and wait on it from a background thread so the exited child is reaped.
fn spawn_reaped(mut cmd: std::process::Command) -> std::io::Result<JoinHandle<Option<ExitStatus>>> {
    let mut child = cmd.spawn()?;
    Ok(std::thread::spawn(move || match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            debug!("waiting on launched process failed: {}", e);
            None
        }
    }))
}
