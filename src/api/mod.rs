pub mod credentials;
pub mod dispatcher;
pub mod oauth;
pub mod pkce;

use crate::config::Config;
use crate::host::{Browser, DataSink, Notifier, Storage};
use crate::models::Command;
use anyhow::Result;
use std::sync::Arc;

pub use credentials::{AuthState, CredentialManager};
pub use dispatcher::{CommandDispatcher, CommandSlot};

/// Player control client: credential lifecycle plus the per-command queue.
pub struct PlayerClient {
    credentials: CredentialManager,
    dispatcher: CommandDispatcher,
}

impl PlayerClient {
    pub fn new(
        cfg: &Config,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        browser: Arc<dyn Browser>,
    ) -> Result<Self> {
        let credentials = CredentialManager::new(cfg, storage, browser)?;
        let dispatcher = CommandDispatcher::new(credentials.clone(), notifier, &cfg.api_base);
        Ok(Self { credentials, dispatcher })
    }

    pub async fn execute(&self, command: Command, sink: &mut dyn DataSink, args: &str) -> bool {
        self.dispatcher.execute(command, sink, args).await
    }

    pub fn set_client_ids(&self, client_id: &str, client_secret: &str) {
        self.credentials.set_client_ids(client_id, client_secret);
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }
}
