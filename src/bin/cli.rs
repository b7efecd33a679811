use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use spotify_player_control as lib;
use lib::api::credentials::GRANT_COOLDOWN;
use lib::api::{AuthState, PlayerClient};
use lib::config::Config;
use lib::db::SqliteStorage;
use lib::host::{BufferSink, ChannelNotifier, SinkData, SystemBrowser};
use lib::models::Command;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::subscriber as tracing_subscriber_global;
use tracing_appender::rolling::RollingFileAppender;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "spotify-player-control", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured client id
    #[arg(long)]
    client_id: Option<String>,

    /// Override the configured client secret
    #[arg(long)]
    client_secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize with Spotify (refresh or browser grant) and store the refresh token
    Auth,
    /// Run one player command and print its result
    Exec {
        /// Command name, e.g. "volume" or "recently_played"
        command: Command,

        /// Arguments as a JSON object, e.g. '{"volume_percent": 40}'
        #[arg(long, default_value = "{}")]
        args: String,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// List the available commands
    Commands,
    /// Validate config file and exit
    ConfigValidate,
}

fn resolve_config(explicit: Option<&PathBuf>) -> Result<Config> {
    if let Some(p) = explicit {
        return Config::from_path(p).with_context(|| format!("loading config from {}", p.display()));
    }
    let default_path = dirs::config_dir().map(|d| d.join("spotify-player-control").join("config.toml"));
    match default_path {
        Some(p) if p.exists() => {
            Config::from_path(&p).with_context(|| format!("loading config from {}", p.display()))
        }
        _ => Ok(Config::default()),
    }
}

fn init_logging(cfg: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    // log->tracing bridge for the `log` macros used by the dispatcher
    let _ = LogTracer::init();
    std::fs::create_dir_all(&cfg.log_dir)
        .with_context(|| format!("creating log dir {}", cfg.log_dir.display()))?;
    let file_appender: RollingFileAppender =
        tracing_appender::rolling::daily(&cfg.log_dir, "spotify-player-control.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Honor RUST_LOG if set, otherwise default to info.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    // stdout carries command output
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer);
    tracing_subscriber_global::set_global_default(subscriber)
        .map_err(|e| anyhow!("failed to set global tracing subscriber: {}", e))?;
    Ok(guard)
}

fn print_sink(sink: &BufferSink) -> Result<()> {
    match &sink.data {
        SinkData::Json(v) => println!("{}", serde_json::to_string_pretty(v)?),
        SinkData::Null => println!("null"),
        SinkData::Unset => {}
    }
    for e in &sink.errors {
        eprintln!("error: {}", e);
    }
    Ok(())
}

async fn run_auth(client: &PlayerClient) -> Result<()> {
    let creds = client.credentials();
    creds.grant().await;
    let deadline = Instant::now() + GRANT_COOLDOWN;
    loop {
        match creds.state() {
            AuthState::Authenticated => {
                println!("Authenticated. Refresh token stored.");
                return Ok(());
            }
            AuthState::Granting if Instant::now() < deadline => {}
            state => bail!("authorization did not complete (state: {:?})", state),
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn run_exec(
    client: &PlayerClient,
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>,
    command: Command,
    args: &str,
    timeout: u64,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(timeout);
    loop {
        let mut sink = BufferSink::new();
        let accepted = client.execute(command, &mut sink, args).await;
        if !sink.is_untouched() {
            print_sink(&sink)?;
            if !sink.errors.is_empty() {
                bail!("{} reported {} error(s)", command, sink.errors.len());
            }
            if accepted {
                return Ok(());
            }
        }
        if !accepted {
            if Instant::now() >= deadline {
                bail!("not authenticated; run the auth command first");
            }
            // a grant may be in flight, retry shortly
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        // dispatched or still in flight: wait for the data-ready signal
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(source)) if source == command.source() => break,
                Ok(Some(_)) => continue,
                Ok(None) => bail!("notification channel closed"),
                Err(_) => bail!("timed out waiting for {}", command),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = resolve_config(cli.config.as_ref())?;

    match cli.command {
        Commands::ConfigValidate => {
            println!("OK");
            return Ok(());
        }
        Commands::Commands => {
            for c in Command::ALL {
                let d = c.descriptor();
                println!(
                    "{:<18} {:?} /me/player{}{}",
                    c.to_string(),
                    d.verb,
                    d.endpoint,
                    d.required.map(|r| format!(" (requires {})", r)).unwrap_or_default()
                );
            }
            return Ok(());
        }
        _ => {}
    }

    let _guard = init_logging(&cfg)?;

    let storage = Arc::new(
        SqliteStorage::open(&cfg.storage_path)
            .with_context(|| format!("opening storage {}", cfg.storage_path.display()))?,
    );
    let (notifier, mut rx) = ChannelNotifier::new();
    let client = PlayerClient::new(&cfg, storage, Arc::new(notifier), Arc::new(SystemBrowser))?;
    if cli.client_id.is_some() || cli.client_secret.is_some() {
        client.set_client_ids(
            cli.client_id.as_deref().unwrap_or(&cfg.client_id),
            cli.client_secret.as_deref().unwrap_or(&cfg.client_secret),
        );
    }

    match cli.command {
        Commands::Auth => run_auth(&client).await?,
        Commands::Exec { command, args, timeout } => {
            run_exec(&client, &mut rx, command, &args, timeout).await?
        }
        Commands::Commands | Commands::ConfigValidate => {}
    }
    Ok(())
}
