//! Command-line interface for the clipshare daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::backend::{self, Backend, BackendKind, DropboxBackend};
use crate::clipboard::SystemClipboard;
use crate::config::Config;
use crate::sync::SyncEngine;

#[derive(Parser)]
#[command(name = "clipshare")]
#[command(about = "Synchronize your clipboard across machines through a shared folder, S3, or Dropbox")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a config file (default: ~/.config/clipshare/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync daemon in the foreground
    Start,

    /// Probe the configured backend and print its state
    Status,

    /// Authorize this machine with Dropbox
    Login,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write an example configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

/// Executes CLI commands against a loaded configuration
pub struct CliHandler {
    config: Config,
}

impl CliHandler {
    /// Load configuration and build a handler
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Config::load_from_path(&path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::load().context("loading config")?,
        };
        Ok(Self { config })
    }

    /// Dispatch a parsed command
    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Start => self.start().await,
            Commands::Status => self.status().await,
            Commands::Login => self.login().await,
            Commands::Config { action } => self.config_action(action),
        }
    }

    async fn start(&self) -> Result<()> {
        let backend = backend::create(&self.config)?;
        self.init_backend(&backend).await?;

        let clipboard = Arc::new(SystemClipboard::new());
        let engine = Arc::new(
            SyncEngine::new(backend.clone(), clipboard)
                .with_max_payload_size(self.config.max_payload_size),
        );

        engine.on_status_change(Arc::new(|status| {
            info!(%status, "sync status changed");
        }));

        engine.start();
        info!(location = %backend.location(), "clipshare running, press Ctrl-C to stop");

        tokio::signal::ctrl_c().await?;

        engine.stop();
        backend.close().await?;
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let backend = backend::create(&self.config)?;
        self.init_backend(&backend).await?;

        println!("backend:  {}", backend.kind());
        println!("location: {}", backend.location());

        if backend.exists().await {
            let mod_time = backend.mod_time().await?;
            let checksum = backend.checksum().await?;
            println!("artifact: present");
            println!("modified: {mod_time}");
            println!("checksum: {checksum}");
        } else {
            println!("artifact: absent");
        }
        Ok(())
    }

    async fn login(&self) -> Result<()> {
        if self.config.backend_type != "dropbox" {
            bail!("login only applies to the dropbox backend");
        }

        let backend = DropboxBackend::new(
            &self.config.dropbox_app_key,
            &self.config.dropbox_app_secret,
        );

        println!("Visit this URL and authorize clipshare:");
        println!("  {}", backend.authorize_url("clipshare"));
        println!("Paste the authorization code:");

        let mut code = String::new();
        std::io::stdin().read_line(&mut code)?;
        backend.exchange_code(code.trim()).await?;

        println!("Authorized. Tokens stored in the system keychain.");
        Ok(())
    }

    fn config_action(&self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                print!("{}", toml::to_string_pretty(&self.config)?);
                Ok(())
            }
            ConfigAction::Init { force } => {
                let config_dir = dirs::config_dir()
                    .context("could not find config directory")?
                    .join("clipshare");
                std::fs::create_dir_all(&config_dir)?;

                let path = config_dir.join("config.toml");
                if path.exists() && !force {
                    bail!(
                        "{} already exists, use --force to overwrite",
                        path.display()
                    );
                }

                std::fs::write(&path, Config::generate_example())?;
                println!("Wrote {}", path.display());
                Ok(())
            }
        }
    }

    async fn init_backend(&self, backend: &Arc<dyn Backend>) -> Result<()> {
        let needs_init = match backend.kind() {
            BackendKind::Local => !backend.location().is_empty(),
            BackendKind::S3 | BackendKind::Dropbox => true,
        };
        if needs_init {
            backend.init().await.context("initializing backend")?;
        }
        Ok(())
    }
}
