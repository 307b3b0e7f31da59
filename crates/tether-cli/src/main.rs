//! Tether CLI
//!
//! Configuration, number normalization and credential maintenance for a
//! Tether deployment.

mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether_core::PhoneNumber;
use tether_transport::{CredentialStore, FileCredentialStore};
use tracing_subscriber::EnvFilter;

use config::Config;

/// Tether - linked-device session manager
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Normalize a phone number and print its address
    Normalize {
        /// Phone number in any accepted form
        #[arg(required = true)]
        number: String,
    },

    /// Inspect or purge stored credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Validate the configuration
    Check,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum CredentialsAction {
    /// Show whether credentials are stored and registered
    Status,
    /// Delete stored credentials
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => show_config(&config)?,
            ConfigAction::Check => check_config(&config, &config_path)?,
            ConfigAction::Init { force } => init_config(&config_path, force)?,
        },
        Commands::Normalize { number } => normalize(&number)?,
        Commands::Credentials { action } => {
            config.validate()?;
            let store = FileCredentialStore::open(&config.credentials.dir).await?;
            match action {
                CredentialsAction::Status => credentials_status(&store).await?,
                CredentialsAction::Purge => purge_credentials(&store).await?,
            }
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn check_config(config: &Config, path: &std::path::Path) -> anyhow::Result<()> {
    config.validate()?;
    if path.exists() {
        println!("{}: ok", path.display());
    } else {
        println!("{}: not found, defaults ok", path.display());
    }
    Ok(())
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    tracing::info!(path = %path.display(), "Wrote default configuration");
    println!("Wrote {}", path.display());
    Ok(())
}

fn normalize(number: &str) -> anyhow::Result<()> {
    let phone = PhoneNumber::parse(number)?;
    let out = serde_json::json!({
        "phoneNumber": phone.as_str(),
        "address": phone.jid(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn credentials_status(store: &FileCredentialStore) -> anyhow::Result<()> {
    let credentials = store.load().await?;
    println!("Directory: {}", store.dir().display());
    println!("Stored: {}", credentials.is_some());
    println!(
        "Registered: {}",
        credentials.as_ref().is_some_and(|c| c.registered)
    );
    Ok(())
}

async fn purge_credentials(store: &FileCredentialStore) -> anyhow::Result<()> {
    store.purge().await?;
    tracing::info!(dir = %store.dir().display(), "Credentials purged");
    println!("Purged {}", store.dir().display());
    Ok(())
}
