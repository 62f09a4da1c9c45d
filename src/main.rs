//! CLI entry point for the Enclave messenger.
//!
//! This binary wraps the library for day-to-day use: generating and showing
//! keys, managing peers, listening for messages, sending and broadcasting,
//! and managing configuration files.

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use clap::{Parser, Subcommand};
use enclave::{
    crypto::{
        keystore::{PUBLIC_KEY_FILE, PRIVATE_KEY_FILE},
        FileStorage, IdentityStore, PublicKeyOps, RsaPublic, Storage,
    },
    utils::{MessengerConfig, DEFAULT_CONFIG_FILE},
    Engine,
};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;

/// Enclave - peer-to-peer encrypted messaging
#[derive(Parser)]
#[command(name = "enclave")]
#[command(about = "Peer-to-peer messaging with RSA-signed, AES-GCM encrypted envelopes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys and peer records
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Environment variable holding the identity password
    #[arg(long, value_name = "VAR", default_value = "ENCLAVE_PASSWORD")]
    password_env: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and inspect the local identity
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Manage known peers
    Peers {
        #[command(subcommand)]
        action: PeerCommands,
    },
    /// Receive messages until interrupted
    Listen {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
    },
    /// Send a message to one peer
    Send {
        /// Recipient fingerprint or unique prefix
        recipient: String,
        /// Message text
        message: String,
    },
    /// Send a message to every known peer
    Broadcast {
        /// Message text
        message: String,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new identity key pair
    Generate {
        /// Force overwrite existing keys
        #[arg(short, long)]
        force: bool,
    },
    /// Display the public key
    Show {
        /// Output format (pem, base64)
        #[arg(short, long, default_value = "pem")]
        format: String,
    },
    /// Print the full fingerprint
    Fingerprint,
}

#[derive(Subcommand)]
enum PeerCommands {
    /// Add a peer from its public key file
    Add {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Host the peer listens on
        #[arg(long)]
        host: String,
        /// Port the peer listens on
        #[arg(short, long, default_value_t = enclave::defaults::DEFAULT_PORT)]
        port: u16,
        /// PEM or DER public key file
        #[arg(short, long, value_name = "FILE")]
        key: PathBuf,
    },
    /// List known peers
    List,
    /// Remove a peer
    Remove {
        /// Fingerprint or unique prefix
        peer: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MessengerConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config = config.with_data_dir(data_dir);
    }

    setup_logging(cli.verbose, cli.quiet, &config.logging.level);
    config.ensure_directories()?;

    let password_env = cli.password_env;
    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config, &password_env).await,
        Commands::Peers { action } => handle_peer_commands(action, &config).await,
        Commands::Listen { port, host } => {
            if let Some(port) = port {
                config.network.listen_port = port;
            }
            if let Some(host) = host {
                config.network.listen_host = host;
            }
            handle_listen_command(config, &password_env).await
        }
        Commands::Send { recipient, message } => {
            handle_send_command(config, &password_env, &recipient, &message).await
        }
        Commands::Broadcast { message } => {
            handle_broadcast_command(config, &password_env, &message).await
        }
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

fn read_password(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("set {} to the identity password", var))
}

fn storage(config: &MessengerConfig) -> Arc<FileStorage> {
    Arc::new(FileStorage::new(&config.storage.keys_dir))
}

fn load_public_key(config: &MessengerConfig) -> Result<RsaPublic> {
    let storage = storage(config);
    let pem = storage
        .read(Path::new(PUBLIC_KEY_FILE))
        .context("no identity found; run `enclave keys generate` first")?;
    Ok(RsaPublic::from_blob(&pem)?)
}

async fn open_engine(config: MessengerConfig, password_env: &str) -> Result<Engine> {
    let password = read_password(password_env)?;
    let storage = storage(&config);
    Ok(Engine::open(config, storage, &password).await?)
}

async fn handle_key_commands(
    action: KeyCommands,
    config: &MessengerConfig,
    password_env: &str,
) -> Result<()> {
    match action {
        KeyCommands::Generate { force } => {
            let password = read_password(password_env)?;
            let store = IdentityStore::new(storage(config), config);
            if store.has_identity() && force {
                warn!("Overwriting existing identity");
            }

            let identity = store.generate(&password, force).await?;

            println!("✓ Identity generated successfully");
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Private key: {}", config.storage.keys_dir.join(PRIVATE_KEY_FILE).display());
            println!("  Public key:  {}", config.storage.keys_dir.join(PUBLIC_KEY_FILE).display());
        }
        KeyCommands::Show { format } => {
            let public_key = load_public_key(config)?;
            match format.as_str() {
                "pem" => print!("{}", public_key.to_pem()?),
                "base64" => println!("{}", general_purpose::STANDARD.encode(public_key.canonical_bytes())),
                _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
            }
        }
        KeyCommands::Fingerprint => {
            println!("{}", load_public_key(config)?.fingerprint());
        }
    }
    Ok(())
}

async fn handle_peer_commands(action: PeerCommands, config: &MessengerConfig) -> Result<()> {
    let store = IdentityStore::new(storage(config), config);

    match action {
        PeerCommands::Add {
            name,
            host,
            port,
            key,
        } => {
            let blob = std::fs::read(&key)
                .with_context(|| format!("failed to read {}", key.display()))?;
            let peer = store.add_peer(&name, &host, port, &blob).await?;
            println!("✓ Added {}", peer);
            println!("  Fingerprint: {}", peer.fingerprint);
        }
        PeerCommands::List => {
            let peers = store.list_peers().await?;
            if peers.is_empty() {
                println!("No peers yet. Add one with `enclave peers add`.");
            }
            for peer in peers {
                println!(
                    "{}  {:<20} {}",
                    peer.fingerprint.short(),
                    peer.name,
                    peer.address()
                );
            }
        }
        PeerCommands::Remove { peer } => {
            let removed = store.remove_peer(&peer).await?;
            println!("✓ Removed {}", removed);
        }
    }
    Ok(())
}

async fn handle_listen_command(config: MessengerConfig, password_env: &str) -> Result<()> {
    let engine = open_engine(config, password_env).await?;

    engine
        .register_inbound_callback(|message| {
            let sent_at = message
                .sent_at()
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            println!(
                "[{}] {} ({}): {}",
                sent_at,
                message.sender_name,
                message.sender.short(),
                message.text()
            );
        })
        .await;

    let address = engine.listen().await?;
    println!("Listening on {} as {}", address, engine.my_fingerprint().short());

    signal::ctrl_c().await.context("failed to install Ctrl-C handler")?;
    info!("Shutdown signal received");

    engine.shutdown().await;
    let stats = engine.stats().await;
    info!(
        "Delivered {} messages ({} rejected, {} dropped on a full queue)",
        stats.delivered, stats.rejected, stats.saturated
    );
    Ok(())
}

async fn handle_send_command(
    config: MessengerConfig,
    password_env: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let engine = open_engine(config, password_env).await?;
    let receipt = engine.send(recipient, message.as_bytes()).await?;
    println!(
        "✓ Sent {} to {} ({})",
        receipt.message_id,
        receipt.recipient_name,
        receipt.recipient.short()
    );
    engine.shutdown().await;
    Ok(())
}

async fn handle_broadcast_command(
    config: MessengerConfig,
    password_env: &str,
    message: &str,
) -> Result<()> {
    let engine = open_engine(config, password_env).await?;
    let peers = engine.list_peers().await?;
    let results = engine.broadcast(message.as_bytes()).await?;

    let mut failures = 0;
    for peer in &peers {
        match results.get(&peer.fingerprint) {
            Some(Ok(())) => println!("✓ {}", peer),
            Some(Err(e)) => {
                failures += 1;
                println!("✗ {}: {}", peer, e);
            }
            None => {}
        }
    }
    engine.shutdown().await;

    if failures > 0 {
        return Err(anyhow::anyhow!("{} of {} deliveries failed", failures, results.len()));
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            MessengerConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = match file {
                Some(path) => MessengerConfig::from_file(path)?,
                None => config.clone(),
            };
            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
