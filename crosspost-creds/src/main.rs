//! crosspost-creds - Destination credential tool for Crosspost
//!
//! Converts cookie files between encodings, imports them into the configured
//! store, checks that they still log in, and deletes relayed posts.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libcrosspost::config::Config;
use libcrosspost::credentials::{open_store, CredentialFormat, DomainRule};
use libcrosspost::relay::RelayClient;
use libcrosspost::session::SessionClient;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::error;

#[derive(Parser)]
#[command(name = "crosspost-creds")]
#[command(about = "Manage the Crosspost destination credential", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true, value_name = "PATH", env = "CROSSPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-encode a cookie file (header, cookies-txt, json, blob)
    Convert {
        /// Input file, or "-" for stdin
        input: String,

        /// Output file, or "-" for stdout
        output: String,

        /// Encoding of the input
        #[arg(long)]
        from: CredentialFormat,

        /// Encoding of the output
        #[arg(long, default_value = "blob")]
        to: CredentialFormat,
    },

    /// Load a cookie file into the configured credential store
    Import {
        /// Input file, or "-" for stdin
        input: String,

        /// Encoding of the input
        #[arg(long, default_value = "header")]
        from: CredentialFormat,
    },

    /// Authenticate with the stored credential and print the session
    Check,

    /// Delete a post from the destination account
    Delete {
        /// Destination post id
        post_id: String,
    },

    /// Remove the stored credential
    Forget {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_command(cli.command, cli.config.as_deref()).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<libcrosspost::CrosspostError>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }

    Ok(())
}

async fn run_command(command: Commands, config_path: Option<&Path>) -> Result<()> {
    match command {
        Commands::Convert {
            input,
            output,
            from,
            to,
        } => convert(&input, &output, from, to),
        Commands::Import { input, from } => import(&load_config(config_path)?, &input, from),
        Commands::Check => check(&load_config(config_path)?).await,
        Commands::Delete { post_id } => delete_post(&load_config(config_path)?, &post_id).await,
        Commands::Forget { force } => forget(&load_config(config_path)?, force),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };
    Ok(config?)
}

fn read_input(input: &str) -> Result<Vec<u8>> {
    if input == "-" {
        let mut data = Vec::new();
        std::io::stdin()
            .read_to_end(&mut data)
            .context("Failed to read credential from stdin")?;
        return Ok(data);
    }
    std::fs::read(input).with_context(|| format!("Failed to read {}", input))
}

fn convert(input: &str, output: &str, from: CredentialFormat, to: CredentialFormat) -> Result<()> {
    // conversions run without a config; use the default destination scoping
    let rule = DomainRule::default();
    let credential = from.codec().decode(&read_input(input)?, &rule)?;
    if credential.is_empty() {
        bail!("No cookies found in {}", input);
    }
    if to.is_lossy() {
        eprintln!("Warning: {} drops cookie domains and expiry; use blob or cookies-txt to persist", to);
    }

    let encoded = to.codec().encode(&credential)?;
    if output == "-" {
        use std::io::Write;
        std::io::stdout().write_all(&encoded)?;
    } else {
        std::fs::write(output, &encoded).with_context(|| format!("Failed to write {}", output))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(output, std::fs::Permissions::from_mode(0o600))?;
        }
        println!("✓ Converted {} cookies ({} → {})", credential.len(), from, to);
    }
    Ok(())
}

fn import(config: &Config, input: &str, from: CredentialFormat) -> Result<()> {
    let rule = DomainRule::from_config(&config.session);
    let credential = from.codec().decode(&read_input(input)?, &rule)?;
    if credential.is_empty() {
        bail!("No cookies found in {}", input);
    }

    let store = open_store(&config.session)?;
    store.save(&credential)?;
    println!(
        "✓ Stored {} cookies in {} storage",
        credential.len(),
        store.backend_name()
    );
    Ok(())
}

async fn authenticated_session(config: &Config) -> Result<SessionClient> {
    let rule = DomainRule::from_config(&config.session);
    let store = open_store(&config.session)?;
    let credential = store.load(&rule)?;
    let session =
        SessionClient::authenticate(&config.session, &config.destination, rule, credential).await?;

    // keep cookies the server rotated during the check
    store.save(&session.credential())?;
    Ok(session)
}

async fn check(config: &Config) -> Result<()> {
    let session = authenticated_session(config).await?;
    let snapshot = session.config().await?;
    println!("✓ Logged in");
    println!("  is_login:   {}", snapshot.is_login);
    println!("  account_id: {}", snapshot.account_id);
    Ok(())
}

async fn delete_post(config: &Config, post_id: &str) -> Result<()> {
    if post_id.trim().is_empty() {
        bail!("Post id cannot be empty");
    }
    let session = authenticated_session(config).await?;
    let relay = RelayClient::new(session, config.destination.clone());
    relay.delete(post_id).await?;
    println!("✓ Deleted post {}", post_id);
    Ok(())
}

fn forget(config: &Config, force: bool) -> Result<()> {
    let store = open_store(&config.session)?;
    if !store.exists()? {
        println!("No stored credential");
        return Ok(());
    }

    if !force {
        print!("Remove the stored destination credential? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled");
            return Ok(());
        }
    }

    store.delete()?;
    println!("✓ Removed stored credential ({})", store.backend_name());
    Ok(())
}
