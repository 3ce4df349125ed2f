//! hullzero - command-line client for the hullzero fleet tracking API.
//!
//! Logs in against the backend, keeps the session between runs when asked
//! to remember it, and shows who is logged in.

mod commands;

use std::io;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hullzero_core::auth::{NotificationLevel, Notifier};
use hullzero_core::config::{Config, StorageBackend};
use hullzero_core::SessionManager;

/// Rolling log file prefix inside `<data dir>/logs`
const LOG_FILE_PREFIX: &str = "hullzero.log";

#[derive(Parser)]
#[command(name = "hullzero")]
#[command(about = "Command-line client for the hullzero fleet tracking API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// API base URL (overrides config and HULLZERO_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Secret storage backend: file, keyring or memory
    #[arg(long, global = true)]
    storage: Option<StorageBackend>,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and load the user profile
    Login {
        /// Account email (defaults to the remembered one)
        #[arg(short, long)]
        email: Option<String>,

        /// Keep the session across runs
        #[arg(short, long)]
        remember: bool,

        /// Check the input with the offline form validator first
        #[arg(long)]
        validate: bool,
    },

    /// Create an account, then log in with it
    Register {
        /// Account email
        #[arg(short, long)]
        email: String,

        /// Keep the session across runs
        #[arg(short, long)]
        remember: bool,
    },

    /// End the session and erase stored tokens
    Logout,

    /// Reload and print the current user's profile
    Whoami {
        /// Print the profile as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the session state without contacting the server
    Status,

    /// Check whether the current user has a role
    HasRole {
        /// Role names; succeeds if the user has any of them
        #[arg(required = true)]
        roles: Vec<String>,
    },

    /// Change the password of the logged-in user
    ChangePassword,
}

/// Prints notifications to stderr, standing in for the app's toasts
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, level: NotificationLevel, message: &str) {
        match level {
            NotificationLevel::Success => eprintln!("✓ {}", message),
            NotificationLevel::Error => eprintln!("✗ {}", message),
        }
    }
}

/// Initialize the tracing subscriber for logging.
/// The returned guard must live until exit so buffered file logs are flushed.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_writer = config.data_dir().ok().and_then(|dir| {
        let log_dir = dir.join("logs");
        std::fs::create_dir_all(&log_dir).ok()?;
        Some(tracing_appender::non_blocking(tracing_appender::rolling::daily(
            log_dir,
            LOG_FILE_PREFIX,
        )))
    });

    match file_writer {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: could not load config ({}), using defaults", e);
        Config::default()
    });
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }
    if let Some(storage) = cli.storage {
        config.storage = storage;
    }

    let _log_guard = init_tracing(&config);
    info!(api_url = %config.api_url, storage = ?config.storage, "hullzero starting");

    let manager = SessionManager::with_notifier(
        config.api_client()?,
        config.secret_store()?,
        Arc::new(ConsoleNotifier),
    );
    manager.initialize().await;

    let result = match cli.command {
        Command::Login {
            email,
            remember,
            validate,
        } => commands::login(&manager, email, remember, validate).await,
        Command::Register { email, remember } => {
            commands::register(&manager, email, remember).await
        }
        Command::Logout => commands::logout(&manager).await,
        Command::Whoami { json } => commands::whoami(&manager, json).await,
        Command::Status => commands::status(&manager).await,
        Command::HasRole { roles } => commands::has_role(&manager, &roles).await,
        Command::ChangePassword => commands::change_password(&manager).await,
    };

    if let Err(ref e) = result {
        warn!(error = %e, "Command failed");
    }
    result
}
