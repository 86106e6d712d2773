//! Cutroom: studio production tracker client
//!
//! Main binary with subcommands:
//! - `login` / `logout` / `whoami`: manage the persisted session
//! - `watch`: follow notifications and chat live
//! - `chat`: send messages and read history
//! - `notifications`: list and bulk-maintain the notification feed
//! - `list`: print cached entities of one type
//! - `upload`: push a file to the media host

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod commands;
mod watch;

use app::{AppOptions, MEMORY_STORE};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "cutroom")]
#[command(about = "Studio production tracker", long_about = None)]
struct Cli {
    /// Document store URL, or `memory` for an in-process demo store
    #[arg(long, global = true, env = "CUTROOM_STORE_URL", default_value = MEMORY_STORE)]
    store: String,

    /// API key sent as a bearer token to the store
    #[arg(long, global = true, env = "CUTROOM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Directory for the session and chat read state
    #[arg(long, global = true, env = "CUTROOM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Show new notifications through the platform notifier
    #[arg(long, global = true, env = "CUTROOM_NATIVE_NOTIFICATIONS", value_parser = parse_bool_env, default_value = "true")]
    native_notifications: bool,

    /// Timeout for one-shot reads and writes, in seconds
    #[arg(long, global = true, default_value = "30")]
    request_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in as the team member with this email
    Login { email: String },

    /// Forget the persisted session
    Logout,

    /// Show the signed-in team member
    Whoami,

    /// Follow notifications and chat until interrupted
    Watch,

    /// Team chat
    Chat {
        #[command(subcommand)]
        command: ChatCommands,
    },

    /// Notification feed
    Notifications {
        #[command(subcommand)]
        command: NotificationCommands,
    },

    /// List cached entities (projects, videos, scripts, clients, post-production)
    List { kind: String },

    /// Upload a file to the media host
    Upload {
        /// File to upload
        path: PathBuf,

        /// Folder to file the asset under
        #[arg(long)]
        folder: Option<String>,

        /// Media host cloud name
        #[arg(long, env = "CUTROOM_MEDIA_CLOUD")]
        cloud: String,

        /// Unsigned upload preset
        #[arg(long, env = "CUTROOM_MEDIA_PRESET")]
        preset: String,
    },
}

#[derive(Subcommand)]
enum ChatCommands {
    /// Send a message. `@Name` and `#type:Name` tokens are resolved.
    Send { message: String },

    /// Print recent messages
    History {
        /// Number of messages to print
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Mark everything read afterwards
        #[arg(long)]
        mark_read: bool,
    },
}

#[derive(Subcommand)]
enum NotificationCommands {
    /// Print the feed, newest first
    List,
    /// Mark every unread notification read
    ReadAll,
    /// Delete every notification
    DeleteAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cutroom=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let options = AppOptions {
        store: cli.store,
        api_key: cli.api_key,
        data_dir: cli.data_dir,
        native_notifications: cli.native_notifications,
        request_timeout: Duration::from_secs(cli.request_timeout),
    };

    match cli.command {
        Commands::Login { email } => commands::login(&options, &email).await,
        Commands::Logout => commands::logout(&options).await,
        Commands::Whoami => commands::whoami(&options).await,
        Commands::Watch => watch::run(&options).await,
        Commands::Chat { command } => match command {
            ChatCommands::Send { message } => commands::chat_send(&options, &message).await,
            ChatCommands::History { limit, mark_read } => {
                commands::chat_history(&options, limit, mark_read).await
            }
        },
        Commands::Notifications { command } => match command {
            NotificationCommands::List => commands::notifications_list(&options).await,
            NotificationCommands::ReadAll => commands::notifications_read_all(&options).await,
            NotificationCommands::DeleteAll => commands::notifications_delete_all(&options).await,
        },
        Commands::List { kind } => commands::list(&options, &kind).await,
        Commands::Upload {
            path,
            folder,
            cloud,
            preset,
        } => commands::upload(&cloud, &preset, &path, folder).await,
    }
}
