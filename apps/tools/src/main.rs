use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use link_guard::LinkDangerDetector;
use session_core::load_settings;
use shared::domain::Phone;
use storage::{SessionStore, Storage};
use tracing::info;

/// Maintenance commands for the dashboard's session database.
#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the configured database URL.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verifies the database is reachable and migrated.
    Health,
    ListSessions,
    ShowSession {
        phone: String,
    },
    /// Forgets a phone's credentials and session so it must sign in again.
    DeleteSession {
        phone: String,
    },
    /// Runs link-danger detection over a piece of text.
    CheckLinks {
        text: String,
        /// Skip the redirect probe.
        #[arg(long)]
        offline: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings()?;
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }

    match cli.command {
        Command::Health => {
            open_storage(&settings.database_url).await?.health_check().await?;
            println!("ok");
        }
        Command::ListSessions => {
            let sessions = open_storage(&settings.database_url)
                .await?
                .list_sessions()
                .await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        Command::ShowSession { phone } => {
            let phone = Phone::parse(&phone)?;
            let storage = open_storage(&settings.database_url).await?;
            let Some(session) = storage.load_session(&phone).await? else {
                bail!("no stored session for {phone}");
            };
            let mut view = serde_json::to_value(&session)?;
            view["has_credentials"] = session.credentials.is_some().into();
            view["has_session_blob"] = session.has_session_blob().into();
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::DeleteSession { phone } => {
            let phone = Phone::parse(&phone)?;
            let storage = open_storage(&settings.database_url).await?;
            if !storage.delete_session(&phone).await? {
                bail!("no stored session for {phone}");
            }
            println!("deleted session for {phone}");
        }
        Command::CheckLinks { text, offline } => {
            let detector = if offline || !settings.probe_enabled {
                LinkDangerDetector::offline(settings.detector_config())
            } else {
                LinkDangerDetector::with_http_probe(settings.detector_config())?
            };
            let dangers = detector.detect(Some(&text)).await;
            println!("{}", serde_json::to_string_pretty(&dangers)?);
        }
    }

    Ok(())
}

async fn open_storage(database_url: &str) -> Result<Storage> {
    let storage = Storage::new(database_url).await?;
    info!(%database_url, "session database opened");
    Ok(storage)
}
