mod app;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use foldstore_common::{telemetry, EngineConfig};
use foldstore_engine::Startup;
use foldstore_events::FileBackend;
use tracing::info;

use app::{AppEvent, AppState};

#[derive(Parser)]
#[command(name = "foldstore", about = "Counter demo on a persisted reducer store")]
struct Cli {
    /// Path to config TOML file
    #[arg(long, env = "FOLDSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current state
    Show,
    /// Add one to the counter
    Inc,
    /// Subtract one from the counter
    Dec,
    /// Add `amount` (may be negative) to the counter
    Add {
        #[arg(allow_hyphen_values = true)]
        amount: i64,
    },
    /// Set the counter back to zero
    Reset,
    /// Replace the label text
    Label {
        text: String,
    },
    /// Add `amount` after a simulated slow fetch
    Fetch {
        amount: i64,
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let backend = FileBackend::open(&config.data_dir)
        .await
        .with_context(|| format!("cannot open data dir {}", config.data_dir.display()))?;

    let booted = Startup::new(backend, app::reduce, AppState::default())
        .config(config)
        .boot()
        .await?;
    let store = booted.store;
    info!(
        version = booted.version,
        replayed = booted.replayed,
        command = ?cli.command,
        "Store ready, applying command"
    );

    match cli.command {
        Command::Show => {}
        Command::Inc => store.dispatch_event(AppEvent::Added { amount: 1 }),
        Command::Dec => store.dispatch_event(AppEvent::Added { amount: -1 }),
        Command::Add { amount } => store.dispatch_event(AppEvent::Added { amount }),
        Command::Reset => store.dispatch_event(AppEvent::Reset),
        Command::Label { text } => store.dispatch_event(AppEvent::Labeled { text }),
        Command::Fetch { amount, delay_ms } => {
            let fetch = app::fetch_increment(amount, Duration::from_millis(delay_ms));
            store.dispatch(fetch.into());
        }
    }

    // Deferred work and persistence writes finish before exit.
    store.settle().await;

    println!("{}", serde_json::to_string_pretty(&*store.get_state())?);
    Ok(())
}
