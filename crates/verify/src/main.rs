//! lemma-verify - headless guest for the host's verification suite
//!
//! Joins the first host that answers discovery and replies to the Echo,
//! PlusOne, Sum and Name checks until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use lemma::{Identity, Lemma, LemmaConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod verification;

#[derive(Parser, Debug)]
#[command(name = "lemma-verify", version, about = "Answer the lemma verification suite")]
struct Args {
    /// Guest name announced to the host
    #[arg(long, default_value = "lemma-verify")]
    name: String,

    /// Room to join
    #[arg(long, default_value = "lemma_verification")]
    room: String,

    /// TOML config file (defaults to the platform config dir, then built-ins)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(explicit: Option<PathBuf>) -> lemma::Result<LemmaConfig> {
    if let Some(path) = explicit {
        return LemmaConfig::load(path);
    }

    let default_path = directories::ProjectDirs::from("", "", "lemma")
        .map(|dirs| dirs.config_dir().join("config.toml"));
    match default_path {
        Some(path) if path.exists() => {
            tracing::info!(path = %path.display(), "Using config file");
            LemmaConfig::load(path)
        }
        _ => Ok(LemmaConfig::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match load_config(args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let identity = match Identity::new(args.name, args.room) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(guest = %identity.guest_name(), "Starting lemma-verify");

    let lemma = Lemma::new(identity, config);
    verification::install(&lemma);
    lemma.begin();

    let mut state = lemma.subscribe();
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                tracing::info!(state = ?*state.borrow_and_update(), "Connection state");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    lemma.end();
    ExitCode::SUCCESS
}
