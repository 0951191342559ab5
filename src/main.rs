use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use pdae::config::{ConfigError, EngineConfig};
use pdae::error::EngineError;
use pdae::templates::{load_manifest, verify_template_files, Manifest};
use pdae::AppState;

#[derive(Debug, Parser)]
#[command(name = "pdae", version, about = "Policy document assembly engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve,
    /// Seed default products and bring sequence trackers up to date.
    InitSequences,
    /// Create templates from a JSON manifest. Existing codes are left alone.
    LoadTemplates {
        manifest: PathBuf,
        /// Directory holding the static and hybrid files the manifest names.
        #[arg(long)]
        files_dir: Option<PathBuf>,
    },
    /// Release base numbers reserved but never used.
    SweepReservations {
        /// Overrides PDAE_RESERVATION_GRACE_SECS.
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// List static and hybrid templates whose stored file is missing.
    VerifyTemplates,
}

const EXIT_USAGE: u8 = 1;
const EXIT_DATA: u8 = 2;
const EXIT_TRANSIENT: u8 = 3;

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_USAGE;
    }
    match err.downcast_ref::<EngineError>() {
        Some(e) if e.is_transient() => EXIT_TRANSIENT,
        Some(_) => EXIT_DATA,
        None if err.downcast_ref::<std::io::Error>().is_some() => EXIT_TRANSIENT,
        None => EXIT_DATA,
    }
}

async fn connect(config: &EngineConfig) -> anyhow::Result<AppState> {
    config.require_database_url()?;
    Ok(AppState::from_config(config.clone()).await?)
}

async fn execute(command: Command, config: EngineConfig) -> anyhow::Result<ExitCode> {
    match command {
        Command::Serve => {
            let state = connect(&config).await?;
            pdae::run(state).await?;
        }
        Command::InitSequences => {
            let state = connect(&config).await?;
            let products = state.allocator.init_sequences().await?;
            for product in &products {
                println!("{}\t{}", product.code, product.name);
            }
        }
        Command::LoadTemplates {
            manifest,
            files_dir,
        } => {
            let text = tokio::fs::read_to_string(&manifest).await.map_err(|e| {
                log::error!("cannot read manifest {}: {}", manifest.display(), e);
                EngineError::validation(format!("manifest {} is unreadable", manifest.display()))
            })?;
            let manifest = Manifest::from_json(&text)?;
            let state = connect(&config).await?;
            let report = load_manifest(
                state.repo.as_ref(),
                state.store.as_ref(),
                manifest,
                files_dir.as_deref(),
            )
            .await?;
            state.registry.invalidate();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::SweepReservations { grace_secs } => {
            let grace = grace_secs
                .map(Duration::from_secs)
                .unwrap_or(config.reservation_grace);
            let state = connect(&config).await?;
            let reset = state.allocator.sweep(grace).await?;
            log::info!("sweep reset {} tracker(s)", reset.len());
            for code in reset {
                println!("{code}");
            }
        }
        Command::VerifyTemplates => {
            let state = connect(&config).await?;
            let missing = verify_template_files(state.repo.as_ref(), state.store.as_ref()).await?;
            if !missing.is_empty() {
                println!("{}", serde_json::to_string_pretty(&missing)?);
                log::warn!("{} template file(s) missing", missing.len());
                return Ok(ExitCode::from(EXIT_DATA));
            }
            log::info!("all template files present");
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[actix_web::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    pdae::init_logging();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("invalid configuration: {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match execute(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
