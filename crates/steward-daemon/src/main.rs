//! steward: run one provider turn and print canonical events as NDJSON.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use steward_core::{
    CanonicalEvent, Locator, Provider, SessionId, Supervisor, SupervisorConfig, TurnRequest,
};

#[derive(Parser)]
#[command(
    name = "steward",
    about = "Supervise LLM coding CLIs and normalize their output",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to $STEWARD_CONFIG, ./steward.json, ~/.config/steward/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one turn and stream its events to stdout.
    Run {
        /// claude, codex or gemini.
        #[arg(short, long)]
        provider: Provider,
        /// Working directory for the provider.
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
        /// Continue an existing provider session.
        #[arg(long)]
        resume: Option<String>,
        #[arg(short, long)]
        model: Option<String>,
        prompt: String,
    },
    /// Print the executable that would be used for a provider.
    Locate { provider: Provider },
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<SupervisorConfig, steward_core::Error> {
    let config = match path {
        Some(path) => SupervisorConfig::load(path)?,
        None => SupervisorConfig::load_default()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Commands::Locate { provider } => match Locator::from_config(&config).locate(provider) {
            Ok(path) => {
                println!("{}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Run {
            provider,
            cwd,
            resume,
            model,
            prompt,
        } => {
            let mut request = TurnRequest::new(provider, prompt, cwd);
            if let Some(session_id) = resume {
                request = request.resume(SessionId::from(session_id));
            }
            if let Some(model) = model {
                request = request.model(model);
            }
            run(Supervisor::new(config), request).await
        }
    }
}

async fn run(supervisor: Supervisor, request: TurnRequest) -> ExitCode {
    let sweeper = supervisor.spawn_sweeper();
    let mut handle = match supervisor.spawn(request).await {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("Started {}", handle.run_id);

    let mut failed = false;
    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                failed |= matches!(event.event, CanonicalEvent::Failure { .. });
                match event.to_wire() {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::warn!("Cannot serialize {} event: {}", event.event.kind(), e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, stopping");
                supervisor.shutdown_all().await;
                failed = true;
                break;
            }
        }
    }

    supervisor.shutdown_all().await;
    let _ = sweeper.await;
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
