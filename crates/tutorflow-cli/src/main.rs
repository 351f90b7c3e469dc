use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tutorflow_core::cache::InvalidationBus;
use tutorflow_core::config::Config;
use tutorflow_core::protocol::DeliveryEvent;
use tutorflow_core::registry::ResponderRegistry;
use tutorflow_gateway::{GatewayState, ResponderWatcher};
use tutorflow_pipeline::setup::components_from_config;
use tutorflow_pipeline::{TurnError, TurnPipeline};

mod logging;

#[derive(Parser)]
#[command(
    name = "tutorflow",
    about = "Streaming tutor pipeline: routing, progressive speech and answer validation",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run a single turn and print the reply
    Chat {
        /// Session id; reuse it to continue a conversation
        #[arg(long, default_value = "cli")]
        session: String,

        /// Message to send
        #[arg(short, long)]
        message: String,

        /// Write the turn's audio to this file
        #[arg(long)]
        audio_out: Option<PathBuf>,
    },

    /// List the responders in the configured directory
    Responders,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration, or one value by dotted path
    Show {
        /// e.g. `synthesis.max_concurrency`
        key: Option<String>,
    },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose)?;

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            serve(config, port).await?;
        }
        Commands::Chat {
            session,
            message,
            audio_out,
        } => chat(&config, &session, &message, audio_out).await?,
        Commands::Responders => {
            let dir = config.registry_dir();
            let registry = ResponderRegistry::load_from_dir(&dir);
            if registry.is_empty() {
                println!("No responders in {}", dir.display());
            }
            for responder in registry.all() {
                println!(
                    "{:<16} {:<10} {:<14} {}",
                    responder.id,
                    responder.tier.to_string(),
                    responder.capability,
                    responder.description
                );
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { key: None } => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Show { key: Some(key) } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}

async fn serve(config: Config, port: u16) -> anyhow::Result<()> {
    let bus = InvalidationBus::new();
    let components = components_from_config(&config, &bus)?;
    let catalog = components.catalog.clone();
    let pipeline = Arc::new(TurnPipeline::new(&config, components));

    let state = GatewayState::new(Arc::new(config), pipeline);
    #[cfg(feature = "metrics")]
    let state = state.with_prometheus(tutorflow_gateway::metrics::install_prometheus_recorder()?);

    // Held for the server's lifetime; dropping it stops the watch.
    let _watcher = match ResponderWatcher::start(catalog) {
        Ok((watcher, _changes)) => Some(watcher),
        Err(e) => {
            warn!(%e, "Responder hot reload disabled");
            None
        }
    };

    info!("Starting tutorflow gateway on port {port}");
    tutorflow_gateway::start_gateway(Arc::new(state), port).await
}

async fn chat(
    config: &Config,
    session: &str,
    message: &str,
    audio_out: Option<PathBuf>,
) -> anyhow::Result<()> {
    let bus = InvalidationBus::new();
    let pipeline = TurnPipeline::new(config, components_from_config(config, &bus)?);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let pipeline_ref = &pipeline;
    let run = async move {
        let result = pipeline_ref
            .run_turn(session, message, &events_tx, &cancel)
            .await;
        drop(events_tx);
        result
    };
    let print = async {
        let mut audio = Vec::new();
        let mut stdout = std::io::stdout();
        while let Some(event) = events_rx.recv().await {
            match &event {
                DeliveryEvent::Text { text, .. } => {
                    print!("{text}");
                    let _ = stdout.flush();
                }
                DeliveryEvent::Audio { .. } => audio.extend(event.audio_bytes().unwrap_or_default()),
                DeliveryEvent::Complete(summary) => {
                    println!();
                    if summary.disclaimer {
                        println!("(This answer did not pass review; please double-check it.)");
                    }
                    eprintln!(
                        "[responder={} reason={} validation={} audio={:?}]",
                        summary.responder.as_deref().unwrap_or("-"),
                        summary.routing_reason.as_str(),
                        summary.validation.label(),
                        summary.audio_mode,
                    );
                }
                DeliveryEvent::Error { kind, message, .. } => eprintln!("error ({kind}): {message}"),
            }
        }
        audio
    };
    let (result, audio) = tokio::join!(run, print);
    pipeline.background().wait_idle().await;

    match result {
        Ok(_) => {}
        Err(TurnError::Abandoned) => anyhow::bail!("Turn cancelled"),
        Err(e) => return Err(e.into()),
    }

    if let Some(path) = audio_out {
        if audio.is_empty() {
            warn!("No audio was produced for this turn");
        } else {
            std::fs::write(&path, &audio)?;
            info!(path = %path.display(), bytes = audio.len(), "Audio written");
        }
    }
    Ok(())
}
