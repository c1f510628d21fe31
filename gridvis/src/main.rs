use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use gridvis::bus::{Bus, DimeClient};
use gridvis::config::{self, DimeEndpoint, EndpointPrompt};
use gridvis::playback;
use gridvis::{IngestionLoop, Session, SessionEvent, relay};
use shared::VisConfig;
use std::io::{BufRead, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gridvis")]
#[command(about = "Live playback of DiME power-grid co-simulation streams")]
struct Cli {
    /// Config file (defaults to <config dir>/gridvis/config.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the bus, negotiate indices and play back the live stream
    Run {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Window number; the session joins `geovis<window>`
        #[arg(long)]
        window: Option<u32>,

        /// Write a snapshot here when the session ends
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Play back a saved snapshot
    Replay {
        snapshot: PathBuf,

        #[arg(long)]
        timescale: Option<f64>,
    },
    /// List the clients connected to the bus
    Devices {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    let result = match config::load_or_default(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Run {
                host,
                port,
                window,
                save,
            } => run(config, host, port, window, save).await,
            Commands::Replay {
                snapshot,
                timescale,
            } => replay(config, snapshot, timescale).await,
            Commands::Devices { host, port } => devices(config, host, port).await,
        },
        Err(e) => Err(anyhow::Error::new(e).context("Failed to load configuration")),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(
    mut config: VisConfig,
    host: Option<String>,
    port: Option<u16>,
    window: Option<u32>,
    save: Option<PathBuf>,
) -> Result<()> {
    if let Some(window) = window {
        config.dime.window = window;
    }
    let endpoint = resolve_endpoint(&config, host, port).await?;
    let frame_interval = playback::frame_interval(config.playback.frame_rate);

    let (events, event_stream) = relay::relay();
    let session = Session::new(config, events).into_shared();

    let url = endpoint.url();
    let client = DimeClient::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to DiME at {}", url))?;
    let mut ingestion = IngestionLoop::new(client, session.clone());

    let outcome = tokio::select! {
        result = ingestion.run_with_playback(frame_interval) => result.context("Ingestion stopped"),
        _ = log_events(event_stream) => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting down");
            Ok(())
        }
    };

    if let Some(path) = save {
        session
            .lock()
            .await
            .save_to(&path)
            .with_context(|| format!("Failed to save snapshot to {}", path.display()))?;
    }
    outcome
}

async fn replay(config: VisConfig, snapshot: PathBuf, timescale: Option<f64>) -> Result<()> {
    let frame_interval = playback::frame_interval(config.playback.frame_rate);
    let (events, event_stream) = relay::relay();
    let mut session = Session::new(config, events);

    session
        .load_from(&snapshot)
        .with_context(|| format!("Failed to load snapshot {}", snapshot.display()))?;
    if session.playback().end_time.is_none() {
        bail!("Snapshot {} has no primary samples to play", snapshot.display());
    }
    if let Some(timescale) = timescale {
        session.set_timescale(timescale)?;
    }

    let session = session.into_shared();
    tokio::select! {
        reached = playback::drive_until_complete(session, frame_interval) => {
            log::info!("Replay finished at t={:.2}", reached)
        }
        _ = log_events(event_stream) => {}
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
    }
    Ok(())
}

async fn devices(config: VisConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    let endpoint = resolve_endpoint(&config, host, port).await?;
    let url = endpoint.url();
    let mut client = DimeClient::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to DiME at {}", url))?;

    for device in client.devices().await.context("Failed to list devices")? {
        println!("{}", device);
    }
    Ok(())
}

/// Command line flags win over the config file; anything still missing is asked for on stdin.
async fn resolve_endpoint(
    config: &VisConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<DimeEndpoint> {
    let mut dime = config.dime.clone();
    dime.host = host.or(dime.host);
    dime.port = port.or(dime.port);
    if let Some(endpoint) = DimeEndpoint::from_config(&dime) {
        return Ok(endpoint);
    }

    let (prompt, receiver) = EndpointPrompt::new();
    let defaults = (dime.host.unwrap_or_default(), dime.port);
    std::thread::spawn(move || prompt_endpoint(prompt, defaults));
    receiver.await.context("No DiME endpoint was entered")
}

fn prompt_endpoint(
    mut prompt: EndpointPrompt,
    (default_host, default_port): (String, Option<u16>),
) {
    let default_port = default_port.map(|p| p.to_string()).unwrap_or_default();
    let mut lines = std::io::stdin().lock().lines();

    while prompt.is_open() {
        let host = ask(&mut lines, "DiME host", &default_host);
        let port = ask(&mut lines, "DiME port", &default_port);
        let (Some(host), Some(port)) = (host, port) else {
            return;
        };
        if let Err(e) = prompt.submit(&host, &port) {
            eprintln!("{}", e);
        }
    }
}

fn ask(
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
    label: &str,
    default: &str,
) -> Option<String> {
    if default.is_empty() {
        eprint!("{}: ", label);
    } else {
        eprint!("{} [{}]: ", label, default);
    }
    let _ = std::io::stderr().flush();

    let line = lines.next()?.ok()?;
    match line.trim() {
        "" => Some(default.to_string()),
        value => Some(value.to_string()),
    }
}

async fn log_events(mut events: UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.next().await {
        match event {
            SessionEvent::IndexNegotiated { windows, plots } => log::info!(
                "Index map ready: {} buses, {} plots",
                windows.voltage.len(),
                plots.len()
            ),
            SessionEvent::ShowVariable {
                variable,
                label,
                range,
            } => log::info!(
                "Showing {} ({}) in [{}, {}]",
                variable.key(),
                label,
                range.min,
                range.max
            ),
            SessionEvent::PlaybackPosition { time } => log::trace!("Playback at t={:.3}", time),
            SessionEvent::Frame { time, frame } => {
                log::debug!("Frame t={:.2} ({} variables)", time, frame.variable_count())
            }
            SessionEvent::PlotPoint { slot, time, value } => {
                log::debug!("Plot p{} t={:.2} value={}", slot + 1, time, value)
            }
            SessionEvent::ClearPlots => log::debug!("Plots cleared"),
            SessionEvent::SimulationFinished { end_time } => {
                log::info!("Simulation finished, end time {:.2}", end_time)
            }
            SessionEvent::Diagnostic { message } => log::warn!("{}", message),
        }
    }
}
