//! Coyote device hub
//!
//! Accepts device connections speaking line-delimited JSON over TCP, runs the
//! bind handshake and hands every bound device to its game controller. A
//! device that opens with a hello line holding its client id keeps its
//! settings across reconnects.
//!
//! # Usage
//!
//! ```bash
//! # Serve devices on the default port with a waveform file
//! coyote serve --pulses pulses.json
//!
//! # Start output as soon as a device binds
//! coyote serve --pulses pulses.json --config game.json --autostart
//!
//! # Inspect waveforms offline
//! coyote pulses --pulses pulses.json
//! coyote expand tide --pulses pulses.json --seed 7
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use coyote_engine::{
    ConfigCache, ControllerOptions, GameConfig, GameRegistry, PulseLibrary, RegistryConfig,
    StrengthConfig,
};

/// Coyote device hub
#[derive(Parser, Debug)]
#[command(name = "coyote")]
#[command(
    author,
    version,
    about = "Control loop hub for Coyote stimulation devices",
    long_about = None
)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept device connections
    Serve {
        /// Listen port
        #[arg(short, long, default_value = "8920")]
        port: u16,

        /// Bind address
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,

        /// Waveform library (JSON array of waveform scripts)
        #[arg(long)]
        pulses: Option<PathBuf>,

        /// Defaults for new controllers (JSON with `game` and `strength`)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Start the game as soon as a device binds
        #[arg(long)]
        autostart: bool,
    },

    /// List waveforms with the size of one expansion
    Pulses {
        /// Waveform library
        #[arg(long)]
        pulses: Option<PathBuf>,
    },

    /// Print the frames of one expansion of a waveform
    Expand {
        /// Waveform id
        id: String,

        /// Waveform library
        #[arg(long)]
        pulses: Option<PathBuf>,

        /// Seed for the random ranges
        #[arg(long)]
        seed: Option<u64>,
    },
}

/// Controller defaults read from `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HubConfig {
    game: GameConfig,
    strength: StrengthConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            pulses,
            config,
            autostart,
        } => {
            info!("Coyote hub v{}", env!("CARGO_PKG_VERSION"));
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
                run_server(addr, pulses, config, autostart).await
            })?;
        }
        Commands::Pulses { pulses } => list_pulses(pulses.as_deref())?,
        Commands::Expand { id, pulses, seed } => expand_pulse(&id, pulses.as_deref(), seed)?,
    }

    Ok(())
}

fn open_library(path: Option<&Path>) -> anyhow::Result<PulseLibrary> {
    match path {
        Some(path) => {
            PulseLibrary::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            warn!("No waveform file given, using the built-in silence");
            Ok(PulseLibrary::from_scripts(Vec::new()))
        }
    }
}

fn read_hub_config(path: Option<&Path>) -> anyhow::Result<HubConfig> {
    let Some(path) = path else {
        return Ok(HubConfig::default());
    };
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn run_server(
    addr: SocketAddr,
    pulses: Option<PathBuf>,
    config: Option<PathBuf>,
    autostart: bool,
) -> anyhow::Result<()> {
    let library = Arc::new(open_library(pulses.as_deref())?);
    let _watcher = pulses.is_some().then(|| library.watch(Duration::from_secs(5)));
    let hub = read_hub_config(config.as_deref())?;

    let registry = Arc::new(GameRegistry::new(
        library,
        Arc::new(ConfigCache::default()),
        RegistryConfig {
            controller: ControllerOptions {
                default_strength: hub.strength,
                default_game: hub.game,
                ..ControllerOptions::default()
            },
            autostart,
            ..RegistryConfig::default()
        },
    ));

    let listener = TcpListener::bind(addr).await?;
    info!("Listening for devices on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                info!("Device connection from {}", peer);
                tokio::spawn(handle_connection(stream, peer, Arc::clone(&registry)));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    registry.shutdown().await;
    Ok(())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, registry: Arc<GameRegistry>) {
    match registry.accept(stream).await {
        Ok(game) => info!("Device {} bound as {}", peer, game.client_id()),
        Err(e) => warn!("Device {} rejected: {}", peer, e),
    }
}

fn list_pulses(path: Option<&Path>) -> anyhow::Result<()> {
    let library = open_library(path)?;
    let mut rng = rand::thread_rng();

    for script in library.snapshot().iter() {
        let batch = script.expand(&mut rng);
        println!(
            "{:<24} {:<24} {:>5} frames {:>7} ms",
            script.id,
            script.name,
            batch.frames.len(),
            batch.duration_ms
        );
    }
    Ok(())
}

fn expand_pulse(id: &str, path: Option<&Path>, seed: Option<u64>) -> anyhow::Result<()> {
    let library = open_library(path)?;
    let script = library.get(id).with_context(|| format!("unknown waveform {id}"))?;

    let mut rng = match seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    };
    let batch = script.expand(&mut rng);

    for frame in &batch.frames {
        let (freq, intensity) = frame.decode();
        println!("{}  freq {:?} Hz  intensity {:?}", frame, freq, intensity);
    }
    println!("{} frames, {} ms", batch.frames.len(), batch.duration_ms);
    Ok(())
}
