use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use rewinder_runtime::config::{Config, DEFAULT_CONFIG_PATH};
use rewinder_runtime::link::{CommandLink, DeviceSink, LinkFault, SerialTransport};
use rewinder_runtime::motor::{CommandSink, ModeSpeeds, MotorController, RewindMode};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(version, about = "Filament rewinder runtime")]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Bridge the filament host to the rewinders (default)
    Run,
    /// Apply one mode to one rewinder, then exit
    Control {
        #[arg(long)]
        id: usize,
        /// stop, brake, rewind_fast, rewind_slow, load_fast or load_slow
        #[arg(long)]
        mode: RewindMode,
    },
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = start(cli).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn start(cli: Cli) -> Result<(), BoxError> {
    let config = Config::load(&cli.config)?;
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => rewinder_runtime::runtime::run(config).await,
        Command::Control { id, mode } => {
            tokio::task::block_in_place(|| control(&config, id, mode))
        }
    }
}

/// One-shot mode change. The motor keeps the mode after exit.
fn control(config: &Config, id: usize, mode: RewindMode) -> Result<(), BoxError> {
    let cfg = config
        .rewinders
        .iter()
        .find(|rewinder| rewinder.index == id)
        .ok_or_else(|| format!("No rewinder configured with index {id}"))?;
    cfg.check_device(config.link.addresses.len())?;
    let address = &config.link.addresses[cfg.device];

    let transport = SerialTransport::new(config.link.baud_rate);
    let link = CommandLink::spawn(&config.link, transport, |fault: &LinkFault| {
        warn!("{}", fault.error);
    })?;
    let device = link.connect(address)?;

    let epoch = Instant::now();
    let sink = DeviceSink::new(link.handle(), device, cfg, epoch);
    let mut motor = MotorController::from_config(cfg, sink)?;
    let (velocity, decay) = mode.target(&ModeSpeeds::from(cfg));
    motor.set_speed(0.0, velocity, decay)?;
    motor.sink().drain(config.link.drain_timeout())?;
    info!("Rewinder {} set to {}", id, mode);

    drop(motor);
    link.shutdown();
    Ok(())
}
