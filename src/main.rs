use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use pinmgr::{
    AppError, DriverOptions, GpioBackend, GpioManager, HandlerSet, MultiPinWatcher, Numbering,
    PinConfig, config::DEFAULT_CHIP,
};

#[cfg(feature = "hardware-gpio")]
use pinmgr::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use pinmgr::MockGpioBackend;

/// Configure GPIO pins from a JSON or YAML pin file.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Pin file, falls back to $PINMGR_CONFIG then ./pins.json
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// GPIO character device
    #[arg(long, default_value = DEFAULT_CHIP)]
    chip: String,

    /// Pin numbers are physical header positions instead of BCM lines
    #[arg(long)]
    board: bool,

    /// Warn when a pin is set up while already in use
    #[arg(long)]
    warnings: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the level of a pin; handler names in the file are not needed
    Read { pin: u32 },
    /// Drive an output pin to 0 or 1; handler names in the file are not needed
    Write { pin: u32, level: u8 },
    /// Print validated pin definitions
    Show { pin: Option<u32> },
    /// Log edges on every pin until interrupted; every pin needs an event and handler "log"
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();

    let backend = {
        #[cfg(feature = "hardware-gpio")]
        {
            match LibgpiodBackend::new() {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    error!("Failed to init libgpiod backend: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            warn!("built without hardware-gpio, using the mock backend");
            Arc::new(MockGpioBackend::default())
        }
    };

    match run(cli, backend).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run<B: GpioBackend + 'static>(cli: Cli, backend: Arc<B>) -> Result<(), AppError> {
    let config_path = cli
        .config
        .or_else(|| std::env::var("PINMGR_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("pins.json"));
    let config = PinConfig::load_from_file(&config_path)?;
    info!("loaded {} pins from {}", config.len(), config_path.display());

    let options = DriverOptions {
        chip: cli.chip,
        numbering: if cli.board {
            Numbering::Board
        } else {
            Numbering::Bcm
        },
        warnings: cli.warnings,
    };
    match cli.command {
        Command::Show { pin } => {
            let shown = match pin {
                Some(pin) => {
                    let definition = config.get(pin).ok_or(AppError::NotFoundPin(pin))?;
                    serde_json::to_string_pretty(definition)
                }
                None => serde_json::to_string_pretty(config.pins()),
            }
            .map_err(|e| AppError::Config(format!("Failed to render config: {e}")))?;
            println!("{shown}");
            Ok(())
        }
        Command::Read { pin } => {
            let manager = configure_lines(backend, options, config)?;
            let value = manager.read(pin);
            manager.cleanup(None)?;
            println!("{}", value?);
            Ok(())
        }
        Command::Write { pin, level } => {
            let manager = configure_lines(backend, options, config)?;
            let written = manager.write(pin, level);
            manager.cleanup(None)?;
            written
        }
        Command::Watch => {
            let handlers =
                HandlerSet::new().with("log", |pin| info!("edge detected on pin {pin}"));
            let watcher = MultiPinWatcher::new(backend, options, config, handlers)?;
            watcher.start().await
        }
    }
}

/// Set up every pin of the file without edge callbacks, so one-shot
/// commands work on files naming handlers this binary does not provide.
fn configure_lines<B: GpioBackend>(
    backend: Arc<B>,
    options: DriverOptions,
    config: PinConfig,
) -> Result<GpioManager<B>, AppError> {
    let mut manager = GpioManager::new(backend, options, HandlerSet::new())?;
    manager.configure_without_callbacks(config)?;
    Ok(manager)
}
