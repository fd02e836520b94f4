//! atticfan - attic ventilation fan controller.
//!
//! Run with: `cargo run -p atticfan-service -- --mock-hardware`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use atticfan_core::{
    Decay, FanActuator, MockSensor, RecordingActuator, SysfsFans, SystemClock, W1Sensor,
    WallClockGate, gpio_available, wait_for_trusted_time,
};
use atticfan_service::{Config, ControlLoop, Hardware, LoopEvent, default_config_path};
use atticfan_types::{FanState, LocalCalendar};

/// atticfan - attic ventilation fan controller.
#[derive(Parser, Debug)]
#[command(name = "atticfan")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data file path (overrides config).
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Use simulated sensors and fans instead of 1-Wire and GPIO.
    #[arg(long)]
    mock_hardware: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,
}

/// How long blocking work, such as a stuck data write, may hold up exit.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atticfan_service=info".parse()?)
                .add_directive("atticfan_store=info".parse()?)
                .add_directive("atticfan_core=info".parse()?),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let result = runtime.block_on(run(args));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    // kept as loaded so runtime changes are saved without the overrides
    let (config_path, saved) = match &args.config {
        Some(path) => (path.clone(), Config::load_validated(path)?),
        None => {
            let config = Config::load_default()?;
            config.validate()?;
            (default_config_path(), config)
        }
    };
    let mut config = saved.clone();
    if let Some(data) = args.data {
        config.storage.data_file = data;
    }
    config.validate()?;

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    if config.startup.wait_for_time && !args.mock_hardware {
        let gate = WallClockGate::new(SystemClock, config.startup.floor_millis());
        tokio::select! {
            result = wait_for_trusted_time(&gate, Decay::default(), config.startup.timeout()) => result?,
            _ = shutdown.cancelled() => {
                info!("Shutdown requested while waiting for the clock");
                return Ok(());
            }
        }
    }

    let hw = if args.mock_hardware {
        mock_hardware()
    } else {
        real_hardware(&config).await?
    };
    if let Err(e) = hw.fans.set_fans_blocking(FanState::Off) {
        warn!("Failed to switch fans off at startup: {}", e);
    }

    info!("Opening data file {}", config.storage.data_file.display());
    let (mut control, handle) =
        ControlLoop::from_config(&config, hw, Arc::new(LocalCalendar::local()))
            .context("Failed to open data files")?;
    control.persist_settings(config_path, saved);
    tokio::spawn(log_events(handle.subscribe()));

    control.run(shutdown).await?;
    Ok(())
}

/// Log the loop events that nothing else reports.
async fn log_events(mut events: broadcast::Receiver<LoopEvent>) {
    loop {
        match events.recv().await {
            Ok(LoopEvent::DayClosed(day)) => info!(
                "Outside high/low for {}: {:.2} / {:.2} °C",
                day.date, day.high, day.low
            ),
            Ok(LoopEvent::ModeChanged(state)) => info!(
                "Fan mode is now {} (return to auto at {:?})",
                state.mode, state.return_to_auto_at
            ),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("Event log fell behind, missed {} events", missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn real_hardware(config: &Config) -> anyhow::Result<Hardware> {
    let sensors = &config.sensors;
    let attic = Arc::new(W1Sensor::new(&sensors.device_dir, &sensors.attic_id));
    let outside = Arc::new(W1Sensor::new(&sensors.device_dir, &sensors.outside_id));

    let fans: Arc<dyn FanActuator> = if config.fans.enabled {
        if !gpio_available(&config.fans.gpio_dir) {
            anyhow::bail!(
                "GPIO not available at {}",
                config.fans.gpio_dir.display()
            );
        }
        let fans = SysfsFans::new(
            &config.fans.gpio_dir,
            config.fans.pins.clone(),
            config.fans.separation(),
        );
        fans.open().await.context("Failed to set up fan pins")?;
        info!("Driving fans on GPIO {:?}", fans.pins());
        Arc::new(fans)
    } else {
        info!("Fan outputs disabled, commands are only logged");
        Arc::new(RecordingActuator::logging())
    };

    Ok(Hardware {
        attic,
        outside,
        fans,
        clock: Arc::new(SystemClock),
    })
}

fn mock_hardware() -> Hardware {
    info!("Using simulated sensors and fans");
    Hardware {
        attic: Arc::new(MockSensor::new("mock-attic", 35.0)),
        outside: Arc::new(MockSensor::new("mock-outside", 25.0)),
        fans: Arc::new(RecordingActuator::logging()),
        clock: Arc::new(SystemClock),
    }
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
            shutdown.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
            }
            shutdown.cancel();
        });
    }
    Ok(())
}
