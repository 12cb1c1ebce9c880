//! SetuIO - serial bridge daemon
//!
//! Loads the TOML config, restores the router's outputs, optionally connects
//! to the flight controller, and runs until Ctrl-C. On shutdown the serial
//! session is closed and every output is stopped (the persisted output list
//! is left as is).

use clap::Parser;
use setu_io::error::{Error, Result};
use setu_io::{AppConfig, ArduPilotDialect, Bridge, BridgeConfig, JsonFileStore, NullSink, Router};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "setu-io", version, about = "Serial protocol bridge and router")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/setu-io.toml")]
    config: PathBuf,

    /// Serial port (overrides config)
    #[arg(long)]
    port: Option<String>,

    /// Baud rate (overrides config)
    #[arg(long)]
    baud: Option<u32>,

    /// Enable the inline legacy listener (overrides config)
    #[arg(long)]
    legacy: bool,
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if args.config.exists() {
        AppConfig::from_file(&args.config)?
    } else {
        AppConfig::default()
    };
    if let Some(port) = &args.port {
        config.serial.port = port.clone();
        config.serial.auto_connect = true;
    }
    if let Some(baud) = args.baud {
        config.serial.baudrate = baud;
    }
    if args.legacy {
        config.legacy.enabled = true;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.level))
        .init();

    log::info!("SetuIO v{} starting...", env!("CARGO_PKG_VERSION"));
    if args.config.exists() {
        log::info!("Using config: {}", args.config.display());
    } else {
        log::warn!("Config {} not found, using defaults", args.config.display());
    }

    let store = Arc::new(JsonFileStore::new(&config.router.outputs_file));
    let router = Router::new(store);
    let bridge = Bridge::new(
        Arc::clone(&router),
        Arc::new(NullSink),
        Arc::new(ArduPilotDialect),
        BridgeConfig {
            handshake_timeout: config.handshake_timeout(),
            max_consecutive_errors: config.serial.max_consecutive_errors,
            param_timeout: config.param_timeout(),
            legacy_listener: config.legacy_listener(),
        },
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    if config.serial.auto_connect {
        match bridge.connect(&config.serial.port, config.serial.baudrate) {
            Ok(msg) => log::info!("{}", msg),
            Err(e) => log::error!("Connect to {} failed: {}", config.serial.port, e),
        }
    }

    log::info!("SetuIO running. Press Ctrl-C to stop.");
    let mut last_status = Instant::now();
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            let status = bridge.get_status();
            let outputs = router.get_status();
            log::info!(
                "connected={} frames_in={} bytes_out={} outputs={}/{}",
                status.connected,
                status.counters.frames_in,
                status.counters.bytes_out,
                outputs.active,
                outputs.total
            );
        }
    }

    log::info!("Shutting down...");
    if bridge.get_status().port.is_some()
        && let Err(e) = bridge.disconnect()
    {
        log::warn!("Disconnect failed: {}", e);
    }
    router.stop_all();

    log::info!("SetuIO stopped");
    Ok(())
}
