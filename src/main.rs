//! acqstream - acquisition streaming daemon
//!
//! Streams windows to one network peer (`use_file = false`) or to local
//! container files (`use_file = true`).
//!
//! Exit status: 0 after a clean stop, 2 if the session could not start,
//! 3 if it ended on a runtime failure.

use acqstream::{AppState, StopHandle, StreamConfig, StreamingApplication};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::process::ExitCode;
use std::thread;

const EXIT_STARTUP: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

/// Parse config path from command line arguments.
///
/// Supports:
/// - `acqstream <path>` (positional)
/// - `acqstream --config <path>` (flag-based)
/// - `acqstream -c <path>` (short flag)
///
/// Defaults to `/etc/acqstream.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    "/etc/acqstream.toml".to_string()
}

/// Forward SIGINT/SIGTERM as a non-graceful stop request
fn spawn_signal_handler(stop: StopHandle) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                log::info!("Received signal {}, stopping session", sig);
                stop.request_stop(false);
            }
        })?;
    Ok(())
}

fn main() -> ExitCode {
    let config_path = parse_config_path();

    let config = match StreamConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init();
            log::error!("Cannot load {}: {}", config_path, e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    log::info!("acqstream v{} starting...", env!("CARGO_PKG_VERSION"));
    log::info!("Using config: {}", config_path);
    log::info!(
        "Sink: {}, decimation {}, {:?}, channels {}, {} samples/window",
        if config.use_file { "file" } else { "network" },
        config.rate,
        config.resolution,
        config.channels,
        config.window_samples
    );

    let mut app = match StreamingApplication::new(config) {
        Ok(app) => app,
        Err(e) => {
            log::error!("Startup failed: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    if let Err(e) = spawn_signal_handler(app.stop_handle()) {
        log::error!("Failed to install signal handler: {}", e);
        return ExitCode::from(EXIT_STARTUP);
    }

    match app.run() {
        Ok(report) if report.is_failure() => {
            log::error!("Session failed: {}", report.reason);
            ExitCode::from(EXIT_RUNTIME)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) if app.state() == AppState::Configured || e.is_startup() => {
            log::error!("Startup failed: {}", e);
            ExitCode::from(EXIT_STARTUP)
        }
        Err(e) => {
            log::error!("Session aborted: {}", e);
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
