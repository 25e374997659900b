//! gpsd-tcp daemon entry point

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use gpsd_tcp::utils::{init_logging_from_config, ShutdownSignal};
use gpsd_tcp::{Controller, GpsdTcpConfig, Notifier, Severity};

// Memory allocator optimization using mimalloc
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Exit status for a configuration file that can't be used
const EXIT_CONFIG: u8 = 2;
/// Exit status for a fatal startup failure
const EXIT_FATAL: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "gpsd-tcp", version, about = "Relay GPS data from source modules to TCP clients")]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, default_value = "/etc/gpsd-tcp.toml")]
    config: PathBuf,

    /// Log level: emergency, alert, critical, error, warning, notice, info, debug or 0-7
    #[arg(short, long)]
    log_level: Option<String>,

    /// Directory to load modules from
    #[arg(short, long)]
    module_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match GpsdTcpConfig::from_file_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gpsd-tcp: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(dir) = args.module_dir {
        config.modules.dir = dir;
    }

    let (threshold, fallback) = Severity::from_request(&config.logging.level);
    init_logging_from_config(&config.logging, threshold);

    let notifier = Notifier::new(threshold);
    if let Some(fallback) = fallback {
        notifier.emit(fallback);
    }

    // Handlers must exist before the first module process does
    let shutdown = ShutdownSignal::register(notifier.clone());

    match Controller::new(config, notifier)
        .run(shutdown.recv())
        .await
    {
        Ok(()) => ExitCode::SUCCESS,
        // Already reported on the notification stream
        Err(_) => ExitCode::from(EXIT_FATAL),
    }
}
