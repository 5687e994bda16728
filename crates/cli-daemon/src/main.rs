//! Daemon entry point for portage
//!
//! Parses command line arguments, loads configuration and runs the transfer
//! daemon until a shutdown request arrives.

use clap::Parser;
use portage_config::Config;
use portage_daemon::Daemon;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// portage daemon - processes persistent queues of file transfer jobs
#[derive(Parser, Debug)]
#[command(name = "portaged")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; missing file means built-in defaults
    #[arg(short, long, default_value = "portage.toml")]
    config: PathBuf,

    /// Override the state directory from config
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Override the control endpoint port from config
    #[arg(short, long)]
    port: Option<u16>,

    /// Skip startup checks (ffmpeg availability). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn load_config(args: &Args) -> Result<Config, portage_config::ConfigError> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    };

    if let Some(state_dir) = &args.state_dir {
        config.daemon.state_dir = Some(state_dir.clone());
    }
    if let Some(port) = args.port {
        config.daemon.port = port;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        config = %args.config.display(),
        port = config.daemon.port,
        state_dir = %config.state_dir().display(),
        "starting portage daemon"
    );

    let daemon_result = if args.skip_checks {
        info!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::with_config(config).await
    };

    match daemon_result {
        Ok(daemon) => {
            if let Err(e) = daemon.run().await {
                eprintln!("Daemon error: {}", e);
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to initialize daemon: {}", e);
            ExitCode::FAILURE
        }
    }
}
