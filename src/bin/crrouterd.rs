//! Cascading router daemon (crrouterd)
//!
//! Runs the plugin host, keeps cascade routes and sub-host NAT in sync with
//! peer advertisements and exposes `org.crrouter.Router` on the system bus.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root)
//! sudo crrouterd
//!
//! # Alternate config file, debug logging
//! sudo crrouterd --config /etc/crrouter/test.toml --verbose
//!
//! # Restart in place
//! sudo kill -HUP $(cat /run/crrouter/routerd/crrouterd.pid)
//! ```

use anyhow::Context;
use clap::Parser;
use libcrrouterd::config::DEFAULT_CONFIG_FILE;
use libcrrouterd::daemon::{Daemon, Exit, Seams};
use libcrrouterd::error::{RouterError, RouterResult};
use libcrrouterd::plugin::PluginHub;
use libcrrouterd::{service, RouterConfig};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Cascading router daemon
#[derive(Parser, Debug)]
#[command(name = "crrouterd")]
#[command(author = "crrouter contributors")]
#[command(version)]
#[command(about = "Cascading router daemon - plugin host, cascade routes and sub-host NAT", long_about = None)]
struct Args {
    /// Daemon configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Do not register on D-Bus
    #[arg(long)]
    no_dbus: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting crrouterd {}", env!("CARGO_PKG_VERSION"));

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - nft and route changes will fail");
        }
    }

    let config = RouterConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let seams = Seams::system(&config);
    let mut hub = PluginHub::new(config.plugins.search_dirs.clone());

    let mut daemon = Daemon::start(config, seams, &mut hub)
        .await
        .context("router startup failed")?;

    let _bus = if args.no_dbus {
        info!("D-Bus service disabled (--no-dbus)");
        None
    } else {
        match service::serve(daemon.requests()).await {
            Ok(connection) => Some(connection),
            Err(e) => {
                error!("Failed to start D-Bus service: {}", e);
                daemon.shutdown().await;
                return Err(e.into());
            }
        }
    };

    let exit = match wait_for_signal().await {
        Ok(signal) => daemon.run(signal).await,
        Err(e) => {
            error!("{}", e);
            Exit::Stop
        }
    };

    daemon.shutdown().await;
    drop(hub);

    if exit == Exit::Restart {
        restart()?;
    }

    info!("crrouterd stopped");
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("crrouterd={},libcrrouterd={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Register handlers up front, then resolve on the first SIGTERM, SIGINT or
/// SIGHUP.
async fn wait_for_signal() -> RouterResult<impl std::future::Future<Output = Exit>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| RouterError::ServiceError(format!("Failed to register SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| RouterError::ServiceError(format!("Failed to register SIGINT handler: {}", e)))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| RouterError::ServiceError(format!("Failed to register SIGHUP handler: {}", e)))?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                Exit::Stop
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                Exit::Stop
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, restarting");
                Exit::Restart
            }
        }
    })
}

/// Replace this process with a fresh copy started with the same arguments
fn restart() -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("locating own executable")?;
    info!("Re-executing {}", exe.display());
    let err = std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .exec();
    Err(anyhow::Error::new(err).context(format!("re-executing {}", exe.display())))
}
