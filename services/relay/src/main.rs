use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay::config::{self, RelayConfig};
use relay::AppState;

/// Low friction file sharing relay daemon.
#[derive(Debug, Parser)]
#[command(name = "fileferry", version)]
struct Cli {
    /// Absolute path for the configuration file
    #[arg(short = 'c', long = "conf", default_value = config::DEFAULT_CONFIG_PATH)]
    conf: PathBuf,

    /// Run service in the background
    #[arg(short = 'D', long)]
    daemonize: bool,

    /// Override the HTTP listening port specified in configuration file
    #[arg(short = 'p', long = "http-port")]
    http_port: Option<u16>,

    /// Override the HTTPS port used when constructing redirects
    #[arg(long = "https-port")]
    https_port: Option<u16>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match config::load_config_from_path(&cli.conf) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("ERROR loading configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_overrides(cli.http_port, cli.https_port);

    // Fork before the runtime exists; a forked multi-threaded runtime is
    // not usable.
    if cli.daemonize {
        if let Err(error) = daemonize() {
            eprintln!("ERROR daemonizing: {error}");
            return ExitCode::FAILURE;
        }
    }

    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("ERROR starting runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            info!("relay shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("ERROR running relay: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let bind_addr = format!("0.0.0.0:{}", config.http.port);
    let state = AppState::new(config);
    let router = relay::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "relay listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

/// Classic double-fork with a new session, stdio on /dev/null.
#[cfg(unix)]
fn daemonize() -> Result<(), Box<dyn std::error::Error>> {
    use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};
    use std::os::fd::AsRawFd;

    match unsafe { fork()? } {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid()?;
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    chdir("/")?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn daemonize() -> Result<(), Box<dyn std::error::Error>> {
    Err("running in the background is only supported on unix".into())
}
