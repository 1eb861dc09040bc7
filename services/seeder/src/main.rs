use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use seeder::{session, SharedFile};

/// Low friction file sharing client.
#[derive(Debug, Parser)]
#[command(name = "fileferry-seed", version)]
struct Cli {
    /// Target service URL
    #[arg(short = 's', long, default_value = "http://localhost:8080")]
    service: String,

    /// Share the file publicly
    #[arg(short = 'p', long)]
    public: bool,

    /// The file to share
    file: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .init();

    let shared = match SharedFile::open(&cli.file, cli.public).await {
        Ok(shared) => shared,
        Err(error) => {
            eprintln!("ERROR opening '{}': {error}", cli.file.display());
            return ExitCode::FAILURE;
        }
    };

    // Runs until a fatal error; transport losses reconnect internally.
    let error = session::run(&cli.service, &shared).await;
    eprintln!("ERROR: {error}");
    ExitCode::FAILURE
}
