use async_signal::{Signal, Signals};
use clap::Parser;
use config::Config;
use futures::StreamExt;
use liso::{Server, ServerConfig, ShutdownHandle};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the server based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("liso={level},lisod={level}");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Readiness-driven HTTP/HTTPS static file server", long_about = None)]
struct Args {
    /// Configuration file path (TOML or any format the config crate reads)
    #[arg(long)]
    config: Option<String>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Address both endpoints bind to
    #[arg(long)]
    bind_address: Option<String>,

    /// Plaintext port
    #[arg(long)]
    http_port: Option<u16>,

    /// TLS port
    #[arg(long)]
    https_port: Option<u16>,

    /// PEM certificate chain for the TLS endpoint
    #[arg(long)]
    cert: Option<String>,

    /// PEM private key for the TLS endpoint
    #[arg(long)]
    key: Option<String>,

    /// Directory to serve
    #[arg(long)]
    root: Option<String>,

    /// Upper bound on one readiness wait, in milliseconds
    #[arg(long)]
    poll_timeout_ms: Option<u64>,
}

// Command-line values override the file, which overrides the defaults.
fn load_config(args: &Args) -> Result<Config, config::ConfigError> {
    let mut builder = Config::builder();
    if let Some(config_path) = &args.config {
        builder = builder.add_source(config::File::with_name(config_path));
    }
    builder
        .set_override_option("bind_address", args.bind_address.clone())?
        .set_override_option("http_port", args.http_port.map(i64::from))?
        .set_override_option("https_port", args.https_port.map(i64::from))?
        .set_override_option("tls_server_cert", args.cert.clone())?
        .set_override_option("tls_server_key", args.key.clone())?
        .set_override_option("document_root", args.root.clone())?
        .set_override_option(
            "poll_timeout_ms",
            args.poll_timeout_ms.map(|ms| ms.to_string()),
        )?
        .build()
}

// ============================================================================
// Signal Handling
// ============================================================================

// The watcher thread only ever touches the shutdown handle.
fn watch_signals(handle: ShutdownHandle) -> std::io::Result<()> {
    let mut signals = Signals::new([Signal::Term, Signal::Quit, Signal::Int])?;
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(Ok(signal)) = futures::executor::block_on(signals.next()) {
                info!(?signal, "Received signal");
            }
            handle.request();
        })?;
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing(args.verbose);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    let server_config = match ServerConfig::from_config(&config) {
        Ok(server_config) => server_config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::bind(&server_config) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("Failed to start server: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = watch_signals(server.shutdown_handle()) {
        eprintln!("Failed to install signal handlers: {err}");
        return ExitCode::FAILURE;
    }

    match server.run() {
        Ok(report) => {
            info!(
                closed = report.closed.len(),
                previously_closed = report.previously_closed,
                "Exiting"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Fatal error: {err}");
            ExitCode::FAILURE
        }
    }
}
