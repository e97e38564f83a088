use clap::Parser;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::Path;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tunnelgate::config::{Config, DEFAULT_PORT};
use tunnelgate::config_validation::ConfigValidator;
use tunnelgate::logging::{self, CustomLogger};
use tunnelgate::proxy::ProxyServer;

#[derive(Parser)]
#[clap(
    version,
    about = "Forward HTTP proxy with CONNECT tunneling for HTTPS"
)]
struct Args {
    #[clap(short, long, value_name = "PORT", help = "Port to listen on, all interfaces (default: 8080)")]
    port: Option<u16>,

    #[clap(short, long, value_name = "ADDR", help = "Full listen address (e.g., 127.0.0.1:3128), overrides --port")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Outbound connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for receiving request headers in seconds")]
    header_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Tunnel idle timeout in seconds (0 = never)")]
    idle_timeout: Option<u64>,

    #[clap(long, value_name = "MILLIS", help = "Tunnel readiness poll interval in milliseconds")]
    poll_interval_ms: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Maximum number of concurrent client connections")]
    max_connections: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP header size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Handle generate-config flag
    if let Some(config_file) = args.generate_config {
        generate_sample_config(&config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    // Load configuration
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };
    apply_args(&mut config, &args)?;

    // Initialize logging
    if let Some(level) = &args.log_level {
        logging::parse_log_level(level)?;
    }
    if let Some(format) = &args.log_format {
        logging::parse_log_format(format)?;
    }
    match config.logging.clone() {
        Some(logging_config) if args.log_level.is_none() && args.log_format.is_none() => {
            CustomLogger::init(logging_config)?;
        }
        _ => logging::init_fallback(args.log_level.as_deref(), args.log_format.as_deref())?,
    }

    // Validate configuration
    let validation = ConfigValidator::validate(&config);
    for warning in &validation.warnings {
        warn!("Configuration warning: {}", warning);
    }
    if !validation.is_valid {
        for e in &validation.errors {
            error!("Configuration error: {}", e);
        }
        return Err(format!("Invalid configuration: {}", validation.errors.join("; ")).into());
    }

    info!("Starting proxy server on port {}", config.listen_addr.port());

    let shutdown = CancellationToken::new();
    let server = ProxyServer::new(&config);
    let mut server_handle = tokio::spawn(server.run(config.listen_addr, shutdown.clone()));

    // Wait for Ctrl+C signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down proxy server...");
            shutdown.cancel();
            match server_handle.await {
                Ok(result) => result?,
                Err(e) => error!("Server task error: {}", e),
            }
        }
        result = &mut server_handle => {
            match result {
                Ok(result) => result?,
                Err(e) => error!("Server task error: {}", e),
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

fn apply_args(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse::<SocketAddr>()?;
    } else if let Some(port) = args.port {
        config.listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
    }
    if args.connect_timeout.is_some() {
        config.connect_timeout_secs = args.connect_timeout;
    }
    if args.header_timeout.is_some() {
        config.header_timeout_secs = args.header_timeout;
    }
    if args.idle_timeout.is_some() {
        config.idle_timeout_secs = args.idle_timeout;
    }
    if args.poll_interval_ms.is_some() {
        config.poll_interval_ms = args.poll_interval_ms;
    }
    if args.max_connections.is_some() {
        config.max_connections = args.max_connections;
    }
    if args.max_header_size.is_some() {
        config.max_header_size = args.max_header_size;
    }
    Ok(())
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
        logging: Some(Default::default()),
        ..Config::default()
    };
    config.to_file(file_path)?;
    Ok(())
}
