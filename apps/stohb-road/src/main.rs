use clap::Parser;
use stohb_road::{cli::Cli, config::Config, serve, websocket::SignalingState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = cli.apply(Config::from_env());
    info!("Starting Stohb Road pairing broker on port {}", config.port);
    info!(
        "Heartbeat timeout: {} seconds, max payload: {} bytes",
        config.heartbeat_timeout.as_secs(),
        config.max_payload_bytes
    );

    let state = SignalingState::new(&config);

    let addr = format!("{}:{}", cli.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Stohb Road listening on {}", addr);

    if let Err(e) = serve(listener, state).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
