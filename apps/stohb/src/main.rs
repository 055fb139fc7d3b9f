use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use stohb_core::cli::{Cli, Command, ProvideArgs, ReceiveArgs};
use stohb_core::config::Config;
use stohb_core::identity::PeerCode;
use stohb_core::protocol::AppMessage;
use stohb_core::session::{ConnectionFacade, Role, SignalingStatus};
use stohb_core::sheet::{ProviderHost, ReceiverHost, image_data_uri};
use stohb_core::telemetry::logging as logctl;
use stohb_core::transport::RelayTransport;
use tracing::info;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    logctl::init(&cli.logging.to_config())?;
    let config = Config::from_env().with_signaling_url(&cli.signaling_url);
    info!(target = "stohb::cli", url = %config.signaling_url, "using pairing broker");

    match cli.command {
        Command::Provide(args) => provide(&config, args).await,
        Command::Receive(args) => receive(&config, args).await,
    }
}

fn facade_for(config: &Config, role: Role, code: Option<&str>) -> Result<ConnectionFacade> {
    let transport = Arc::new(RelayTransport::new(&config.signaling_url, config.heartbeat)?);
    let mut builder = ConnectionFacade::builder(role, transport).with_config(config);
    if let Some(code) = code {
        builder = builder.identity(PeerCode::parse(code)?);
    }
    Ok(builder.build()?)
}

async fn await_registration(facade: &ConnectionFacade) -> Result<PeerCode> {
    let state = facade
        .wait_for(|state| state.is_registered || state.signaling == SignalingStatus::Failed)
        .await
        .ok_or_else(|| anyhow!("session closed before registering"))?;
    match state.local_id {
        Some(code) if state.is_registered => Ok(code),
        _ => match state.last_error {
            Some(err) => bail!("could not register with the broker: {err}"),
            None => bail!("could not register with the broker"),
        },
    }
}

async fn provide(config: &Config, args: ProvideArgs) -> Result<()> {
    let facade = facade_for(config, Role::Provider, args.code.as_deref())?;
    let host = Arc::new(ProviderHost::new(args.select));
    facade.spawn_handler(host.clone());

    let code = await_registration(&facade).await?;
    println!("📷 Pairing code: {code}");
    match args.select {
        Some(cell) => println!("   Assigning cell {},{} to devices that connect", cell.row, cell.col),
        None => println!("   No cell selected; devices will connect but receive no assignment"),
    }
    println!("   Press Ctrl-C to stop.");

    let mut states = facade.watch_state();
    let mut sessions = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if state.open_sessions != sessions {
                    sessions = state.open_sessions;
                    println!("🔗 Connected devices: {}", render_codes(&sessions));
                }
                if let Some(err) = state.last_error {
                    println!("⚠️  {err}");
                    facade.clear_error();
                }
            }
        }
    }

    facade.dispose().await;
    for (cell, count) in host.filled_cells() {
        println!("🖼️  Cell {},{}: {count} image(s)", cell.row, cell.col);
    }
    Ok(())
}

async fn receive(config: &Config, args: ReceiveArgs) -> Result<()> {
    let facade = facade_for(config, Role::Receiver, None)?;
    let host = Arc::new(ReceiverHost::new());
    facade.spawn_handler(host.clone());

    let result = send_images(&facade, &host, &args).await;
    facade.dispose().await;
    result
}

async fn send_images(facade: &ConnectionFacade, host: &ReceiverHost, args: &ReceiveArgs) -> Result<()> {
    let local = await_registration(facade).await?;
    println!("📱 Registered as {local}");

    facade.connect(&args.code).await?;
    let remote = PeerCode::parse(&args.code)?;
    let state = facade
        .wait_for(|state| state.open_sessions.contains(&remote) || state.last_error.is_some())
        .await
        .ok_or_else(|| anyhow!("session closed while connecting"))?;
    if let Some(err) = state.last_error {
        bail!(err);
    }
    println!("🔗 Connected to {remote}, waiting for a cell");

    let (provider, assignment) = tokio::time::timeout(
        Duration::from_secs(args.wait_secs),
        host.wait_for_assignment(),
    )
    .await
    .context("the provider did not assign a cell; select a photo cell on the sheet and retry")?;
    let cell = assignment.cell();
    let remaining = host.remaining();
    println!(
        "📥 Assigned cell {},{} ({} image(s) already there)",
        cell.row, cell.col, assignment.current_count
    );

    if args.images.len() > remaining {
        println!("⚠️  The cell takes {remaining} more image(s); skipping the rest");
    }
    for path in args.images.iter().take(remaining) {
        let uri = image_data_uri(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let delivery = facade
            .send(AppMessage::image(cell, uri), Some(provider.clone()))
            .await?;
        if delivery.recipients().is_empty() {
            bail!("lost the session with {provider} before {} was sent", path.display());
        }
        println!("✅ Sent {}", path.display());
    }
    Ok(())
}

fn render_codes(codes: &[PeerCode]) -> String {
    if codes.is_empty() {
        return "none".to_string();
    }
    codes
        .iter()
        .map(PeerCode::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
