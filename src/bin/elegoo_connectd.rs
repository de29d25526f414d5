//! `elegoo-connectd`: the CLI entry point over the connectivity core (§4.8).
//!
//! Mirrors the shape of the teacher's `bambutop` binary (`clap::Parser` args,
//! `--reset` wiping the config file, config-file-or-wizard bootstrap) but
//! drives [`elegoo_connect::client::PrinterClient`] + an optional
//! [`elegoo_connect::proxy`] per configured device instead of a TUI, since
//! this crate is a headless connectivity core rather than a terminal app.

use anyhow::{Context, Result};
use clap::Parser;
use elegoo_connect::client::PrinterClient;
use elegoo_connect::config::ConnectFileConfig;
use elegoo_connect::discovery::{self, BROADCAST_PROBE_TIMEOUT};
use elegoo_connect::proxy;
use elegoo_connect::wizard;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "elegoo-connectd")]
#[command(about = "Connectivity daemon for Elegoo 3D printers")]
#[command(version)]
struct Args {
    /// Printer IP address. Only consulted alongside --serial for a one-off
    /// device not already in the config file.
    #[arg(long)]
    ip: Option<String>,

    /// Printer serial number (overrides config file lookup by serial).
    #[arg(long)]
    serial: Option<String>,

    /// Printer access code, required for the MQTT-CC2 dialect.
    #[arg(long)]
    access_code: Option<String>,

    /// Run the local multiplexing proxy (§4.6) for every connected device.
    #[arg(long)]
    proxy: bool,

    /// Probe the network for printers and print what answered, then exit.
    #[arg(long)]
    discover_only: bool,

    /// Delete the config file and run the setup wizard again.
    #[arg(long)]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::filter::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if std::env::var("DEBUG").as_deref() == Ok("true") {
                    format!("{}=debug", env!("CARGO_CRATE_NAME")).into()
                } else {
                    format!("{}=info", env!("CARGO_CRATE_NAME")).into()
                }
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.discover_only {
        return run_discover_only().await;
    }

    if args.reset {
        let config_path =
            ConnectFileConfig::config_path().context("failed to determine config path")?;
        if config_path.exists() {
            std::fs::remove_file(&config_path).context("failed to remove config file")?;
        }
    }

    let mut config = match ConnectFileConfig::load()? {
        Some(config) => config,
        None => wizard::run_setup_wizard().await?,
    };

    if let (Some(ip), Some(serial)) = (args.ip.as_ref(), args.serial.as_ref()) {
        if config.device_by_serial(serial).is_none() {
            println!("Device {serial} not in config; probing {ip} to add it...");
            let identities = discovery::discover(discovery::DIRECTED_PROBE_TIMEOUT).await;
            if let Some(identity) = identities.into_iter().find(|i| &i.serial == serial) {
                config.upsert_device(elegoo_connect::identity::ConnectionConfig {
                    identity,
                    proxy_enabled: args.proxy,
                    proxy_ws_port: config.defaults.proxy_port_base,
                    proxy_video_port: config.defaults.proxy_port_base + 1,
                    access_code: args.access_code.clone(),
                });
                config.save().context("failed to save config")?;
            }
        }
    }

    if config.devices.is_empty() {
        println!("No devices configured. Run again to use the setup wizard, or pass --ip/--serial.");
        return Ok(());
    }

    run_devices(config, args.proxy).await
}

async fn run_discover_only() -> Result<()> {
    println!("Probing the local network for printers ({BROADCAST_PROBE_TIMEOUT:?} timeout)...");
    let found = discovery::discover(BROADCAST_PROBE_TIMEOUT).await;
    if found.is_empty() {
        println!("No printers answered.");
        return Ok(());
    }
    for identity in &found {
        println!(
            "{}\t{}\t{}\t{:?}\t{}",
            identity.serial, identity.name, identity.model, identity.protocol_kind, identity.ip_address
        );
    }
    Ok(())
}

/// Opens every configured device concurrently, starts its proxy if enabled
/// or requested on the command line, and prints status transitions until
/// the process receives a shutdown signal.
async fn run_devices(config: ConnectFileConfig, force_proxy: bool) -> Result<()> {
    let mut tasks = Vec::new();

    for device in config.devices.clone() {
        let run_proxy = force_proxy || device.proxy_enabled;
        tasks.push(tokio::spawn(async move {
            if let Err(error) = run_one_device(device, run_proxy).await {
                tracing::error!(%error, "device task ended");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    println!("\nShutting down...");
    for task in tasks {
        task.abort();
    }

    Ok(())
}

async fn run_one_device(
    device: elegoo_connect::identity::ConnectionConfig,
    run_proxy: bool,
) -> Result<()> {
    let identity = device.identity.clone();
    println!(
        "Connecting to {} ({}) at {}...",
        identity.name, identity.model, identity.ip_address
    );
    let client = PrinterClient::open(&device).await?;
    println!("Connected to {} ({}).", identity.name, identity.serial);

    let mut snapshot_rx = client.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            if snapshot_rx.changed().await.is_err() {
                break;
            }
            let snapshot = snapshot_rx.borrow().clone();
            tracing::info!(serial = %identity.serial, stale = snapshot.stale, "status update");
        }
    });

    if run_proxy {
        let printer_ip = device.identity.ip_address;
        let control_port = device.proxy_ws_port;
        let video_port = device.proxy_video_port;
        println!(
            "Proxy listening: ws=0.0.0.0:{control_port} video=0.0.0.0:{video_port}"
        );
        proxy::run(client.session_handle(), printer_ip, control_port, video_port).await?;
    } else {
        // No proxy requested: just keep the session alive until shutdown.
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    watcher.abort();
    client.close().await;
    Ok(())
}
