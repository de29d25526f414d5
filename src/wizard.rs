//! First-run setup wizard for printer configuration.
//!
//! Unlike the teacher's Bambu wizard (which has to ask for an IP and serial
//! by hand, since Bambu's cloud-bound discovery isn't available over plain
//! LAN broadcast), Elegoo printers answer a UDP broadcast directly (§4.2),
//! so this wizard runs discovery first and only falls back to manual entry
//! when nothing answers.

use crate::config::ConnectFileConfig;
use crate::discovery::{self, BROADCAST_PROBE_TIMEOUT};
use crate::identity::{ConnectionConfig, Identity};
use anyhow::{Context, Result};
use std::io::{self, Write};
use std::net::IpAddr;

/// Runs the interactive first-run setup wizard: discover, let the user pick
/// devices to keep, prompt an access code where the dialect needs one, and
/// persist the result.
pub async fn run_setup_wizard() -> Result<ConnectFileConfig> {
    println!();
    println!("Welcome to elegoo-connect!");
    println!("==========================");
    println!();
    println!("No configuration file found. Searching the local network for printers...");

    let mut found = discovery::discover(BROADCAST_PROBE_TIMEOUT).await;
    if found.is_empty() {
        println!("No printers answered. You can enter one manually instead.");
        if let Some(identity) = prompt_manual_identity().await? {
            found.push(identity);
        }
    } else {
        println!();
        println!("Found {} printer(s):", found.len());
        for (index, identity) in found.iter().enumerate() {
            println!(
                "  [{}] {} ({}) at {} — {:?}",
                index + 1,
                identity.name,
                identity.model,
                identity.ip_address,
                identity.protocol_kind
            );
        }
    }

    let mut config = ConnectFileConfig::default();
    for identity in found {
        if !prompt_yes_no(&format!("Add \"{}\" ({})?", identity.name, identity.ip_address))? {
            continue;
        }
        let access_code = if identity.requires_access_code() {
            Some(prompt_access_code("Access code")?)
        } else {
            None
        };
        config.upsert_device(ConnectionConfig {
            identity,
            proxy_enabled: false,
            proxy_ws_port: 3030,
            proxy_video_port: 3031,
            access_code,
        });
    }

    if config.devices.is_empty() {
        println!();
        println!("No devices configured; exiting without writing a config file.");
        return Ok(config);
    }

    config.save()?;
    let config_path = ConnectFileConfig::config_path()?;
    println!();
    println!("Configuration saved to: {}", config_path.display());
    println!("  {} device(s) configured.", config.devices.len());
    println!();

    Ok(config)
}

/// Builds an [`Identity`] from a manually entered IP by running a directed
/// (single-target) discovery probe against it, rather than fabricating one
/// from guesses — we still need the printer's own answer for its serial,
/// model, and protocol dialect.
async fn prompt_manual_identity() -> Result<Option<Identity>> {
    let ip = prompt_ip("Printer IP address")?;
    println!("Probing {ip}...");
    let identities = discovery::discover(discovery::DIRECTED_PROBE_TIMEOUT).await;
    Ok(identities.into_iter().find(|identity| identity.ip_address == ip))
}

fn prompt_ip(label: &str) -> Result<IpAddr> {
    loop {
        let input = prompt(label)?;
        match input.parse::<IpAddr>() {
            Ok(ip) => return Ok(ip),
            Err(_) => {
                println!("  Invalid IP address format. Please enter a valid IPv4 or IPv6 address.");
                println!("  Example: 192.168.1.100");
            }
        }
    }
}

fn prompt_access_code(label: &str) -> Result<String> {
    loop {
        let input = prompt(label)?;
        if input.len() < 4 {
            println!("  Access code seems too short (minimum 4 characters).");
            println!("  Access codes are found in the printer's network settings.");
            continue;
        }
        return Ok(input);
    }
}

fn prompt(label: &str) -> Result<String> {
    loop {
        print!("{label}: ");
        io::stdout()
            .flush()
            .context("failed to flush stdout during prompt")?;

        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .context("failed to read user input")?;

        let trimmed = input.trim();
        if trimmed.is_empty() {
            println!("  This field is required. Please enter a value.");
            continue;
        }
        return Ok(trimmed.to_string());
    }
}

fn prompt_yes_no(label: &str) -> Result<bool> {
    loop {
        print!("{label} (y/n): ");
        io::stdout()
            .flush()
            .context("failed to flush stdout during prompt")?;

        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .context("failed to read user input")?;

        match input.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => println!("  Please enter 'y' for yes or 'n' for no."),
        }
    }
}
