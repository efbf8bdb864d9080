//! NeoPool CLI
//!
//! A command-line interface (CLI) application for monitoring and controlling
//! NeoPool pool controllers over Modbus/TCP.
//!
//! This tool allows users to:
//! - Read every measurement, status bitfield, setting and timer in one cycle.
//! - Write holding registers, optionally persisting them to EEPROM.
//! - Switch the auxiliary relays by hand.
//! - Change timer blocks and the heating setpoint.
//! - Run in a continuous daemon mode that prints a snapshot per interval.
//!
//! The CLI leverages the `neopool_lib` crate for protocol definitions and client operations.

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use neopool_lib::{
    config::ClientConfig,
    protocol::Snapshot,
    timer::TimerUpdate,
    tokio_async,
    tokio_async_safe_client::SafeClient,
    tokio_common::Error,
};
use std::panic;
use std::path::Path;

mod commandline;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Loads the configuration file and applies the commandline overrides.
fn load_config(args: &commandline::CliArgs) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("Cannot load configuration {}", path.display()))?,
        None if Path::new(ClientConfig::DEFAULT_CONFIG_FILE).exists() => {
            ClientConfig::from_file(ClientConfig::DEFAULT_CONFIG_FILE).with_context(|| {
                format!("Cannot load configuration {}", ClientConfig::DEFAULT_CONFIG_FILE)
            })?
        }
        None => ClientConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(unit_id) = args.unit_id {
        config.unit_id = unit_id;
    }
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    Ok(config)
}

fn print_snapshot(snapshot: &Snapshot, yaml: bool) -> Result<()> {
    if yaml {
        print!(
            "{}",
            serde_yaml::to_string(snapshot).context("Cannot serialize snapshot")?
        );
    } else {
        println!("{snapshot}");
    }
    Ok(())
}

fn confirm_write(address: u16, values: &[u16], apply: bool) -> Result<bool> {
    println!("About to write {values:?} starting at register {address:#06x}.");
    if apply {
        println!("The change will be stored in EEPROM and applied by the controller.");
    }
    Confirm::new()
        .with_prompt("Do you want to continue?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

async fn run_daemon(client: &SafeClient, poll_interval: std::time::Duration) -> Result<()> {
    info!("Starting daemon mode: interval={poll_interval:?}");
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
            _ = interval.tick() => {
                match client.refresh().await {
                    Ok(snapshot) => print_snapshot(&snapshot, false)?,
                    Err(Error::NotReady) => warn!("Controller not ready yet"),
                    Err(err) => return Err(err.into()),
                }
                info!("{}", client.connection_stats().await);
            }
        }
    }
}

async fn execute(client: &SafeClient, command: &commandline::CliCommands) -> Result<()> {
    match command {
        commandline::CliCommands::Daemon { poll_interval } => {
            run_daemon(client, *poll_interval).await?;
        }
        commandline::CliCommands::ReadAll { yaml } => {
            info!("Executing: Read All");
            let outcome = client
                .read_snapshot()
                .await
                .with_context(|| "Cannot connect to controller")?;
            print_snapshot(&outcome.snapshot, *yaml)?;
            if let Some(err) = outcome.error {
                return Err(anyhow::Error::from(err).context("Read cycle incomplete"));
            }
            for timer in &outcome.skipped_timers {
                warn!("Timer {timer} could not be read");
            }
        }
        commandline::CliCommands::ReadTimer { timer } => {
            info!("Executing: Read Timer {timer}");
            let block = client
                .read_timer(*timer)
                .await
                .with_context(|| format!("Cannot read timer {timer}"))?;
            println!("{timer}: {block}");
        }
        commandline::CliCommands::WriteRegister {
            address,
            values,
            apply,
            yes,
        } => {
            if !*yes && !confirm_write(*address, values, *apply)? {
                info!("Write aborted by user.");
                return Ok(());
            }
            info!("Executing: Write {values:?} to {address:#06x}");
            let confirmation = client
                .write_register(*address, values, *apply)
                .await
                .with_context(|| format!("Failed to write register {address:#06x}"))?;
            if confirmation.is_confirmed() {
                println!("Register {address:#06x} written successfully.");
            } else {
                println!(
                    "Register {address:#06x} written, but the controller reports {:?}.",
                    confirmation.read_back
                );
            }
        }
        commandline::CliCommands::SetAux { relay, state } => {
            let on = if *state { "on" } else { "off" };
            info!("Executing: Switch {relay} {on}");
            let word = client
                .write_aux_relay(**relay, *state)
                .await
                .with_context(|| format!("Failed to switch {relay} {on}"))?;
            for (name, value) in tokio_async::relay_facts(word) {
                println!("{name}: {value}");
            }
        }
        commandline::CliCommands::SetTimer {
            timer,
            enable,
            start,
            stop,
            period,
        } => {
            let update = TimerUpdate {
                enable: *enable,
                on: *start,
                off: *stop,
                period: period.map(|period| period.seconds()),
                ..Default::default()
            };
            if update.is_empty() {
                anyhow::bail!("Nothing to change for timer {timer}");
            }
            info!("Executing: Update Timer {timer}");
            let block = client
                .write_timer(*timer, &update)
                .await
                .with_context(|| format!("Failed to update timer {timer}"))?;
            println!("{timer}: {block}");
        }
        commandline::CliCommands::SetHeating { value } => {
            info!("Executing: Set Heating Setpoint to {value} °C");
            client
                .write_heating_setpoint(*value)
                .await
                .with_context(|| format!("Failed to set heating setpoint to {value}"))?;
            println!("Heating setpoint set to {value} °C.");
        }
        commandline::CliCommands::Stats => {
            if let Err(err) = client.refresh().await {
                warn!("Read cycle failed: {err}");
            }
            println!("{}", client.connection_stats().await);
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "NeoPool CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Configuration file plus overrides
    let config = load_config(&args)?;
    let client = SafeClient::from_config(&config)?;
    info!(
        "Using controller {}:{} (unit {})",
        config.host, config.port, config.unit_id
    );

    // 3. Execute the command
    let result = execute(&client, &args.command).await;
    client.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_config_values() {
        let args = commandline::CliArgs::try_parse_from([
            "neopool",
            "--host",
            "10.0.0.7",
            "--unit-id",
            "0x02",
            "--timeout",
            "3s",
            "stats",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.host, "10.0.0.7");
        assert_eq!(config.unit_id, 2);
        assert_eq!(config.timeout, std::time::Duration::from_secs(3));
        assert_eq!(config.port, 502);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = commandline::CliArgs::try_parse_from([
            "neopool",
            "--config",
            "/nonexistent/neopool.yaml",
            "stats",
        ])
        .unwrap();
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn snapshot_as_yaml() {
        let mut snapshot = Snapshot::new();
        snapshot.insert("pH", neopool_lib::protocol::Value::Float(7.2));
        snapshot.insert("AUX1", neopool_lib::protocol::Value::Bool(true));
        let text = serde_yaml::to_string(&snapshot).unwrap();
        assert!(text.contains("pH: 7.2"));
        assert!(text.contains("AUX1: true"));
    }
}
