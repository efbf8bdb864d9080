use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use neopool_lib::{
    protocol as proto,
    timer::{self, RepeatPeriod, TimerEnable, TimerName},
};
use std::path::PathBuf;
use std::time::Duration;

fn parse_register(s: &str) -> Result<u16, String> {
    clap_num::maybe_hex::<u16>(s).map_err(|e| format!("Invalid register value format: {e}"))
}

fn parse_unit_id(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid unit id format: {e}"))
}

fn parse_aux_relay(s: &str) -> Result<proto::AuxRelay, String> {
    let index =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid relay number format: {e}"))?;
    proto::AuxRelay::try_from(index).map_err(|e| e.to_string())
}

fn parse_switch(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => Err(format!("Expected 'on' or 'off', got '{s}'")),
    }
}

fn parse_timer(s: &str) -> Result<TimerName, String> {
    s.parse().map_err(|e: proto::Error| e.to_string())
}

fn parse_enable(s: &str) -> Result<TimerEnable, String> {
    let enable: TimerEnable = s.parse().map_err(|e: proto::Error| e.to_string())?;
    enable.encode_for_write().map_err(|e| e.to_string())?;
    Ok(enable)
}

fn parse_time_of_day(s: &str) -> Result<u32, String> {
    timer::time_to_seconds(s).map_err(|e| e.to_string())
}

fn parse_period(s: &str) -> Result<RepeatPeriod, String> {
    s.parse().map_err(|e: proto::Error| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: read all values at a fixed interval until Ctrl-C.
    /// A failed cycle keeps printing the last complete snapshot.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval between read cycles (e.g., "30s", "1m")
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "30s")]
        poll_interval: Duration,
    },

    /// Read and display every register page, bitfield and timer.
    ReadAll {
        /// Print the snapshot as YAML instead of one fact per line.
        #[arg(long)]
        yaml: bool,
    },

    /// Read and display one timer block.
    ReadTimer {
        /// Timer name: filtration1..3, aux1..4, light, aux1_2..aux4_2.
        #[arg(value_parser = parse_timer)]
        timer: TimerName,
    },

    /// Write one or more consecutive holding registers.
    /// Values can be given in decimal or hexadecimal (e.g., "0x02D0").
    #[clap(verbatim_doc_comment)]
    WriteRegister {
        /// Address of the first register.
        #[arg(value_parser = parse_register)]
        address: u16,
        /// Register values, at most 31.
        #[arg(required = true, value_parser = parse_register)]
        values: Vec<u16>,
        /// Persist the change to EEPROM and make the controller apply it.
        #[arg(long)]
        apply: bool,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Switch an auxiliary relay (1 to 4) on or off.
    SetAux {
        #[arg(value_parser = parse_aux_relay)]
        relay: proto::AuxRelay,
        /// "on" or "off".
        #[arg(value_parser = parse_switch, action = clap::ArgAction::Set)]
        state: bool,
    },

    /// Change fields of a timer block. Fields not given keep their current value.
    SetTimer {
        #[arg(value_parser = parse_timer)]
        timer: TimerName,
        /// disabled, auto, on or off.
        #[arg(long, value_parser = parse_enable)]
        enable: Option<TimerEnable>,
        /// Start time of day, "HH:MM".
        #[arg(long, value_parser = parse_time_of_day)]
        start: Option<u32>,
        /// Stop time of day, "HH:MM".
        #[arg(long, value_parser = parse_time_of_day)]
        stop: Option<u32>,
        /// Repeat period, e.g. "1 day" or "2 weeks".
        #[arg(long, value_parser = parse_period)]
        period: Option<RepeatPeriod>,
    },

    /// Set the heating setpoint (°C). The smart temperature setpoint follows it.
    SetHeating {
        value: u16,
    },

    /// Read all values once and display the connection statistics.
    Stats,
}

const fn about_text() -> &'static str {
    "NeoPool CLI - Monitor and control NeoPool pool controllers via Modbus/TCP."
}

#[derive(Parser, Debug)]
#[command(
    name = "neopool",
    author,
    version,
    about = about_text(),
    long_about = None,
    propagate_version = true
)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// YAML configuration file. "neopool.yaml" is used if present.
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    /// Hostname or IP address of the controller. Overrides the configuration file.
    #[arg(global = true, long)]
    pub host: Option<String>,

    /// Modbus/TCP port. Overrides the configuration file.
    #[arg(global = true, long)]
    pub port: Option<u16>,

    /// Modbus unit id. Overrides the configuration file.
    #[arg(global = true, long, value_parser = parse_unit_id)]
    pub unit_id: Option<u8>,

    /// Modbus I/O timeout for connects and requests.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}
