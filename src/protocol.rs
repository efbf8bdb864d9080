//! Register map of the NeoPool controller.
//!
//! This module is the single source of truth for where a named value lives on
//! the device and how its raw registers are turned into a typed [`Value`]. It
//! contains no I/O: the orchestration in [`crate::tokio_async`] reads whole
//! [`Page`]s and hands the raw words to [`Register::decode`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of registers the device returns for a single read request.
pub const MAX_READ_REGISTERS: u16 = 31;
/// Maximum number of registers accepted by a single write request.
pub const MAX_WRITE_REGISTERS: u16 = 31;

/// Writing `1` here persists the most recent register writes to EEPROM.
pub const EEPROM_COMMIT_REG_ADDR: u16 = 0x02F0;
/// Writing `1` here makes pending configuration take effect immediately.
pub const EXECUTE_REG_ADDR: u16 = 0x02F5;
/// Unlocks manual control of the auxiliary relays while set to `1`.
pub const AUX_UNLOCK_REG_ADDR: u16 = 0x0289;
/// Relay state word, read as an input register and written as a holding register.
pub const RELAY_STATE_REG_ADDR: u16 = 0x010E;
/// Cheap register used to probe a connection that has been idle for a while.
pub const HEALTH_PROBE_REG_ADDR: u16 = 0x0002;

pub const HEATING_SETPOINT_REG_ADDR: u16 = 0x050D;
pub const SMART_TEMPERATURE_SETPOINT_REG_ADDR: u16 = 0x050E;

/// Errors caused by invalid arguments, never by the device.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Auxiliary relay index {0} is out of range (1..=4)")]
    AuxRelayOutOfRange(u8),
    #[error("Unknown timer block '{0}'")]
    UnknownTimer(String),
    #[error("Timer enable mode '{0}' is reported by the device but cannot be written")]
    EnableNotWritable(&'static str),
    #[error("Unknown timer enable mode '{0}'")]
    UnknownEnableMode(String),
    #[error("Unknown repeat period '{0}'")]
    UnknownPeriod(String),
    #[error("Invalid time of day '{0}', expected HH:MM")]
    InvalidTimeOfDay(String),
    #[error("Time step of {0} minutes does not divide a day")]
    InvalidTimeStep(u16),
    #[error("Register count {0} is out of range (1..={MAX_WRITE_REGISTERS})")]
    RegisterCountOutOfRange(usize),
}

/// Modbus address space a page is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// Function code 0x03.
    Holding,
    /// Function code 0x04.
    Input,
}

/// A contiguous register range read with a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub name: &'static str,
    pub function: Function,
    pub address: u16,
    pub quantity: u16,
}

impl Page {
    const fn new(name: &'static str, function: Function, address: u16, quantity: u16) -> Self {
        Self {
            name,
            function,
            address,
            quantity,
        }
    }

    /// Returns true if `address` lies inside this page.
    pub fn contains(&self, address: u16) -> bool {
        address >= self.address
            && u32::from(address) < u32::from(self.address) + u32::from(self.quantity)
    }

    /// All catalog registers that are decoded from this page, in address order.
    pub fn registers(&self) -> impl Iterator<Item = &'static Register> + '_ {
        CATALOG.iter().filter(move |reg| self.contains(reg.address))
    }
}

/// Pages read by one snapshot cycle, in the order they are requested.
pub const PAGES: &[Page] = &[
    Page::new("general", Function::Holding, 0x0000, 0x0010),
    Page::new("measurement", Function::Input, 0x0100, 0x0012),
    Page::new("global", Function::Holding, 0x0206, 0x0014),
    Page::new("hydrolysis", Function::Holding, 0x0280, 0x0002),
    Page::new("factory", Function::Holding, 0x0300, 0x0010),
    Page::new("installer", Function::Holding, 0x0408, 0x001F),
    Page::new("installer_ext", Function::Holding, 0x0427, 0x000D),
    Page::new("user", Function::Holding, 0x0502, 0x000E),
    Page::new("misc", Function::Holding, 0x0600, 0x0008),
];

/// Decoder families for single-word bitfields, see [`crate::bitfield`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitfield {
    Notification,
    RelayState,
    /// Per measurement channel status, the payload is the fact name prefix.
    ChannelStatus(&'static str),
    Ionization,
    Hydrolysis,
}

/// How the raw registers of a catalog entry become a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kind {
    Raw,
    /// Raw integer divided by a power of ten.
    Scaled(f64),
    /// Two registers, low word at the lower address.
    U32,
    /// ASCIIZ string packed two characters per register.
    Ascii(u16),
    Bitfield(Bitfield),
}

/// One named value in the register map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Register {
    pub name: &'static str,
    pub address: u16,
    pub unit: Option<&'static str>,
    pub kind: Kind,
}

const fn reg(name: &'static str, address: u16, unit: Option<&'static str>, kind: Kind) -> Register {
    Register {
        name,
        address,
        unit,
        kind,
    }
}

const fn raw(name: &'static str, address: u16) -> Register {
    reg(name, address, None, Kind::Raw)
}

const fn scaled(name: &'static str, address: u16, scale: f64, unit: &'static str) -> Register {
    reg(name, address, Some(unit), Kind::Scaled(scale))
}

const fn bits(name: &'static str, address: u16, bitfield: Bitfield) -> Register {
    reg(name, address, None, Kind::Bitfield(bitfield))
}

#[rustfmt::skip]
pub const CATALOG: &[Register] = &[
    // general
    raw("Power module version", 0x0002),
    reg("Power module node id", 0x0004, None, Kind::Ascii(6)),
    raw("Power module register", 0x000C),
    raw("Power module data", 0x000D),
    // measurement
    raw("Ionization current", 0x0100),
    scaled("Hydrolysis current", 0x0101, 10.0, "g/h"),
    scaled("pH", 0x0102, 100.0, "pH"),
    reg("Redox", 0x0103, Some("mV"), Kind::Raw),
    scaled("Chlorine", 0x0104, 100.0, "ppm"),
    reg("Conductivity", 0x0105, Some("%"), Kind::Raw),
    scaled("Water temperature", 0x0106, 10.0, "°C"),
    bits("pH status", 0x0107, Bitfield::ChannelStatus("pH")),
    bits("Redox status", 0x0108, Bitfield::ChannelStatus("Redox")),
    bits("Chlorine status", 0x0109, Bitfield::ChannelStatus("Chlorine")),
    bits("Conductivity status", 0x010A, Bitfield::ChannelStatus("Conductivity")),
    bits("Ionization status", 0x010C, Bitfield::Ionization),
    bits("Hydrolysis status", 0x010D, Bitfield::Hydrolysis),
    bits("Relay state", RELAY_STATE_REG_ADDR, Bitfield::RelayState),
    raw("Hydrolysis switch value", 0x010F),
    bits("Notification", 0x0110, Bitfield::Notification),
    scaled("Hydrolysis voltage", 0x0111, 10.0, "V"),
    // global
    reg("Cell runtime", 0x0206, Some("s"), Kind::U32),
    reg("Cell partial runtime", 0x0208, Some("s"), Kind::U32),
    raw("Cell boost", 0x020C),
    reg("Cell runtime polarity 1", 0x0214, Some("s"), Kind::U32),
    reg("Cell runtime polarity 2", 0x0216, Some("s"), Kind::U32),
    reg("Cell polarity changes", 0x0218, None, Kind::U32),
    // hydrolysis
    raw("Hydrolysis module version", 0x0280),
    raw("Hydrolysis module connectivity", 0x0281),
    // factory
    raw("Firmware version", 0x0300),
    raw("Model", 0x0301),
    reg("Serial number", 0x0302, None, Kind::U32),
    raw("Ionization nominal", 0x0304),
    scaled("Hydrolysis nominal", 0x0306, 10.0, "g/h"),
    reg("Salt cell constant", 0x030B, None, Kind::Raw),
    // installer
    reg("Device time", 0x0408, Some("s"), Kind::U32),
    raw("pH acid relay", 0x0410),
    raw("pH base relay", 0x0411),
    raw("Redox relay", 0x0412),
    raw("Chlorine relay", 0x0413),
    raw("Conductivity relay", 0x0414),
    raw("Temperature sensor active", 0x0415),
    raw("Lighting relay", 0x0416),
    raw("Filtration relay", 0x0417),
    raw("Filtration mode", 0x041A),
    raw("Heating relay", 0x0420),
    // installer_ext
    reg("pH pump repeat time", 0x0427, Some("s"), Kind::Raw),
    reg("pH pump pause time", 0x0428, Some("s"), Kind::Raw),
    reg("Redox pump repeat time", 0x042A, Some("s"), Kind::Raw),
    reg("Hydrolysis cover reduction", 0x0430, Some("%"), Kind::Raw),
    reg("Hydrolysis shutdown temperature", 0x0431, Some("°C"), Kind::Raw),
    // user
    scaled("Hydrolysis setpoint", 0x0502, 10.0, "%"),
    scaled("pH high setpoint", 0x0504, 100.0, "pH"),
    scaled("pH low setpoint", 0x0505, 100.0, "pH"),
    reg("Redox setpoint", 0x0508, Some("mV"), Kind::Raw),
    scaled("Chlorine setpoint", 0x050A, 100.0, "ppm"),
    raw("Conductivity setpoint", 0x050B),
    raw("Ionization setpoint", 0x050C),
    reg("Heating setpoint", HEATING_SETPOINT_REG_ADDR, Some("°C"), Kind::Raw),
    reg("Smart temperature setpoint", SMART_TEMPERATURE_SETPOINT_REG_ADDR, Some("°C"), Kind::Raw),
    raw("Filtration speed setting", 0x050F),
    // misc
    raw("Language", 0x0600),
    reg("Backlight timeout", 0x0601, Some("s"), Kind::Raw),
    raw("Sound mask", 0x0602),
    raw("Visual options", 0x0604),
    raw("Extended options", 0x0605),
];

/// Result of looking up a register inside a response that may be too short.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue<T> {
    Present(T),
    Missing,
}

impl<T> RegisterValue<T> {
    pub fn present(self) -> Option<T> {
        match self {
            RegisterValue::Present(value) => Some(value),
            RegisterValue::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, RegisterValue::Missing)
    }
}

/// Returns the word at `index`, or `Missing` if the response did not contain it.
pub fn word_at(registers: &[u16], index: usize) -> RegisterValue<u16> {
    match registers.get(index) {
        Some(word) => RegisterValue::Present(*word),
        None => RegisterValue::Missing,
    }
}

pub fn scaled_decode(value: u16, scale: f64) -> f64 {
    f64::from(value) / scale
}

pub fn scaled_encode(value: f64, scale: f64) -> u16 {
    (value * scale).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Combines two registers into a 32-bit value: `(high << 16) | low`.
pub fn u32_decode(low: u16, high: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Splits a 32-bit value into `[low, high]` register order.
pub fn u32_encode(value: u32) -> [u16; 2] {
    [(value & 0xFFFF) as u16, (value >> 16) as u16]
}

/// Decodes an ASCIIZ string, high byte first. Stops at the first zero byte.
pub fn ascii_decode(registers: &[u16]) -> String {
    registers
        .iter()
        .flat_map(|word| word.to_be_bytes())
        .take_while(|byte| *byte != 0)
        .map(char::from)
        .collect()
}

impl Register {
    /// Number of registers this entry spans.
    pub fn width(&self) -> u16 {
        match self.kind {
            Kind::U32 => 2,
            Kind::Ascii(len) => len,
            _ => 1,
        }
    }

    pub fn by_name(name: &str) -> Option<&'static Register> {
        CATALOG.iter().find(|reg| reg.name == name)
    }

    pub fn by_address(address: u16) -> Option<&'static Register> {
        CATALOG.iter().find(|reg| reg.address == address)
    }

    /// Decodes this entry from a page response read at `page_address`.
    pub fn decode(&self, registers: &[u16], page_address: u16) -> RegisterValue<Value> {
        let index = usize::from(self.address.wrapping_sub(page_address));
        let first = match word_at(registers, index) {
            RegisterValue::Present(word) => word,
            RegisterValue::Missing => return RegisterValue::Missing,
        };
        let value = match self.kind {
            Kind::Raw | Kind::Bitfield(_) => Value::Int(i64::from(first)),
            Kind::Scaled(scale) => Value::Float(scaled_decode(first, scale)),
            Kind::U32 => match word_at(registers, index + 1) {
                RegisterValue::Present(high) => Value::Int(i64::from(u32_decode(first, high))),
                RegisterValue::Missing => return RegisterValue::Missing,
            },
            Kind::Ascii(len) => {
                let end = (index + usize::from(len)).min(registers.len());
                Value::Text(ascii_decode(&registers[index..end]))
            }
        };
        RegisterValue::Present(value)
    }
}

/// A single decoded fact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Text(value) => write!(f, "{value}"),
        }
    }
}

/// Flat mapping of fact names to values, produced fresh by every read cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, Value>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl Extend<(String, Value)> for Snapshot {
    fn extend<I: IntoIterator<Item = (String, Value)>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match Register::by_name(name).and_then(|reg| reg.unit) {
                Some(unit) => writeln!(f, "{name}: {value} {unit}")?,
                None => writeln!(f, "{name}: {value}")?,
            }
        }
        Ok(())
    }
}

/// One of the four manually switchable auxiliary relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxRelay(u8);

impl AuxRelay {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 4;
    const MASKS: [u16; 4] = [0x0008, 0x0010, 0x0020, 0x0040];

    /// Bit of this relay inside the relay state word.
    pub fn mask(&self) -> u16 {
        Self::MASKS[usize::from(self.0 - Self::MIN)]
    }

    /// Returns `state` with this relay's bit set or cleared.
    pub fn apply(&self, state: u16, on: bool) -> u16 {
        if on {
            state | self.mask()
        } else {
            state & !self.mask()
        }
    }
}

impl std::ops::Deref for AuxRelay {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u8> for AuxRelay {
    type Error = Error;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::AuxRelayOutOfRange(value))
        }
    }
}

impl fmt::Display for AuxRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AUX{}", self.0)
    }
}

/// Validates the length of a register block for a single write request.
pub fn check_write_len(values: &[u16]) -> std::result::Result<(), Error> {
    if values.is_empty() || values.len() > usize::from(MAX_WRITE_REGISTERS) {
        Err(Error::RegisterCountOutOfRange(values.len()))
    } else {
        Ok(())
    }
}
