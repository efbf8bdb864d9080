//! Decoders for the single-word status and relay bitfields.
//!
//! Every decoder returns an empty map for an absent raw value. Callers must
//! read a missing key as "unknown", never as `false`.

use crate::protocol::{Bitfield, Value};
use std::collections::BTreeMap;

pub type Facts = BTreeMap<String, Value>;

/// Bits 8..=10 of the relay state word carry the running filtration speed.
pub const FILTRATION_SPEED_MASK: u16 = 0x0700;
pub const FILTRATION_SPEED_SHIFT: u16 = 8;

const NOTIFICATION_BITS: &[(&str, u16)] = &[
    ("IO changed", 0x0001),
    ("Measurements changed", 0x0002),
    ("Status changed", 0x0004),
    ("Config changed", 0x0008),
    ("Warnings changed", 0x0010),
    ("Info changed", 0x0020),
    ("Date changed", 0x0040),
    ("Page changed", 0x0080),
];

const RELAY_BITS: &[(&str, u16)] = &[
    ("pH Acid Pump", 0x0001),
    ("Filtration Pump", 0x0002),
    ("Light", 0x0004),
    ("AUX1", 0x0008),
    ("AUX2", 0x0010),
    ("AUX3", 0x0020),
    ("AUX4", 0x0040),
    ("Filtration low speed", 0x0100),
    ("Filtration mid speed", 0x0200),
    ("Filtration high speed", 0x0400),
];

const CHANNEL_BITS: &[(&str, u16)] = &[
    ("flow sensor problem", 0x0008),
    ("module control status", 0x0400),
    ("acid pump active", 0x0800),
    ("pump active", 0x1000),
    ("control module", 0x2000),
    ("measurement active", 0x4000),
    ("measurement module detected", 0x8000),
];

const IONIZATION_BITS: &[(&str, u16)] = &[
    ("Ionization on target", 0x0001),
    ("Ionization low flow", 0x0002),
    ("Ionization program time exceeded", 0x0008),
    ("Ionization dead time", 0x1000),
    ("Ionization polarity 1", 0x2000),
    ("Ionization polarity 2", 0x4000),
];

const HYDROLYSIS_BITS: &[(&str, u16)] = &[
    ("Hydrolysis on target", 0x0001),
    ("Hydrolysis low flow", 0x0002),
    ("Hydrolysis reserved", 0x0004),
    ("Hydrolysis flow indicator", 0x0008),
    ("Hydrolysis cover", 0x0010),
    ("Hydrolysis shock", 0x0100),
    ("Hydrolysis dead time", 0x1000),
    ("Hydrolysis polarity 1", 0x2000),
    ("Hydrolysis polarity 2", 0x4000),
];

fn flags(raw: u16, table: &[(&str, u16)], prefix: Option<&str>) -> Facts {
    table
        .iter()
        .map(|(name, mask)| {
            let name = match prefix {
                Some(prefix) => format!("{prefix} {name}"),
                None => (*name).to_string(),
            };
            (name, Value::Bool(raw & mask != 0))
        })
        .collect()
}

/// Page change notification mask.
pub fn notification(raw: Option<u16>) -> Facts {
    raw.map(|raw| flags(raw, NOTIFICATION_BITS, None))
        .unwrap_or_default()
}

/// Relay state word, including the running filtration speed field.
pub fn relay_state(raw: Option<u16>) -> Facts {
    let Some(raw) = raw else {
        return Facts::new();
    };
    let mut facts = flags(raw, RELAY_BITS, None);
    facts.insert(
        "Filtration current speed".to_string(),
        Value::Int(i64::from(filtration_speed(raw))),
    );
    facts
}

/// Extracts bits 8..=10 of the relay state word.
pub fn filtration_speed(raw: u16) -> u16 {
    (raw & FILTRATION_SPEED_MASK) >> FILTRATION_SPEED_SHIFT
}

/// Status word of a measurement channel (pH, Redox, Chlorine, Conductivity).
pub fn channel_status(raw: Option<u16>, prefix: &str) -> Facts {
    raw.map(|raw| flags(raw, CHANNEL_BITS, Some(prefix)))
        .unwrap_or_default()
}

pub fn ionization_status(raw: Option<u16>) -> Facts {
    raw.map(|raw| flags(raw, IONIZATION_BITS, None))
        .unwrap_or_default()
}

pub fn hydrolysis_status(raw: Option<u16>) -> Facts {
    raw.map(|raw| flags(raw, HYDROLYSIS_BITS, None))
        .unwrap_or_default()
}

impl Bitfield {
    pub fn decode(&self, raw: Option<u16>) -> Facts {
        match self {
            Bitfield::Notification => notification(raw),
            Bitfield::RelayState => relay_state(raw),
            Bitfield::ChannelStatus(prefix) => channel_status(raw, prefix),
            Bitfield::Ionization => ionization_status(raw),
            Bitfield::Hydrolysis => hydrolysis_status(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(facts: &Facts) -> Vec<&str> {
        facts.keys().map(String::as_str).collect()
    }

    #[test]
    fn absent_raw_is_empty() {
        assert!(notification(None).is_empty());
        assert!(relay_state(None).is_empty());
        assert!(channel_status(None, "pH").is_empty());
        assert!(ionization_status(None).is_empty());
        assert!(hydrolysis_status(None).is_empty());
    }

    #[test]
    fn key_sets_do_not_depend_on_value() {
        for decoder in [
            Bitfield::Notification,
            Bitfield::RelayState,
            Bitfield::ChannelStatus("Redox"),
            Bitfield::Ionization,
            Bitfield::Hydrolysis,
        ] {
            let zero = decoder.decode(Some(0));
            for raw in [0x0001, 0x00FF, 0x5A5A, 0xFFFF] {
                assert_eq!(keys(&decoder.decode(Some(raw))), keys(&zero));
            }
        }
        assert_eq!(notification(Some(0)).len(), 8);
        assert_eq!(relay_state(Some(0)).len(), 11);
        assert_eq!(channel_status(Some(0), "pH").len(), 7);
    }

    #[test]
    fn relay_state_decode() {
        let facts = relay_state(Some(0x042B));
        assert_eq!(facts["pH Acid Pump"], Value::Bool(true));
        assert_eq!(facts["Filtration Pump"], Value::Bool(true));
        assert_eq!(facts["Light"], Value::Bool(false));
        assert_eq!(facts["AUX1"], Value::Bool(true));
        assert_eq!(facts["AUX2"], Value::Bool(false));
        assert_eq!(facts["AUX3"], Value::Bool(true));
        assert_eq!(facts["Filtration high speed"], Value::Bool(true));
        assert_eq!(facts["Filtration low speed"], Value::Bool(false));
        assert_eq!(facts["Filtration current speed"], Value::Int(4));
    }

    #[test]
    fn channel_status_prefix() {
        let facts = channel_status(Some(0x8008), "Chlorine");
        assert_eq!(facts["Chlorine flow sensor problem"], Value::Bool(true));
        assert_eq!(facts["Chlorine measurement module detected"], Value::Bool(true));
        assert_eq!(facts["Chlorine pump active"], Value::Bool(false));
        assert!(!facts.contains_key("pH pump active"));
    }

    #[test]
    fn hydrolysis_and_ionization() {
        let facts = hydrolysis_status(Some(0x0111));
        assert_eq!(facts["Hydrolysis on target"], Value::Bool(true));
        assert_eq!(facts["Hydrolysis cover"], Value::Bool(true));
        assert_eq!(facts["Hydrolysis shock"], Value::Bool(true));
        assert_eq!(facts["Hydrolysis low flow"], Value::Bool(false));

        let facts = ionization_status(Some(0x2002));
        assert_eq!(facts["Ionization low flow"], Value::Bool(true));
        assert_eq!(facts["Ionization polarity 1"], Value::Bool(true));
        assert_eq!(facts["Ionization on target"], Value::Bool(false));
    }
}
