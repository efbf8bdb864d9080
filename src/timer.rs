//! Codec for the 15-register timer blocks.
//!
//! Each schedulable relay function owns one block:
//!
//! | Offset | Width | Field |
//! |-------:|------:|-------|
//! | 0 | 1 | enable |
//! | 1 | 2 | on time, seconds since midnight |
//! | 3 | 2 | off time, seconds since midnight |
//! | 5 | 2 | repeat period in seconds |
//! | 7 | 2 | interval in seconds |
//! | 9 | 2 | countdown |
//! | 11 | 1 | function |
//! | 12 | 1 | reserved |
//! | 13 | 2 | work time |
//!
//! 32-bit fields store the low word first. Writes are always full-block
//! read-modify-write, so [`TimerBlock`] tracks every register including the
//! reserved one.

use crate::protocol::{u32_decode, u32_encode, Error, Value};
use std::fmt;
use std::str::FromStr;

pub const TIMER_BLOCK_LEN: u16 = 15;
pub const SECONDS_PER_DAY: u32 = 86_400;

/// Named timer blocks in register order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerName {
    Filtration1,
    Filtration2,
    Filtration3,
    Aux1Secondary,
    Light,
    Aux2Secondary,
    Aux3Secondary,
    Aux4Secondary,
    Aux1,
    Aux2,
    Aux3,
    Aux4,
}

impl TimerName {
    pub const ALL: [TimerName; 12] = [
        TimerName::Filtration1,
        TimerName::Filtration2,
        TimerName::Filtration3,
        TimerName::Aux1Secondary,
        TimerName::Light,
        TimerName::Aux2Secondary,
        TimerName::Aux3Secondary,
        TimerName::Aux4Secondary,
        TimerName::Aux1,
        TimerName::Aux2,
        TimerName::Aux3,
        TimerName::Aux4,
    ];

    /// First register of this block. The second aux intervals sit between
    /// the filtration and light blocks, the first ones follow them.
    pub fn address(&self) -> u16 {
        match self {
            TimerName::Filtration1 => 0x0434,
            TimerName::Filtration2 => 0x0443,
            TimerName::Filtration3 => 0x0452,
            TimerName::Aux1Secondary => 0x0461,
            TimerName::Light => 0x0470,
            TimerName::Aux2Secondary => 0x047F,
            TimerName::Aux3Secondary => 0x048E,
            TimerName::Aux4Secondary => 0x049D,
            TimerName::Aux1 => 0x04AC,
            TimerName::Aux2 => 0x04BB,
            TimerName::Aux3 => 0x04CA,
            TimerName::Aux4 => 0x04D9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerName::Filtration1 => "filtration1",
            TimerName::Filtration2 => "filtration2",
            TimerName::Filtration3 => "filtration3",
            TimerName::Aux1Secondary => "aux1_2",
            TimerName::Light => "light",
            TimerName::Aux2Secondary => "aux2_2",
            TimerName::Aux3Secondary => "aux3_2",
            TimerName::Aux4Secondary => "aux4_2",
            TimerName::Aux1 => "aux1",
            TimerName::Aux2 => "aux2",
            TimerName::Aux3 => "aux3",
            TimerName::Aux4 => "aux4",
        }
    }
}

impl FromStr for TimerName {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimerName::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownTimer(s.to_string()))
    }
}

impl fmt::Display for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the enable register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TimerEnable {
    Disabled = 0,
    Auto = 1,
    /// Reported by the device, but never written by this crate.
    AutoLinked = 2,
    On = 3,
    Off = 4,
}

impl TimerEnable {
    pub fn decode(value: u16) -> Option<Self> {
        match value {
            0 => Some(TimerEnable::Disabled),
            1 => Some(TimerEnable::Auto),
            2 => Some(TimerEnable::AutoLinked),
            3 => Some(TimerEnable::On),
            4 => Some(TimerEnable::Off),
            _ => None,
        }
    }

    /// Register value for a write, rejecting modes the device only reports.
    pub fn encode_for_write(&self) -> Result<u16, Error> {
        match self {
            TimerEnable::AutoLinked => Err(Error::EnableNotWritable(self.as_str())),
            _ => Ok(*self as u16),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerEnable::Disabled => "disabled",
            TimerEnable::Auto => "auto",
            TimerEnable::AutoLinked => "auto_linked",
            TimerEnable::On => "on",
            TimerEnable::Off => "off",
        }
    }
}

impl FromStr for TimerEnable {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" => Ok(TimerEnable::Disabled),
            "auto" => Ok(TimerEnable::Auto),
            "auto_linked" => Ok(TimerEnable::AutoLinked),
            "on" => Ok(TimerEnable::On),
            "off" => Ok(TimerEnable::Off),
            _ => Err(Error::UnknownEnableMode(s.to_string())),
        }
    }
}

impl fmt::Display for TimerEnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repeat periods offered by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatPeriod {
    Days(u8),
    Weeks(u8),
}

impl RepeatPeriod {
    pub const ALL: [RepeatPeriod; 9] = [
        RepeatPeriod::Days(1),
        RepeatPeriod::Days(2),
        RepeatPeriod::Days(3),
        RepeatPeriod::Days(4),
        RepeatPeriod::Days(5),
        RepeatPeriod::Weeks(1),
        RepeatPeriod::Weeks(2),
        RepeatPeriod::Weeks(3),
        RepeatPeriod::Weeks(4),
    ];

    pub fn seconds(&self) -> u32 {
        match self {
            RepeatPeriod::Days(days) => u32::from(*days) * SECONDS_PER_DAY,
            RepeatPeriod::Weeks(weeks) => u32::from(*weeks) * 7 * SECONDS_PER_DAY,
        }
    }

    /// Looks up a period register value; unknown values have no name.
    pub fn from_seconds(seconds: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|period| period.seconds() == seconds)
    }
}

impl FromStr for RepeatPeriod {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|period| period.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownPeriod(s.to_string()))
    }
}

impl fmt::Display for RepeatPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepeatPeriod::Days(1) => write!(f, "1 day"),
            RepeatPeriod::Days(days) => write!(f, "{days} days"),
            RepeatPeriod::Weeks(1) => write!(f, "1 week"),
            RepeatPeriod::Weeks(weeks) => write!(f, "{weeks} weeks"),
        }
    }
}

/// Decoded timer block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerBlock {
    pub enable: u16,
    pub on: u32,
    pub off: u32,
    pub period: u32,
    pub interval: u32,
    pub countdown: u32,
    pub function: u16,
    pub reserved: u16,
    pub work_time: u32,
}

/// Fields a caller wants to change in a timer block. `None` keeps the
/// value read from the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerUpdate {
    pub enable: Option<TimerEnable>,
    pub on: Option<u32>,
    pub off: Option<u32>,
    pub period: Option<u32>,
    pub interval: Option<u32>,
    pub countdown: Option<u32>,
    pub function: Option<u16>,
    pub work_time: Option<u32>,
}

impl TimerUpdate {
    pub fn is_empty(&self) -> bool {
        *self == TimerUpdate::default()
    }
}

impl TimerBlock {
    /// Parses a block. Short input is zero padded, extra words are ignored.
    pub fn parse(registers: &[u16]) -> Self {
        let mut regs = [0u16; TIMER_BLOCK_LEN as usize];
        for (dst, src) in regs.iter_mut().zip(registers) {
            *dst = *src;
        }
        Self {
            enable: regs[0],
            on: u32_decode(regs[1], regs[2]),
            off: u32_decode(regs[3], regs[4]),
            period: u32_decode(regs[5], regs[6]),
            interval: u32_decode(regs[7], regs[8]),
            countdown: u32_decode(regs[9], regs[10]),
            function: regs[11],
            reserved: regs[12],
            work_time: u32_decode(regs[13], regs[14]),
        }
    }

    /// Encodes the block into exactly [`TIMER_BLOCK_LEN`] registers.
    pub fn build(&self) -> [u16; TIMER_BLOCK_LEN as usize] {
        let [on_lo, on_hi] = u32_encode(self.on);
        let [off_lo, off_hi] = u32_encode(self.off);
        let [period_lo, period_hi] = u32_encode(self.period);
        let [interval_lo, interval_hi] = u32_encode(self.interval);
        let [countdown_lo, countdown_hi] = u32_encode(self.countdown);
        let [work_lo, work_hi] = u32_encode(self.work_time);
        [
            self.enable,
            on_lo,
            on_hi,
            off_lo,
            off_hi,
            period_lo,
            period_hi,
            interval_lo,
            interval_hi,
            countdown_lo,
            countdown_hi,
            self.function,
            self.reserved,
            work_lo,
            work_hi,
        ]
    }

    pub fn enable_mode(&self) -> Option<TimerEnable> {
        TimerEnable::decode(self.enable)
    }

    pub fn repeat_period(&self) -> Option<RepeatPeriod> {
        RepeatPeriod::from_seconds(self.period)
    }

    /// Overlays `update` onto this block.
    ///
    /// If the on or off time changes without an explicit interval, the
    /// interval is recomputed from the resulting window.
    pub fn apply(&self, update: &TimerUpdate) -> Result<TimerBlock, Error> {
        let mut block = *self;
        if let Some(enable) = update.enable {
            block.enable = enable.encode_for_write()?;
        }
        if let Some(on) = update.on {
            block.on = on;
        }
        if let Some(off) = update.off {
            block.off = off;
        }
        if update.on.is_some() || update.off.is_some() {
            block.on %= SECONDS_PER_DAY;
            block.off %= SECONDS_PER_DAY;
        }
        if let Some(period) = update.period {
            block.period = period;
        }
        match update.interval {
            Some(interval) => block.interval = interval,
            None if update.on.is_some() || update.off.is_some() => {
                block.interval = interval(block.on, block.off);
            }
            None => {}
        }
        if let Some(countdown) = update.countdown {
            block.countdown = countdown;
        }
        if let Some(function) = update.function {
            block.function = function;
        }
        if let Some(work_time) = update.work_time {
            block.work_time = work_time;
        }
        Ok(block)
    }

    /// Snapshot facts for this block, prefixed with the timer name.
    pub fn facts(&self, name: TimerName) -> Vec<(String, Value)> {
        let enable = match self.enable_mode() {
            Some(mode) => Value::Text(mode.to_string()),
            None => Value::Int(i64::from(self.enable)),
        };
        let period = match self.repeat_period() {
            Some(period) => Value::Text(period.to_string()),
            None => Value::Int(i64::from(self.period)),
        };
        vec![
            (format!("{name} enable"), enable),
            (format!("{name} on"), Value::Text(seconds_to_time(self.on))),
            (format!("{name} off"), Value::Text(seconds_to_time(self.off))),
            (format!("{name} period"), period),
            (format!("{name} interval"), Value::Int(i64::from(self.interval))),
            (format!("{name} countdown"), Value::Int(i64::from(self.countdown))),
            (format!("{name} function"), Value::Int(i64::from(self.function))),
            (format!("{name} work time"), Value::Int(i64::from(self.work_time))),
        ]
    }
}

impl fmt::Display for TimerBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.enable_mode() {
            Some(mode) => write!(f, "enable={mode}")?,
            None => write!(f, "enable={}", self.enable)?,
        }
        write!(
            f,
            ", on={}, off={}",
            seconds_to_time(self.on),
            seconds_to_time(self.off)
        )?;
        match self.repeat_period() {
            Some(period) => write!(f, ", period={period}")?,
            None => write!(f, ", period={}s", self.period)?,
        }
        write!(
            f,
            ", interval={}s, countdown={}, function={}, work_time={}",
            self.interval, self.countdown, self.function, self.work_time
        )
    }
}

/// Duration of the window from `start` to `stop`, wrapping past midnight.
/// Both times are taken modulo one day.
pub fn interval(start: u32, stop: u32) -> u32 {
    let start = start % SECONDS_PER_DAY;
    let stop = stop % SECONDS_PER_DAY;
    (stop + SECONDS_PER_DAY - start) % SECONDS_PER_DAY
}

/// Parses `HH:MM` into seconds since midnight.
pub fn time_to_seconds(value: &str) -> Result<u32, Error> {
    let invalid = || Error::InvalidTimeOfDay(value.to_string());
    let (hours, minutes) = value.trim().split_once(':').ok_or_else(invalid)?;
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    Ok(hours * 3600 + minutes * 60)
}

/// Formats seconds since midnight as `HH:MM`.
pub fn seconds_to_time(seconds: u32) -> String {
    let seconds = seconds % SECONDS_PER_DAY;
    format!("{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60)
}

/// Selectable times of day at a resolution of `step_minutes`.
pub fn time_options(step_minutes: u16) -> Result<Vec<String>, Error> {
    let minutes_per_day = SECONDS_PER_DAY / 60;
    if step_minutes == 0 || minutes_per_day % u32::from(step_minutes) != 0 {
        return Err(Error::InvalidTimeStep(step_minutes));
    }
    Ok((0..minutes_per_day)
        .step_by(usize::from(step_minutes))
        .map(|minute| seconds_to_time(minute * 60))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sample() -> TimerBlock {
        TimerBlock {
            enable: 1,
            on: 8 * 3600,
            off: 20 * 3600 + 30 * 60,
            period: SECONDS_PER_DAY,
            interval: 12 * 3600 + 30 * 60,
            countdown: 70_000,
            function: 0x0011,
            reserved: 0xBEEF,
            work_time: 123_456,
        }
    }

    #[test]
    fn addresses() {
        let addresses: Vec<_> = TimerName::ALL.iter().map(TimerName::address).collect();
        assert_eq!(
            addresses,
            [
                0x0434, 0x0443, 0x0452, 0x0461, 0x0470, 0x047F, 0x048E, 0x049D, 0x04AC, 0x04BB,
                0x04CA, 0x04D9,
            ]
        );
        assert_eq!(TimerName::Aux1.address(), 0x04AC);
        assert_eq!(TimerName::Aux1Secondary.address(), 0x0461);
        assert_eq!(TimerName::Aux4.address(), 0x04D9);
        assert_eq!(TimerName::Aux4Secondary.address(), 0x049D);
        for pair in addresses.windows(2) {
            assert_eq!(pair[1] - pair[0], TIMER_BLOCK_LEN);
        }
        let last = TimerName::Aux4.address() + TIMER_BLOCK_LEN;
        assert_eq!(last, 0x04E8);
    }

    #[test]
    fn names() {
        assert_eq!("light".parse::<TimerName>(), Ok(TimerName::Light));
        assert_eq!("AUX2_2".parse::<TimerName>(), Ok(TimerName::Aux2Secondary));
        assert_matches!("pump".parse::<TimerName>(), Err(Error::UnknownTimer(..)));
        for name in TimerName::ALL {
            assert_eq!(name.as_str().parse::<TimerName>(), Ok(name));
        }
    }

    #[test]
    fn round_trip() {
        let block = sample();
        assert_eq!(TimerBlock::parse(&block.build()), block);

        let regs: [u16; 15] = [3, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14];
        assert_eq!(TimerBlock::parse(&regs).build(), regs);
    }

    #[test]
    fn parse_layout() {
        let regs = [1, 0x7080, 0x0000, 0x0E10, 0x0001];
        let block = TimerBlock::parse(&regs);
        assert_eq!(block.enable, 1);
        assert_eq!(block.on, 0x7080);
        assert_eq!(block.off, 0x0001_0E10);
        assert_eq!(block.period, 0);
        assert_eq!(block.work_time, 0);
        assert_eq!(TimerBlock::parse(&[]), TimerBlock::default());
        assert_eq!(TimerBlock::default().build(), [0; 15]);
    }

    #[test]
    fn apply_preserves_untouched_fields() {
        let block = sample();
        let update = TimerUpdate {
            enable: Some(TimerEnable::On),
            ..Default::default()
        };
        let updated = block.apply(&update).unwrap();
        assert_eq!(updated.enable, 3);
        assert_eq!(
            TimerBlock {
                enable: block.enable,
                ..updated
            },
            block
        );
        assert_eq!(block.apply(&TimerUpdate::default()), Ok(block));
    }

    #[test]
    fn apply_recomputes_interval() {
        let block = sample();
        let update = TimerUpdate {
            on: Some(22 * 3600),
            ..Default::default()
        };
        let updated = block.apply(&update).unwrap();
        assert_eq!(updated.on, 22 * 3600);
        assert_eq!(updated.interval, 2 * 3600 + 20 * 3600 + 30 * 60);

        let update = TimerUpdate {
            off: Some(9 * 3600),
            interval: Some(600),
            ..Default::default()
        };
        assert_eq!(block.apply(&update).unwrap().interval, 600);
    }

    #[test]
    fn auto_linked_is_not_writable() {
        let update = TimerUpdate {
            enable: Some(TimerEnable::AutoLinked),
            ..Default::default()
        };
        assert_matches!(sample().apply(&update), Err(Error::EnableNotWritable(..)));
        assert_eq!(TimerEnable::decode(2), Some(TimerEnable::AutoLinked));
        assert_eq!(TimerEnable::decode(9), None);
    }

    #[test]
    fn periods() {
        assert_eq!(RepeatPeriod::from_seconds(86_400), Some(RepeatPeriod::Days(1)));
        assert_eq!(RepeatPeriod::from_seconds(604_800), Some(RepeatPeriod::Weeks(1)));
        assert_eq!(RepeatPeriod::from_seconds(4 * 604_800), Some(RepeatPeriod::Weeks(4)));
        assert_eq!(RepeatPeriod::from_seconds(3600), None);
        assert_eq!("2 weeks".parse::<RepeatPeriod>(), Ok(RepeatPeriod::Weeks(2)));
        assert_eq!(RepeatPeriod::Days(3).to_string(), "3 days");
        assert_matches!("6 days".parse::<RepeatPeriod>(), Err(Error::UnknownPeriod(..)));
    }

    #[test]
    fn intervals() {
        assert_eq!(interval(3600, 7200), 3600);
        assert_eq!(interval(5000, 5000), 0);
        assert_eq!(interval(22 * 3600, 2 * 3600), 4 * 3600);
        assert_eq!(interval(86_399, 0), 1);
        assert_eq!(interval(90_000, 3600), 0);
        assert_eq!(interval(90_000, 100), SECONDS_PER_DAY - 3500);
        assert_eq!(interval(u32::MAX, u32::MAX), 0);
    }

    #[test]
    fn apply_reduces_stored_time_out_of_range() {
        let block = TimerBlock {
            on: 90_000,
            off: 100,
            ..sample()
        };
        let update = TimerUpdate {
            off: Some(3600),
            ..Default::default()
        };
        let updated = block.apply(&update).unwrap();
        assert_eq!(updated.on, 3600);
        assert_eq!(updated.off, 3600);
        assert_eq!(updated.interval, 0);

        let block = TimerBlock {
            off: u32::MAX,
            ..sample()
        };
        let update = TimerUpdate {
            on: Some(8 * 3600),
            ..Default::default()
        };
        let updated = block.apply(&update).unwrap();
        assert_eq!(updated.off, u32::MAX % SECONDS_PER_DAY);
        assert_eq!(updated.interval, interval(8 * 3600, u32::MAX));
    }

    #[test]
    fn time_of_day() {
        assert_eq!(time_to_seconds("00:00"), Ok(0));
        assert_eq!(time_to_seconds("08:30"), Ok(30_600));
        assert_eq!(time_to_seconds("23:59"), Ok(86_340));
        assert_matches!(time_to_seconds("24:00"), Err(Error::InvalidTimeOfDay(..)));
        assert_matches!(time_to_seconds("8h30"), Err(Error::InvalidTimeOfDay(..)));
        assert_eq!(seconds_to_time(30_600), "08:30");
        assert_eq!(seconds_to_time(86_400 + 60), "00:01");
    }

    #[test]
    fn options() {
        let options = time_options(15).unwrap();
        assert_eq!(options.len(), 96);
        assert_eq!(options.first().map(String::as_str), Some("00:00"));
        assert_eq!(options.last().map(String::as_str), Some("23:45"));
        assert_eq!(time_options(60).unwrap().len(), 24);
        assert_matches!(time_options(0), Err(Error::InvalidTimeStep(0)));
        assert_matches!(time_options(7), Err(Error::InvalidTimeStep(7)));
    }

    #[test]
    fn facts() {
        let facts = sample().facts(TimerName::Light);
        assert_eq!(facts.len(), 8);
        assert_eq!(facts[0], ("light enable".to_string(), Value::Text("auto".into())));
        assert_eq!(facts[1], ("light on".to_string(), Value::Text("08:00".into())));
        assert_eq!(facts[3], ("light period".to_string(), Value::Text("1 day".into())));
    }
}
