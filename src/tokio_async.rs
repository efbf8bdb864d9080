//! Asynchronous protocol exchanges with the NeoPool controller.
//!
//! This module provides a stateless API (`NeoPool` struct) that runs one
//! complete exchange over an already established [`Transport`]: the
//! read-all cycle that builds a [`Snapshot`], timer block reads and the
//! write sequences. It handles the conversion between the types defined in
//! [`crate::protocol`] and [`crate::timer`] and the raw Modbus registers.
//!
//! Connection handling lives in [`crate::connection`]; most users want the
//! [`crate::tokio_async_safe_client::SafeClient`] which combines both.
//!
//! # Example
//!
//! ```no_run
//! use neopool_lib::tokio_async::{NeoPool, Timing};
//! use neopool_lib::timer::TimerName;
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket_addr: SocketAddr = "192.168.1.50:502".parse()?;
//!     let mut ctx = tokio_modbus::client::tcp::connect(socket_addr).await?;
//!
//!     let outcome = NeoPool::read_all(&mut ctx, &TimerName::ALL, &Timing::default()).await;
//!     println!("{}", outcome.snapshot);
//!     Ok(())
//! }
//! ```

use crate::bitfield;
use crate::protocol::{
    self as proto, AuxRelay, Function, Kind, Page, RegisterValue, Snapshot, Value,
};
use crate::timer::{TimerBlock, TimerName, TimerUpdate, TIMER_BLOCK_LEN};
use crate::tokio_common::{Error, Result, Transport};
use log::*;
use std::time::Duration;

/// Pauses inserted between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Between two reads of one cycle.
    pub inter_request_delay: Duration,
    /// Between the steps of a write sequence.
    pub command_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            inter_request_delay: Duration::from_millis(50),
            command_delay: Duration::from_millis(100),
        }
    }
}

/// Result of one read-all cycle.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Facts of every page read before the first failure.
    pub snapshot: Snapshot,
    /// The failure that aborted the page reads, if any.
    pub error: Option<Error>,
    /// Timer blocks that could not be read.
    pub skipped_timers: Vec<TimerName>,
}

impl ReadOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.skipped_timers.is_empty()
    }
}

/// A register write together with what the device reported afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub address: u16,
    pub written: Vec<u16>,
    /// `None` if the read-back itself failed.
    pub read_back: Option<Vec<u16>>,
}

impl Confirmation {
    /// True if the device returned exactly the written values.
    pub fn is_confirmed(&self) -> bool {
        self.read_back.as_deref() == Some(self.written.as_slice())
    }
}

/// Stateless protocol exchanges with the controller.
#[derive(Debug)]
pub struct NeoPool;

impl NeoPool {
    /// Helper function to map tokio result to our result.
    fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
        match result {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.into()), // Modbus exception
            Err(err) => Err(err.into()),     // IO error
        }
    }

    /// Reads `quantity` registers and rejects short responses.
    pub async fn read_registers<T: Transport>(
        ctx: &mut T,
        function: Function,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        let registers = Self::map_tokio_result(match function {
            Function::Holding => ctx.read_holding_registers(address, quantity).await,
            Function::Input => ctx.read_input_registers(address, quantity).await,
        })?;
        if registers.len() < usize::from(quantity) {
            return Err(Error::ShortResponse {
                address,
                expected: quantity,
                actual: registers.len(),
            });
        }
        Ok(registers)
    }

    pub async fn read_page<T: Transport>(ctx: &mut T, page: &Page) -> Result<Vec<u16>> {
        Self::read_registers(ctx, page.function, page.address, page.quantity).await
    }

    /// Merges every catalog entry of `page` into `snapshot`, expanding
    /// bitfields into their named flags.
    pub fn decode_page(page: &Page, registers: &[u16], snapshot: &mut Snapshot) {
        for register in page.registers() {
            match register.decode(registers, page.address) {
                RegisterValue::Present(value) => {
                    if let Kind::Bitfield(bitfield) = register.kind {
                        let raw = value.as_int().and_then(|raw| u16::try_from(raw).ok());
                        snapshot.extend(bitfield.decode(raw));
                    }
                    snapshot.insert(register.name, value);
                }
                RegisterValue::Missing => {
                    debug!("{} missing from page {}", register.name, page.name)
                }
            }
        }
    }

    /// Runs one read-all cycle.
    ///
    /// Pages are read strictly in order. The first failing page aborts the
    /// remaining page reads; its error is returned in the outcome together
    /// with everything accumulated so far. Timer blocks are read afterwards,
    /// each one skippable on its own. This function never fails as a whole.
    pub async fn read_all<T: Transport>(
        ctx: &mut T,
        timers: &[TimerName],
        timing: &Timing,
    ) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let mut first = true;

        for page in proto::PAGES {
            if !first {
                tokio::time::sleep(timing.inter_request_delay).await;
            }
            first = false;
            match Self::read_page(ctx, page).await {
                Ok(registers) => {
                    debug!("Read page {} ({} registers)", page.name, registers.len());
                    Self::decode_page(page, &registers, &mut outcome.snapshot);
                }
                Err(err) => {
                    warn!("Reading page {} failed, aborting cycle: {err}", page.name);
                    outcome.error = Some(err);
                    break;
                }
            }
        }

        if outcome.error.is_none() {
            for (index, timer) in timers.iter().enumerate() {
                tokio::time::sleep(timing.inter_request_delay).await;
                match Self::read_timer(ctx, *timer).await {
                    Ok(block) => outcome.snapshot.extend(block.facts(*timer)),
                    Err(err) if err.is_connection_error() => {
                        warn!("Reading timer {timer} failed, skipping remaining timers: {err}");
                        outcome.skipped_timers.extend_from_slice(&timers[index..]);
                        outcome.error = Some(err);
                        break;
                    }
                    Err(err) => {
                        warn!("Reading timer {timer} failed, skipping it: {err}");
                        outcome.skipped_timers.push(*timer);
                    }
                }
            }
        }

        Self::derive_facts(&mut outcome.snapshot);
        outcome
    }

    /// Facts computed from several raw facts. Runs after all reads.
    fn derive_facts(snapshot: &mut Snapshot) {
        let running = snapshot
            .get("Filtration current speed")
            .and_then(Value::as_int);
        let configured = snapshot
            .get("Filtration speed setting")
            .and_then(Value::as_int);
        let speed = match (running, configured) {
            (Some(1), _) => Some("low"),
            (Some(2), _) => Some("mid"),
            (Some(4), _) => Some("high"),
            (_, Some(0)) => Some("low"),
            (_, Some(1)) => Some("mid"),
            (_, Some(2)) => Some("high"),
            _ => None,
        };
        if let Some(speed) = speed {
            snapshot.insert("Filtration speed", Value::Text(speed.to_string()));
        }
    }

    pub async fn read_timer<T: Transport>(ctx: &mut T, timer: TimerName) -> Result<TimerBlock> {
        let registers =
            Self::read_registers(ctx, Function::Holding, timer.address(), TIMER_BLOCK_LEN).await?;
        Ok(TimerBlock::parse(&registers))
    }

    async fn write<T: Transport>(ctx: &mut T, address: u16, values: &[u16]) -> Result<()> {
        Self::map_tokio_result(ctx.write_multiple_registers(address, values).await)?;
        debug!("Wrote {values:?} to {address:#06x}");
        Ok(())
    }

    /// Persists pending writes to EEPROM and makes the device apply them.
    pub async fn commit<T: Transport>(ctx: &mut T, timing: &Timing) -> Result<()> {
        tokio::time::sleep(timing.command_delay).await;
        Self::write(ctx, proto::EEPROM_COMMIT_REG_ADDR, &[1]).await?;
        tokio::time::sleep(timing.command_delay).await;
        Self::write(ctx, proto::EXECUTE_REG_ADDR, &[1]).await
    }

    /// Writes consecutive registers and reads them back.
    ///
    /// A read-back that differs from the written values is logged, not
    /// treated as a failure. With `apply` the write is committed afterwards.
    pub async fn write_registers<T: Transport>(
        ctx: &mut T,
        address: u16,
        values: &[u16],
        apply: bool,
        timing: &Timing,
    ) -> Result<Confirmation> {
        proto::check_write_len(values)?;
        Self::write(ctx, address, values).await?;

        let quantity = values.len() as u16;
        let read_back =
            match Self::read_registers(ctx, Function::Holding, address, quantity).await {
                Ok(registers) => {
                    if registers != values {
                        warn!(
                            "Read-back of {address:#06x} returned {registers:?}, wrote {values:?}"
                        );
                    }
                    Some(registers)
                }
                Err(err) => {
                    warn!("Read-back of {address:#06x} failed: {err}");
                    None
                }
            };

        if apply {
            Self::commit(ctx, timing).await?;
        }
        Ok(Confirmation {
            address,
            written: values.to_vec(),
            read_back,
        })
    }

    /// Switches an auxiliary relay by hand and returns the new relay state word.
    ///
    /// The sequence is: read state, unlock manual control, write state,
    /// lock again, execute. Any failing step aborts the rest.
    pub async fn write_aux_relay<T: Transport>(
        ctx: &mut T,
        relay: AuxRelay,
        on: bool,
        timing: &Timing,
    ) -> Result<u16> {
        let registers =
            Self::read_registers(ctx, Function::Input, proto::RELAY_STATE_REG_ADDR, 1).await?;
        let current = registers.first().copied().ok_or(Error::ShortResponse {
            address: proto::RELAY_STATE_REG_ADDR,
            expected: 1,
            actual: 0,
        })?;
        let state = relay.apply(current, on);
        debug!(
            "Switching {relay} {}: {current:#06x} -> {state:#06x}",
            if on { "on" } else { "off" }
        );

        Self::write(ctx, proto::AUX_UNLOCK_REG_ADDR, &[1]).await?;
        tokio::time::sleep(timing.command_delay).await;
        Self::write(ctx, proto::RELAY_STATE_REG_ADDR, &[state]).await?;
        tokio::time::sleep(timing.command_delay).await;
        Self::write(ctx, proto::AUX_UNLOCK_REG_ADDR, &[0]).await?;
        tokio::time::sleep(timing.command_delay).await;
        Self::write(ctx, proto::EXECUTE_REG_ADDR, &[1]).await?;
        Ok(state)
    }

    /// Read-modify-write of a timer block. Fields not named in `update`
    /// keep the value just read from the device.
    pub async fn write_timer<T: Transport>(
        ctx: &mut T,
        timer: TimerName,
        update: &TimerUpdate,
        timing: &Timing,
    ) -> Result<TimerBlock> {
        if let Some(enable) = update.enable {
            enable.encode_for_write()?;
        }
        let current = Self::read_timer(ctx, timer).await?;
        let updated = current.apply(update)?;
        debug!("Timer {timer}: {current} -> {updated}");
        tokio::time::sleep(timing.command_delay).await;
        Self::write(ctx, timer.address(), &updated.build()).await?;
        Self::commit(ctx, timing).await?;
        Ok(updated)
    }

    /// Writes the heating setpoint and keeps the smart temperature setpoint
    /// in step with it, then commits both.
    pub async fn write_heating_setpoint<T: Transport>(
        ctx: &mut T,
        value: u16,
        timing: &Timing,
    ) -> Result<Confirmation> {
        let confirmation =
            Self::write_registers(ctx, proto::HEATING_SETPOINT_REG_ADDR, &[value], false, timing)
                .await?;
        let paired = Self::read_registers(
            ctx,
            Function::Holding,
            proto::SMART_TEMPERATURE_SETPOINT_REG_ADDR,
            1,
        )
        .await?;
        if paired.first() != Some(&value) {
            tokio::time::sleep(timing.command_delay).await;
            Self::write_registers(
                ctx,
                proto::SMART_TEMPERATURE_SETPOINT_REG_ADDR,
                &[value],
                false,
                timing,
            )
            .await?;
        }
        Self::commit(ctx, timing).await?;
        Ok(confirmation)
    }
}

/// Decodes a relay state word outside a full cycle.
pub fn relay_facts(state: u16) -> bitfield::Facts {
    bitfield::relay_state(Some(state))
}
