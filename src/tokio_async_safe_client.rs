//! Asynchronous client for the NeoPool controller that owns its connection.
//!
//! This module provides a high-level API (`SafeClient` struct) that combines
//! the [`ConnectionManager`] with the exchanges of [`crate::tokio_async`].
//! All operations on one client (and on every clone of it) are serialized:
//! at most one request is in flight on the shared session at any time.
//!
//! All client methods are `async` and must be `.await`ed.

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionStats, Connector, TcpConnector};
use crate::protocol::{self as proto, Snapshot};
use crate::timer::{TimerBlock, TimerName, TimerUpdate};
use crate::tokio_async::{Confirmation, NeoPool, ReadOutcome, Timing};
use crate::tokio_common::{Error, Result};
use log::*;
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;

/// Asynchronous client for interacting with the NeoPool controller over Modbus/TCP.
///
/// Clones share the connection, its health bookkeeping and the snapshot cache.
pub struct SafeClient<C: Connector = TcpConnector> {
    manager: Arc<Mutex<ConnectionManager<C>>>,
    timing: Timing,
    timers: Arc<[TimerName]>,
    cache: Arc<std::sync::Mutex<Option<Arc<Snapshot>>>>,
}

impl<C: Connector> Clone for SafeClient<C> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            timing: self.timing,
            timers: self.timers.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<C: Connector> std::fmt::Debug for SafeClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeClient")
            .field("timing", &self.timing)
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}

impl SafeClient<TcpConnector> {
    /// Creates a TCP client. No connection is made until the first request.
    pub fn from_config(config: &ClientConfig) -> std::result::Result<Self, proto::Error> {
        let manager = ConnectionManager::tcp(config.connection_settings());
        Ok(Self::new(manager, config.timing(), config.timer_names()?))
    }
}

impl<C: Connector> SafeClient<C> {
    pub fn new(manager: ConnectionManager<C>, timing: Timing, timers: Vec<TimerName>) -> Self {
        Self::from_shared(Arc::new(Mutex::new(manager)), timing, timers)
    }

    /// Creates a client on top of a connection manager shared with other code.
    pub fn from_shared(
        manager: Arc<Mutex<ConnectionManager<C>>>,
        timing: Timing,
        timers: Vec<TimerName>,
    ) -> Self {
        Self {
            manager,
            timing,
            timers: timers.into(),
            cache: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Clones the shared connection manager.
    pub fn clone_shared(&self) -> Arc<Mutex<ConnectionManager<C>>> {
        self.manager.clone()
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Runs one read-all cycle and returns whatever it produced.
    ///
    /// Fails only if no session could be obtained. Page failures are
    /// reported inside the [`ReadOutcome`].
    pub async fn read_snapshot(&self) -> Result<ReadOutcome> {
        let mut manager = self.manager.lock().await;
        let outcome = match manager.connection().await {
            Ok(ctx) => Ok(NeoPool::read_all(ctx, &self.timers, &self.timing).await),
            Err(err) => Err(err),
        };
        match &outcome {
            Ok(ReadOutcome { error: Some(err), .. }) => manager.record_failure(err),
            Ok(_) => manager.record_success(),
            Err(err) => manager.record_failure(err),
        }
        outcome
    }

    /// Reads a fresh snapshot, falling back to the last complete one.
    ///
    /// A complete cycle replaces the cached snapshot. An incomplete cycle or
    /// a failure returns the cached snapshot if there is one. Without a
    /// cached snapshot a partial, non-empty result is returned uncached;
    /// otherwise the call fails with [`Error::NotReady`].
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        let cached = self.cached();
        match self.read_snapshot().await {
            Ok(outcome) if outcome.is_complete() => {
                let snapshot = Arc::new(outcome.snapshot);
                *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
                Ok(snapshot)
            }
            Ok(outcome) => match cached {
                Some(previous) => {
                    warn!("Incomplete read cycle, keeping previous snapshot");
                    Ok(previous)
                }
                None if !outcome.snapshot.is_empty() => {
                    warn!(
                        "Incomplete read cycle, returning {} partial facts",
                        outcome.snapshot.len()
                    );
                    Ok(Arc::new(outcome.snapshot))
                }
                None => Err(Error::NotReady),
            },
            Err(err) => match cached {
                Some(previous) => {
                    warn!("Read cycle failed, keeping previous snapshot: {err}");
                    Ok(previous)
                }
                None => {
                    warn!("Read cycle failed: {err}");
                    Err(Error::NotReady)
                }
            },
        }
    }

    /// Last complete snapshot, if any.
    pub fn cached(&self) -> Option<Arc<Snapshot>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn read_timer(&self, timer: TimerName) -> Result<TimerBlock> {
        let mut manager = self.manager.lock().await;
        let result = match manager.connection().await {
            Ok(ctx) => NeoPool::read_timer(ctx, timer).await,
            Err(err) => Err(err),
        };
        manager.record(&result);
        result
    }

    /// Writes consecutive registers; with `apply` the change is persisted
    /// and executed.
    pub async fn write_register(
        &self,
        address: u16,
        values: &[u16],
        apply: bool,
    ) -> Result<Confirmation> {
        proto::check_write_len(values)?;
        let mut manager = self.manager.lock().await;
        let result = match manager.connection().await {
            Ok(ctx) => NeoPool::write_registers(ctx, address, values, apply, &self.timing).await,
            Err(err) => Err(err),
        };
        manager.record(&result);
        result
    }

    /// Switches auxiliary relay `index` (1..=4). Returns the new relay state word.
    pub async fn write_aux_relay(&self, index: u8, on: bool) -> Result<u16> {
        let relay = proto::AuxRelay::try_from(index)?;
        let mut manager = self.manager.lock().await;
        let result = match manager.connection().await {
            Ok(ctx) => NeoPool::write_aux_relay(ctx, relay, on, &self.timing).await,
            Err(err) => Err(err),
        };
        manager.record(&result);
        result
    }

    pub async fn write_timer(&self, timer: TimerName, update: &TimerUpdate) -> Result<TimerBlock> {
        if let Some(enable) = update.enable {
            enable.encode_for_write()?;
        }
        let mut manager = self.manager.lock().await;
        let result = match manager.connection().await {
            Ok(ctx) => NeoPool::write_timer(ctx, timer, update, &self.timing).await,
            Err(err) => Err(err),
        };
        manager.record(&result);
        result
    }

    /// Writes the heating setpoint and mirrors it to the smart temperature setpoint.
    pub async fn write_heating_setpoint(&self, value: u16) -> Result<Confirmation> {
        let mut manager = self.manager.lock().await;
        let result = match manager.connection().await {
            Ok(ctx) => NeoPool::write_heating_setpoint(ctx, value, &self.timing).await,
            Err(err) => Err(err),
        };
        manager.record(&result);
        result
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        self.manager.lock().await.stats()
    }

    /// Closes the shared session. Safe to call repeatedly; the next request reconnects.
    pub async fn close(&self) {
        self.manager.lock().await.close();
    }
}
