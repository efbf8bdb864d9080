//! Coalesces bursts of writes to the same register.
//!
//! Each submitted value starts a quiet period. A newer value for the same
//! address within that period cancels the pending one, so only the last
//! value of a burst reaches the device. Once the quiet period has elapsed
//! the write is committed to run and can no longer be cancelled.

use crate::config::ClientConfig;
use crate::connection::{Connector, TcpConnector};
use crate::protocol as proto;
use crate::tokio_async::Confirmation;
use crate::tokio_async_safe_client::SafeClient;
use crate::tokio_common::{Error, Result};
use log::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

type Pending = Arc<Mutex<HashMap<u16, (u64, AbortHandle)>>>;

/// Delays single-register writes so that only the last value of a burst
/// to the same address is sent.
///
/// Each pending write runs as its own Tokio task, so [`submit`](Self::submit)
/// must be called from within a Tokio runtime.
pub struct DebouncedWriter<C: Connector = TcpConnector> {
    client: SafeClient<C>,
    window: Duration,
    generation: AtomicU64,
    pending: Pending,
}

impl DebouncedWriter<TcpConnector> {
    /// A TCP client with the configured quiet period.
    pub fn from_config(config: &ClientConfig) -> std::result::Result<Self, proto::Error> {
        Ok(Self::new(SafeClient::from_config(config)?, config.debounce))
    }
}

impl<C: Connector + 'static> DebouncedWriter<C> {
    pub fn new(client: SafeClient<C>, window: Duration) -> Self {
        Self {
            client,
            window,
            generation: AtomicU64::new(0),
            pending: Arc::default(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Schedules a single-register write after the quiet period.
    ///
    /// The returned handle resolves to the write's confirmation, or to a
    /// cancelled [`tokio::task::JoinError`] if a newer value replaced it.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn submit(
        &self,
        address: u16,
        value: u16,
        apply: bool,
    ) -> JoinHandle<Result<Confirmation>> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let client = self.client.clone();
        let pending = self.pending.clone();
        let window = self.window;

        // Held until the new entry is stored, so the task cannot look it up early.
        let mut entries = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut entries = pending.lock().unwrap_or_else(PoisonError::into_inner);
                match entries.get(&address) {
                    Some((current, _)) if *current == generation => {
                        entries.remove(&address);
                    }
                    _ => return Err(Error::Superseded { address }),
                }
            }
            debug!("Debounced write of {value} to {address:#06x}");
            client.write_register(address, &[value], apply).await
        });
        if let Some((_, previous)) = entries.insert(address, (generation, task.abort_handle())) {
            previous.abort();
            debug!("Superseded pending write to {address:#06x}");
        }
        task
    }

    /// Number of writes still inside their quiet period.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
