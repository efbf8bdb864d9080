//! A library for monitoring and controlling NeoPool pool controllers via Modbus/TCP.
//!
//! This crate provides two main ways to interact with the controller:
//!
//! 1.  **High-Level, Safe Client**: A stateful, cloneable client that owns the
//!     connection, reconnects with backoff and keeps the last complete
//!     snapshot. This is the recommended approach for most users. See
//!     [`tokio_async_safe_client::SafeClient`].
//!
//! 2.  **Low-Level, Stateless Functions**: Exchanges that run over a Modbus
//!     context you manage yourself. See the [`tokio_async`] module.
//!
//! ## Features
//!
//! - **Register Map**: Named registers with scaling, 32-bit values, strings and bitfields.
//! - **Read-All Cycle**: Reads every register page in order and merges the results into one [`protocol::Snapshot`].
//! - **Write Sequences**: Register writes with EEPROM commit, manual relay switching and timer read-modify-write.
//! - **Connection Management**: Retry, exponential backoff and idle health probing.
//! - **Debounced Writes**: Only the last value of a burst of writes reaches the device.
//!
//! ## Quick Start
//!
//! ```no_run
//! use neopool_lib::{config::ClientConfig, tokio_async_safe_client::SafeClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig {
//!         host: "192.168.1.50".to_string(),
//!         ..Default::default()
//!     };
//!     let client = SafeClient::from_config(&config)?;
//!
//!     let snapshot = client.refresh().await?;
//!     println!("pH: {:?}", snapshot.get("pH"));
//!
//!     client.write_aux_relay(1, true).await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod bitfield;
pub mod config;
pub mod connection;
pub mod debounce;
pub mod protocol;
pub mod timer;
pub mod tokio_async;
pub mod tokio_async_safe_client;
pub mod tokio_common;
