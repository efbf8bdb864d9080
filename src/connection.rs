//! Ownership of the single Modbus/TCP session to the controller.
//!
//! The [`ConnectionManager`] creates the session lazily, retries bounded
//! connection attempts, suppresses further attempts inside a backoff window
//! after repeated failures, probes idle sessions before reuse and tears the
//! session down once operations keep failing.

use crate::protocol as proto;
use crate::tokio_common::{Error, Result, TimeoutTransport, Transport};
use log::*;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_modbus::client::Context;
use tokio_modbus::Slave;

/// Opens new sessions to the device.
pub trait Connector: Send {
    type Transport: Transport;

    fn connect(&mut self) -> impl Future<Output = std::io::Result<Self::Transport>> + Send;
}

/// Connects to a Modbus/TCP gateway, resolving the host on every attempt.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    unit_id: u8,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
        }
    }

    async fn resolve(&self) -> std::io::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot resolve {}:{}", self.host, self.port),
                )
            })
    }
}

impl Connector for TcpConnector {
    type Transport = Context;

    fn connect(&mut self) -> impl Future<Output = std::io::Result<Context>> + Send {
        async move {
            let socket_addr = self.resolve().await?;
            debug!("Connecting to {socket_addr} (unit {})", self.unit_id);
            tokio_modbus::client::tcp::connect_slave(socket_addr, Slave(self.unit_id)).await
        }
    }
}

/// Tuning of the connection lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Bound for a connection attempt and for every request.
    pub timeout: Duration,
    /// Attempts per establish call.
    pub connect_attempts: u32,
    /// Pause between two attempts of the same establish call.
    pub retry_delay: Duration,
    /// Window after the first exhausted establish call, doubled for each
    /// further one up to `backoff_max`.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed operations that tear the session down.
    pub error_threshold: u32,
    /// Sessions idle for longer than this are probed before reuse.
    pub health_check_after: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 502,
            unit_id: 1,
            timeout: Duration::from_secs(1),
            connect_attempts: 3,
            retry_delay: Duration::from_millis(500),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            error_threshold: 3,
            health_check_after: Duration::from_secs(30),
        }
    }
}

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the last operations failed.
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        })
    }
}

/// Read-only diagnostics of a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ConnectionStats {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    #[serde(serialize_with = "serialize_state")]
    pub state: ConnectionState,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub success_rate: f64,
    pub consecutive_errors: u32,
}

fn serialize_state<S: serde::Serializer>(
    state: &ConnectionState,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(state)
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (unit {}) {}, {}/{} operations succeeded ({:.1}%), {} consecutive errors",
            self.host,
            self.port,
            self.unit_id,
            self.state,
            self.successful_operations,
            self.total_operations,
            self.success_rate * 100.0,
            self.consecutive_errors
        )
    }
}

/// Owns the live session and its health bookkeeping.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    settings: ConnectionSettings,
    handle: Option<TimeoutTransport<C::Transport>>,
    state: ConnectionState,
    consecutive_errors: u32,
    failed_establishes: u32,
    last_success: Option<Instant>,
    backoff_until: Option<Instant>,
    total_operations: u64,
    successful_operations: u64,
}

impl<C: Connector> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .field("state", &self.state)
            .field("consecutive_errors", &self.consecutive_errors)
            .field("backoff_until", &self.backoff_until)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager<TcpConnector> {
    pub fn tcp(settings: ConnectionSettings) -> Self {
        let connector = TcpConnector::new(settings.host.clone(), settings.port, settings.unit_id);
        Self::new(connector, settings)
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, settings: ConnectionSettings) -> Self {
        Self {
            connector,
            settings,
            handle: None,
            state: ConnectionState::Disconnected,
            consecutive_errors: 0,
            failed_establishes: 0,
            last_success: None,
            backoff_until: None,
            total_operations: 0,
            successful_operations: 0,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn backoff_until(&self) -> Option<Instant> {
        self.backoff_until
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Returns the live session, connecting or reconnecting as needed.
    ///
    /// # Errors
    ///
    /// * [`Error::Backoff`] if called inside the backoff window. No network
    ///   traffic happens in that case.
    /// * [`Error::Connection`] once every attempt of this call failed.
    pub async fn connection(&mut self) -> Result<&mut TimeoutTransport<C::Transport>> {
        if self.handle.is_some() && !self.check_health().await {
            self.discard("health check failed");
        }
        if self.handle.is_none() {
            self.establish().await?;
        }
        // `establish` either stored a session or returned an error.
        self.handle.as_mut().ok_or(Error::NotReady)
    }

    async fn check_health(&mut self) -> bool {
        let fresh = self
            .last_success
            .is_some_and(|last| last.elapsed() < self.settings.health_check_after);
        if fresh {
            return true;
        }
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        debug!("Probing idle connection");
        match handle
            .read_holding_registers(proto::HEALTH_PROBE_REG_ADDR, 1)
            .await
        {
            Ok(Ok(_)) => {
                self.last_success = Some(Instant::now());
                true
            }
            Ok(Err(exception)) => {
                warn!("Health probe answered with exception: {exception}");
                false
            }
            Err(err) => {
                warn!("Health probe failed: {err}");
                false
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        if let Some(until) = self.backoff_until {
            let now = Instant::now();
            if now < until {
                return Err(Error::Backoff {
                    remaining: until - now,
                });
            }
        }

        self.state = ConnectionState::Connecting;
        let attempts = self.settings.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let result =
                tokio::time::timeout(self.settings.timeout, self.connector.connect()).await;
            let err = match result {
                Ok(Ok(transport)) => {
                    info!(
                        "Connected to {}:{} (unit {})",
                        self.settings.host, self.settings.port, self.settings.unit_id
                    );
                    self.handle = Some(TimeoutTransport::new(transport, self.settings.timeout));
                    self.state = ConnectionState::Connected;
                    self.consecutive_errors = 0;
                    self.failed_establishes = 0;
                    self.backoff_until = None;
                    self.last_success = Some(Instant::now());
                    return Ok(());
                }
                Ok(Err(err)) => err,
                Err(_) => std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.settings.timeout),
                ),
            };
            warn!("Connection attempt {attempt}/{attempts} failed: {err}");
            last_error = Some(err);
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        self.failed_establishes = self.failed_establishes.saturating_add(1);
        let window = self.backoff_window();
        self.backoff_until = Some(Instant::now() + window);
        self.state = ConnectionState::Disconnected;
        error!(
            "Giving up on {}:{} after {attempts} attempts, next try in {window:?}",
            self.settings.host, self.settings.port
        );
        Err(Error::Connection {
            attempts,
            source: last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "no connection attempt")
            }),
        })
    }

    /// Window for the current number of consecutive failed establish calls.
    fn backoff_window(&self) -> Duration {
        let exponent = self.failed_establishes.saturating_sub(1).min(16);
        self.settings
            .backoff_base
            .saturating_mul(1 << exponent)
            .min(self.settings.backoff_max)
    }

    /// Books the outcome of an operation that ran on the live session.
    pub fn record<T>(&mut self, result: &Result<T>) {
        match result {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(err),
        }
    }

    pub fn record_success(&mut self) {
        self.total_operations += 1;
        self.successful_operations += 1;
        self.consecutive_errors = 0;
        self.last_success = Some(Instant::now());
        if self.handle.is_some() {
            self.state = ConnectionState::Connected;
        }
    }

    pub fn record_failure(&mut self, err: &Error) {
        self.total_operations += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if err.is_connection_error() {
            self.discard(&err.to_string());
        } else if self.consecutive_errors >= self.settings.error_threshold {
            self.discard("too many consecutive errors");
        } else if self.handle.is_some() {
            self.state = ConnectionState::Degraded;
        }
    }

    fn discard(&mut self, reason: &str) {
        if self.handle.take().is_some() {
            warn!("Dropping connection: {reason}");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Tears down the live session, if any. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            info!(
                "Closed connection to {}:{}",
                self.settings.host, self.settings.port
            );
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn stats(&self) -> ConnectionStats {
        let success_rate = if self.total_operations == 0 {
            0.0
        } else {
            self.successful_operations as f64 / self.total_operations as f64
        };
        ConnectionStats {
            host: self.settings.host.clone(),
            port: self.settings.port,
            unit_id: self.settings.unit_id,
            state: self.state,
            total_operations: self.total_operations,
            successful_operations: self.successful_operations,
            success_rate,
            consecutive_errors: self.consecutive_errors,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Connector;
    use crate::tokio_common::testing::Device;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Outcome forced on a connection attempt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ConnectFault {
        Refuse,
        /// Never completes.
        Stall,
    }

    /// Hands out sessions to one simulated device, failing on demand.
    #[derive(Debug, Clone, Default)]
    pub struct FakeConnector {
        pub device: Device,
        pub attempts: Arc<AtomicU32>,
        pub failures: Arc<Mutex<VecDeque<ConnectFault>>>,
    }

    impl FakeConnector {
        pub fn new(device: Device) -> Self {
            Self {
                device,
                ..Default::default()
            }
        }

        pub fn fail_next(&self, count: usize) {
            self.push_faults(ConnectFault::Refuse, count);
        }

        pub fn stall_next(&self, count: usize) {
            self.push_faults(ConnectFault::Stall, count);
        }

        fn push_faults(&self, fault: ConnectFault, count: usize) {
            let mut failures = self.failures.lock().unwrap();
            failures.extend(std::iter::repeat(fault).take(count));
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Connector for FakeConnector {
        type Transport = Device;

        fn connect(&mut self) -> impl Future<Output = std::io::Result<Device>> + Send {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failure = self.failures.lock().unwrap().pop_front();
            let device = self.device.clone();
            async move {
                match failure {
                    Some(ConnectFault::Refuse) => Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "simulated refusal",
                    )),
                    Some(ConnectFault::Stall) => std::future::pending().await,
                    None => Ok(device),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeConnector;
    use super::*;
    use crate::tokio_common::testing::{Device, Fault};
    use assert_matches::assert_matches;

    fn manager(connector: FakeConnector) -> ConnectionManager<FakeConnector> {
        ConnectionManager::new(connector, ConnectionSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn connects_lazily() {
        let connector = FakeConnector::new(Device::new());
        let mut manager = manager(connector.clone());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.attempts(), 0);

        manager.connection().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 1);

        manager.connection().await.unwrap();
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_within_one_call() {
        let connector = FakeConnector::new(Device::new());
        connector.fail_next(2);
        let mut manager = manager(connector.clone());

        manager.connection().await.unwrap();
        assert_eq!(connector.attempts(), 3);
        assert_eq!(manager.backoff_until(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_set_backoff() {
        let connector = FakeConnector::new(Device::new());
        connector.fail_next(3);
        let mut manager = manager(connector.clone());

        let result = manager.connection().await.map(|_| ());
        assert_matches!(result, Err(Error::Connection { attempts: 3, .. }));
        assert_eq!(connector.attempts(), 3);
        let until = manager.backoff_until().unwrap();
        assert!(until > Instant::now());

        let result = manager.connection().await.map(|_| ());
        assert_matches!(result, Err(Error::Backoff { .. }));
        assert_eq!(connector.attempts(), 3);

        tokio::time::advance(Duration::from_secs(5)).await;
        manager.connection().await.unwrap();
        assert_eq!(connector.attempts(), 4);
        assert_eq!(manager.backoff_until(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connect_times_out() {
        let connector = FakeConnector::new(Device::new());
        connector.stall_next(3);
        let mut manager = manager(connector.clone());
        let settings = manager.settings().clone();
        let start = Instant::now();

        let result = manager.connection().await.map(|_| ());
        assert_matches!(
            result,
            Err(Error::Connection { attempts: 3, ref source })
                if source.kind() == std::io::ErrorKind::TimedOut
        );
        assert_eq!(connector.attempts(), 3);
        assert!(start.elapsed() >= settings.timeout * 3 + settings.retry_delay * 2);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.backoff_until().unwrap() > Instant::now());

        let result = manager.connection().await.map(|_| ());
        assert_matches!(result, Err(Error::Backoff { .. }));
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_and_caps() {
        let connector = FakeConnector::new(Device::new());
        let mut manager = ConnectionManager::new(
            connector.clone(),
            ConnectionSettings {
                connect_attempts: 1,
                backoff_base: Duration::from_secs(10),
                backoff_max: Duration::from_secs(30),
                ..Default::default()
            },
        );
        let mut windows = Vec::new();
        for _ in 0..4 {
            connector.fail_next(1);
            assert!(manager.connection().await.is_err());
            let window = manager.backoff_until().unwrap() - Instant::now();
            windows.push(window.as_secs());
            tokio::time::advance(window).await;
        }
        assert_eq!(windows, [10, 20, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_error_discards_handle() {
        let connector = FakeConnector::new(Device::new());
        let mut manager = manager(connector.clone());
        manager.connection().await.unwrap();

        let err = Error::from(crate::tokio_common::timed_out(Duration::from_secs(1)));
        manager.record_failure(&err);
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connection().await.unwrap();
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn error_threshold_discards_handle() {
        let connector = FakeConnector::new(Device::new());
        let mut manager = manager(connector.clone());
        manager.connection().await.unwrap();

        let err = Error::from(tokio_modbus::ExceptionCode::IllegalDataAddress);
        manager.record_failure(&err);
        manager.record_failure(&err);
        assert_eq!(manager.state(), ConnectionState::Degraded);
        assert!(manager.is_connected());
        manager.record_failure(&err);
        assert!(!manager.is_connected());
        assert_eq!(manager.consecutive_errors(), 3);

        manager.connection().await.unwrap();
        manager.record_success();
        assert_eq!(manager.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_probed() {
        let device = Device::new();
        let connector = FakeConnector::new(device.clone());
        let mut manager = manager(connector.clone());
        manager.connection().await.unwrap();
        device.clear_log();

        tokio::time::advance(Duration::from_secs(10)).await;
        manager.connection().await.unwrap();
        assert!(device.log().is_empty());

        tokio::time::advance(Duration::from_secs(60)).await;
        device.fail_once(
            proto::HEALTH_PROBE_REG_ADDR,
            Fault::Exception(tokio_modbus::ExceptionCode::ServerDeviceBusy),
        );
        manager.connection().await.unwrap();
        assert_eq!(device.log().len(), 1);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let connector = FakeConnector::new(Device::new());
        let mut manager = manager(connector);
        manager.close();
        manager.connection().await.unwrap();
        manager.close();
        manager.close();
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stats() {
        let connector = FakeConnector::new(Device::new());
        let mut manager = manager(connector);
        manager.connection().await.unwrap();
        manager.record_success();
        manager.record_success();
        manager.record_success();
        manager.record_failure(&Error::from(tokio_modbus::ExceptionCode::IllegalFunction));

        let stats = manager.stats();
        assert_eq!(stats.host, "127.0.0.1");
        assert_eq!(stats.port, 502);
        assert_eq!(stats.unit_id, 1);
        assert_eq!(stats.total_operations, 4);
        assert_eq!(stats.successful_operations, 3);
        assert_eq!(stats.success_rate, 0.75);
        assert_eq!(stats.consecutive_errors, 1);
        assert_eq!(stats.state, ConnectionState::Degraded);
    }
}
