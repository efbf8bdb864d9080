//! This module provides common data structures and error types for the `tokio`
//! based clients.
//!
//! It defines the `Error` enum, which encapsulates all possible communication
//! errors, and the [`Transport`] trait, the seam between the protocol
//! exchanges and the live Modbus connection.
use crate::protocol as proto;
use std::future::Future;
use std::time::Duration;
use tokio_modbus::client::{Context, Reader, Writer};

/// Represents all possible errors that can occur during Modbus communication.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`.
    #[error(transparent)]
    ProtocolError(#[from] proto::Error),

    /// Wraps `tokio_modbus::ExceptionCode`.
    #[error(transparent)]
    TokioExceptionError(#[from] tokio_modbus::ExceptionCode),

    /// Wraps `tokio_modbus::Error`, including request timeouts.
    #[error(transparent)]
    TokioError(#[from] tokio_modbus::Error),

    /// The device answered with fewer registers than requested.
    #[error("Short response at {address:#06x}: expected {expected} registers, got {actual}")]
    ShortResponse {
        address: u16,
        expected: u16,
        actual: usize,
    },

    /// Every connection attempt of one establish call failed.
    #[error("Connection failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// A connection attempt was suppressed inside the backoff window.
    #[error("Connection attempts suppressed for another {remaining:?}")]
    Backoff { remaining: Duration },

    /// No snapshot has ever been read from the device.
    #[error("Device not ready: no snapshot has been read yet")]
    NotReady,

    /// A debounced write was replaced by a newer value for the same register.
    #[error("Write to {address:#06x} superseded by a newer value")]
    Superseded { address: u16 },
}

impl Error {
    /// True for failures that leave the connection in an unknown state.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::TokioError(_) | Error::Connection { .. } | Error::Backoff { .. }
        )
    }
}

/// The result type for tokio operations.
pub type Result<T> = std::result::Result<T, crate::tokio_common::Error>;

/// The subset of Modbus functions the controller speaks.
///
/// Implemented for `tokio_modbus::client::Context`; tests substitute a
/// simulated device.
pub trait Transport: Send {
    /// Function code 0x03.
    fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = tokio_modbus::Result<Vec<u16>>> + Send;

    /// Function code 0x04.
    fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = tokio_modbus::Result<Vec<u16>>> + Send;

    /// Function code 0x10.
    fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = tokio_modbus::Result<()>> + Send;
}

impl Transport for Context {
    fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = tokio_modbus::Result<Vec<u16>>> + Send {
        Reader::read_holding_registers(self, address, quantity)
    }

    fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = tokio_modbus::Result<Vec<u16>>> + Send {
        Reader::read_input_registers(self, address, quantity)
    }

    fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = tokio_modbus::Result<()>> + Send {
        async move { Writer::write_multiple_registers(self, address, values).await }
    }
}

/// Bounds every request of the wrapped transport. An elapsed request is
/// reported as a transport error of kind `TimedOut`.
#[derive(Debug)]
pub struct TimeoutTransport<T> {
    inner: T,
    timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

pub(crate) fn timed_out(timeout: Duration) -> tokio_modbus::Error {
    tokio_modbus::Error::Transport(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("no response within {timeout:?}"),
    ))
}

async fn bounded<T>(
    timeout: Duration,
    request: impl Future<Output = tokio_modbus::Result<T>>,
) -> tokio_modbus::Result<T> {
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(timed_out(timeout)),
    }
}

impl<T: Transport> Transport for TimeoutTransport<T> {
    fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = tokio_modbus::Result<Vec<u16>>> + Send {
        bounded(self.timeout, self.inner.read_holding_registers(address, quantity))
    }

    fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = tokio_modbus::Result<Vec<u16>>> + Send {
        bounded(self.timeout, self.inner.read_input_registers(address, quantity))
    }

    fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = tokio_modbus::Result<()>> + Send {
        bounded(self.timeout, self.inner.write_multiple_registers(address, values))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Device, Fault};
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_transport_error() {
        let device = Device::new();
        device.set_holding(0x0002, &[7]);
        device.fail_once(0x0002, Fault::Stall(Duration::from_secs(5)));
        let mut transport = TimeoutTransport::new(device, Duration::from_secs(1));

        let result = transport.read_holding_registers(0x0002, 1).await;
        assert_matches!(
            result,
            Err(tokio_modbus::Error::Transport(ref err))
                if err.kind() == std::io::ErrorKind::TimedOut
        );

        let result = transport.read_holding_registers(0x0002, 1).await;
        assert_matches!(result, Ok(Ok(ref regs)) if regs == &[7]);
    }

    #[test]
    fn connection_errors() {
        assert!(Error::from(timed_out(Duration::from_secs(1))).is_connection_error());
        assert!(Error::Backoff {
            remaining: Duration::from_secs(1)
        }
        .is_connection_error());
        assert!(
            !Error::from(tokio_modbus::ExceptionCode::IllegalDataAddress).is_connection_error()
        );
        assert!(!Error::NotReady.is_connection_error());
        assert!(!Error::ShortResponse {
            address: 0,
            expected: 2,
            actual: 1
        }
        .is_connection_error());
    }
}
