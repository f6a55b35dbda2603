//! Serial channel ownership.
//!
//! A [`BusTransport`] performs exactly one request/response cycle per
//! [`exchange`](BusTransport::exchange). Retrying is the group engine's job.

use crate::error::{Result, ServoBusError};
use log::{debug, info};
use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Where and how to open the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl SerialSettings {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub trait BusTransport: Send {
    /// Open the channel. Opening an already open transport is a no-op.
    fn open(&mut self, settings: &SerialSettings) -> Result<()>;

    /// Release the channel. Safe to call any number of times.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Send `request` and read back exactly `response_len` bytes.
    ///
    /// Both directions are flushed first so bytes left over from an earlier
    /// timed-out exchange cannot shift the framing of this one.
    fn exchange(&mut self, request: &[u8], response_len: usize) -> Result<Vec<u8>>;
}

/// Transport over a host serial port.
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BusTransport for SerialTransport {
    fn open(&mut self, settings: &SerialSettings) -> Result<()> {
        if self.port.is_some() {
            debug!("serial port {} already open", settings.path);
            return Ok(());
        }
        let port = serialport::new(&settings.path, settings.baud_rate)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| ServoBusError::PortOpenFailed {
                path: settings.path.clone(),
                reason: e.to_string(),
            })?;
        info!(
            "opened {} at {} baud, timeout {:?}",
            settings.path, settings.baud_rate, settings.timeout
        );
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(port) = self.port.take() {
            info!("closed {}", port.name().unwrap_or_default());
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn exchange(&mut self, request: &[u8], response_len: usize) -> Result<Vec<u8>> {
        let port = self.port.as_mut().ok_or(ServoBusError::PortClosed)?;
        port.clear(ClearBuffer::All)
            .map_err(|e| ServoBusError::CommFailure(format!("clearing buffers: {e}")))?;
        port.write_all(request)
            .and_then(|_| port.flush())
            .map_err(|e| ServoBusError::CommFailure(format!("write: {e}")))?;

        let mut response = vec![0u8; response_len];
        port.read_exact(&mut response).map_err(|e| match e.kind() {
            ErrorKind::TimedOut | ErrorKind::UnexpectedEof => ServoBusError::CommFailure(format!(
                "timed out waiting for {response_len} response bytes"
            )),
            _ => ServoBusError::CommFailure(format!("read: {e}")),
        })?;
        Ok(response)
    }
}

/// Serial ports visible on this host, for front ends helping the operator
/// find the bus adapter.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| ServoBusError::Io(std::io::Error::other(e.to_string())))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
