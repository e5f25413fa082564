//! Single serial connection to the feedback device.
//!
//! Every I/O failure stops at this boundary: callers get a `bool` or a
//! [`Dispatch`] report and a log line, never an error that could stall the
//! playback loop.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stimulus::DeviceCommand;
use thiserror::Error;

mod link;

pub use link::{LoopbackLink, SerialLink, SerialPortLink};

const MAX_PENDING_RX: usize = 4096;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open serial port {port}: {source}")]
    Connect {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial port is not open")]
    NotOpen,
    #[error("no serial devices detected")]
    NoPorts,
    #[error("serial i/o: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port to open; the first enumerated port when unset.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self { Self { port: None, baud_rate: 9600, timeout_ms: 1000 } }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

fn describe(kind: &serialport::SerialPortType) -> String {
    match kind {
        serialport::SerialPortType::UsbPort(usb) => {
            let product = usb.product.clone().or_else(|| usb.manufacturer.clone()).unwrap_or_else(|| "USB serial".into());
            format!("{product} ({:04x}:{:04x})", usb.vid, usb.pid)
        }
        serialport::SerialPortType::PciPort => "PCI serial".into(),
        serialport::SerialPortType::BluetoothPort => "Bluetooth serial".into(),
        serialport::SerialPortType::Unknown => "n/a".into(),
    }
}

/// System-visible serial devices, sorted by name. Enumeration failure is
/// logged and reported as an empty list.
pub fn discover_ports() -> Vec<PortInfo> {
    let mut ports = match serialport::available_ports() {
        Ok(list) => list.into_iter().map(|p| PortInfo { description: describe(&p.port_type), name: p.port_name }).collect::<Vec<_>>(),
        Err(e) => {
            tracing::warn!(error = %e, "serial port enumeration failed");
            Vec::new()
        }
    };
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

/// Configured port if any, else the first discovered one.
pub fn select_port(preferred: Option<&str>, ports: &[PortInfo]) -> Option<String> {
    match preferred {
        Some(p) if !p.is_empty() => Some(p.to_string()),
        _ => ports.first().map(|p| p.name.clone()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialConnection {
    pub port_name: Option<String>,
    pub is_open: bool,
}

/// Outcome of a fire-and-forget send plus opportunistic read-back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub delivered: bool,
    pub response: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

pub struct DeviceChannel {
    config: SerialConfig,
    link: Option<Box<dyn SerialLink>>,
    rx: Vec<u8>,
    stats: DeviceStats,
}

impl DeviceChannel {
    pub fn new(config: SerialConfig) -> Self {
        Self { config, link: None, rx: Vec::new(), stats: DeviceStats::default() }
    }

    pub fn config(&self) -> &SerialConfig { &self.config }

    pub fn stats(&self) -> DeviceStats { self.stats }

    pub fn is_open(&self) -> bool { self.link.is_some() }

    pub fn connection(&self) -> SerialConnection {
        SerialConnection { port_name: self.link.as_ref().map(|l| l.name().to_string()), is_open: self.is_open() }
    }

    /// Replaces any current connection with `link`.
    pub fn attach(&mut self, link: Box<dyn SerialLink>) {
        self.close();
        tracing::info!(port = link.name(), "device attached");
        self.link = Some(link);
    }

    pub fn open(&mut self, port: &str) -> Result<(), DeviceError> {
        self.close();
        let handle = serialport::new(port, self.config.baud_rate)
            .timeout(self.config.timeout())
            .open()
            .map_err(|source| DeviceError::Connect { port: port.to_string(), source })?;
        tracing::info!(port, baud = self.config.baud_rate, "connected");
        self.link = Some(Box::new(SerialPortLink::new(port, handle)));
        Ok(())
    }

    /// Discover, select and open. Failure is logged; the channel then stays
    /// closed and later sends are dropped.
    pub fn connect(&mut self) -> bool {
        let ports = discover_ports();
        let Some(port) = select_port(self.config.port.as_deref(), &ports) else {
            tracing::warn!(error = %DeviceError::NoPorts, "continuing without a device");
            return false;
        };
        match self.open(&port) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "continuing without a device");
                false
            }
        }
    }

    /// User-triggered reconnect to the configured (or first) port.
    pub fn reconnect(&mut self) -> bool {
        self.close();
        self.connect()
    }

    pub fn close(&mut self) {
        if let Some(link) = self.link.take() {
            tracing::info!(port = link.name(), "serial port closed");
        }
        self.rx.clear();
    }

    /// Writes `"<tag><intensity>\n"`. A write failure closes the connection.
    pub fn send(&mut self, command: &DeviceCommand) -> Result<(), DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        if let Err(e) = link.write_all(&command.to_bytes()) {
            tracing::warn!(port = link.name(), error = %e, "write failed, closing port");
            self.stats.failed += 1;
            self.close();
            return Err(DeviceError::Io(e));
        }
        self.stats.sent += 1;
        tracing::debug!(command = %command, "sent");
        Ok(())
    }

    /// Drains everything the device has sent so far and returns the newest
    /// complete line. Older complete lines are discarded; a trailing partial
    /// line stays buffered. Never waits.
    pub fn try_read(&mut self) -> Option<String> {
        self.drain_link();
        let last = self.rx.iter().rposition(|&b| b == b'\n')?;
        let block: Vec<u8> = self.rx.drain(..=last).collect();
        let mut lines: Vec<String> = block
            .split(|&b| b == b'\n')
            .map(|l| String::from_utf8_lossy(l).trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        let newest = lines.pop()?;
        if !lines.is_empty() {
            tracing::debug!(stale = lines.len(), "discarded older responses");
        }
        tracing::debug!(response = %newest, "received");
        Some(newest)
    }

    fn drain_link(&mut self) {
        let Some(link) = self.link.as_mut() else { return };
        let mut buf = [0u8; 512];
        let mut budget = MAX_PENDING_RX * 4;
        while budget > 0 {
            let available = match link.bytes_available() {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "read-back unavailable");
                    break;
                }
            };
            let want = available.min(buf.len()).min(budget);
            match link.read_available(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    self.rx.extend_from_slice(&buf[..n]);
                    budget -= n;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "read-back failed");
                    break;
                }
            }
            if self.rx.len() > MAX_PENDING_RX { shed_rx(&mut self.rx); }
        }
    }

    /// Failure-isolated send: never returns an error.
    pub fn dispatch(&mut self, command: &DeviceCommand) -> Dispatch {
        match self.send(command) {
            Ok(()) => Dispatch { delivered: true, response: self.try_read() },
            Err(DeviceError::NotOpen) => {
                self.stats.dropped += 1;
                tracing::warn!(command = %command, "serial port is not open, command dropped");
                Dispatch { delivered: false, response: None }
            }
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "command not delivered");
                Dispatch { delivered: false, response: None }
            }
        }
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) { self.close(); }
}

/// Keeps only the newest complete line and any partial tail.
fn shed_rx(rx: &mut Vec<u8>) {
    let Some(last) = rx.iter().rposition(|&b| b == b'\n') else {
        rx.clear();
        return;
    };
    let start = rx[..last].iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
    rx.drain(..start);
    if rx.len() > MAX_PENDING_RX { rx.clear(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_with(link: &LoopbackLink) -> DeviceChannel {
        let mut ch = DeviceChannel::new(SerialConfig::default());
        ch.attach(Box::new(link.clone()));
        ch
    }

    #[test]
    fn test_serial_config_defaults() {
        let cfg = SerialConfig::default();
        assert_eq!(cfg.baud_rate, 9600);
        assert_eq!(cfg.timeout(), Duration::from_secs(1));
        let cfg: SerialConfig = serde_json::from_str(r#"{"port": "/dev/ttyACM0"}"#).unwrap();
        assert_eq!(cfg.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cfg.baud_rate, 9600);
    }

    #[test]
    fn test_select_port() {
        let ports = vec![
            PortInfo { name: "/dev/ttyACM0".into(), description: "n/a".into() },
            PortInfo { name: "/dev/ttyUSB0".into(), description: "n/a".into() },
        ];
        assert_eq!(select_port(None, &ports).as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(select_port(Some("/dev/pts/3"), &ports).as_deref(), Some("/dev/pts/3"));
        assert_eq!(select_port(None, &[]), None);
    }

    #[test]
    fn test_send_writes_wire_line() {
        let link = LoopbackLink::silent("loop");
        let mut ch = channel_with(&link);
        ch.send(&DeviceCommand::new('h', 190)).unwrap();
        ch.send(&DeviceCommand::new('c', 0)).unwrap();
        assert_eq!(link.written(), b"h190\nc0\n".to_vec());
        assert_eq!(ch.stats().sent, 2);
        assert_eq!(ch.connection(), SerialConnection { port_name: Some("loop".into()), is_open: true });
    }

    #[test]
    fn test_send_on_closed_channel() {
        let mut ch = DeviceChannel::new(SerialConfig::default());
        assert!(matches!(ch.send(&DeviceCommand::new('h', 1)), Err(DeviceError::NotOpen)));
        let d = ch.dispatch(&DeviceCommand::new('h', 1));
        assert!(!d.delivered);
        assert_eq!(ch.stats().dropped, 1);
        assert!(ch.try_read().is_none());
    }

    #[test]
    fn test_write_fault_closes_channel() {
        let link = LoopbackLink::new("loop");
        let mut ch = channel_with(&link);
        link.set_fail_writes(true);
        let d = ch.dispatch(&DeviceCommand::new('c', 200));
        assert!(!d.delivered);
        assert!(!ch.is_open());
        assert_eq!(ch.stats().failed, 1);
    }

    #[test]
    fn test_try_read_is_best_effort() {
        let link = LoopbackLink::silent("loop");
        let mut ch = channel_with(&link);
        assert_eq!(ch.try_read(), None);
        link.push_incoming("par");
        assert_eq!(ch.try_read(), None);
        link.push_incoming("tial\r\n");
        assert_eq!(ch.try_read().as_deref(), Some("partial"));
        assert_eq!(ch.try_read(), None);
    }

    #[test]
    fn test_try_read_returns_newest_line() {
        let link = LoopbackLink::silent("loop");
        let mut ch = channel_with(&link);
        link.push_incoming("h10\r\nh20\r\n\r\nh30\r\nc4");
        assert_eq!(ch.try_read().as_deref(), Some("h30"));
        // older lines are gone, the partial tail waits for its newline
        assert_eq!(ch.try_read(), None);
        link.push_incoming("0\n");
        assert_eq!(ch.try_read().as_deref(), Some("c40"));
    }

    #[test]
    fn test_try_read_drains_large_backlog() {
        let link = LoopbackLink::silent("loop");
        let mut ch = channel_with(&link);
        let backlog: String = (0..2000).map(|i| format!("h{i}\n")).collect();
        link.push_incoming(&backlog);
        assert_eq!(ch.try_read().as_deref(), Some("h1999"));
        assert_eq!(ch.try_read(), None);
    }

    #[test]
    fn test_dispatch_reads_echo() {
        let link = LoopbackLink::new("loop");
        let mut ch = channel_with(&link);
        let d = ch.dispatch(&DeviceCommand::new('h', 42));
        assert_eq!(d, Dispatch { delivered: true, response: Some("h42".into()) });
    }
}
