//! Serial port links
//!
//! Provides port enumeration and an async link over a blocking serial
//! port. A dedicated reader thread polls the port with a short timeout and
//! forwards bytes into the link's event queue; writes run on the blocking
//! pool so a slow port never stalls the runtime.

use super::{Link, LinkEvent, LinkOpener, LinkWriter, LINK_EVENT_CAPACITY};
use async_trait::async_trait;
use fablink_core::{ConnectionError, Error, Result};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default baud rate for machine controllers
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set serial number
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports that could host a machine controller
///
/// Filters to USB/ACM style devices:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::from(ConnectionError::SerialError {
            reason: format!("Failed to enumerate ports: {}", e),
        })
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_machine_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, port_description(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb_info) => {
                    let mut info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                    if let Some(ref mfg) = usb_info.manufacturer {
                        info = info.with_manufacturer(mfg);
                    }
                    if let Some(ref serial) = usb_info.serial_number {
                        info = info.with_serial_number(serial);
                    }
                    info
                }
                _ => info,
            }
        })
        .collect())
}

/// Check if a port name looks like a USB machine controller
fn is_machine_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

/// Get a user-friendly description for a port
fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Opens serial links to one device path
#[derive(Debug, Clone)]
pub struct SerialLinkOpener {
    path: String,
    baud_rate: u32,
    poll_timeout: Duration,
}

impl SerialLinkOpener {
    /// Create an opener for a device path and baud rate
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            poll_timeout: Duration::from_millis(10),
        }
    }

    /// Device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[async_trait]
impl LinkOpener for SerialLinkOpener {
    async fn open(&self) -> Result<Link> {
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.poll_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", self.path, e);
                ConnectionError::FailedToOpen {
                    target: self.path.clone(),
                    reason: e.to_string(),
                }
            })?;

        let reader = port.try_clone().map_err(|e| ConnectionError::SerialError {
            reason: format!("cannot clone {}: {}", self.path, e),
        })?;

        let (tx, rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        spawn_reader(self.path.clone(), reader, tx, stop.clone())?;

        tracing::info!("Opened serial port {} at {} baud", self.path, self.baud_rate);
        let writer = SerialWriter {
            port: Arc::new(Mutex::new(port)),
            stop,
        };
        Ok(Link::new(Arc::new(writer), rx, self.describe()))
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.path, self.baud_rate)
    }
}

fn spawn_reader(
    path: String,
    mut port: Box<dyn serialport::SerialPort>,
    tx: mpsc::Sender<LinkEvent>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("serial-reader {}", path))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                if stop.load(Ordering::Acquire) {
                    let _ = tx.blocking_send(LinkEvent::Closed(None));
                    break;
                }
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if tx.blocking_send(LinkEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::error!("Serial read on {} failed: {}", path, e);
                        let _ = tx.blocking_send(LinkEvent::Closed(Some(e.to_string())));
                        break;
                    }
                }
            }
            tracing::debug!("Serial reader for {} stopped", path);
        })
        .map(|_| ())
        .map_err(Error::from)
}

struct SerialWriter {
    port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    stop: Arc<AtomicBool>,
}

#[async_trait]
impl LinkWriter for SerialWriter {
    async fn write_all(&self, data: &[u8]) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(ConnectionError::closed("serial port closed").into());
        }
        let port = self.port.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut port = port.lock();
            port.write_all(&data)?;
            port.flush()
        })
        .await
        .map_err(|e| Error::other(format!("serial writer task failed: {}", e)))?
        .map_err(|e| {
            ConnectionError::SerialError {
                reason: e.to_string(),
            }
            .into()
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_port_patterns() {
        assert!(is_machine_port("COM3"));
        assert!(is_machine_port("/dev/ttyACM0"));
        assert!(is_machine_port("/dev/ttyUSB1"));
        assert!(is_machine_port("/dev/cu.usbmodem14201"));
        assert!(!is_machine_port("COM"));
        assert!(!is_machine_port("COMx"));
        assert!(!is_machine_port("/dev/ttyS0"));
    }

    #[test]
    fn test_opener_description() {
        let opener = SerialLinkOpener::new("/dev/ttyACM0", DEFAULT_BAUD_RATE);
        assert_eq!(opener.describe(), "serial:///dev/ttyACM0@115200");
        assert_eq!(opener.baud_rate(), 115_200);
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let opener = SerialLinkOpener::new("/dev/fablink-does-not-exist", DEFAULT_BAUD_RATE);
        let err = opener.open().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::FailedToOpen { .. })
        ));
    }
}
