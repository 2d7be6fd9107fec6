// Cable (serial) transport
//
// `CablePorts` stands in for the port chooser: it reports whether serial
// ports exist at all, picks one, and opens it. `CableSession` is the open
// port. The serialport-backed implementation lives here; tests use the
// doubles in `mock`.

use serde::Serialize;
use std::io::Write as _;
use std::time::Duration;

const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

pub trait CableSession: Send {
    fn write_all(&mut self, data: &[u8]) -> Result<(), String>;
    /// Release the port.
    fn close(self: Box<Self>);
}

pub trait CablePorts: Send + Sync {
    /// Whether the host can enumerate serial ports at all.
    fn is_available(&self) -> bool;
    /// Choose the port to use.
    fn request_port(&self) -> Result<String, String>;
    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn CableSession>, String>;
}

#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    pub fn is_usb(&self) -> bool {
        self.port_type == "USB"
    }
}

/// List available serial ports
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The cu (calling unit) devices are non-blocking and preferred for outgoing connections.
/// The tty (terminal) devices block on open waiting for carrier detect.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, String> {
    let ports =
        serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => {
                    ("PCI".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

/// Pick `preferred` if given, otherwise the first USB port.
pub fn choose_port(ports: &[SerialPortInfo], preferred: Option<&str>) -> Result<String, String> {
    if let Some(preferred) = preferred {
        return Ok(preferred.to_string());
    }
    ports
        .iter()
        .find(|p| p.is_usb())
        .map(|p| p.port_name.clone())
        .ok_or_else(|| "No USB serial port found. Is the robot plugged in?".to_string())
}

// ============================================================================
// serialport-backed implementation
// ============================================================================

pub struct SerialPorts {
    preferred: Option<String>,
}

impl SerialPorts {
    pub fn new(preferred: Option<String>) -> Self {
        Self { preferred }
    }
}

impl CablePorts for SerialPorts {
    fn is_available(&self) -> bool {
        serialport::available_ports().is_ok()
    }

    fn request_port(&self) -> Result<String, String> {
        let ports = list_serial_ports()?;
        choose_port(&ports, self.preferred.as_deref())
    }

    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn CableSession>, String> {
        let serial = serialport::new(port, baud_rate)
            .timeout(WRITE_TIMEOUT)
            .open()
            .map_err(|e| format!("Failed to open {}: {}", port, e))?;
        tlog!("[cable] Opened {} at {} baud", port, baud_rate);
        Ok(Box::new(SerialSession {
            name: port.to_string(),
            port: serial,
        }))
    }
}

struct SerialSession {
    name: String,
    port: Box<dyn serialport::SerialPort>,
}

impl CableSession for SerialSession {
    fn write_all(&mut self, data: &[u8]) -> Result<(), String> {
        self.port
            .write_all(data)
            .and_then(|_| self.port.flush())
            .map_err(|e| format!("Write to {} failed: {}", self.name, e))
    }

    fn close(self: Box<Self>) {
        tlog!("[cable] Closed {}", self.name);
    }
}
