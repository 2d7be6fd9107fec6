// User-facing failure taxonomy
//
// Every gesture handler funnels its failure through `report`, which writes
// the headline and remediation lines to the log panel and raises an alert
// for connection and setup failures. Nothing here is retried automatically.

use crate::console::Console;
use std::fmt;

/// Platform capability a gesture depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Bluetooth Low Energy adapter.
    Wireless,
    /// Serial (USB cable) ports.
    Cable,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Wireless => f.write_str("Bluetooth"),
            Capability::Cable => f.write_str("Serial"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RobotError {
    #[error("{0} is not available on this system")]
    CapabilityUnavailable(Capability),
    #[error("Bluetooth access is restricted for this process")]
    InsecureContext,
    #[error("No devices found")]
    NoDeviceFound,
    #[error("Security error")]
    SecurityRejected,
    #[error("Connection lost")]
    LinkLost,
    #[error("{0}")]
    Unknown(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Please enter a name.")]
    EmptyName,
    #[error("Please select a .bin file first.")]
    NoImageSelected,
    #[error("{0}")]
    ConfiguratorFailed(String),
    #[error("{0}")]
    FlashFailed(String),
}

impl RobotError {
    /// First log line for this failure.
    pub fn headline(&self) -> String {
        match self {
            RobotError::CapabilityUnavailable(_) | RobotError::InsecureContext => {
                format!("{self}.")
            }
            RobotError::NoDeviceFound
            | RobotError::SecurityRejected
            | RobotError::LinkLost
            | RobotError::Unknown(_) => format!("Connection Failed: {self}"),
            RobotError::SendFailed(_) => self.to_string(),
            RobotError::EmptyName | RobotError::NoImageSelected => self.to_string(),
            RobotError::ConfiguratorFailed(msg) => format!("Error: {msg}"),
            RobotError::FlashFailed(msg) => format!("Flashing Error: {msg}"),
        }
    }

    /// Manual recovery steps shown under the headline.
    pub fn remediation(&self) -> &'static [&'static str] {
        match self {
            RobotError::CapabilityUnavailable(Capability::Wireless) => &[
                "1. Check that a Bluetooth adapter is present and switched on",
                "2. On Linux, make sure the bluetooth service (BlueZ) is running",
                "3. Press Connect again once the adapter is available",
            ],
            RobotError::CapabilityUnavailable(Capability::Cable) => &[
                "1. Plug the robot in with a data-capable USB cable",
                "2. Install the USB-serial driver for the board (CP210x / CH340)",
                "3. Retry once the port shows up in `robolink ports`",
            ],
            RobotError::InsecureContext => &[
                "1. macOS: allow this terminal under Privacy & Security > Bluetooth",
                "2. Linux: add your user to the 'bluetooth' group and log in again",
                "3. Press Connect again after granting access",
            ],
            RobotError::NoDeviceFound => &[
                "1. Power cycle the ESP32",
                "2. Clear the Bluetooth cache (bluetoothctl remove <addr>, or toggle Bluetooth)",
                "3. Check ESP32 Serial Monitor for device name",
                "4. Try scanning with phone app (nRF Connect)",
            ],
            RobotError::SecurityRejected => &[
                "The operating system refused the Bluetooth request",
                "Grant Bluetooth permission to this terminal and press Connect again",
            ],
            RobotError::LinkLost => &[
                "Device may be out of range or already connected",
                "Move closer or disconnect other centrals, then press Connect again",
            ],
            RobotError::ConfiguratorFailed(_) => &[
                "Reconnect the USB cable and press Rename again",
            ],
            RobotError::FlashFailed(_) => &[
                "Hold BOOT while tapping RESET to enter download mode",
                "Then restart the flash from file selection",
            ],
            RobotError::Unknown(_)
            | RobotError::SendFailed(_)
            | RobotError::EmptyName
            | RobotError::NoImageSelected => &[],
        }
    }

    /// Text for the blocking alert, if this failure raises one.
    pub fn alert(&self) -> Option<String> {
        match self {
            RobotError::CapabilityUnavailable(Capability::Wireless) => Some(
                "Bluetooth is not available.\nSwitch on the adapter and try again.".to_string(),
            ),
            RobotError::CapabilityUnavailable(Capability::Cable) => Some(
                "Serial ports are not available.\nConnect the robot over USB and try again."
                    .to_string(),
            ),
            RobotError::InsecureContext => Some(
                "Bluetooth access is restricted.\nGrant Bluetooth permission and try again."
                    .to_string(),
            ),
            RobotError::NoDeviceFound
            | RobotError::SecurityRejected
            | RobotError::LinkLost
            | RobotError::Unknown(_) => Some(self.headline()),
            RobotError::EmptyName | RobotError::NoImageSelected => Some(self.to_string()),
            RobotError::SendFailed(_)
            | RobotError::ConfiguratorFailed(_)
            | RobotError::FlashFailed(_) => None,
        }
    }
}

/// Translate a failure into log panel output (and an alert where one applies).
pub fn report(console: &Console, err: &RobotError) {
    tlog!("[errors] {:?}", err);
    console.log(err.headline());
    let steps = err.remediation();
    if !steps.is_empty() {
        console.log("Troubleshooting:");
        for step in steps {
            console.log(format!("   {step}"));
        }
    }
    if let Some(text) = err.alert() {
        console.alert(text);
    }
}
