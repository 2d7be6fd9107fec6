// Naming configurator
//
// One-shot rename over the USB cable: open the port, write a single
// `NAME:<name>\n` line, close the port. The firmware stores the name and
// restarts advertising under it.

use crate::cable::CablePorts;
use crate::console::Console;
use crate::controls::Command;
use crate::errors::{Capability, RobotError};

/// Baud rate the robot firmware listens on for configuration lines.
pub const NAMING_BAUD_RATE: u32 = 115_200;

/// Write the rename directive. The session is closed on success and on
/// write failure alike.
pub fn rename_robot(
    ports: &dyn CablePorts,
    console: &Console,
    requested: &str,
) -> Result<String, RobotError> {
    let name = requested.trim();
    if name.is_empty() {
        return Err(RobotError::EmptyName);
    }
    if !ports.is_available() {
        return Err(RobotError::CapabilityUnavailable(Capability::Cable));
    }

    console.log("Connecting to Robot via USB...");
    let port = ports.request_port().map_err(RobotError::ConfiguratorFailed)?;
    let mut session = ports
        .open(&port, NAMING_BAUD_RATE)
        .map_err(RobotError::ConfiguratorFailed)?;

    console.log(format!("Saving new name to memory: {name}"));
    let command = Command::Rename(name.to_string());
    let written = session.write_all(command.encode().as_bytes());
    session.close();
    written.map_err(RobotError::ConfiguratorFailed)?;

    tlog!("[naming] Renamed robot on {} to {}", port, name);
    Ok(name.to_string())
}

/// Gesture handler: rename and report the outcome to the panel.
/// Returns whether the name was written.
pub fn rename_clicked(ports: &dyn CablePorts, console: &Console, requested: &str) -> bool {
    match rename_robot(ports, console, requested) {
        Ok(name) => {
            console.log(format!("Success! The robot is restarting as: {name}"));
            console.alert(format!(
                "Name Saved! The robot will now appear as \"{name}\" in the Bluetooth list."
            ));
            true
        }
        Err(e) => {
            crate::errors::report(console, &e);
            false
        }
    }
}
