// Firmware updater
//
// Orchestrates a flash over the USB cable. The flashing protocol itself
// (bootloader sync, chip detection, compressed transfer, MD5 verify) sits
// behind `FlashLoader`/`FlashTarget`; this module only sequences the steps,
// throttles progress output and pulses the reset lines at the end.

use crate::cable::CablePorts;
use crate::console::Console;
use crate::errors::{Capability, RobotError};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashOptions {
    /// Flash address of the single image.
    pub address: u32,
    /// Leave the flash size in the image header untouched.
    pub keep_flash_size: bool,
    /// Erase the whole chip before writing.
    pub erase_all: bool,
    pub compress: bool,
    /// Verify each written region by MD5.
    pub verify_md5: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            address: 0,
            keep_flash_size: true,
            erase_all: true,
            compress: true,
            verify_md5: true,
        }
    }
}

/// One progress report: `written` of `total` bytes of image `image_index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashProgress {
    pub image_index: usize,
    pub written: usize,
    pub total: usize,
}

/// A bootloader connection on an open cable session.
pub trait FlashTarget: Send {
    /// Sync with the bootloader and identify the chip.
    fn detect_chip(&mut self) -> Result<String, String>;
    /// Write `image` per `options`. `on_progress` sees non-decreasing values.
    fn write_image(
        &mut self,
        image: &[u8],
        options: &FlashOptions,
        on_progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<(), String>;
    fn set_dtr(&mut self, level: bool) -> Result<(), String>;
    fn set_rts(&mut self, level: bool) -> Result<(), String>;
}

/// Opens a cable session and wraps it in a bootloader connection.
pub trait FlashLoader: Send + Sync {
    /// Options that shape the connection (MD5 verify) apply from here on;
    /// a loader that cannot honour an option refuses to attach.
    fn attach(
        &self,
        port: &str,
        baud_rate: u32,
        options: &FlashOptions,
    ) -> Result<Box<dyn FlashTarget>, String>;
}

/// Lets one log line through per 10% step, including steps a coarse
/// progress report jumped over.
#[derive(Default)]
pub struct ProgressThrottle {
    next_step: u32,
}

impl ProgressThrottle {
    /// Returns the steps reached since the previous report, in order.
    pub fn step(&mut self, written: usize, total: usize) -> Vec<u32> {
        if total == 0 {
            return Vec::new();
        }
        let percent = ((written.min(total) as u64 * 100) / total as u64) as u32;
        let mut reached = Vec::new();
        while self.next_step <= percent {
            reached.push(self.next_step);
            self.next_step += 10;
        }
        reached
    }
}

/// Flash `image_path` to the robot on the cable.
pub fn flash_firmware(
    ports: &dyn CablePorts,
    loader: &dyn FlashLoader,
    console: &Console,
    image_path: Option<&Path>,
    baud_rate: u32,
) -> Result<(), RobotError> {
    console.log("Initialize Flashing...");

    if !ports.is_available() {
        return Err(RobotError::CapabilityUnavailable(Capability::Cable));
    }
    let path = image_path.ok_or(RobotError::NoImageSelected)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    console.log(format!("Reading local file: {file_name}"));
    let image = std::fs::read(path)
        .map_err(|e| RobotError::FlashFailed(format!("Failed to read {}: {}", file_name, e)))?;
    if image.is_empty() {
        return Err(RobotError::FlashFailed(format!("{file_name} is empty")));
    }

    console.log("Requesting Serial Port...");
    let port = ports.request_port().map_err(RobotError::FlashFailed)?;

    console.log("Connecting to ESP32...");
    let options = FlashOptions::default();
    let mut target = loader
        .attach(&port, baud_rate, &options)
        .map_err(RobotError::FlashFailed)?;

    console.log("Connecting and detecting chip...");
    let chip = target.detect_chip().map_err(RobotError::FlashFailed)?;
    console.log(format!("Chip detected: {chip}"));

    console.log(format!("Starting Flash: {file_name}"));
    tlog!(
        "[firmware] Writing {} ({} bytes) to {} on {}",
        file_name,
        image.len(),
        chip,
        port
    );
    let mut throttle = ProgressThrottle::default();
    target
        .write_image(&image, &options, &mut |progress| {
            for percent in throttle.step(progress.written, progress.total) {
                console.log(format!("Flashing: {percent}%"));
            }
        })
        .map_err(RobotError::FlashFailed)?;

    console.log("Flash Complete! Resetting...");
    target.set_dtr(false).map_err(RobotError::FlashFailed)?;
    target.set_rts(true).map_err(RobotError::FlashFailed)?;

    console.log("Flash Success!");
    Ok(())
}

/// Gesture handler: flash and report the outcome to the panel.
/// Returns whether the image was written.
pub fn flash_clicked(
    ports: &dyn CablePorts,
    loader: &dyn FlashLoader,
    console: &Console,
    image_path: Option<&Path>,
    baud_rate: u32,
) -> bool {
    match flash_firmware(ports, loader, console, image_path, baud_rate) {
        Ok(()) => {
            console.alert("Firmware flashed successfully!");
            true
        }
        Err(e) => {
            crate::errors::report(console, &e);
            false
        }
    }
}
