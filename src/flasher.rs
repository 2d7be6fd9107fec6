// espflash-backed flash loader
//
// Drives the ESP32 ROM/stub bootloader over a USB serial port. A second
// handle to the same port is kept aside before espflash takes ownership so
// the reset lines can still be pulsed once the image is written.

use crate::firmware::{FlashLoader, FlashOptions, FlashProgress, FlashTarget};
use espflash::connection::{Connection, ResetAfterOperation, ResetBeforeOperation};
use espflash::flasher::Flasher;
use espflash::target::ProgressCallbacks;
use serialport::{SerialPort, SerialPortType, UsbPortInfo};

pub struct EspflashLoader;

/// espflash needs the USB identity of the port to pick a reset strategy.
fn usb_port_info(port: &str) -> Result<UsbPortInfo, String> {
    let ports =
        serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;
    let found = ports
        .into_iter()
        .find(|p| p.port_name == port)
        .ok_or_else(|| format!("Serial port {} not found", port))?;
    match found.port_type {
        SerialPortType::UsbPort(info) => Ok(info),
        _ => Err(format!("{} is not a USB serial port", port)),
    }
}

/// espflash always deflates flash writes and never patches the header of a
/// raw image, so those two options can only be on.
fn check_supported(options: &FlashOptions) -> Result<(), String> {
    if !options.compress {
        return Err("Uncompressed writes are not supported by espflash".to_string());
    }
    if !options.keep_flash_size {
        return Err("Rewriting the image flash size is not supported by espflash".to_string());
    }
    Ok(())
}

impl FlashLoader for EspflashLoader {
    fn attach(
        &self,
        port: &str,
        baud_rate: u32,
        options: &FlashOptions,
    ) -> Result<Box<dyn FlashTarget>, String> {
        check_supported(options)?;
        let port_info = usb_port_info(port)?;
        let serial = serialport::new(port, baud_rate)
            .open_native()
            .map_err(|e| format!("Failed to open {}: {}", port, e))?;
        let control = serial
            .try_clone()
            .map_err(|e| format!("Failed to clone {} for reset control: {}", port, e))?;

        let connection = Connection::new(
            serial,
            port_info,
            ResetAfterOperation::NoReset,
            ResetBeforeOperation::DefaultReset,
            baud_rate,
        );
        tlog!("[flasher] Attached to {} at {} baud", port, baud_rate);

        Ok(Box::new(EspTarget {
            port: port.to_string(),
            connection: Some(connection),
            verify: options.verify_md5,
            flasher: None,
            control,
        }))
    }
}

struct EspTarget {
    port: String,
    /// Held until chip detection hands it to the flasher.
    connection: Option<Connection>,
    verify: bool,
    flasher: Option<Flasher>,
    control: Box<dyn SerialPort>,
}

impl FlashTarget for EspTarget {
    fn detect_chip(&mut self) -> Result<String, String> {
        let connection = self
            .connection
            .take()
            .ok_or_else(|| "Bootloader connection already in use".to_string())?;
        // use_stub, verify, skip, chip (auto), baud (unchanged)
        let flasher = Flasher::connect(connection, true, self.verify, false, None, None)
            .map_err(|e| format!("Failed to connect to bootloader on {}: {}", self.port, e))?;
        let chip = flasher.chip().to_string();
        self.flasher = Some(flasher);
        Ok(chip)
    }

    fn write_image(
        &mut self,
        image: &[u8],
        options: &FlashOptions,
        on_progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<(), String> {
        let flasher = self
            .flasher
            .as_mut()
            .ok_or_else(|| "Chip not detected".to_string())?;

        check_supported(options)?;
        tlog!("[flasher] Options: {:?}", options);

        if options.erase_all {
            tlog!("[flasher] Erasing flash on {}", self.port);
            flasher
                .erase_flash()
                .map_err(|e| format!("Erase failed: {}", e))?;
        }

        let mut progress = ProgressBridge {
            image_len: image.len(),
            units: 1,
            on_progress,
        };
        flasher
            .write_bin_to_flash(options.address, image, &mut progress)
            .map_err(|e| format!("Write failed: {}", e))
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), String> {
        self.control
            .write_data_terminal_ready(level)
            .map_err(|e| format!("Failed to set DTR: {}", e))
    }

    fn set_rts(&mut self, level: bool) -> Result<(), String> {
        self.control
            .write_request_to_send(level)
            .map_err(|e| format!("Failed to set RTS: {}", e))
    }
}

/// espflash counts progress in blocks; scale to bytes of the image.
struct ProgressBridge<'a> {
    image_len: usize,
    units: usize,
    on_progress: &'a mut dyn FnMut(FlashProgress),
}

impl ProgressCallbacks for ProgressBridge<'_> {
    fn init(&mut self, _addr: u32, total: usize) {
        self.units = total.max(1);
    }

    fn update(&mut self, current: usize) {
        let written = current.min(self.units) * self.image_len / self.units;
        (self.on_progress)(FlashProgress {
            image_index: 0,
            written,
            total: self.image_len,
        });
    }

    fn verifying(&mut self) {
        tlog!("[flasher] Verifying");
    }

    fn finish(&mut self, _skipped: bool) {}
}
