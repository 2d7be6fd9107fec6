// Command-line surface
//
// With no subcommand the terminal control panel starts. The other
// subcommands run one operation, print to the terminal and exit.

use crate::app::App;
use crate::ble::{self, BleTransport};
use crate::cable::{self, SerialPorts};
use crate::console::Console;
use crate::errors::{report, RobotError};
use crate::flasher::EspflashLoader;
use crate::settings::Settings;
use crate::ui;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "robolink", version, about = "Drive, rename and flash BLE robots")]
pub struct Cli {
    /// Settings file (default: <config dir>/robolink/settings.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Serial port for rename and flash (default: first USB port)
    #[arg(long, global = true)]
    pub port: Option<String>,

    /// Advertised robot name to pick when several are in range
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// Write a diagnostic log file to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Open the control panel (default)
    Drive,
    /// List robots advertising nearby
    Scan,
    /// List serial ports
    Ports,
    /// Store a new advertised name on the robot over USB
    Rename { name: String },
    /// Flash a firmware image over USB
    Flash { file: PathBuf },
}

impl Cli {
    /// Command-line flags win over the settings file.
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(port) = &self.port {
            settings.serial.port = Some(port.clone());
        }
        if let Some(device) = &self.device {
            settings.ble.preferred_device = Some(device.clone());
        }
        if let Some(dir) = &self.log_dir {
            settings.log_dir = Some(dir.display().to_string());
        }
    }
}

fn build_app(settings: &Settings, console: Console) -> Result<App, String> {
    App::new(
        settings,
        console,
        Arc::new(BleTransport),
        Arc::new(SerialPorts::new(settings.serial.port.clone())),
        Arc::new(EspflashLoader),
    )
}

pub async fn execute(command: Commands, settings: Settings) -> ExitCode {
    match command {
        Commands::Drive => {
            let app = match build_app(&settings, Console::new()) {
                Ok(app) => app,
                Err(e) => {
                    eprintln!("Error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            match ui::run(app).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Terminal error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Scan => {
            let console = Console::with_echo();
            let filter = match settings.ble.filter() {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            console.log(format!(
                "Scanning for {}s (service {}, prefixes {:?})...",
                filter.scan_window.as_secs(),
                filter.service,
                filter.name_prefixes
            ));
            match ble::discover_robots(&filter).await {
                Ok(robots) if robots.is_empty() => {
                    report(&console, &RobotError::NoDeviceFound);
                    ExitCode::FAILURE
                }
                Ok(robots) => {
                    for robot in robots {
                        let rssi = robot
                            .rssi
                            .map(|r| format!("{r} dBm"))
                            .unwrap_or_else(|| "-".to_string());
                        println!("{:<24} {:<40} {}", robot.name, robot.id, rssi);
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    report(&console, &e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Ports => match cable::list_serial_ports() {
            Ok(ports) => {
                for port in ports {
                    let product = port.product.clone().unwrap_or_default();
                    let marker = if port.is_usb() { "usb" } else { "" };
                    println!("{:<28} {:<6} {:<4} {}", port.port_name, port.port_type, marker, product);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
        Commands::Rename { name } => {
            let app = match build_app(&settings, Console::with_echo()) {
                Ok(app) => app,
                Err(e) => {
                    eprintln!("Error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let saved = match app.rename_clicked(name) {
                Some(job) => job.await.unwrap_or(false),
                None => false,
            };
            if saved {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Flash { file } => {
            let mut app = match build_app(&settings, Console::with_echo()) {
                Ok(app) => app,
                Err(e) => {
                    eprintln!("Error: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let flashed = match app.flash_clicked(Some(file)) {
                Some(job) => job.await.unwrap_or(false),
                None => false,
            };
            if flashed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
