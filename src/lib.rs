#[macro_use]
pub mod logging;

pub mod app;
pub mod ble;
pub mod ble_common;
pub mod cable;
pub mod cli;
pub mod console;
pub mod controls;
pub mod errors;
pub mod firmware;
pub mod flasher;
pub mod link;
pub mod naming;
pub mod settings;
pub mod ui;

#[cfg(test)]
mod mock;

use clap::Parser;
use std::path::Path;
use std::process::ExitCode;

pub fn run() -> ExitCode {
    let cli = cli::Cli::parse();

    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(settings::default_settings_path);
    let mut app_settings = match settings::load_settings(&settings_path) {
        Ok(s) => s,
        Err(e) => {
            tlog!("[setup] {}; using defaults", e);
            settings::Settings::default()
        }
    };
    cli.apply_overrides(&mut app_settings);

    if let Some(dir) = &app_settings.log_dir {
        if let Err(e) = logging::init_file_logging(Path::new(dir)) {
            tlog!("[setup] {}", e);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tlog!("[setup] Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(cli::Commands::Drive);
    let code = runtime.block_on(cli::execute(command, app_settings));

    logging::stop_file_logging();
    code
}
