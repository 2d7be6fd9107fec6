// Control panel state
//
// Owns the console, the link and the dispatcher, and turns user gestures
// into transport work. Wireless work runs on tasks so the panel keeps
// drawing during a scan; cable work runs on the blocking pool and only one
// cable session may be open at a time.

use crate::cable::CablePorts;
use crate::console::Console;
use crate::controls::{CommandDispatcher, Direction};
use crate::errors::report;
use crate::firmware::{self, FlashLoader};
use crate::link::{LinkManager, WirelessTransport};
use crate::naming;
use crate::settings::Settings;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct App {
    pub console: Console,
    pub dispatcher: CommandDispatcher,
    cable: Arc<dyn CablePorts>,
    loader: Arc<dyn FlashLoader>,
    cable_busy: Arc<AtomicBool>,
    flash_baud_rate: u32,
    /// Last image picked for flashing; pre-fills the flash prompt.
    pub firmware: Option<PathBuf>,
}

/// Clears the busy flag when the cable job ends, even if it panicked.
struct CableGuard(Arc<AtomicBool>);

impl Drop for CableGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl App {
    pub fn new(
        settings: &Settings,
        console: Console,
        transport: Arc<dyn WirelessTransport>,
        cable: Arc<dyn CablePorts>,
        loader: Arc<dyn FlashLoader>,
    ) -> Result<Self, String> {
        let filter = settings.ble.filter()?;
        let link = LinkManager::new(transport, filter, console.clone());
        Ok(Self {
            dispatcher: CommandDispatcher::new(link, settings.controls.clone()),
            console,
            cable,
            loader,
            cable_busy: Arc::new(AtomicBool::new(false)),
            flash_baud_rate: settings.serial.flash_baud_rate,
            firmware: settings.serial.firmware.as_ref().map(PathBuf::from),
        })
    }

    pub fn link(&self) -> &LinkManager {
        self.dispatcher.link()
    }

    pub fn cable_busy(&self) -> bool {
        self.cable_busy.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Wireless gestures
    // ========================================================================

    pub fn connect_clicked(&self) -> JoinHandle<()> {
        let link = self.link().clone();
        let console = self.console.clone();
        tokio::spawn(async move {
            if let Err(e) = link.connect().await {
                report(&console, &e);
            }
        })
    }

    pub fn disconnect_clicked(&self) -> JoinHandle<()> {
        let link = self.link().clone();
        tokio::spawn(async move { link.disconnect().await })
    }

    /// Leaving the panel: drop the link so the robot does not stay paired
    /// to a dead session.
    pub async fn shutdown(&self) {
        if self.link().is_connected().await {
            self.link().disconnect().await;
        }
    }

    pub async fn press(&mut self, direction: Direction) {
        self.dispatcher.press(direction).await;
    }

    pub async fn release(&mut self, direction: Direction) {
        self.dispatcher.release(direction).await;
    }

    /// Release every held direction, for terminals that never report key
    /// releases.
    pub async fn release_all(&mut self) {
        for direction in Direction::ALL {
            if self.dispatcher.is_active(direction) {
                self.dispatcher.release(direction).await;
            }
        }
    }

    // ========================================================================
    // Cable gestures
    // ========================================================================

    fn claim_cable(&self) -> Option<CableGuard> {
        if self.cable_busy.swap(true, Ordering::SeqCst) {
            self.console.log("Serial port is busy, wait for the current job to finish.");
            return None;
        }
        Some(CableGuard(self.cable_busy.clone()))
    }

    pub fn rename_clicked(&self, requested: String) -> Option<JoinHandle<bool>> {
        let guard = self.claim_cable()?;
        let cable = self.cable.clone();
        let console = self.console.clone();
        Some(tokio::task::spawn_blocking(move || {
            let _guard = guard;
            naming::rename_clicked(cable.as_ref(), &console, &requested)
        }))
    }

    pub fn flash_clicked(&mut self, image: Option<PathBuf>) -> Option<JoinHandle<bool>> {
        if image.is_some() {
            self.firmware = image.clone();
        }
        let guard = self.claim_cable()?;
        let cable = self.cable.clone();
        let loader = self.loader.clone();
        let console = self.console.clone();
        let baud_rate = self.flash_baud_rate;
        Some(tokio::task::spawn_blocking(move || {
            let _guard = guard;
            firmware::flash_clicked(
                cable.as_ref(),
                loader.as_ref(),
                &console,
                image.as_deref(),
                baud_rate,
            )
        }))
    }
}
