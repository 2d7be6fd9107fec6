// BLE robot transport (btleplug)
//
// Discovers robots advertising the command service (or a known name
// prefix), connects, resolves the command characteristic and watches the
// link. There is no device chooser on the desktop, so discovery runs for a
// bounded window and selects the preferred name if configured, otherwise
// the first match.

use crate::ble_common::{self, AdapterError};
use crate::errors::{Capability, RobotError};
use crate::link::{CommandChannel, DiscoveryFilter, PeerLink, WirelessPeer, WirelessTransport};
use async_trait::async_trait;
use btleplug::api::{Central, CharPropFlags, Characteristic, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// How often discovered peripherals are polled during a scan.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often the link watchdog checks the connection.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Types
// ============================================================================

#[derive(Clone, Debug, Serialize)]
pub struct DiscoveredRobot {
    pub name: String,
    pub id: String,
    pub rssi: Option<i16>,
}

// ============================================================================
// Helpers
// ============================================================================

fn map_btleplug_error(e: btleplug::Error) -> RobotError {
    match e {
        btleplug::Error::PermissionDenied => RobotError::SecurityRejected,
        btleplug::Error::DeviceNotFound => RobotError::NoDeviceFound,
        btleplug::Error::NotConnected | btleplug::Error::TimedOut(_) => RobotError::LinkLost,
        other => RobotError::Unknown(other.to_string()),
    }
}

fn map_adapter_error(e: AdapterError) -> RobotError {
    match e {
        AdapterError::NoAdapter => RobotError::CapabilityUnavailable(Capability::Wireless),
        AdapterError::Platform(btleplug::Error::PermissionDenied) => RobotError::InsecureContext,
        AdapterError::Platform(e) => {
            tlog!("[ble] BLE manager init failed: {e}");
            RobotError::CapabilityUnavailable(Capability::Wireless)
        }
    }
}

/// Index of the robot to connect to: the first one named `preferred`, or
/// the first one seen when that name is absent or none is configured.
fn pick_robot<'a>(
    names: impl IntoIterator<Item = &'a str>,
    preferred: Option<&str>,
) -> Option<usize> {
    let names: Vec<&str> = names.into_iter().collect();
    if names.is_empty() {
        return None;
    }
    preferred
        .and_then(|wanted| names.iter().position(|name| *name == wanted))
        .or(Some(0))
}

/// Scan for robots matching `filter` until the window closes. With
/// `stop_at_pick` the scan ends as soon as a robot that would be selected
/// (the preferred name, or any match when none is configured) shows up.
async fn scan(
    adapter: &Adapter,
    filter: &DiscoveryFilter,
    stop_at_pick: bool,
) -> Result<Vec<(DiscoveredRobot, Peripheral)>, RobotError> {
    // Unfiltered scan: 128-bit service UUIDs often sit in the scan
    // response, which platform-side filters do not reliably match.
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(map_btleplug_error)?;

    tlog!(
        "[ble] Scan started (service {}, prefixes {:?})",
        filter.service,
        filter.name_prefixes
    );

    let deadline = Instant::now() + filter.scan_window;
    let mut seen_ids = HashSet::new();
    let mut found = Vec::new();

    'poll: while Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;

        let peripherals = match adapter.peripherals().await {
            Ok(p) => p,
            Err(e) => {
                tlog!("[ble] Failed to list peripherals: {e}");
                continue;
            }
        };

        for peripheral in peripherals {
            let id = peripheral.id().to_string();
            if seen_ids.contains(&id) {
                continue;
            }

            let props = match peripheral.properties().await.ok().flatten() {
                Some(p) => p,
                None => continue,
            };

            let advertised: Vec<Uuid> = props
                .services
                .iter()
                .copied()
                .chain(props.service_data.keys().copied())
                .collect();
            if !filter.matches(props.local_name.as_deref(), &advertised) {
                continue;
            }

            seen_ids.insert(id.clone());
            let name = props.local_name.clone().unwrap_or_else(|| id.clone());
            tlog!("[ble] Matched: {} ({}), RSSI: {:?}", name, id, props.rssi);

            let is_pick = filter
                .preferred_name
                .as_deref()
                .map_or(true, |wanted| wanted == name);
            found.push((
                DiscoveredRobot {
                    name,
                    id,
                    rssi: props.rssi,
                },
                peripheral,
            ));
            if stop_at_pick && is_pick {
                break 'poll;
            }
        }
    }

    let _ = adapter.stop_scan().await;
    tlog!("[ble] Scan finished, {} robot(s) matched", found.len());
    Ok(found)
}

/// List every robot seen during one scan window.
pub async fn discover_robots(filter: &DiscoveryFilter) -> Result<Vec<DiscoveredRobot>, RobotError> {
    let adapter = ble_common::ensure_adapter().await.map_err(map_adapter_error)?;
    let found = scan(&adapter, filter, false).await?;
    Ok(found.into_iter().map(|(robot, _)| robot).collect())
}

// ============================================================================
// Transport
// ============================================================================

pub struct BleTransport;

#[async_trait]
impl WirelessTransport for BleTransport {
    async fn check_environment(&self) -> Result<(), RobotError> {
        ble_common::ensure_adapter()
            .await
            .map(|_| ())
            .map_err(map_adapter_error)
    }

    async fn request_device(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Box<dyn WirelessPeer>, RobotError> {
        let adapter = ble_common::ensure_adapter().await.map_err(map_adapter_error)?;
        let mut found = scan(&adapter, filter, true).await?;
        let index = pick_robot(
            found.iter().map(|(robot, _)| robot.name.as_str()),
            filter.preferred_name.as_deref(),
        )
        .ok_or(RobotError::NoDeviceFound)?;
        let (robot, peripheral) = found.swap_remove(index);
        Ok(Box::new(BlePeer {
            name: robot.name,
            peripheral,
        }))
    }
}

struct BlePeer {
    name: String,
    peripheral: Peripheral,
}

impl BlePeer {
    async fn abandon(&self, err: RobotError) -> RobotError {
        let _ = self.peripheral.disconnect().await;
        err
    }
}

#[async_trait]
impl WirelessPeer for BlePeer {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self, filter: &DiscoveryFilter) -> Result<PeerLink, RobotError> {
        tlog!("[ble] Connecting to {}...", self.name);
        self.peripheral
            .connect()
            .await
            .map_err(map_btleplug_error)?;

        if let Err(e) = self.peripheral.discover_services().await {
            return Err(self.abandon(map_btleplug_error(e)).await);
        }

        let has_service = self
            .peripheral
            .services()
            .iter()
            .any(|s| s.uuid == filter.service);
        if !has_service {
            let err = RobotError::Unknown(format!(
                "{} does not expose service {}",
                self.name, filter.service
            ));
            return Err(self.abandon(err).await);
        }

        let command = match self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == filter.command)
        {
            Some(c) => c,
            None => {
                let err = RobotError::Unknown(format!(
                    "Command characteristic {} not found",
                    filter.command
                ));
                return Err(self.abandon(err).await);
            }
        };

        let write_type = if command
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        tlog!("[ble] Connected to {} ({:?})", self.name, write_type);

        let (lost_tx, lost_rx) = oneshot::channel();
        spawn_watchdog(self.peripheral.clone(), self.name.clone(), lost_tx);

        Ok(PeerLink {
            channel: Arc::new(BleChannel {
                peripheral: self.peripheral.clone(),
                command,
                write_type,
            }),
            lost: lost_rx,
        })
    }
}

/// Poll the link and fire `lost` when the peripheral drops. Ends quietly
/// once nobody is listening any more.
fn spawn_watchdog(peripheral: Peripheral, name: String, lost: oneshot::Sender<()>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(WATCHDOG_INTERVAL).await;

            if lost.is_closed() {
                break;
            }

            let connected = peripheral.is_connected().await.unwrap_or(false);
            if !connected {
                tlog!("[ble] Watchdog: {name} disconnected");
                let _ = lost.send(());
                break;
            }
        }
    });
}

struct BleChannel {
    peripheral: Peripheral,
    command: Characteristic,
    write_type: WriteType,
}

#[async_trait]
impl CommandChannel for BleChannel {
    async fn write(&self, data: &[u8]) -> Result<(), String> {
        self.peripheral
            .write(&self.command, data, self.write_type)
            .await
            .map_err(|e| e.to_string())
    }

    async fn close(&self) {
        // Best-effort disconnect, the peripheral may already be gone
        let _ = self.peripheral.disconnect().await;
    }
}
