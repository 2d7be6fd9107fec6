// Shared BLE adapter management
//
// Provides a singleton BLE manager + adapter used by the robot link and
// by the `scan` listing.

use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// GATT UUIDs
// ============================================================================

/// Nordic UART service advertised by the robot firmware.
pub const NUS_SERVICE_UUID: Uuid =
    uuid_from_fields(0x6e400001, 0xb5a3, 0xf393, 0xe0a9, 0xe50e24dcca9e);
/// NUS RX characteristic: the robot reads commands written here.
pub const NUS_RX_UUID: Uuid = uuid_from_fields(0x6e400002, 0xb5a3, 0xf393, 0xe0a9, 0xe50e24dcca9e);

// ============================================================================
// Shared adapter state
// ============================================================================

pub struct BleAdapterState {
    manager: Option<Manager>,
    pub adapter: Option<Adapter>,
}

pub static BLE_ADAPTER: Lazy<Arc<Mutex<BleAdapterState>>> = Lazy::new(|| {
    Arc::new(Mutex::new(BleAdapterState {
        manager: None,
        adapter: None,
    }))
});

#[derive(Debug)]
pub enum AdapterError {
    /// The platform Bluetooth stack refused or failed.
    Platform(btleplug::Error),
    /// The stack is up but has no adapter.
    NoAdapter,
}

/// Initialise the BLE manager and adapter if not already done, and return
/// a handle to the adapter.
pub async fn ensure_adapter() -> Result<Adapter, AdapterError> {
    let mut state = BLE_ADAPTER.lock().await;
    if let Some(adapter) = &state.adapter {
        return Ok(adapter.clone());
    }
    let manager = Manager::new().await.map_err(AdapterError::Platform)?;
    let adapters = manager.adapters().await.map_err(AdapterError::Platform)?;
    let adapter = adapters.into_iter().next().ok_or(AdapterError::NoAdapter)?;
    state.adapter = Some(adapter.clone());
    state.manager = Some(manager);
    tlog!("[ble_common] BLE adapter initialised");
    Ok(adapter)
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Build a 128-bit UUID from the 5-field encoding (same layout as Zephyr's
/// BT_UUID_128_ENCODE macro).
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}
