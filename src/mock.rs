// Test doubles for the wireless, cable and flash seams.

use crate::cable::{CablePorts, CableSession};
use crate::errors::RobotError;
use crate::firmware::{FlashLoader, FlashOptions, FlashProgress, FlashTarget};
use crate::link::{CommandChannel, DiscoveryFilter, PeerLink, WirelessPeer, WirelessTransport};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub fn test_filter() -> DiscoveryFilter {
    DiscoveryFilter {
        service: crate::ble_common::NUS_SERVICE_UUID,
        command: crate::ble_common::NUS_RX_UUID,
        name_prefixes: vec!["Super".into(), "ESP32".into(), "Robot".into()],
        preferred_name: None,
        scan_window: Duration::from_millis(10),
    }
}

/// Poll `check` until it holds, failing the test after a second.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(1), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within 1s");
}

// ============================================================================
// Wireless
// ============================================================================

#[derive(Default)]
pub struct MockChannel {
    writes: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    pub closed: AtomicBool,
}

impl MockChannel {
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    async fn write(&self, data: &[u8]) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("GATT operation failed".to_string());
        }
        self.writes
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockWireless {
    name: String,
    env_error: Mutex<Option<RobotError>>,
    discover_error: Mutex<Option<RobotError>>,
    connect_error: Arc<Mutex<Option<RobotError>>>,
    lost: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    pub requests: AtomicUsize,
    pub channel: Arc<MockChannel>,
}

impl MockWireless {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            env_error: Mutex::new(None),
            discover_error: Mutex::new(None),
            connect_error: Arc::new(Mutex::new(None)),
            lost: Arc::new(Mutex::new(None)),
            requests: AtomicUsize::new(0),
            channel: Arc::new(MockChannel::default()),
        })
    }

    pub fn set_env_error(&self, err: RobotError) {
        *self.env_error.lock().unwrap() = Some(err);
    }

    pub fn set_discover_error(&self, err: RobotError) {
        *self.discover_error.lock().unwrap() = Some(err);
    }

    pub fn set_connect_error(&self, err: RobotError) {
        *self.connect_error.lock().unwrap() = Some(err);
    }

    /// Simulate the robot dropping the link.
    pub fn drop_link(&self) {
        if let Some(tx) = self.take_lost_sender() {
            let _ = tx.send(());
        }
    }

    pub fn take_lost_sender(&self) -> Option<oneshot::Sender<()>> {
        self.lost.lock().unwrap().take()
    }
}

#[async_trait]
impl WirelessTransport for MockWireless {
    async fn check_environment(&self) -> Result<(), RobotError> {
        match self.env_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn request_device(
        &self,
        _filter: &DiscoveryFilter,
    ) -> Result<Box<dyn WirelessPeer>, RobotError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.discover_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(Box::new(MockPeer {
            name: self.name.clone(),
            connect_error: self.connect_error.clone(),
            lost: self.lost.clone(),
            channel: self.channel.clone(),
        }))
    }
}

struct MockPeer {
    name: String,
    connect_error: Arc<Mutex<Option<RobotError>>>,
    lost: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    channel: Arc<MockChannel>,
}

#[async_trait]
impl WirelessPeer for MockPeer {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self, _filter: &DiscoveryFilter) -> Result<PeerLink, RobotError> {
        if let Some(err) = self.connect_error.lock().unwrap().clone() {
            return Err(err);
        }
        let (tx, rx) = oneshot::channel();
        *self.lost.lock().unwrap() = Some(tx);
        Ok(PeerLink {
            channel: self.channel.clone(),
            lost: rx,
        })
    }
}

// ============================================================================
// Cable
// ============================================================================

pub struct MockCable {
    pub available: AtomicBool,
    pub fail_writes: AtomicBool,
    pub requests: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    baud_rates: Mutex<Vec<u32>>,
}

impl MockCable {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            written: Arc::new(Mutex::new(Vec::new())),
            baud_rates: Mutex::new(Vec::new()),
        }
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn baud_rates(&self) -> Vec<u32> {
        self.baud_rates.lock().unwrap().clone()
    }
}

impl CablePorts for MockCable {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn request_port(&self) -> Result<String, String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok("/dev/ttyMOCK0".to_string())
    }

    fn open(&self, _port: &str, baud_rate: u32) -> Result<Box<dyn CableSession>, String> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.baud_rates.lock().unwrap().push(baud_rate);
        Ok(Box::new(MockSession {
            fail_writes: self.fail_writes.load(Ordering::SeqCst),
            written: self.written.clone(),
            closes: self.closes.clone(),
        }))
    }
}

struct MockSession {
    fail_writes: bool,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    closes: Arc<AtomicUsize>,
}

impl CableSession for MockSession {
    fn write_all(&mut self, data: &[u8]) -> Result<(), String> {
        if self.fail_writes {
            return Err("device unplugged".to_string());
        }
        self.written.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn close(self: Box<Self>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Flash
// ============================================================================

pub struct MockLoader {
    events: Arc<Mutex<Vec<String>>>,
    options: Arc<Mutex<Option<FlashOptions>>>,
    /// (written, total) pairs to report; empty = ten even steps.
    progress: Arc<Mutex<Vec<(usize, usize)>>>,
    pub fail_write: Arc<AtomicBool>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            options: Arc::new(Mutex::new(None)),
            progress: Arc::new(Mutex::new(Vec::new())),
            fail_write: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn options(&self) -> Option<FlashOptions> {
        self.options.lock().unwrap().clone()
    }

    pub fn set_progress(&self, steps: Vec<(usize, usize)>) {
        *self.progress.lock().unwrap() = steps;
    }
}

impl FlashLoader for MockLoader {
    fn attach(
        &self,
        port: &str,
        baud_rate: u32,
        options: &FlashOptions,
    ) -> Result<Box<dyn FlashTarget>, String> {
        self.events
            .lock()
            .unwrap()
            .push(format!("attach {port} {baud_rate} verify={}", options.verify_md5));
        Ok(Box::new(MockTarget {
            events: self.events.clone(),
            options: self.options.clone(),
            progress: self.progress.lock().unwrap().clone(),
            fail_write: self.fail_write.load(Ordering::SeqCst),
        }))
    }
}

struct MockTarget {
    events: Arc<Mutex<Vec<String>>>,
    options: Arc<Mutex<Option<FlashOptions>>>,
    progress: Vec<(usize, usize)>,
    fail_write: bool,
}

impl FlashTarget for MockTarget {
    fn detect_chip(&mut self) -> Result<String, String> {
        self.events.lock().unwrap().push("detect".to_string());
        Ok("ESP32-S3".to_string())
    }

    fn write_image(
        &mut self,
        image: &[u8],
        options: &FlashOptions,
        on_progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<(), String> {
        self.events
            .lock()
            .unwrap()
            .push(format!("write {} @{}", image.len(), options.address));
        *self.options.lock().unwrap() = Some(options.clone());
        if self.fail_write {
            return Err("MD5 mismatch".to_string());
        }

        let steps = if self.progress.is_empty() {
            (1..=10).map(|i| (image.len() * i / 10, image.len())).collect()
        } else {
            self.progress.clone()
        };
        for (written, total) in steps {
            on_progress(FlashProgress {
                image_index: 0,
                written,
                total,
            });
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), String> {
        self.events.lock().unwrap().push(format!("dtr {level}"));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), String> {
        self.events.lock().unwrap().push(format!("rts {level}"));
        Ok(())
    }
}
