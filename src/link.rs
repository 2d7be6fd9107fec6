// Wireless link manager
//
// Owns the single robot connection. `connect`, `disconnect` and `send` are
// the only mutators; everything else reads. The transport behind it is a
// trait so the lifecycle runs the same against btleplug or a test double.
//
// Link loss is delivered through a oneshot per link. Each link carries a
// generation number so a late signal from an old link never tears down a
// newer one (the same "is this still the current peripheral" check the
// BLE watchdogs do).

use crate::console::Console;
use crate::controls::Command;
use crate::errors::RobotError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

// ============================================================================
// Transport seam
// ============================================================================

/// What to look for when discovering a robot.
#[derive(Clone, Debug)]
pub struct DiscoveryFilter {
    /// Advertised service carrying the command channel.
    pub service: Uuid,
    /// Writable characteristic commands are sent to.
    pub command: Uuid,
    /// Any advertised name starting with one of these also matches.
    pub name_prefixes: Vec<String>,
    /// Select this name when several robots answer.
    pub preferred_name: Option<String>,
    /// How long discovery may run before giving up.
    pub scan_window: Duration,
}

impl DiscoveryFilter {
    /// Service match OR name-prefix match.
    pub fn matches(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        if services.contains(&self.service) {
            return true;
        }
        match name {
            Some(name) => self
                .name_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str())),
            None => false,
        }
    }
}

/// Writable endpoint bound to an open link.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), String>;
    /// Tear down the link. Best effort.
    async fn close(&self);
}

/// An established link: its channel plus the loss signal.
pub struct PeerLink {
    pub channel: Arc<dyn CommandChannel>,
    /// Resolves (or is dropped) when the link goes away on its own.
    pub lost: oneshot::Receiver<()>,
}

/// A device picked during discovery, not yet connected.
#[async_trait]
pub trait WirelessPeer: Send + Sync {
    fn name(&self) -> String;
    /// Establish the link and resolve the command channel.
    async fn connect(&self, filter: &DiscoveryFilter) -> Result<PeerLink, RobotError>;
}

#[async_trait]
pub trait WirelessTransport: Send + Sync {
    /// Capability check. Fails with `CapabilityUnavailable` or `InsecureContext`.
    async fn check_environment(&self) -> Result<(), RobotError>;
    /// Discover and select one robot matching `filter`.
    async fn request_device(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Box<dyn WirelessPeer>, RobotError>;
}

// ============================================================================
// Affordance
// ============================================================================

/// State of the connect button.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Affordance {
    Idle,
    Scanning,
    Connecting,
    Connected(String),
}

impl Affordance {
    pub fn label(&self) -> String {
        match self {
            Affordance::Idle => "Connect Robot (BLE)".to_string(),
            Affordance::Scanning => "Scanning...".to_string(),
            Affordance::Connecting => "Connecting...".to_string(),
            Affordance::Connected(name) => format!("Connected: {name}"),
        }
    }

    /// The button only accepts presses while idle.
    pub fn enabled(&self) -> bool {
        matches!(self, Affordance::Idle)
    }
}

// ============================================================================
// Manager
// ============================================================================

struct ActiveLink {
    name: String,
    channel: Arc<dyn CommandChannel>,
    generation: u64,
}

struct LinkState {
    active: Option<ActiveLink>,
    affordance: Affordance,
    generation: u64,
}

#[derive(Clone)]
pub struct LinkManager {
    transport: Arc<dyn WirelessTransport>,
    filter: DiscoveryFilter,
    console: Console,
    state: Arc<Mutex<LinkState>>,
}

impl LinkManager {
    pub fn new(
        transport: Arc<dyn WirelessTransport>,
        filter: DiscoveryFilter,
        console: Console,
    ) -> Self {
        Self {
            transport,
            filter,
            console,
            state: Arc::new(Mutex::new(LinkState {
                active: None,
                affordance: Affordance::Idle,
                generation: 0,
            })),
        }
    }

    pub async fn affordance(&self) -> Affordance {
        self.state.lock().await.affordance.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    pub async fn device_name(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.active.as_ref().map(|a| a.name.clone())
    }

    async fn set_affordance(&self, affordance: Affordance) {
        self.state.lock().await.affordance = affordance;
    }

    /// Discover, select and connect to a robot.
    ///
    /// Capability checks run before anything else. A request while a
    /// connection exists or an attempt is in flight is ignored. On failure
    /// the affordance returns to `Idle`; the caller reports the error.
    pub async fn connect(&self) -> Result<(), RobotError> {
        self.transport.check_environment().await?;

        {
            let mut state = self.state.lock().await;
            if state.affordance != Affordance::Idle {
                drop(state);
                self.console.log("Connection attempt already in progress");
                return Ok(());
            }
            state.affordance = Affordance::Scanning;
        }

        let link = match self.establish().await {
            Ok(link) => link,
            Err(e) => {
                tlog!("[link] Connection failed: {:?}", e);
                self.set_affordance(Affordance::Idle).await;
                return Err(e);
            }
        };
        let (name, PeerLink { channel, lost }) = link;

        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            let generation = state.generation;
            state.active = Some(ActiveLink {
                name: name.clone(),
                channel,
                generation,
            });
            state.affordance = Affordance::Connected(name.clone());
            generation
        };

        // Observe unsolicited disconnects for this link only
        let manager = self.clone();
        tokio::spawn(async move {
            let _ = lost.await;
            manager.on_link_lost(generation).await;
        });

        tlog!("[link] Connected to {} (generation {})", name, generation);
        self.console.log(format!("Connected to {name}"));
        Ok(())
    }

    async fn establish(&self) -> Result<(String, PeerLink), RobotError> {
        self.console.log("Scanning for robots...");
        self.console
            .log(format!("Filtering for Service: {}", self.filter.service));

        let peer = self.transport.request_device(&self.filter).await?;
        let name = peer.name();
        self.console.log(format!("Device selected: {name}"));

        self.set_affordance(Affordance::Connecting).await;
        self.console.log("Connecting to robot...");
        let link = peer.connect(&self.filter).await?;
        Ok((name, link))
    }

    /// Explicit disconnect from the user.
    pub async fn disconnect(&self) {
        let active = {
            let mut state = self.state.lock().await;
            let active = state.active.take();
            if active.is_some() {
                state.affordance = Affordance::Idle;
            }
            active
        };

        match active {
            Some(link) => {
                tlog!("[link] Disconnecting from {}", link.name);
                link.channel.close().await;
                self.console.log("Robot Disconnected.");
            }
            None => self.console.log("Not connected"),
        }
    }

    async fn on_link_lost(&self, generation: u64) {
        let was_current = {
            let mut state = self.state.lock().await;
            let current = state
                .active
                .as_ref()
                .map_or(false, |a| a.generation == generation);
            if current {
                state.active = None;
                state.affordance = Affordance::Idle;
            }
            current
        };

        if was_current {
            tlog!("[link] Link {} lost", generation);
            self.console.log("Robot Disconnected.");
        }
    }

    /// Fire-and-forget send. Dropped silently while disconnected; a failed
    /// write is only logged and leaves the connection as it is.
    /// Returns whether the transport accepted the write.
    pub async fn send(&self, command: &Command) -> bool {
        let channel = {
            let state = self.state.lock().await;
            state.active.as_ref().map(|a| a.channel.clone())
        };

        let Some(channel) = channel else {
            tlog!("[link] Not connected, cannot send: {}", command);
            return false;
        };

        match channel.write(command.encode().as_bytes()).await {
            Ok(()) => {
                tlog!("[link] Sent: {}", command);
                true
            }
            Err(e) => {
                tlog!("[link] {}", RobotError::SendFailed(e));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Capability;
    use crate::mock::{test_filter, wait_until, MockWireless};
    use std::sync::atomic::Ordering;

    fn manager(wireless: &Arc<MockWireless>) -> (LinkManager, Console) {
        let console = Console::new();
        let link = LinkManager::new(wireless.clone(), test_filter(), console.clone());
        (link, console)
    }

    #[test]
    fn test_filter_matches_service_or_prefix() {
        let filter = test_filter();
        assert!(filter.matches(None, &[filter.service]));
        assert!(filter.matches(Some("SuperBot"), &[]));
        assert!(filter.matches(Some("ESP32-abc"), &[]));
        assert!(filter.matches(Some("Robot7"), &[]));
        assert!(!filter.matches(Some("Headphones"), &[]));
        assert!(!filter.matches(None, &[]));
        // prefix, not substring
        assert!(!filter.matches(Some("MySuperBot"), &[]));
    }

    #[test]
    fn test_affordance_labels() {
        assert_eq!(Affordance::Idle.label(), "Connect Robot (BLE)");
        assert_eq!(
            Affordance::Connected("SuperBot".into()).label(),
            "Connected: SuperBot"
        );
        assert!(Affordance::Idle.enabled());
        assert!(!Affordance::Scanning.enabled());
        assert!(!Affordance::Connected("x".into()).enabled());
    }

    #[tokio::test]
    async fn test_connect_then_unsolicited_disconnect() {
        let wireless = MockWireless::new("SuperBot");
        let (link, console) = manager(&wireless);

        link.connect().await.unwrap();
        assert_eq!(link.affordance().await, Affordance::Connected("SuperBot".into()));
        assert!(link.send(&Command::Speed(100)).await);
        assert_eq!(wireless.channel.writes(), vec!["V:100"]);

        wireless.drop_link();
        let link_ref = &link;
        wait_until(|| async move { link_ref.affordance().await == Affordance::Idle }).await;

        assert!(!link.is_connected().await);
        assert!(!link.send(&Command::Speed(50)).await);
        assert_eq!(wireless.channel.writes(), vec!["V:100"]);
        assert!(console.lines().last().unwrap().ends_with("Robot Disconnected."));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let wireless = MockWireless::new("SuperBot");
        let (link, _console) = manager(&wireless);
        assert!(!link.send(&Command::Direction("F".into())).await);
        assert!(wireless.channel.writes().is_empty());
    }

    #[tokio::test]
    async fn test_missing_capability_short_circuits() {
        let wireless = MockWireless::new("SuperBot");
        wireless.set_env_error(RobotError::CapabilityUnavailable(Capability::Wireless));
        let (link, _console) = manager(&wireless);

        let err = link.connect().await.unwrap_err();
        assert_eq!(err, RobotError::CapabilityUnavailable(Capability::Wireless));
        assert_eq!(wireless.requests.load(Ordering::SeqCst), 0);
        assert_eq!(link.affordance().await, Affordance::Idle);
    }

    #[tokio::test]
    async fn test_insecure_context_short_circuits() {
        let wireless = MockWireless::new("SuperBot");
        wireless.set_env_error(RobotError::InsecureContext);
        let (link, _console) = manager(&wireless);

        assert_eq!(link.connect().await.unwrap_err(), RobotError::InsecureContext);
        assert_eq!(wireless.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_discovery_failure_resets_affordance() {
        let wireless = MockWireless::new("SuperBot");
        wireless.set_discover_error(RobotError::NoDeviceFound);
        let (link, _console) = manager(&wireless);

        assert_eq!(link.connect().await.unwrap_err(), RobotError::NoDeviceFound);
        assert_eq!(link.affordance().await, Affordance::Idle);
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn test_link_failure_after_selection_resets_affordance() {
        let wireless = MockWireless::new("SuperBot");
        wireless.set_connect_error(RobotError::LinkLost);
        let (link, _console) = manager(&wireless);

        assert_eq!(link.connect().await.unwrap_err(), RobotError::LinkLost);
        assert_eq!(wireless.requests.load(Ordering::SeqCst), 1);
        assert_eq!(link.affordance().await, Affordance::Idle);
    }

    #[tokio::test]
    async fn test_second_connect_is_ignored() {
        let wireless = MockWireless::new("SuperBot");
        let (link, _console) = manager(&wireless);

        link.connect().await.unwrap();
        link.connect().await.unwrap();
        assert_eq!(wireless.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_closes_channel() {
        let wireless = MockWireless::new("SuperBot");
        let (link, _console) = manager(&wireless);

        link.connect().await.unwrap();
        link.disconnect().await;
        assert!(wireless.channel.closed.load(Ordering::SeqCst));
        assert_eq!(link.affordance().await, Affordance::Idle);
        assert!(!link.send(&Command::Speed(1)).await);
    }

    #[tokio::test]
    async fn test_stale_loss_signal_does_not_drop_new_link() {
        let wireless = MockWireless::new("SuperBot");
        let (link, _console) = manager(&wireless);

        link.connect().await.unwrap();
        let stale = wireless.take_lost_sender();
        link.disconnect().await;
        link.connect().await.unwrap();

        if let Some(tx) = stale {
            let _ = tx.send(());
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(link.is_connected().await);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_connection() {
        let wireless = MockWireless::new("SuperBot");
        let (link, _console) = manager(&wireless);

        link.connect().await.unwrap();
        wireless.channel.fail.store(true, Ordering::SeqCst);
        assert!(!link.send(&Command::Speed(10)).await);
        assert!(link.is_connected().await);
    }
}
