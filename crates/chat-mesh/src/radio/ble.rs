//! Bluetooth LE radio on top of btleplug
//!
//! btleplug only drives the central role. The radio scans for the mesh
//! service and connects to every peripheral serving it; advertising reports
//! [`MeshError::Unsupported`] and the controller carries on as a scanner.
//! When two nodes discover each other at the same time they end up with two
//! links, which the connection manager collapses by identity.

use super::framing::{chunk, delimit, FrameAssembler};
use super::{LinkId, PeerRadio, RadioEvent, RadioEventSender, CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::message::PeerIdentity;
use crate::retry::{retry_transient, RetryConfig};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// BLE MTU limit for write fragmentation
const BLE_MTU: usize = 512;

struct BleLink {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

/// State reachable from the background scan and notification tasks
struct BleShared {
    sink: RwLock<Option<RadioEventSender>>,
    links: DashMap<LinkId, BleLink>,
    by_peripheral: DashMap<PeripheralId, LinkId>,
    connecting: DashSet<PeripheralId>,
    /// Cancels the running scan task; empty when nothing is discovering
    scan: RwLock<Option<CancellationToken>>,
    retry: RetryConfig,
    connection_timeout: Duration,
}

impl BleShared {
    async fn emit(&self, event: RadioEvent) {
        if let Some(sink) = self.sink.read().await.as_ref() {
            if sink.send(event).is_err() {
                debug!("BLE event sink closed");
            }
        }
    }

    /// Forget a link and report it lost, if it was still known
    async fn link_gone(&self, link: LinkId) {
        if let Some((_, gone)) = self.links.remove(&link) {
            self.by_peripheral.remove(&gone.peripheral.id());
            info!("BLE {} lost", link);
            self.emit(RadioEvent::LinkLost(link)).await;
        }
    }

    async fn peripheral_gone(&self, id: &PeripheralId) {
        if let Some((_, link)) = self.by_peripheral.remove(id) {
            self.link_gone(link).await;
        }
    }

    /// Called when the scan task exits
    ///
    /// A task that stopped on its own frees the scan slot so scanning can be
    /// started again, and reports `failure` as a capability loss.
    async fn scan_ended(&self, cancel: &CancellationToken, failure: Option<String>) {
        if cancel.is_cancelled() {
            return;
        }

        self.scan.write().await.take();
        if let Some(reason) = failure {
            error!("BLE discovery stopped: {}", reason);
            self.emit(RadioEvent::CapabilityLost(reason)).await;
        }
    }

    /// Connect to a discovered advertiser and start reading its frames
    async fn connect(self: Arc<Self>, peripheral: Peripheral, cancel: CancellationToken) {
        let id = peripheral.id();
        if self.by_peripheral.contains_key(&id) || !self.connecting.insert(id.clone()) {
            return;
        }

        let result = self.open_link(&peripheral).await;
        self.connecting.remove(&id);

        let (link, characteristic) = match result {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Could not link to {:?}: {}", id, e);
                return;
            }
        };

        let notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("No notification stream from {:?}: {}", id, e);
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect after failed subscribe: {}", e);
                }
                return;
            }
        };

        self.links.insert(
            link,
            BleLink {
                peripheral: peripheral.clone(),
                characteristic,
            },
        );
        self.by_peripheral.insert(id.clone(), link);
        info!("BLE {} established with {:?}", link, id);
        self.emit(RadioEvent::LinkEstablished(link)).await;

        let mut notifications = notifications;
        let mut assembler = FrameAssembler::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notification = notifications.next() => {
                    let Some(notification) = notification else {
                        debug!("Notification stream for {} ended", link);
                        break;
                    };
                    if notification.uuid != CHARACTERISTIC_UUID {
                        continue;
                    }

                    let assembled = assembler.push(&notification.value);
                    if assembled.discarded > 0 {
                        warn!(link = %link, bytes = assembled.discarded, "Discarded overlong frame");
                    }
                    for data in assembled.frames {
                        self.emit(RadioEvent::FrameReceived { link, data }).await;
                    }
                }
            }
        }

        self.link_gone(link).await;
    }

    async fn open_link(&self, peripheral: &Peripheral) -> MeshResult<(LinkId, Characteristic)> {
        let connection_timeout = self.connection_timeout;

        retry_transient("connect", &self.retry, || async move {
            match timeout(connection_timeout, peripheral.connect()).await {
                Ok(result) => result.map_err(MeshError::from),
                Err(_) => Err(MeshError::ConnectionFailed(format!(
                    "timed out after {:?}",
                    connection_timeout
                ))),
            }
        })
        .await?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("Service discovery failed: {}", e)))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == CHARACTERISTIC_UUID)
            .ok_or_else(|| {
                MeshError::ConnectionFailed("peer does not expose the mesh characteristic".to_string())
            })?;

        peripheral.subscribe(&characteristic).await?;

        Ok((LinkId::next(), characteristic))
    }
}

/// Cross-platform BLE radio implementation using btleplug
pub struct BleRadio {
    adapter: RwLock<Option<Adapter>>,
    shared: Arc<BleShared>,
    scan_restart_interval: Duration,
}

impl BleRadio {
    pub fn new(config: &MeshConfig) -> Self {
        info!("Initializing BLE radio");

        Self {
            adapter: RwLock::new(None),
            shared: Arc::new(BleShared {
                sink: RwLock::new(None),
                links: DashMap::new(),
                by_peripheral: DashMap::new(),
                connecting: DashSet::new(),
                scan: RwLock::new(None),
                retry: RetryConfig::from_mesh_config(config),
                connection_timeout: config.connection_timeout(),
            }),
            scan_restart_interval: config.scan_restart_interval(),
        }
    }

    /// Get the first adapter, creating it on first use
    ///
    /// Any failure here means Bluetooth is missing, off or not permitted.
    async fn adapter(&self) -> MeshResult<Adapter> {
        let mut adapter_lock = self.adapter.write().await;

        if let Some(adapter) = adapter_lock.as_ref() {
            return Ok(adapter.clone());
        }

        debug!("Creating BLE manager and adapter");

        let manager = Manager::new().await.map_err(|e| {
            MeshError::RadioCapabilityUnavailable(format!("Failed to create BLE manager: {}", e))
        })?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| MeshError::RadioCapabilityUnavailable(format!("Failed to get adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| MeshError::RadioCapabilityUnavailable("No BLE adapter found".to_string()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("BLE adapter initialized: {}", info),
            Err(e) => debug!("BLE adapter initialized without info: {}", e),
        }

        *adapter_lock = Some(adapter.clone());
        Ok(adapter)
    }

    pub fn link_count(&self) -> usize {
        self.shared.links.len()
    }

    fn link(&self, link: LinkId) -> MeshResult<(Peripheral, Characteristic)> {
        self.shared
            .links
            .get(&link)
            .map(|entry| (entry.peripheral.clone(), entry.characteristic.clone()))
            .ok_or_else(|| MeshError::LinkUnavailable(format!("{} not connected", link)))
    }
}

async fn run_scanner(
    adapter: Adapter,
    shared: Arc<BleShared>,
    restart_every: Duration,
    cancel: CancellationToken,
) {
    let failure = scan_until_lost(&adapter, &shared, restart_every, &cancel).await;

    if let Err(e) = adapter.stop_scan().await {
        debug!("stop_scan on exit failed: {}", e);
    }
    shared.scan_ended(&cancel, failure).await;
    debug!("BLE scanner terminated");
}

/// Delay before reopening an event stream that ended `consecutive` times in a row
///
/// `None` once the stream has ended more often than the retry budget allows.
fn reopen_delay(retry: &RetryConfig, consecutive: u32) -> Option<Duration> {
    if consecutive == 0 || consecutive > retry.max_attempts {
        return None;
    }
    Some(retry.calculate_delay(consecutive - 1))
}

/// Discover and connect until cancelled
///
/// Returns why discovery could not go on, or `None` when cancelled.
async fn scan_until_lost(
    adapter: &Adapter,
    shared: &Arc<BleShared>,
    restart_every: Duration,
    cancel: &CancellationToken,
) -> Option<String> {
    let mut restart = interval(restart_every);
    restart.tick().await;
    let mut stream_ends = 0;

    loop {
        let opened = retry_transient("open BLE event stream", &shared.retry, || async move {
            adapter.events().await.map_err(MeshError::from)
        })
        .await;
        let mut events = match opened {
            Ok(events) => events,
            Err(e) => return Some(format!("BLE event stream unavailable: {}", e)),
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = restart.tick() => {
                    // Some platforms quietly stop reporting advertisements
                    debug!("Restarting BLE scan");
                    if let Err(e) = adapter.stop_scan().await {
                        debug!("stop_scan failed: {}", e);
                    }
                    if let Err(e) = adapter.start_scan(ScanFilter { services: vec![SERVICE_UUID] }).await {
                        let failure = MeshError::from(e);
                        if failure.is_terminal() {
                            return Some(failure.to_string());
                        }
                        warn!("Scan restart failed: {}", failure);
                    }
                }
                event = events.next() => {
                    let Some(event) = event else {
                        break;
                    };
                    stream_ends = 0;

                    match event {
                        CentralEvent::DeviceDiscovered(id)
                        | CentralEvent::ServicesAdvertisement { id, .. } => {
                            if shared.by_peripheral.contains_key(&id) || shared.connecting.contains(&id) {
                                continue;
                            }
                            match adapter.peripheral(&id).await {
                                Ok(peripheral) => {
                                    if advertises_mesh(&peripheral).await {
                                        tokio::spawn(shared.clone().connect(peripheral, cancel.clone()));
                                    }
                                }
                                Err(e) => debug!("Discovered {:?} vanished: {}", id, e),
                            }
                        }
                        CentralEvent::DeviceDisconnected(id) => {
                            shared.peripheral_gone(&id).await;
                        }
                        _ => {}
                    }
                }
            }
        }

        stream_ends += 1;
        let Some(delay) = reopen_delay(&shared.retry, stream_ends) else {
            return Some(format!("BLE event stream closed {} times in a row", stream_ends));
        };
        warn!("BLE event stream ended, reopening in {:?}", delay);

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep(delay) => {}
        }
    }
}

async fn advertises_mesh(peripheral: &Peripheral) -> bool {
    match peripheral.properties().await {
        Ok(Some(properties)) => properties.services.contains(&SERVICE_UUID),
        Ok(None) => false,
        Err(e) => {
            debug!("No properties for {:?}: {}", peripheral.id(), e);
            false
        }
    }
}

#[async_trait]
impl PeerRadio for BleRadio {
    async fn attach(&self, sink: RadioEventSender) {
        *self.shared.sink.write().await = Some(sink);
    }

    async fn start_advertising(&self, identity: &PeerIdentity) -> MeshResult<()> {
        debug!("Advertising requested as {}", identity);

        // Missing hardware is a capability error, not a missing role
        self.adapter().await?;

        Err(MeshError::Unsupported(
            "btleplug has no BLE peripheral role; cannot advertise the mesh service".to_string(),
        ))
    }

    async fn start_scanning(&self) -> MeshResult<()> {
        let mut scan = self.shared.scan.write().await;
        if scan.is_some() {
            debug!("BLE scanning already active");
            return Ok(());
        }

        info!("Starting BLE scanning for service {}", SERVICE_UUID);
        let adapter = self.adapter().await?;

        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await?;

        let cancel = CancellationToken::new();
        tokio::spawn(run_scanner(
            adapter,
            self.shared.clone(),
            self.scan_restart_interval,
            cancel.clone(),
        ));
        *scan = Some(cancel);

        info!("BLE scanning started");
        Ok(())
    }

    async fn send(&self, link: LinkId, frame: &[u8]) -> MeshResult<()> {
        let (peripheral, characteristic) = self.link(link)?;
        let data = delimit(frame);

        for fragment in chunk(&data, BLE_MTU) {
            if let Err(e) = peripheral
                .write(&characteristic, &fragment, WriteType::WithoutResponse)
                .await
            {
                debug!(link = %link, "BLE write failed: {}", e);
                return Err(MeshError::LinkUnavailable(format!("write to {} failed: {}", link, e)));
            }
        }

        debug!(link = %link, bytes = data.len(), "Sent frame");
        Ok(())
    }

    async fn disconnect(&self, link: LinkId) -> MeshResult<()> {
        let (peripheral, _) = self.link(link)?;

        peripheral
            .disconnect()
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("Disconnect failed: {}", e)))?;

        self.shared.link_gone(link).await;
        Ok(())
    }

    async fn shutdown(&self) -> MeshResult<()> {
        info!("Shutting down BLE radio");

        if let Some(cancel) = self.shared.scan.write().await.take() {
            cancel.cancel();
        }

        let links: Vec<LinkId> = self.shared.links.iter().map(|entry| *entry.key()).collect();
        for link in links {
            if let Err(e) = self.disconnect(link).await {
                warn!("Failed to disconnect {}: {}", link, e);
                self.shared.link_gone(link).await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_on_unknown_link() {
        let radio = BleRadio::new(&MeshConfig::default());
        let result = radio.send(LinkId::next(), b"frame").await;
        assert!(matches!(result, Err(MeshError::LinkUnavailable(_))));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_link() {
        let radio = BleRadio::new(&MeshConfig::default());
        let result = radio.disconnect(LinkId::next()).await;
        assert!(matches!(result, Err(MeshError::LinkUnavailable(_))));
    }

    #[tokio::test]
    async fn test_shutdown_without_start() {
        let radio = BleRadio::new(&MeshConfig::default());
        radio.shutdown().await.unwrap();
        assert_eq!(radio.link_count(), 0);
        assert!(radio.shared.scan.read().await.is_none());
    }

    #[tokio::test]
    async fn test_advertising_start() {
        let radio = BleRadio::new(&MeshConfig::default());

        // Hosts without Bluetooth report a capability error instead
        let result = radio.start_advertising(&"node#0001".into()).await;
        assert!(matches!(
            result,
            Err(MeshError::Unsupported(_)) | Err(MeshError::RadioCapabilityUnavailable(_))
        ));
    }

    #[test]
    fn test_reopen_delay_backs_off_then_gives_up() {
        let retry = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };

        assert_eq!(reopen_delay(&retry, 1), Some(Duration::from_millis(100)));
        assert_eq!(reopen_delay(&retry, 2), Some(Duration::from_millis(200)));
        assert_eq!(reopen_delay(&retry, 3), Some(Duration::from_millis(400)));
        assert_eq!(reopen_delay(&retry, 4), None);
    }

    #[tokio::test]
    async fn test_scan_task_exit_frees_slot_and_reports_loss() {
        let radio = BleRadio::new(&MeshConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        radio.attach(tx).await;

        let cancel = CancellationToken::new();
        *radio.shared.scan.write().await = Some(cancel.clone());

        radio
            .shared
            .scan_ended(&cancel, Some("BLE event stream closed 6 times in a row".to_string()))
            .await;

        assert!(radio.shared.scan.read().await.is_none());
        assert!(matches!(rx.try_recv(), Ok(RadioEvent::CapabilityLost(reason)) if reason.contains("closed")));
    }

    #[tokio::test]
    async fn test_cancelled_scan_task_exits_quietly() {
        let radio = BleRadio::new(&MeshConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        radio.attach(tx).await;

        // A newer scan owns the slot; the old, cancelled task must not clear it
        let stale = CancellationToken::new();
        stale.cancel();
        let current = CancellationToken::new();
        *radio.shared.scan.write().await = Some(current);

        radio.shared.scan_ended(&stale, Some("ignored".to_string())).await;

        assert!(radio.shared.scan.read().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
