//! Mesh controller: the single facade the application talks to

use crate::config::MeshConfig;
use crate::connection::{ConnectionManager, PeerLink, ReachabilityChange};
use crate::control::ControlPayload;
use crate::error::{MeshError, MeshResult};
use crate::message::{Message, MessageId, MessageKind, PeerIdentity};
use crate::observer::MeshObserver;
use crate::outbox::OutboxQueue;
use crate::radio::{LinkId, PeerRadio, RadioEvent};
use crate::retry::{retry_transient, RetryConfig};
use crate::router::{Inbound, MessageRouter};
use crate::seen_cache::SeenMessageCache;
use dashmap::DashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    /// Advertising and scanning are being brought up
    Starting,
    Active,
    /// The radio reported it can no longer operate
    Failed,
}

/// What happened to a send request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to this many links right away
    Flooded { links: usize },
    /// No usable link; held in the outbox until a peer appears
    Queued,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// State shared between the facade and its background tasks
struct MeshCore {
    config: MeshConfig,
    radio: Arc<dyn PeerRadio>,
    observer: Arc<dyn MeshObserver>,
    connections: Arc<ConnectionManager>,
    router: MessageRouter,
    outbox: Mutex<OutboxQueue>,
    /// Recipients with a drain in flight; only touched under the outbox lock
    draining: DashSet<PeerIdentity>,
    state: RwLock<ControllerState>,
    last_reported_count: AtomicUsize,
}

impl MeshCore {
    async fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::LinkEstablished(link) => {
                self.connections.link_established(link).await;
                if let Err(e) = self.router.send_hello(link).await {
                    warn!(link = %link, "Failed to send hello: {}", e);
                }
                self.report_reachability().await;
            }
            RadioEvent::LinkLost(link) => {
                if let Some(ReachabilityChange::Lost(identity)) = self.connections.link_lost(link).await {
                    info!("Lost last link to {}", identity);
                }
                self.report_reachability().await;
            }
            RadioEvent::FrameReceived { link, data } => {
                let inbound = self.router.handle_frame(link, &data).await;
                self.handle_inbound(link, inbound).await;
            }
            RadioEvent::CapabilityLost(reason) => {
                let failure = MeshError::RadioCapabilityUnavailable(reason);
                error!("Radio capability lost: {}", failure);
                *self.state.write().await = ControllerState::Failed;
                self.observer.on_failure(&failure);
            }
        }
    }

    async fn handle_inbound(&self, link: LinkId, inbound: Inbound) {
        match inbound {
            Inbound::Handshake { identity } => {
                // The peer's hello can overtake our own link-established event
                if self.connections.link_established(link).await {
                    debug!(link = %link, "Hello arrived before link event");
                }

                let changes = match self.connections.identify(link, identity).await {
                    Ok(changes) => changes,
                    Err(e) => {
                        debug!("Ignoring handshake: {}", e);
                        return;
                    }
                };

                self.report_reachability().await;

                for change in changes {
                    if let ReachabilityChange::Gained(identity) = change {
                        self.drain_outbox(&identity).await;
                    }
                }
            }
            Inbound::Delivered(message) => self.dispatch(message),
            Inbound::Relayed { .. } => self.observer.on_message_relayed(),
            Inbound::Dropped(reason) => debug!(link = %link, "Frame dropped: {:?}", reason),
        }
    }

    fn dispatch(&self, message: Message) {
        match message.kind {
            MessageKind::Regular => self.observer.on_message_received(message),
            MessageKind::Acknowledgement | MessageKind::Read => match message.control_payload() {
                Ok(ControlPayload::Acknowledgement(_)) => {
                    self.observer.on_acknowledgement_received(message)
                }
                Ok(ControlPayload::Read(ids)) if ids.is_empty() => {
                    debug!(message_id = message.id, "Empty read receipt, nothing to do");
                }
                Ok(ControlPayload::Read(_)) => self.observer.on_read_receipt_received(message),
                Err(e) => warn!(message_id = message.id, "Dropping control message: {}", e),
            },
        }
    }

    /// Report the connected-device count if it moved since the last report
    async fn report_reachability(&self) {
        let count = self.connections.connected_device_count().await;
        let previous = self.last_reported_count.swap(count, Ordering::SeqCst);
        if previous != count {
            debug!("Connected devices: {} -> {}", previous, count);
            self.observer.on_reachability_changed(count);
        }
    }

    /// Flood queued messages now that `gained` is reachable
    ///
    /// The gained peer's queue goes first. Every other queue follows, since the
    /// new neighbour is also a path towards them.
    async fn drain_outbox(&self, gained: &PeerIdentity) {
        let mut recipients = self.outbox.lock().await.recipients();
        recipients.sort();
        recipients.retain(|recipient| recipient != gained);
        recipients.insert(0, gained.clone());

        for recipient in recipients {
            self.drain_recipient(&recipient).await;
        }
    }

    /// Flood everything queued for `recipient` in order
    ///
    /// Returns the link count of the last flood once the queue is empty, or
    /// `None` when messages are left behind. Only one drain per recipient
    /// runs at a time: a second caller gets `None` and leaves the queue to the
    /// drain in progress, which keeps taking until nothing is left. On the
    /// first failure the failed message and everything behind it go back to
    /// the head of the queue.
    async fn drain_recipient(&self, recipient: &PeerIdentity) -> Option<usize> {
        {
            let outbox = self.outbox.lock().await;
            if self.draining.contains(recipient) {
                return None;
            }
            if outbox.queue_len(recipient) == 0 {
                return Some(0);
            }
            self.draining.insert(recipient.clone());
        }

        let mut flooded = 0;
        let mut last_links = 0;

        loop {
            let pending = {
                let mut outbox = self.outbox.lock().await;
                let pending = outbox.take(recipient);
                if pending.is_empty() {
                    self.draining.remove(recipient);
                    break;
                }
                pending
            };

            let mut remaining = pending.into_iter();
            while let Some(item) = remaining.next() {
                match self.router.originate(&item.message).await {
                    Ok(links) => {
                        flooded += 1;
                        last_links = links;
                    }
                    Err(e) => {
                        debug!("Stopped draining {} after {}: {}", recipient, flooded, e);
                        let mut undelivered = vec![item];
                        undelivered.extend(remaining);

                        let mut outbox = self.outbox.lock().await;
                        outbox.requeue_front(recipient, undelivered);
                        self.draining.remove(recipient);
                        info!("Flooded {} queued message(s) for {} before a write failed", flooded, recipient);
                        return None;
                    }
                }
            }
        }

        info!("Flooded {} queued message(s) for {}", flooded, recipient);
        Some(last_links)
    }

    async fn send(&self, message: Message) -> MeshResult<SendOutcome> {
        let receiver = message.receiver.clone();

        let direct = {
            let mut outbox = self.outbox.lock().await;
            if self.draining.contains(&receiver) || outbox.queue_len(&receiver) > 0 {
                outbox.enqueue(message);
                None
            } else {
                Some(message)
            }
        };

        // Older messages for this receiver go first
        let Some(message) = direct else {
            debug!(receiver = %receiver, "Queued behind pending messages");
            return Ok(match self.drain_recipient(&receiver).await {
                Some(links) if links > 0 => SendOutcome::Flooded { links },
                _ => SendOutcome::Queued,
            });
        };

        match self.router.originate(&message).await {
            Ok(links) => Ok(SendOutcome::Flooded { links }),
            Err(MeshError::NoConnectedDevices) | Err(MeshError::LinkUnavailable(_)) => {
                debug!(
                    message_id = message.id,
                    receiver = %message.receiver,
                    "No usable link, queueing"
                );
                self.outbox.lock().await.enqueue(message);
                Ok(SendOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }
}

async fn run_event_loop(
    core: Arc<MeshCore>,
    mut events: mpsc::UnboundedReceiver<RadioEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Event loop received shutdown signal");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => core.handle_radio_event(event).await,
                    None => {
                        debug!("Radio event channel closed");
                        break;
                    }
                }
            }
        }
    }

    debug!("Mesh event loop terminated");
}

async fn run_outbox_sweeper(core: Arc<MeshCore>, cancel: CancellationToken) {
    let mut sweep = interval(core.config.outbox_sweep_interval());
    // The first tick fires immediately
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let expired = core.outbox.lock().await.cleanup_expired();
                if expired > 0 {
                    info!("Outbox sweep expired {} message(s)", expired);
                }
            }
        }
    }

    debug!("Outbox sweeper terminated");
}

/// Facade over radio, connection tracking, routing and store-and-forward
///
/// Application calls ([`MeshController::send`] and friends) run on the
/// caller's task. Radio events are handled by one background task spawned by
/// [`MeshController::start`], which is also where observer callbacks run.
pub struct MeshController {
    core: Arc<MeshCore>,
    retry: RetryConfig,
    running: Mutex<Option<Running>>,
}

impl MeshController {
    pub fn new(
        identity: PeerIdentity,
        config: MeshConfig,
        radio: Arc<dyn PeerRadio>,
        observer: Arc<dyn MeshObserver>,
    ) -> Self {
        let seen = Arc::new(SeenMessageCache::new(config.seen_retention(), config.seen_capacity));
        let connections = Arc::new(ConnectionManager::new());
        let router = MessageRouter::new(identity.clone(), seen, connections.clone(), radio.clone());
        let outbox = OutboxQueue::new(config.outbox_max_per_recipient, config.outbox_max_age());
        let retry = RetryConfig::from_mesh_config(&config);

        info!("MeshController created for {}", identity);

        Self {
            core: Arc::new(MeshCore {
                config,
                radio,
                observer,
                connections,
                router,
                outbox: Mutex::new(outbox),
                draining: DashSet::new(),
                state: RwLock::new(ControllerState::Idle),
                last_reported_count: AtomicUsize::new(0),
            }),
            retry,
            running: Mutex::new(None),
        }
    }

    /// Start advertising and scanning, then process radio events until stopped
    ///
    /// Transient radio errors are retried with backoff. A capability error is
    /// reported to the observer and returned. Calling `start` on an active
    /// controller does nothing; after the radio reported a capability loss it
    /// tears the old session down and brings the radio up again.
    pub async fn start(&self) -> MeshResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            if self.state().await != ControllerState::Failed {
                debug!("MeshController already running");
                return Ok(());
            }

            info!("Restarting mesh after radio failure");
            if let Some(stale) = running.take() {
                self.teardown(stale).await;
            }
        }

        let identity = self.core.router.identity().await;
        info!("Starting mesh as {}", identity);
        *self.core.state.write().await = ControllerState::Starting;

        let (tx, rx) = mpsc::unbounded_channel();
        self.core.radio.attach(tx).await;

        if let Err(e) = self.bring_up_radio(&identity).await {
            *self.core.state.write().await = ControllerState::Idle;
            if e.is_terminal() {
                error!("Mesh failed to start: {}", e);
                self.core.observer.on_failure(&e);
            }
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_event_loop(self.core.clone(), rx, cancel.clone())),
            tokio::spawn(run_outbox_sweeper(self.core.clone(), cancel.clone())),
        ];
        *running = Some(Running { cancel, tasks });
        *self.core.state.write().await = ControllerState::Active;

        info!("Mesh active as {}", identity);
        Ok(())
    }

    async fn bring_up_radio(&self, identity: &PeerIdentity) -> MeshResult<()> {
        let radio = &self.core.radio;
        match retry_transient("start advertising", &self.retry, || radio.start_advertising(identity)).await {
            Ok(()) => {}
            Err(MeshError::Unsupported(reason)) => {
                warn!("Advertising unavailable, running as scanner only: {}", reason);
            }
            Err(e) => return Err(e),
        }
        retry_transient("start scanning", &self.retry, || radio.start_scanning()).await?;
        Ok(())
    }

    /// Stop background tasks and close every link
    ///
    /// Queued messages stay in the outbox.
    pub async fn stop(&self) -> MeshResult<()> {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            debug!("MeshController not running");
            return Ok(());
        };

        self.teardown(running).await;
        info!("Mesh stopped");
        Ok(())
    }

    /// Cancel background tasks, shut the radio down and forget every link
    async fn teardown(&self, running: Running) {
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        if let Err(e) = self.core.radio.shutdown().await {
            warn!("Radio shutdown failed: {}", e);
        }

        let dropped = self.core.connections.clear().await;
        debug!("Dropped {} link(s) on teardown", dropped);
        self.core.report_reachability().await;

        *self.core.state.write().await = ControllerState::Idle;
    }

    /// Switch to a new identity
    ///
    /// Every link is torn down and rebuilt, and queued messages are discarded
    /// because the old identity can no longer be addressed. The seen cache and
    /// the relay counter survive. A running controller is restarted under the
    /// new identity.
    pub async fn reconfigure(&self, identity: PeerIdentity) -> MeshResult<()> {
        let was_running = self.running.lock().await.is_some();
        self.stop().await?;

        let discarded = self.core.outbox.lock().await.clear();
        if discarded > 0 {
            warn!("Discarded {} queued message(s) on reconfigure", discarded);
        }

        self.core.router.set_identity(identity.clone()).await;
        info!("Reconfigured mesh identity to {}", identity);

        if was_running {
            self.start().await?;
        }
        Ok(())
    }

    /// Send a message, flooding now or queueing until a peer appears
    ///
    /// Never drops a well-formed request: no connected devices is reported as
    /// [`SendOutcome::Queued`], not as an error.
    pub async fn send(&self, message: Message) -> MeshResult<SendOutcome> {
        self.core.send(message).await
    }

    /// Encrypted-elsewhere payload to `receiver` as a regular message
    pub async fn send_text(
        &self,
        receiver: PeerIdentity,
        ciphertext: impl Into<String>,
    ) -> MeshResult<(MessageId, SendOutcome)> {
        let message = Message::regular(self.identity().await, receiver, ciphertext);
        let id = message.id;
        Ok((id, self.send(message).await?))
    }

    /// Send an acknowledgement or read receipt
    pub async fn send_control(
        &self,
        receiver: PeerIdentity,
        payload: &ControlPayload,
    ) -> MeshResult<SendOutcome> {
        let message = Message::control(self.identity().await, receiver, payload);
        self.send(message).await
    }

    /// Confirm delivery of `id` to its sender with `ACK/<id>`
    pub async fn acknowledge(&self, receiver: PeerIdentity, id: MessageId) -> MeshResult<SendOutcome> {
        self.send_control(receiver, &ControlPayload::Acknowledgement(id)).await
    }

    /// Tell `receiver` these messages were read
    ///
    /// Returns `None` without sending anything when `ids` is empty.
    pub async fn mark_read(
        &self,
        receiver: PeerIdentity,
        ids: Vec<MessageId>,
    ) -> MeshResult<Option<SendOutcome>> {
        if ids.is_empty() {
            debug!("No read ids for {}, skipping receipt", receiver);
            return Ok(None);
        }
        let outcome = self.send_control(receiver, &ControlPayload::Read(ids)).await?;
        Ok(Some(outcome))
    }

    pub async fn identity(&self) -> PeerIdentity {
        self.core.router.identity().await
    }

    pub async fn state(&self) -> ControllerState {
        *self.core.state.read().await
    }

    pub fn relay_count(&self) -> u64 {
        self.core.router.relay_count()
    }

    pub async fn connected_device_count(&self) -> usize {
        self.core.connections.connected_device_count().await
    }

    pub async fn is_reachable(&self, identity: &PeerIdentity) -> bool {
        self.core.connections.is_reachable(identity).await
    }

    pub async fn peers(&self) -> Vec<PeerLink> {
        self.core.connections.snapshot().await
    }

    /// Messages waiting in the outbox across all recipients
    pub async fn pending_outbox(&self) -> usize {
        self.core.outbox.lock().await.total_messages()
    }

    pub async fn pending_for(&self, recipient: &PeerIdentity) -> usize {
        self.core.outbox.lock().await.queue_len(recipient)
    }
}
