//! In-memory peer network for exercising the dispatch and transfer layers
//! without real sockets.
//!
//! A `TestPeer` is one simulated node: an identity, a boot counter, and a
//! message bus. `connect` wires two peers together with a `MemoryLink` in
//! each direction; every link runs a pump task that stamps the source onto
//! submitted messages and dispatches them straight into the remote bus.
//! Links expose toggles for the failure modes the transfer layer has to
//! survive: lost traffic, withheld acknowledgements, restarts, disconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use cairn_core::{Message, PeerId};

use crate::bus::MessageBus;
use crate::peer::{PacketCallback, PeerLink, SendError};
use crate::throttle::{BandwidthThrottle, ByteCounter};

/// One simulated node.
pub struct TestPeer {
    id: PeerId,
    boot: AtomicU64,
    connected: AtomicBool,
    pub bus: Arc<MessageBus>,
}

impl TestPeer {
    pub fn new(id_byte: u8) -> Arc<Self> {
        Arc::new(Self {
            id: [id_byte; 32],
            boot: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            bus: Arc::new(MessageBus::new()),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn boot_id(&self) -> u64 {
        self.boot.load(Ordering::SeqCst)
    }

    /// Simulate a process restart: the boot id changes.
    pub fn restart(&self) {
        self.boot.fetch_add(1, Ordering::SeqCst);
    }

    /// Simulate the peer going away.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

type Queued = (Message, Option<Arc<dyn PacketCallback>>);

/// One direction of a simulated connection: the local side's handle on the
/// remote peer.
pub struct MemoryLink {
    remote: Arc<TestPeer>,
    /// Remote boot id when the link came up; a later mismatch means the
    /// session state is gone.
    session_boot: u64,
    outbound: mpsc::UnboundedSender<Queued>,
    throttle: Arc<BandwidthThrottle>,
    acks: Arc<AtomicBool>,
    delivery: Arc<AtomicBool>,
}

impl MemoryLink {
    /// Stop acknowledging delivered packets. The data still arrives.
    pub fn suppress_acks(&self) {
        self.acks.store(false, Ordering::SeqCst);
    }

    /// Silently drop everything submitted from now on.
    pub fn drop_traffic(&self) {
        self.delivery.store(false, Ordering::SeqCst);
    }
}

/// Wire two peers together. Returns `(a→b, b→a)`.
pub fn connect(a: &Arc<TestPeer>, b: &Arc<TestPeer>) -> (Arc<MemoryLink>, Arc<MemoryLink>) {
    (
        link(a, b, BandwidthThrottle::unlimited()),
        link(b, a, BandwidthThrottle::unlimited()),
    )
}

/// One direction with an explicit throttle.
pub fn link(
    local: &Arc<TestPeer>,
    remote: &Arc<TestPeer>,
    throttle: BandwidthThrottle,
) -> Arc<MemoryLink> {
    let (outbound, inbound) = mpsc::unbounded_channel();
    let acks = Arc::new(AtomicBool::new(true));
    let delivery = Arc::new(AtomicBool::new(true));
    tokio::spawn(pump(
        local.clone(),
        remote.clone(),
        inbound,
        acks.clone(),
        delivery.clone(),
    ));
    Arc::new(MemoryLink {
        remote: remote.clone(),
        session_boot: remote.boot_id(),
        outbound,
        throttle: Arc::new(throttle),
        acks,
        delivery,
    })
}

/// Deliver queued messages into the remote bus, driving packet callbacks
/// the way a real link would.
async fn pump(
    local: Arc<TestPeer>,
    remote: Arc<TestPeer>,
    mut inbound: mpsc::UnboundedReceiver<Queued>,
    acks: Arc<AtomicBool>,
    delivery: Arc<AtomicBool>,
) {
    while let Some((msg, callback)) = inbound.recv().await {
        if !delivery.load(Ordering::SeqCst) {
            continue;
        }
        if !remote.is_connected() {
            if let Some(cb) = &callback {
                cb.disconnected();
            }
            continue;
        }
        if let Some(cb) = &callback {
            cb.sent();
        }
        remote
            .bus
            .dispatch(msg.received_from(local.id(), local.boot_id()));
        if acks.load(Ordering::SeqCst) {
            if let Some(cb) = callback {
                cb.acknowledged();
            }
        }
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn peer_id(&self) -> PeerId {
        self.remote.id()
    }

    fn boot_id(&self) -> u64 {
        self.remote.boot_id()
    }

    fn is_connected(&self) -> bool {
        self.remote.is_connected()
    }

    fn message_overhead(&self) -> usize {
        64
    }

    fn send_async(
        &self,
        msg: Message,
        callback: Option<Arc<dyn PacketCallback>>,
        ctr: &dyn ByteCounter,
    ) -> Result<(), SendError> {
        if !self.remote.is_connected() {
            return Err(SendError::NotConnected);
        }
        ctr.sent_bytes(self.message_overhead());
        self.outbound
            .send((msg, callback))
            .map_err(|_| SendError::NotConnected)
    }

    async fn send_throttled(
        &self,
        msg: Message,
        size: usize,
        ctr: &dyn ByteCounter,
        limit: Duration,
        tag: Arc<dyn PacketCallback>,
    ) -> Result<(), SendError> {
        if !self.remote.is_connected() {
            return Err(SendError::NotConnected);
        }
        if self.remote.boot_id() != self.session_boot {
            return Err(SendError::PeerRestarted);
        }
        self.throttle
            .acquire(size, limit)
            .await
            .map_err(|_| SendError::WaitedTooLong)?;
        // Re-check after the wait: the peer may have gone while we were
        // queued behind the throttle.
        if !self.remote.is_connected() {
            return Err(SendError::NotConnected);
        }
        if self.remote.boot_id() != self.session_boot {
            return Err(SendError::PeerRestarted);
        }
        ctr.sent_bytes(size);
        self.outbound
            .send((msg, Some(tag)))
            .map_err(|_| SendError::NotConnected)
    }
}
