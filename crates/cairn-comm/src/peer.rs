//! Peer link seam — the connection abstraction the dispatch and transfer
//! layers are written against.
//!
//! A `PeerLink` hands whole application messages to one peer and reports
//! their fate through a `PacketCallback`. Framing, encryption, and
//! congestion control live below this trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cairn_core::{short_id, Message, PeerId};

use crate::throttle::ByteCounter;

/// Delivery-progress callback for one enqueued packet.
///
/// Implementations must be short and must not call back into the link.
pub trait PacketCallback: Send + Sync {
    /// The packet left the local queue. Informational.
    fn sent(&self) {}
    /// The peer acknowledged the packet.
    fn acknowledged(&self);
    /// The link dropped before the packet was acknowledged.
    fn disconnected(&self);
    /// The link failed permanently while the packet was queued.
    fn fatal_error(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("peer not connected")]
    NotConnected,

    #[error("peer restarted")]
    PeerRestarted,

    #[error("waited too long for throttle admission")]
    WaitedTooLong,

    #[error("synchronous send waited too long")]
    SyncSendWaitedTooLong,
}

/// One established connection to a peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn peer_id(&self) -> PeerId;

    /// Changes exactly when the peer restarts. A mismatch against a
    /// snapshot taken earlier means the connection's state is gone.
    fn boot_id(&self) -> u64;

    fn is_connected(&self) -> bool;

    fn short_id(&self) -> String {
        short_id(&self.peer_id())
    }

    /// Fixed per-message header overhead on this link, for packet size
    /// budgeting.
    fn message_overhead(&self) -> usize;

    /// Enqueue a message without waiting for admission.
    fn send_async(
        &self,
        msg: Message,
        callback: Option<Arc<dyn PacketCallback>>,
        ctr: &dyn ByteCounter,
    ) -> Result<(), SendError>;

    /// Wait until the throttle admits `size` bytes, then enqueue. `tag`
    /// follows the packet through the queue.
    async fn send_throttled(
        &self,
        msg: Message,
        size: usize,
        ctr: &dyn ByteCounter,
        limit: Duration,
        tag: Arc<dyn PacketCallback>,
    ) -> Result<(), SendError>;
}
