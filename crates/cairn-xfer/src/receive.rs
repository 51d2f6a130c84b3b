//! Bulk receiver — fills a shared buffer from incoming block packets.
//!
//! One wait per packet: a filter for the transfer's data packets, chained
//! with an alternative for the sender's abort, both bounded by the
//! per-packet timeout. Blocks are validated before they touch the buffer;
//! duplicates are dropped by the buffer itself, so out-of-order and
//! multi-path arrival are harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cairn_comm::bus::{MessageBus, WaitError};
use cairn_comm::filter::MessageFilter;
use cairn_comm::peer::PeerLink;
use cairn_comm::throttle::ByteCounter;

use cairn_core::{proto, MessageError};

use crate::prb::PartiallyReceivedBulk;

/// How long to wait for each packet before presuming the sender dead.
/// Also the bound the sender applies to one throttled submission.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct BulkReceiver {
    prb: Arc<PartiallyReceivedBulk>,
    peer: Arc<dyn PeerLink>,
    bus: Arc<MessageBus>,
    uid: u64,
    ctr: Arc<dyn ByteCounter>,
    sent_abort: AtomicBool,
}

impl BulkReceiver {
    pub fn new(
        prb: Arc<PartiallyReceivedBulk>,
        peer: Arc<dyn PeerLink>,
        uid: u64,
        ctr: Arc<dyn ByteCounter>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            prb,
            peer,
            bus,
            uid,
            ctr,
            sent_abort: AtomicBool::new(false),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Receive until the buffer is whole. Returns true once the completion
    /// ack went out, false on abort, timeout, or a lost peer. After this
    /// returns, no filters remain and stray packets for the uid fall on
    /// the floor.
    pub async fn receive(&self) -> bool {
        loop {
            if self.prb.is_aborted() {
                self.send_abort_once();
                return false;
            }
            if self.prb.has_whole_file() {
                tracing::debug!(
                    uid = self.uid,
                    blocks = self.prb.block_count(),
                    "bulk receive complete"
                );
                // Best-effort: the payload is intact either way.
                let _ = self.peer.send_async(
                    proto::bulk_received_all(self.uid),
                    None,
                    self.ctr.as_ref(),
                );
                return true;
            }

            let filter = match self.packet_filter() {
                Ok(filter) => filter,
                Err(err) => {
                    tracing::error!(uid = self.uid, error = %err, "bad packet filter");
                    self.abort("internal error");
                    return false;
                }
            };
            match self.bus.wait_for(filter).await {
                Ok(msg) if msg.is(&proto::BULK_PACKET_SEND) => {
                    let (Some(block), Some(data)) = (
                        msg.u32_field(proto::BLOCK_NO),
                        msg.bytes_field(proto::DATA),
                    ) else {
                        self.abort("malformed block packet");
                        return false;
                    };
                    if block as usize >= self.prb.block_count()
                        || data.len() != self.prb.block_len(block)
                    {
                        tracing::warn!(
                            uid = self.uid,
                            block,
                            len = data.len(),
                            "block fails validation, aborting"
                        );
                        self.abort("bad block");
                        return false;
                    }
                    self.ctr.received_bytes(data.len());
                    self.prb.block_received(block, data);
                }
                Ok(_) => {
                    // The sender gave up; no point echoing an abort back.
                    tracing::debug!(uid = self.uid, "sender aborted transfer");
                    self.prb.abort("sender aborted");
                    return false;
                }
                Err(WaitError::Timeout) => {
                    tracing::error!(
                        uid = self.uid,
                        received = self.prb.received_count(),
                        "timed out waiting for a block"
                    );
                    self.abort("receive timeout");
                    return false;
                }
                Err(_) => {
                    // Disconnect or restart: the link is gone, so only the
                    // buffer needs to hear about it.
                    tracing::debug!(uid = self.uid, peer = self.peer.short_id(), "peer lost");
                    self.prb.abort("peer lost");
                    return false;
                }
            }
        }
    }

    /// Give up locally: tell the sender once and flip the buffer.
    pub fn abort(&self, reason: &str) {
        self.send_abort_once();
        self.prb.abort(reason);
    }

    fn send_abort_once(&self) {
        if self.sent_abort.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.peer.send_async(
            proto::bulk_receive_aborted(self.uid),
            None,
            self.ctr.as_ref(),
        );
    }

    fn packet_filter(&self) -> Result<Arc<MessageFilter>, MessageError> {
        let aborted = MessageFilter::new()
            .set_type(&proto::BULK_SEND_ABORTED)
            .set_source(self.peer.clone())
            .set_field(proto::UID, self.uid as i64)?
            .set_timeout(RECEIVE_TIMEOUT);
        Ok(Arc::new(
            MessageFilter::new()
                .set_type(&proto::BULK_PACKET_SEND)
                .set_source(self.peer.clone())
                .set_field(proto::UID, self.uid as i64)?
                .set_timeout(RECEIVE_TIMEOUT)
                .or(aborted),
        ))
    }
}
