//! Bulk transmitter — drives every block of a shared buffer to one peer.
//!
//! Designed for payloads much bigger than a single block, where the sender
//! usually holds the whole payload at the outset but may also stream blocks
//! in as they arrive. Transfers do not survive a restart of either side.
//!
//! The transmitter subscribes to its buffer for new blocks, registers two
//! control filters on the bus (remote abort, remote completion), and then
//! `send` loops: pick the first unsent present block, push it through the
//! peer's throttled send, repeat. When nothing is sendable it parks on its
//! own wakeup, re-checking terminal conditions at least once a minute.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bitvec::prelude::{bitvec, BitVec};
use tokio::sync::Notify;
use tokio::time::Instant;

use cairn_core::{proto, Message, MessageError};
use cairn_comm::bus::MessageBus;
use cairn_comm::filter::{FilterCallback, MessageFilter};
use cairn_comm::peer::{PacketCallback, PeerLink, SendError};
use cairn_comm::throttle::ByteCounter;

use crate::prb::{BulkSubscriber, PartiallyReceivedBulk};
use crate::receive::RECEIVE_TIMEOUT;

/// If no packet is sent in this period and neither a completion nor a
/// cancellation arrives, the transfer is presumed dead.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long to keep listening for a late completion ack after finishing.
pub const FINAL_ACK_GRACE: Duration = Duration::from_secs(10);

/// Upper bound on one park in the send loop; terminal conditions are
/// re-checked at least this often.
const IDLE_POLL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The peer was already gone when the transmitter registered its
    /// control filters.
    #[error("peer disconnected")]
    Disconnected,

    #[error(transparent)]
    Filter(#[from] MessageError),
}

struct XmitState {
    /// 1 = block present in the buffer but not yet submitted to the link.
    unsent: BitVec,
    /// Packets submitted to the link and not yet acknowledged.
    in_flight: u32,
    failed_packet: bool,
    cancelled: bool,
    finished: bool,
    finish_time: Option<Instant>,
    sent_cancel: bool,
    cancel_reason: Option<String>,
}

pub struct BulkTransmitter {
    prb: Arc<PartiallyReceivedBulk>,
    peer: Arc<dyn PeerLink>,
    uid: u64,
    /// Peer boot id at construction; a mismatch later means the peer
    /// restarted and the transfer is void.
    peer_boot_id: u64,
    packet_size: usize,
    no_wait: bool,
    ctr: Arc<dyn ByteCounter>,
    sub_id: OnceLock<u64>,
    state: Mutex<XmitState>,
    wakeup: Notify,
}

impl std::fmt::Debug for BulkTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkTransmitter")
            .field("uid", &self.uid)
            .field("peer_boot_id", &self.peer_boot_id)
            .field("packet_size", &self.packet_size)
            .field("no_wait", &self.no_wait)
            .finish()
    }
}

impl BulkTransmitter {
    /// Bind a transmitter to `(prb, peer, uid)` and register its control
    /// filters. Fails with `Disconnected` if the peer is already gone; in
    /// that case nothing stays subscribed or registered.
    pub fn new(
        prb: Arc<PartiallyReceivedBulk>,
        peer: Arc<dyn PeerLink>,
        uid: u64,
        no_wait: bool,
        ctr: Arc<dyn ByteCounter>,
        bus: &MessageBus,
    ) -> Result<Arc<Self>, TransferError> {
        let packet_size =
            proto::bulk_packet_wire_size(prb.block_size()) + peer.message_overhead();
        let me = Arc::new(Self {
            peer_boot_id: peer.boot_id(),
            packet_size,
            uid,
            no_wait,
            ctr,
            sub_id: OnceLock::new(),
            state: Mutex::new(XmitState {
                unsent: bitvec![0; prb.block_count()],
                in_flight: 0,
                failed_packet: false,
                cancelled: false,
                finished: false,
                finish_time: None,
                sent_cancel: false,
                cancel_reason: None,
            }),
            wakeup: Notify::new(),
            prb: prb.clone(),
            peer: peer.clone(),
        });

        // Snapshot and subscribe under one buffer lock, then fold the
        // snapshot in. A block fanned out in between only sets a bit that
        // the snapshot sets too.
        let (sub_id, snapshot) =
            prb.subscribe_with_snapshot(Arc::downgrade(&me) as Weak<dyn BulkSubscriber>);
        let _ = me.sub_id.set(sub_id);
        {
            let mut state = me.state.lock().expect("transmitter lock poisoned");
            for block in snapshot.iter_ones() {
                state.unsent.set(block, true);
            }
        }

        let abort_filter = Arc::new(
            MessageFilter::new()
                .set_type(&proto::BULK_RECEIVE_ABORTED)
                .set_source(peer.clone())
                .set_field(proto::UID, uid as i64)?
                .set_no_timeout()
                .set_callback(Arc::new(RemoteAbort {
                    xmit: Arc::downgrade(&me),
                })),
        );
        let completion_filter = Arc::new(
            MessageFilter::new()
                .set_type(&proto::BULK_RECEIVED_ALL)
                .set_source(peer)
                .set_field(proto::UID, uid as i64)?
                .set_no_timeout()
                .set_callback(Arc::new(CompletionAck {
                    xmit: Arc::downgrade(&me),
                })),
        );
        for filter in [abort_filter, completion_filter] {
            if bus.add_async_filter(filter).is_err() {
                me.cancel("disconnected");
                return Err(TransferError::Disconnected);
            }
        }
        Ok(me)
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    // ── Send loop ────────────────────────────────────────────────────────────

    /// Send the payload. Returns true once the receiver acknowledged the
    /// whole file (or, with `no_wait`, once everything was submitted),
    /// false on any abort, disconnect, or timeout.
    pub async fn send(self: &Arc<Self>) -> bool {
        let mut last_sent = Instant::now();
        loop {
            if self.prb.is_aborted() {
                tracing::debug!(uid = self.uid, "bulk buffer aborted, giving up");
                self.detach();
                return false;
            }
            if self.peer.boot_id() != self.peer_boot_id {
                tracing::debug!(
                    uid = self.uid,
                    peer = self.peer.short_id(),
                    "peer restarted, cancelling"
                );
                self.cancel("peer restarted");
                return false;
            }

            let next = {
                let state = self.state.lock().expect("transmitter lock poisoned");
                if state.finished {
                    return true;
                }
                if state.cancelled {
                    return false;
                }
                state.unsent.first_one()
            };

            let Some(block_no) = next else {
                if self.no_wait && self.prb.has_whole_file() {
                    self.completed();
                    return true;
                }
                // Park until a new block, an ack, or a terminal signal.
                // The wakeup future is armed before the re-check so a
                // concurrent notify cannot be lost.
                let wakeup = self.wakeup.notified();
                let (failed, in_flight, ready) = {
                    let state = self.state.lock().expect("transmitter lock poisoned");
                    (
                        state.failed_packet,
                        state.in_flight,
                        state.unsent.first_one().is_some(),
                    )
                };
                if failed {
                    self.cancel("packet send failed");
                    return false;
                }
                if ready {
                    continue;
                }
                if last_sent.elapsed() > IDLE_TIMEOUT {
                    tracing::error!(
                        uid = self.uid,
                        peer = self.peer.short_id(),
                        "bulk send made no progress, giving up"
                    );
                    self.cancel("idle timeout");
                    return false;
                }
                tracing::trace!(
                    uid = self.uid,
                    in_flight,
                    "waiting for blocks, acks, or completion"
                );
                let _ = tokio::time::timeout(IDLE_POLL, wakeup).await;
                continue;
            };

            let block_no = block_no as u32;
            let Some(data) = self.prb.block_data(block_no) else {
                tracing::debug!(
                    uid = self.uid,
                    block = block_no,
                    "block withdrawn, transfer aborted"
                );
                self.detach();
                return false;
            };

            let tag = UnsentPacketTag::register(self);
            match self
                .peer
                .send_throttled(
                    proto::bulk_packet_send(self.uid, block_no, data),
                    self.packet_size,
                    self.ctr.as_ref(),
                    RECEIVE_TIMEOUT,
                    tag,
                )
                .await
            {
                Ok(()) => {
                    self.state
                        .lock()
                        .expect("transmitter lock poisoned")
                        .unsent
                        .set(block_no as usize, false);
                    last_sent = Instant::now();
                    tracing::trace!(uid = self.uid, block = block_no, "block submitted");
                }
                Err(SendError::NotConnected) => {
                    self.cancel("disconnected");
                    return false;
                }
                Err(SendError::PeerRestarted) => {
                    self.cancel("peer restarted");
                    return false;
                }
                Err(err @ (SendError::WaitedTooLong | SendError::SyncSendWaitedTooLong)) => {
                    // The link is stuck; an abort message would only queue
                    // behind the same congestion.
                    tracing::error!(
                        uid = self.uid,
                        block = block_no,
                        error = %err,
                        "throttle admission failed, giving up"
                    );
                    self.fail_quiet("throttle stalled");
                    return false;
                }
            }
        }
    }

    // ── Terminal transitions ─────────────────────────────────────────────────

    /// Abort the transfer: tell the peer once (best-effort), mark
    /// cancelled, wake the send loop, and detach from the buffer. Safe to
    /// call any number of times from any task. A completed transfer stays
    /// completed.
    pub fn cancel(&self, reason: &str) {
        {
            let state = self.state.lock().expect("transmitter lock poisoned");
            if state.finished {
                return;
            }
        }
        tracing::debug!(
            uid = self.uid,
            peer = self.peer.short_id(),
            reason,
            "cancelling bulk send"
        );
        self.send_aborted_message();
        self.fail_quiet(reason);
    }

    /// The receiver says it has everything; believe it, even if some
    /// blocks were never sent from here.
    pub fn completed(&self) {
        {
            let mut state = self.state.lock().expect("transmitter lock poisoned");
            if state.finished || state.cancelled {
                return;
            }
            state.finished = true;
            state.finish_time = Some(Instant::now());
        }
        tracing::debug!(uid = self.uid, "bulk send acknowledged complete");
        self.wakeup.notify_waiters();
        self.detach();
    }

    /// Mark cancelled without telling the peer.
    fn fail_quiet(&self, reason: &str) {
        {
            let mut state = self.state.lock().expect("transmitter lock poisoned");
            state.cancelled = true;
            if state.cancel_reason.is_none() {
                state.cancel_reason = Some(reason.to_string());
            }
        }
        self.wakeup.notify_waiters();
        self.detach();
    }

    /// At-most-once notification to the peer that this side gave up.
    fn send_aborted_message(&self) {
        {
            let mut state = self.state.lock().expect("transmitter lock poisoned");
            if state.sent_cancel {
                return;
            }
            state.sent_cancel = true;
        }
        // Best-effort: a dead link means the peer no longer cares.
        let _ = self
            .peer
            .send_async(proto::bulk_send_aborted(self.uid), None, self.ctr.as_ref());
    }

    fn detach(&self) {
        if let Some(id) = self.sub_id.get() {
            self.prb.unsubscribe(*id);
        }
    }

    // ── Observers ────────────────────────────────────────────────────────────

    pub fn is_finished(&self) -> bool {
        self.state.lock().expect("transmitter lock poisoned").finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().expect("transmitter lock poisoned").cancelled
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.state
            .lock()
            .expect("transmitter lock poisoned")
            .cancel_reason
            .clone()
    }
}

impl BulkSubscriber for BulkTransmitter {
    // Called with the buffer lock held: flip one bit, wake the loop.
    fn on_block_received(&self, block: u32) {
        self.state
            .lock()
            .expect("transmitter lock poisoned")
            .unsent
            .set(block as usize, true);
        self.wakeup.notify_waiters();
    }

    fn on_aborted(&self) {
        self.send_aborted_message();
        self.wakeup.notify_waiters();
    }
}

// ── Packet accounting ────────────────────────────────────────────────────────

/// Follows one submitted packet through the link queue. An ack retires it;
/// a failure flags the transmitter, which exits through `cancel` on its
/// next wakeup.
struct UnsentPacketTag {
    xmit: Weak<BulkTransmitter>,
    done: AtomicBool,
}

impl UnsentPacketTag {
    fn register(xmit: &Arc<BulkTransmitter>) -> Arc<dyn PacketCallback> {
        xmit.state
            .lock()
            .expect("transmitter lock poisoned")
            .in_flight += 1;
        Arc::new(Self {
            xmit: Arc::downgrade(xmit),
            done: AtomicBool::new(false),
        })
    }

    fn complete(&self, failed: bool) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(xmit) = self.xmit.upgrade() else {
            return;
        };
        {
            let mut state = xmit.state.lock().expect("transmitter lock poisoned");
            if failed {
                state.failed_packet = true;
            } else {
                state.in_flight = state.in_flight.saturating_sub(1);
            }
        }
        xmit.wakeup.notify_waiters();
    }
}

impl PacketCallback for UnsentPacketTag {
    fn sent(&self) {
        // Informational; the ack is what retires the packet.
    }

    fn acknowledged(&self) {
        self.complete(false);
    }

    fn disconnected(&self) {
        self.complete(true);
    }

    fn fatal_error(&self) {
        self.complete(true);
    }
}

// ── Control filters ──────────────────────────────────────────────────────────

/// The receiver gave up: cancel the transfer.
struct RemoteAbort {
    xmit: Weak<BulkTransmitter>,
}

impl FilterCallback for RemoteAbort {
    fn on_matched(&self, _msg: Message) {
        if let Some(xmit) = self.xmit.upgrade() {
            xmit.cancel("remote abort");
        }
    }

    fn should_timeout(&self) -> bool {
        let Some(xmit) = self.xmit.upgrade() else {
            return true;
        };
        {
            let state = xmit.state.lock().expect("transmitter lock poisoned");
            if state.cancelled || state.finished {
                return true;
            }
        }
        xmit.prb.is_aborted()
    }
}

/// The receiver has the whole file: finish the transfer. The filter stays
/// for a grace period after completion to absorb a duplicated ack.
struct CompletionAck {
    xmit: Weak<BulkTransmitter>,
}

impl FilterCallback for CompletionAck {
    fn on_matched(&self, _msg: Message) {
        if let Some(xmit) = self.xmit.upgrade() {
            xmit.completed();
        }
    }

    fn should_timeout(&self) -> bool {
        let Some(xmit) = self.xmit.upgrade() else {
            return true;
        };
        {
            let state = xmit.state.lock().expect("transmitter lock poisoned");
            if state.cancelled {
                return true;
            }
            if state.finished {
                return state
                    .finish_time
                    .is_some_and(|at| at.elapsed() > FINAL_ACK_GRACE);
            }
        }
        xmit.prb.is_aborted()
    }
}
