//! End-to-end bulk transfer scenarios over the in-memory test network.
//!
//! Each test wires two peers together with `cairn_comm::testing`, runs a
//! real transmitter against a real receiver, and injects the failure it is
//! about to assert: restarts, remote aborts, lost acknowledgements, dead
//! air. Timeout-driven scenarios run under tokio's paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use rand::RngCore;

use cairn_comm::bus::MessageBus;
use cairn_comm::filter::{FilterCallback, MessageFilter};
use cairn_comm::peer::PeerLink;
use cairn_comm::testing::{connect, MemoryLink, TestPeer};
use cairn_comm::throttle::TallyCounter;
use cairn_core::{proto, Message, MessageType};
use cairn_xfer::{BulkReceiver, BulkTransmitter, PartiallyReceivedBulk};

// ── Harness ──────────────────────────────────────────────────────────────────

struct Net {
    a: Arc<TestPeer>,
    b: Arc<TestPeer>,
    a_to_b: Arc<MemoryLink>,
    b_to_a: Arc<MemoryLink>,
}

fn net() -> Net {
    let a = TestPeer::new(1);
    let b = TestPeer::new(2);
    let (a_to_b, b_to_a) = connect(&a, &b);
    Net { a, b, a_to_b, b_to_a }
}

struct Tally {
    hits: Arc<AtomicUsize>,
}

impl FilterCallback for Tally {
    fn on_matched(&self, _msg: Message) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Count claims of `mtype` on a bus. Two one-shot filters are registered,
/// so an erroneous second emission is counted as well.
fn tally(bus: &MessageBus, mtype: &'static MessageType) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        bus.add_async_filter(Arc::new(
            MessageFilter::new()
                .set_type(mtype)
                .set_no_timeout()
                .set_callback(Arc::new(Tally { hits: hits.clone() })),
        ))
        .expect("tally filter registration");
    }
    hits
}

fn random_payload(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Bytes::from(data)
}

/// Run one full transfer of `payload` from peer a to peer b.
async fn transfer(payload: Bytes, block_size: usize) -> Result<(bool, bool, Bytes)> {
    let net = net();
    let uid = proto::new_uid();

    let send_prb = Arc::new(PartiallyReceivedBulk::from_bytes(payload.clone(), block_size));
    let recv_prb = Arc::new(PartiallyReceivedBulk::empty(
        payload.len() as u64,
        block_size,
    ));

    let xmit = BulkTransmitter::new(
        send_prb,
        net.a_to_b.clone() as Arc<dyn PeerLink>,
        uid,
        false,
        Arc::new(TallyCounter::new()),
        &net.a.bus,
    )?;
    let receiver = Arc::new(BulkReceiver::new(
        recv_prb.clone(),
        net.b_to_a.clone() as Arc<dyn PeerLink>,
        uid,
        Arc::new(TallyCounter::new()),
        net.b.bus.clone(),
    ));

    let recv_task = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sent = xmit.send().await;
    let received = recv_task.await?;
    let body = recv_prb.whole_file().unwrap_or_default();
    Ok((sent, received, body))
}

// ── Round trips ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_three_blocks() -> Result<()> {
    let net = net();
    let uid = proto::new_uid();
    let payload = Bytes::from_static(b"aaaabbbbcccc");

    // No tally on bulk_received_all: the transmitter's own filter must be
    // the one that claims the ack.
    let send_aborts = tally(&net.b.bus, &proto::BULK_SEND_ABORTED);

    let send_prb = Arc::new(PartiallyReceivedBulk::from_bytes(payload.clone(), 4));
    let recv_prb = Arc::new(PartiallyReceivedBulk::empty(12, 4));

    let xmit = BulkTransmitter::new(
        send_prb,
        net.a_to_b.clone() as Arc<dyn PeerLink>,
        uid,
        false,
        Arc::new(TallyCounter::new()),
        &net.a.bus,
    )?;
    let receiver = Arc::new(BulkReceiver::new(
        recv_prb.clone(),
        net.b_to_a.clone() as Arc<dyn PeerLink>,
        uid,
        Arc::new(TallyCounter::new()),
        net.b.bus.clone(),
    ));

    let recv_task = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(xmit.send().await, "send reports success");
    assert!(recv_task.await?, "receive reports success");
    assert!(xmit.is_finished());
    assert_eq!(recv_prb.whole_file().unwrap(), payload);
    assert_eq!(
        send_aborts.load(Ordering::SeqCst),
        0,
        "a clean transfer never aborts"
    );
    Ok(())
}

#[tokio::test]
async fn payload_survives_byte_for_byte() -> Result<()> {
    let payload = random_payload(80_000);
    let (sent, received, body) = transfer(payload.clone(), 32 * 1024).await?;
    assert!(sent);
    assert!(received);
    assert_eq!(body, payload, "three blocks, the last one short");
    Ok(())
}

#[tokio::test]
async fn single_block_payload() -> Result<()> {
    let payload = Bytes::from_static(b"just one block");
    let (sent, received, body) = transfer(payload.clone(), 32 * 1024).await?;
    assert!(sent && received);
    assert_eq!(body, payload);
    Ok(())
}

#[tokio::test]
async fn one_byte_blocks() -> Result<()> {
    let payload = Bytes::from_static(b"abc");
    let (sent, received, body) = transfer(payload.clone(), 1).await?;
    assert!(sent && received);
    assert_eq!(body, payload);
    Ok(())
}

#[tokio::test]
async fn empty_payload_acknowledged() -> Result<()> {
    let (sent, received, body) = transfer(Bytes::new(), 4096).await?;
    assert!(sent, "nothing to send still completes");
    assert!(received);
    assert!(body.is_empty());
    Ok(())
}

// ── Streamed arrival ─────────────────────────────────────────────────────────

#[tokio::test]
async fn blocks_streamed_into_the_sender() -> Result<()> {
    let net = net();
    let uid = proto::new_uid();

    // The sender holds only block 0 at construction; 1 and 2 arrive later.
    let send_prb = Arc::new(PartiallyReceivedBulk::empty(12, 4));
    send_prb.block_received(0, b"aaaa");
    let recv_prb = Arc::new(PartiallyReceivedBulk::empty(12, 4));

    let xmit = BulkTransmitter::new(
        send_prb.clone(),
        net.a_to_b.clone() as Arc<dyn PeerLink>,
        uid,
        false,
        Arc::new(TallyCounter::new()),
        &net.a.bus,
    )?;
    let receiver = Arc::new(BulkReceiver::new(
        recv_prb.clone(),
        net.b_to_a.clone() as Arc<dyn PeerLink>,
        uid,
        Arc::new(TallyCounter::new()),
        net.b.bus.clone(),
    ));

    let recv_task = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.receive().await })
    };
    let feeder = {
        let send_prb = send_prb.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            send_prb.block_received(1, b"bbbb");
            tokio::time::sleep(Duration::from_millis(100)).await;
            send_prb.block_received(2, b"cccc");
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(xmit.send().await);
    assert!(recv_task.await?);
    feeder.await?;
    assert_eq!(recv_prb.whole_file().unwrap().as_ref(), b"aaaabbbbcccc");
    Ok(())
}

// ── Failure injection ────────────────────────────────────────────────────────

#[tokio::test]
async fn peer_restart_cancels_the_transfer() -> Result<()> {
    let net = net();
    let uid = proto::new_uid();
    let send_aborts = tally(&net.b.bus, &proto::BULK_SEND_ABORTED);

    // Block 1 is withheld so the loop is parked when the restart lands.
    let send_prb = Arc::new(PartiallyReceivedBulk::empty(8, 4));
    send_prb.block_received(0, b"aaaa");

    let xmit = BulkTransmitter::new(
        send_prb.clone(),
        net.a_to_b.clone() as Arc<dyn PeerLink>,
        uid,
        false,
        Arc::new(TallyCounter::new()),
        &net.a.bus,
    )?;
    let send_task = {
        let xmit = xmit.clone();
        tokio::spawn(async move { xmit.send().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    net.b.restart();
    send_prb.block_received(1, b"bbbb");

    assert!(!send_task.await?, "restart voids the transfer");
    assert!(xmit.is_cancelled());
    assert_eq!(xmit.cancel_reason().as_deref(), Some("peer restarted"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(send_aborts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn remote_abort_cancels_the_sender() -> Result<()> {
    let net = net();
    let uid = proto::new_uid();

    // Block 2 never exists, so neither side can finish on its own.
    let send_prb = Arc::new(PartiallyReceivedBulk::empty(12, 4));
    send_prb.block_received(0, b"aaaa");
    send_prb.block_received(1, b"bbbb");
    let recv_prb = Arc::new(PartiallyReceivedBulk::empty(12, 4));

    let xmit = BulkTransmitter::new(
        send_prb,
        net.a_to_b.clone() as Arc<dyn PeerLink>,
        uid,
        false,
        Arc::new(TallyCounter::new()),
        &net.a.bus,
    )?;
    let receiver = Arc::new(BulkReceiver::new(
        recv_prb.clone(),
        net.b_to_a.clone() as Arc<dyn PeerLink>,
        uid,
        Arc::new(TallyCounter::new()),
        net.b.bus.clone(),
    ));

    let recv_task = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.receive().await })
    };
    let send_task = {
        let xmit = xmit.clone();
        tokio::spawn(async move { xmit.send().await })
    };

    // Give up once both available blocks landed.
    while recv_prb.received_count() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    receiver.abort("had enough");

    assert!(!send_task.await?);
    assert!(!recv_task.await?);
    assert_eq!(xmit.cancel_reason().as_deref(), Some("remote abort"));
    assert!(recv_prb.is_aborted());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dead_receiver_times_out_the_sender() -> Result<()> {
    let net = net();
    let uid = proto::new_uid();
    let send_aborts = tally(&net.b.bus, &proto::BULK_SEND_ABORTED);

    // No receiver at all: the block is delivered and acked by the link,
    // but the completion ack never comes.
    let send_prb = Arc::new(PartiallyReceivedBulk::from_bytes(
        Bytes::from_static(b"orphaned"),
        4,
    ));
    let xmit = BulkTransmitter::new(
        send_prb,
        net.a_to_b.clone() as Arc<dyn PeerLink>,
        uid,
        false,
        Arc::new(TallyCounter::new()),
        &net.a.bus,
    )?;

    assert!(!xmit.send().await, "five silent minutes kill the transfer");
    assert!(xmit.is_cancelled());
    assert_eq!(xmit.cancel_reason().as_deref(), Some("idle timeout"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(send_aborts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lost_completion_ack_times_out_the_sender() -> Result<()> {
    let net = net();
    let uid = proto::new_uid();

    // Everything the receiver says back is lost in transit.
    net.b_to_a.drop_traffic();

    let payload = Bytes::from_static(b"going one way only");
    let send_prb = Arc::new(PartiallyReceivedBulk::from_bytes(payload.clone(), 4));
    let recv_prb = Arc::new(PartiallyReceivedBulk::empty(payload.len() as u64, 4));

    let xmit = BulkTransmitter::new(
        send_prb,
        net.a_to_b.clone() as Arc<dyn PeerLink>,
        uid,
        false,
        Arc::new(TallyCounter::new()),
        &net.a.bus,
    )?;
    let receiver = Arc::new(BulkReceiver::new(
        recv_prb.clone(),
        net.b_to_a.clone() as Arc<dyn PeerLink>,
        uid,
        Arc::new(TallyCounter::new()),
        net.b.bus.clone(),
    ));

    let recv_task = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!xmit.send().await, "the sender never hears the ack");
    assert_eq!(xmit.cancel_reason().as_deref(), Some("idle timeout"));
    assert!(recv_task.await?, "the receiver still has the whole file");
    assert_eq!(recv_prb.whole_file().unwrap(), payload);
    Ok(())
}

#[tokio::test]
async fn no_wait_sender_does_not_linger() -> Result<()> {
    let net = net();
    let uid = proto::new_uid();

    let payload = Bytes::from_static(b"fire and forget");
    let send_prb = Arc::new(PartiallyReceivedBulk::from_bytes(payload.clone(), 4));
    let recv_prb = Arc::new(PartiallyReceivedBulk::empty(payload.len() as u64, 4));

    let xmit = BulkTransmitter::new(
        send_prb,
        net.a_to_b.clone() as Arc<dyn PeerLink>,
        uid,
        true,
        Arc::new(TallyCounter::new()),
        &net.a.bus,
    )?;
    let receiver = Arc::new(BulkReceiver::new(
        recv_prb.clone(),
        net.b_to_a.clone() as Arc<dyn PeerLink>,
        uid,
        Arc::new(TallyCounter::new()),
        net.b.bus.clone(),
    ));
    let recv_task = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(xmit.send().await, "returns as soon as everything is submitted");
    assert!(xmit.is_finished());
    assert!(recv_task.await?);
    assert_eq!(recv_prb.whole_file().unwrap(), payload);
    Ok(())
}

#[tokio::test]
async fn stalled_throttle_fails_without_an_abort_message() -> Result<()> {
    let a = TestPeer::new(1);
    let b = TestPeer::new(2);
    // A tenth of a byte per second: no packet can ever be admitted inside
    // the per-packet wait limit.
    let a_to_b = cairn_comm::testing::link(
        &a,
        &b,
        cairn_comm::throttle::BandwidthThrottle::new(0.1, 1.0),
    );
    let _b_to_a = cairn_comm::testing::link(
        &b,
        &a,
        cairn_comm::throttle::BandwidthThrottle::unlimited(),
    );
    let send_aborts = tally(&b.bus, &proto::BULK_SEND_ABORTED);

    let send_prb = Arc::new(PartiallyReceivedBulk::from_bytes(
        Bytes::from_static(b"wedged"),
        4,
    ));
    let xmit = BulkTransmitter::new(
        send_prb.clone(),
        a_to_b as Arc<dyn PeerLink>,
        proto::new_uid(),
        false,
        Arc::new(TallyCounter::new()),
        &a.bus,
    )?;

    assert!(!xmit.send().await);
    assert!(xmit.is_cancelled());
    assert_eq!(xmit.cancel_reason().as_deref(), Some("throttle stalled"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        send_aborts.load(Ordering::SeqCst),
        0,
        "a stuck link gets no abort message"
    );
    assert_eq!(send_prb.subscriber_count(), 0);
    Ok(())
}
