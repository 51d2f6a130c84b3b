//! Bulk-transfer protocol messages.
//!
//! Four message types drive one directional transfer, identified end to end
//! by a 64-bit uid: the sender streams `bulk_packet_send` blocks; the
//! receiver answers with `bulk_received_all` once its buffer is complete, or
//! `bulk_receive_aborted` if it gives up; the sender announces its own
//! surrender with `bulk_send_aborted`.

use bytes::Bytes;

use crate::message::{Message, MessageType, ScalarType, Value};

/// Transfer identifier field. Unique across both peers for the lifetime of
/// the transfer. Carried as an i64 scalar; interpreted unsigned.
pub const UID: &str = "uid";
/// Zero-based block index within the transfer.
pub const BLOCK_NO: &str = "block_no";
/// One block of payload.
pub const DATA: &str = "data";

pub static BULK_PACKET_SEND: MessageType = MessageType::new(
    "bulk_packet_send",
    &[
        (UID, ScalarType::I64),
        (BLOCK_NO, ScalarType::I32),
        (DATA, ScalarType::Bytes),
    ],
);

pub static BULK_RECEIVED_ALL: MessageType =
    MessageType::new("bulk_received_all", &[(UID, ScalarType::I64)]);

pub static BULK_RECEIVE_ABORTED: MessageType =
    MessageType::new("bulk_receive_aborted", &[(UID, ScalarType::I64)]);

pub static BULK_SEND_ABORTED: MessageType =
    MessageType::new("bulk_send_aborted", &[(UID, ScalarType::I64)]);

/// Resolve a transfer message type by wire name.
pub fn by_name(name: &str) -> Option<&'static MessageType> {
    match name {
        "bulk_packet_send" => Some(&BULK_PACKET_SEND),
        "bulk_received_all" => Some(&BULK_RECEIVED_ALL),
        "bulk_receive_aborted" => Some(&BULK_RECEIVE_ABORTED),
        "bulk_send_aborted" => Some(&BULK_SEND_ABORTED),
        _ => None,
    }
}

/// Decode a transfer message from its wire form.
pub fn from_wire(raw: &[u8]) -> Result<Message, crate::message::MessageError> {
    Message::from_wire(raw, by_name)
}

pub fn bulk_packet_send(uid: u64, block_no: u32, data: Bytes) -> Message {
    Message::new(&BULK_PACKET_SEND)
        .push(UID, Value::I64(uid as i64))
        .push(BLOCK_NO, Value::I32(block_no as i32))
        .push(DATA, Value::Bytes(data))
}

pub fn bulk_received_all(uid: u64) -> Message {
    Message::new(&BULK_RECEIVED_ALL).push(UID, Value::I64(uid as i64))
}

pub fn bulk_receive_aborted(uid: u64) -> Message {
    Message::new(&BULK_RECEIVE_ABORTED).push(UID, Value::I64(uid as i64))
}

pub fn bulk_send_aborted(uid: u64) -> Message {
    Message::new(&BULK_SEND_ABORTED).push(UID, Value::I64(uid as i64))
}

/// Wire size of a `bulk_packet_send` carrying one block of `block_size`
/// bytes, excluding the link's per-message header.
pub fn bulk_packet_wire_size(block_size: usize) -> usize {
    // uid + block index + the block itself
    block_size + 8 + 4
}

/// A fresh transfer uid.
pub fn new_uid() -> u64 {
    rand::random()
}
