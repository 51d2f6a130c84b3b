//! cairn-xfer — bulk transfer of multi-block payloads between peers.
//!
//! A transfer moves the contents of one `PartiallyReceivedBulk` buffer to
//! a single peer: the `BulkTransmitter` pushes block packets through the
//! peer link under flow control, the `BulkReceiver` fills its own buffer
//! and acknowledges the whole file. Control messages ride the dispatch bus
//! from `cairn-comm`.

pub mod prb;
pub mod receive;
pub mod send;

pub use prb::{BulkSubscriber, PartiallyReceivedBulk};
pub use receive::{BulkReceiver, RECEIVE_TIMEOUT};
pub use send::{BulkTransmitter, TransferError, FINAL_ACK_GRACE, IDLE_TIMEOUT};
