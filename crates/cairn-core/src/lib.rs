//! cairn-core — message model and transfer protocol definitions.
//! All other cairn crates depend on this one.

pub mod message;
pub mod proto;

pub use message::{short_id, Message, MessageError, MessageType, PeerId, ScalarType, Value};
