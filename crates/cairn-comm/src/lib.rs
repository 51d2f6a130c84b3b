//! cairn-comm — peer links, message filters, and the dispatch bus.
//!
//! The dispatch layer sits between the packet transport (behind the
//! `PeerLink` trait) and request handlers. Handlers describe the messages
//! they are waiting for as `MessageFilter`s; the `MessageBus` matches each
//! incoming message against the registered filters and delivers it to the
//! winning filter's sink — a blocking waiter or an async callback.

pub mod bus;
pub mod config;
pub mod filter;
pub mod peer;
pub mod testing;
pub mod throttle;

pub use bus::{MessageBus, RegisterError, WaitError};
pub use config::CommConfig;
pub use filter::{FilterCallback, MessageFilter};
pub use peer::{PacketCallback, PeerLink, SendError};
pub use throttle::{BandwidthThrottle, ByteCounter, TallyCounter, ThrottleError};
