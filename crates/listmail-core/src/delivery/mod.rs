//! Delivery Module
//!
//! Hands messages to the outbound MTA and builds bounces.

mod dispatcher;
mod transport;

pub use dispatcher::DeliveryDispatcher;
pub(crate) use dispatcher::{mailbox, message_id};
pub use transport::{MemoryTransport, SentMessage, SmtpRelay, Transport};
