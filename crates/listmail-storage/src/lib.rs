//! Listmail Storage - Subscriber database
//!
//! This crate persists the mapping from list name to list record in a
//! single JSON file shared by every delivery agent invocation on a host.
//! Membership changes go through locked transactions; posting reads an
//! unlocked snapshot.

pub mod lock;
pub mod models;
pub mod store;

pub use lock::FileLock;
pub use models::{MailingList, SubscriberDatabase};
pub use store::{SubscriberStore, Transaction};
