//! Listmail Core - per-message mailing list delivery
//!
//! This crate resolves the list a message is addressed to, authorizes the
//! sender, applies subscribe/unsubscribe commands, rewrites the list
//! headers and fans the message out. Failures end in a bounce to the
//! sender, a report to the administrator, or both.

pub mod address;
pub mod agent;
pub mod delivery;
pub mod email_auth;
pub mod message;
pub mod policy;
pub mod report;

pub use address::{AddressResolver, ListAddress};
pub use agent::{DeliveryAgent, Invocation, Outcome, ReturnPath, EX_CONFIG, EX_TEMPFAIL};
pub use delivery::{DeliveryDispatcher, MemoryTransport, SentMessage, SmtpRelay, Transport};
pub use email_auth::{AuthResultsVerifier, DkimResult, DkimSignature, DkimVerifier};
pub use message::InboundMessage;
pub use policy::{Decision, ListPolicyEngine};
pub use report::{ErrorReporter, ReportContext};
