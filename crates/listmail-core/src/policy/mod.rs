//! List Policy Module
//!
//! Decides what happens to a message addressed to a list: a membership
//! change, distribution to the members, or a rejection.

mod engine;
mod headers;

pub use engine::{Decision, ListPolicyEngine};
pub use headers::{check_signed_headers, rewrite_list_headers, MUNGED_HEADERS};
