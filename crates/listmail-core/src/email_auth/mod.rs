//! Email Authentication Module
//!
//! DKIM-Signature tag parsing plus the oracle that tells whether the
//! receiving MTA verified a message's signature. No cryptography happens
//! here.

pub mod dkim;

pub use dkim::{AuthResultsVerifier, DkimResult, DkimSignature, DkimVerifier};
