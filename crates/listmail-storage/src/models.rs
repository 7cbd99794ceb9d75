//! List records stored in the subscriber database

use listmail_common::{normalize_address, AllowedSenders, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from lower-cased list name to its record
pub type SubscriberDatabase = BTreeMap<String, MailingList>;

/// A mailing list record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailingList {
    /// Human readable name used in List-ID
    pub shortname: String,

    /// Owner contact address
    pub owner: String,

    /// Posting policy, kept verbatim so an invalid value survives a commit
    pub allowed_senders: String,

    /// Nobody may reply to the list
    #[serde(default, alias = "announcements-only")]
    pub announcements_only: bool,

    /// Copy every post to the archiver
    #[serde(default)]
    pub archive: bool,

    /// Whether `list+subscribe@` is honoured
    #[serde(default)]
    pub self_subscribe_allowed: bool,

    /// Subscribed addresses, in subscription order
    #[serde(default)]
    pub members: Vec<String>,

    /// Addresses allowed to post to moderated lists
    #[serde(default)]
    pub moderators: Vec<String>,
}

impl MailingList {
    /// Create an empty list record
    pub fn new(
        shortname: impl Into<String>,
        owner: impl Into<String>,
        allowed_senders: AllowedSenders,
    ) -> Self {
        Self {
            shortname: shortname.into(),
            owner: owner.into(),
            allowed_senders: allowed_senders.to_string(),
            announcements_only: false,
            archive: false,
            self_subscribe_allowed: true,
            members: Vec::new(),
            moderators: Vec::new(),
        }
    }

    /// Parsed posting policy; an unknown stored value is a configuration error
    pub fn allowed_senders(&self) -> Result<AllowedSenders> {
        self.allowed_senders.parse()
    }

    pub fn is_member(&self, address: &str) -> bool {
        contains_address(&self.members, address)
    }

    pub fn is_moderator(&self, address: &str) -> bool {
        contains_address(&self.moderators, address)
    }

    /// Append a member; fails if the address is already subscribed
    pub fn add_member(&mut self, address: &str) -> Result<()> {
        let address = normalize_address(address);
        if self.is_member(&address) {
            return Err(Error::AlreadyMember(address));
        }
        self.members.push(address);
        Ok(())
    }

    /// Remove every entry matching the address and return how many went away
    pub fn remove_member(&mut self, address: &str) -> Result<usize> {
        let address = normalize_address(address);
        let before = self.members.len();
        self.members.retain(|m| normalize_address(m) != address);
        let removed = before - self.members.len();
        if removed == 0 {
            return Err(Error::NotMember(address));
        }
        Ok(removed)
    }
}

fn contains_address(addresses: &[String], address: &str) -> bool {
    let address = normalize_address(address);
    addresses.iter().any(|a| normalize_address(a) == address)
}
