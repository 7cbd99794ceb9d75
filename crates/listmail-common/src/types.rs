//! Common types for Listmail

use std::fmt;
use std::str::FromStr;

/// Who may post to a list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedSenders {
    Anyone,
    Moderators,
    Members,
}

impl AllowedSenders {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllowedSenders::Anyone => "anyone",
            AllowedSenders::Moderators => "moderators",
            AllowedSenders::Members => "members",
        }
    }
}

impl FromStr for AllowedSenders {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anyone" => Ok(AllowedSenders::Anyone),
            "moderators" => Ok(AllowedSenders::Moderators),
            "members" => Ok(AllowedSenders::Members),
            other => Err(crate::Error::Config(format!(
                "allowed_senders must be one of 'anyone', 'moderators' and 'members', not '{}'.",
                other
            ))),
        }
    }
}

impl fmt::Display for AllowedSenders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalizes a mail address for comparison: surrounding whitespace and
/// angle brackets are dropped and the whole address is lower-cased.
pub fn normalize_address(address: &str) -> String {
    address
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase()
}
