//! DKIM-Signature header parsing and verification oracle
//!
//! Implements the tag-list grammar of RFC 6376 section 3.2 far enough to
//! learn which header fields a signer claims to cover.

use crate::message::InboundMessage;
use async_trait::async_trait;
use listmail_common::{Error, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;
use tracing::debug;

/// Tag names must start with a letter followed by word characters; only
/// the start of the name is checked.
static TAG_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*").expect("valid tag name regex"));

static HEADER_LIST_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*:\s*").expect("valid separator regex"));

/// DKIM verification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkimResult {
    /// Signature is valid
    Pass,
    /// Signature verification failed
    Fail,
    /// No signature present
    None,
    /// Temporary error (DNS timeout, etc.)
    TempError,
    /// Permanent error (invalid signature format)
    PermError,
}

impl DkimResult {
    /// Convert to header value for Authentication-Results
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DkimResult::Pass => "pass",
            DkimResult::Fail => "fail",
            DkimResult::None => "none",
            DkimResult::TempError => "temperror",
            DkimResult::PermError => "permerror",
        }
    }

    fn from_header_value(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "pass" => DkimResult::Pass,
            "none" => DkimResult::None,
            "temperror" => DkimResult::TempError,
            "permerror" => DkimResult::PermError,
            _ => DkimResult::Fail,
        }
    }
}

/// The parts of a DKIM-Signature header this engine cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimSignature {
    /// Lower-cased header names listed in the `h=` tag
    pub signed_headers: BTreeSet<String>,
    pub tags: HashMap<String, String>,
}

impl DkimSignature {
    /// Parse a DKIM-Signature header value.
    ///
    /// A single trailing `;` is allowed; any other empty segment, a segment
    /// without `=`, a malformed tag name or a repeated tag is a parse error.
    /// The `h` tag is mandatory.
    pub fn parse(header: &str) -> Result<Self> {
        let mut specs: Vec<&str> = header.trim().split(';').collect();
        if specs.last().is_some_and(|s| s.is_empty()) {
            specs.pop();
        }

        let mut tags = HashMap::new();
        for spec in specs {
            let (key, value) = spec
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| Error::parse("invalid tag spec", spec))?;

            if !TAG_NAME.is_match(key) {
                return Err(Error::parse("invalid tag spec", spec));
            }
            if tags.contains_key(key) {
                return Err(Error::parse("duplicate tag", key));
            }
            tags.insert(key.to_string(), value.to_string());
        }

        let h = tags.get("h").ok_or_else(|| {
            Error::Sender("Your DKIM Signature does not list its signed headers (h= tag).".to_string())
        })?;
        let signed_headers = HEADER_LIST_SEPARATOR
            .split(h)
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        Ok(Self {
            signed_headers,
            tags,
        })
    }

    /// Whether the signer claims to cover header `name`
    pub fn covers(&self, name: &str) -> bool {
        self.signed_headers.contains(&name.to_lowercase())
    }
}

/// Oracle answering whether a message's DKIM signature verified
#[async_trait]
pub trait DkimVerifier: Send + Sync {
    async fn verify(&self, message: &InboundMessage) -> DkimResult;
}

/// Trusts the `dkim=` results the local MTA recorded in
/// Authentication-Results headers carrying our authserv-id.
///
/// The MTA must strip Authentication-Results headers with this id from
/// incoming mail, otherwise a sender can forge a pass.
#[derive(Debug, Clone)]
pub struct AuthResultsVerifier {
    authserv_id: String,
}

impl AuthResultsVerifier {
    pub fn new(authserv_id: impl Into<String>) -> Self {
        Self {
            authserv_id: authserv_id.into().to_lowercase(),
        }
    }

    /// Every `dkim=` result found in trusted headers, in header order
    fn results(&self, message: &InboundMessage) -> Vec<DkimResult> {
        message
            .headers("Authentication-Results")
            .iter()
            .filter_map(|value| {
                let (id, rest) = value.split_once(';')?;
                let id = id.split_whitespace().next()?;
                id.eq_ignore_ascii_case(&self.authserv_id).then_some(rest)
            })
            .flat_map(|rest| {
                rest.split(';').filter_map(|resinfo| {
                    let (method, result) = resinfo.trim().split_once('=')?;
                    if !method.trim().eq_ignore_ascii_case("dkim") {
                        return None;
                    }
                    let result = result.split_whitespace().next()?;
                    Some(DkimResult::from_header_value(result))
                })
            })
            .collect()
    }
}

#[async_trait]
impl DkimVerifier for AuthResultsVerifier {
    async fn verify(&self, message: &InboundMessage) -> DkimResult {
        let results = self.results(message);
        debug!(authserv_id = %self.authserv_id, results = ?results, "DKIM results");

        if results.is_empty() {
            DkimResult::None
        } else if results.contains(&DkimResult::Pass) {
            DkimResult::Pass
        } else {
            results[0]
        }
    }
}
