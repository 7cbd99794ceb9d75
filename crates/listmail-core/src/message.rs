//! Inbound message: raw bytes plus an editable header view
//!
//! Header fields are kept byte for byte so everything this engine does not
//! rewrite reaches the members exactly as the sender (and the DKIM signer)
//! produced it.

use listmail_common::{normalize_address, Error, Result};
use mail_parser::{Address, MessageParser};

/// One header field including its continuation lines and line ending
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderField {
    name: String,
    raw: Vec<u8>,
}

impl HeaderField {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Unfolded value with surrounding whitespace removed
    fn value(&self) -> String {
        let raw = String::from_utf8_lossy(&self.raw);
        let value = raw.split_once(':').map(|(_, v)| v).unwrap_or_default();
        value.replace("\r\n", "").replace('\n', "").trim().to_string()
    }
}

/// A message being delivered to a list
#[derive(Debug, Clone)]
pub struct InboundMessage {
    fields: Vec<HeaderField>,
    separator: Vec<u8>,
    body: Vec<u8>,
    line_ending: &'static str,
    from: Vec<String>,
    recipients: Vec<String>,
}

impl InboundMessage {
    /// Split a raw message into header fields and body and collect the
    /// From, To and Cc addresses.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Sender("Your message could not be parsed.".to_string()))?;

        let from = collect_addresses(parsed.from());
        let mut recipients = collect_addresses(parsed.to());
        recipients.extend(collect_addresses(parsed.cc()));

        let (head, separator, body) = split_head(raw);
        let line_ending = if head.windows(2).any(|w| w == b"\r\n") || head.is_empty() {
            "\r\n"
        } else {
            "\n"
        };

        Ok(Self {
            fields: split_fields(head),
            separator: separator.to_vec(),
            body: body.to_vec(),
            line_ending,
            from,
            recipients,
        })
    }

    /// The single From address; zero or several is a sender error
    pub fn sole_sender(&self) -> Result<&str> {
        match self.from.as_slice() {
            [address] => Ok(address),
            _ => Err(Error::Sender(
                "You must use one and only one address in the From header.".to_string(),
            )),
        }
    }

    /// Whether `address` appears in To or Cc
    pub fn is_addressed_to(&self, address: &str) -> bool {
        let address = normalize_address(address);
        self.recipients.iter().any(|r| *r == address)
    }

    /// Unfolded value of the first header named `name`
    pub fn header(&self, name: &str) -> Option<String> {
        self.fields.iter().find(|f| f.is(name)).map(HeaderField::value)
    }

    /// Unfolded values of every header named `name`, in order
    pub fn headers(&self, name: &str) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.is(name))
            .map(HeaderField::value)
            .collect()
    }

    /// Replace every header named `name` by a single new one at the end of
    /// the header block.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.remove_header(name);
        let raw = format!("{}: {}{}", name, value, self.line_ending).into_bytes();
        self.fields.push(HeaderField {
            name: name.to_string(),
            raw,
        });
    }

    /// Delete every header named `name`
    pub fn remove_header(&mut self, name: &str) {
        self.fields.retain(|f| !f.is(name));
    }

    /// Envelope return path from the Return-Path header, without brackets
    pub fn return_path(&self) -> Option<String> {
        self.header("Return-Path").map(|v| normalize_address(&v))
    }

    /// Serialize the (possibly rewritten) message
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.fields.iter().map(|f| f.raw.len()).sum::<usize>()
                + self.separator.len()
                + self.body.len(),
        );
        for field in &self.fields {
            out.extend_from_slice(&field.raw);
        }
        out.extend_from_slice(&self.separator);
        out.extend_from_slice(&self.body);
        out
    }
}

fn collect_addresses(address: Option<&Address<'_>>) -> Vec<String> {
    let mut out = Vec::new();
    match address {
        Some(Address::List(list)) => {
            out.extend(list.iter().filter_map(|a| a.address.as_deref()).map(normalize_address));
        }
        Some(Address::Group(groups)) => {
            for group in groups {
                out.extend(
                    group
                        .addresses
                        .iter()
                        .filter_map(|a| a.address.as_deref())
                        .map(normalize_address),
                );
            }
        }
        None => {}
    }
    out
}

/// Split at the first empty line into (header block, separator, body).
/// The header block keeps the line ending of its last field.
fn split_head(raw: &[u8]) -> (&[u8], &[u8], &[u8]) {
    if raw.starts_with(b"\r\n") {
        return (&[], &raw[..2], &raw[2..]);
    }
    if raw.starts_with(b"\n") {
        return (&[], &raw[..1], &raw[1..]);
    }

    let crlf = find(raw, b"\r\n\r\n").map(|i| (i + 2, 2));
    let lf = find(raw, b"\n\n").map(|i| (i + 1, 1));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };

    match split {
        Some((head_end, sep_len)) => (
            &raw[..head_end],
            &raw[head_end..head_end + sep_len],
            &raw[head_end + sep_len..],
        ),
        None => (raw, &[], &[]),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_fields(head: &[u8]) -> Vec<HeaderField> {
    let mut fields: Vec<HeaderField> = Vec::new();

    for line in head.split_inclusive(|b| *b == b'\n') {
        let continuation = matches!(line.first(), Some(b' ') | Some(b'\t'));
        match fields.last_mut() {
            Some(field) if continuation => field.raw.extend_from_slice(line),
            _ => {
                let name = line
                    .iter()
                    .position(|b| *b == b':')
                    .map(|i| String::from_utf8_lossy(&line[..i]).trim().to_string())
                    .unwrap_or_default();
                fields.push(HeaderField {
                    name,
                    raw: line.to_vec(),
                });
            }
        }
    }

    fields
}
