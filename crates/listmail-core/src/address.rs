//! Recipient address resolution
//!
//! A list is reached at `list@domain`; commands use a subaddress such as
//! `list+subscribe@domain`, where `+` is the configured delimiter.

use listmail_common::{Config, Error, Result};

/// A recipient address split into list name, command extension and domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListAddress {
    pub list_name: String,
    /// Empty for ordinary posts
    pub extension: String,
    pub domain: String,
}

/// Splits local addresses at the recipient delimiter
#[derive(Debug, Clone, Copy)]
pub struct AddressResolver {
    delimiter: char,
}

impl AddressResolver {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.general.recipient_delimiter.chars().next().unwrap_or('+'))
    }

    /// Resolve `list[+ext]@domain`, lower-casing every component
    pub fn parse(&self, address: &str) -> Result<ListAddress> {
        let address = address.trim();
        let malformed = || Error::Config(format!("Malformed recipient address '{}'", address));

        let (list_name, extension, domain) = match address.split_once(self.delimiter) {
            Some((list_name, remaining)) => {
                let (extension, domain) = remaining.rsplit_once('@').ok_or_else(malformed)?;
                (list_name, extension, domain)
            }
            None => {
                let (list_name, domain) = address.rsplit_once('@').ok_or_else(malformed)?;
                (list_name, "", domain)
            }
        };

        Ok(ListAddress {
            list_name: list_name.to_lowercase(),
            extension: extension.to_lowercase(),
            domain: domain.to_lowercase(),
        })
    }
}
