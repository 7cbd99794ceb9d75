//! Delivery Dispatcher - fan-out and bounces
//!
//! Everything leaves with the bounce address as envelope sender, so
//! delivery failures come back to the list manager instead of the author.

use super::transport::Transport;
use chrono::Utc;
use lettre::message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::Message;
use listmail_common::{Config, Error, Result};
use tracing::{debug, info};
use uuid::Uuid;

const BOUNCE_SUBJECT: &str = "Undelivered Mail Returned to Sender";

/// Sends list traffic through a [`Transport`]
pub struct DeliveryDispatcher<'a> {
    config: &'a Config,
    transport: &'a dyn Transport,
}

impl<'a> DeliveryDispatcher<'a> {
    pub fn new(config: &'a Config, transport: &'a dyn Transport) -> Self {
        Self { config, transport }
    }

    /// Send `message` unchanged to exactly `recipients`
    pub async fn dispatch(&self, message: &[u8], recipients: &[String]) -> Result<()> {
        if recipients.is_empty() {
            debug!("No recipients, nothing to dispatch");
            return Ok(());
        }

        self.transport
            .send_raw(&self.config.bounce_address(), recipients, message)
            .await?;
        info!(recipients = recipients.len(), bytes = message.len(), "Dispatched");
        Ok(())
    }

    /// Return `original` to its sender stating why it was rejected
    pub async fn bounce(&self, original: &[u8], reason: &str, return_path: &str) -> Result<()> {
        let body = format!("Your email to this mailing list was rejected.\n\n{}\n", reason);
        self.send_notice(original, body, return_path).await
    }

    /// Tell the sender an internal fault stopped delivery, without details
    pub async fn apologize(&self, original: &[u8], return_path: &str) -> Result<()> {
        let body = format!(
            "This is the mailing list system at host {domain}.\n\
\n\
Your email to this mailing list failed to deliver due to an internal\n\
error. Most likely you did nothing wrong and the server is misconfigured,\n\
or the mailing list software is buggy. The error has been reported to the\n\
server's administrator, who should be able to see and fix the problem.\n\
\n\
The administrator of this server is {administrator}.\n",
            domain = self.config.general.domain,
            administrator = self.config.general.administrator,
        );
        self.send_notice(original, body, return_path).await
    }

    /// Pass unsolicited mail for the list manager itself on to the administrator
    pub async fn forward_to_administrator(&self, original: &[u8]) -> Result<()> {
        self.dispatch(original, &[self.config.general.administrator.clone()])
            .await
    }

    async fn send_notice(&self, original: &[u8], body: String, return_path: &str) -> Result<()> {
        let from = mailbox(&self.config.bounce_address())?;
        let to = mailbox(return_path)?;
        let rfc822 = ContentType::parse("message/rfc822")
            .map_err(|e| Error::Internal(format!("Invalid content type: {}", e)))?;

        let notice = Message::builder()
            .from(from)
            .to(to)
            .subject(BOUNCE_SUBJECT)
            .date(Utc::now().into())
            .message_id(Some(message_id(&self.config.general.domain)))
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(body))
                    .singlepart(
                        Attachment::new("original.eml".to_string()).body(original.to_vec(), rfc822),
                    ),
            )
            .map_err(|e| Error::Internal(format!("Failed to build bounce: {}", e)))?;

        self.dispatch(&notice.formatted(), &[return_path.to_string()])
            .await
    }
}

/// Parse an address for a message we build ourselves
pub(crate) fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse()
        .map_err(|e| Error::Transport(format!("Invalid address '{}': {}", address, e)))
}

pub(crate) fn message_id(domain: &str) -> String {
    format!("<{}@{}>", Uuid::new_v4(), domain)
}
