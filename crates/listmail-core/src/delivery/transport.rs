//! Outbound transports

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use listmail_common::{Config, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Something that can submit a fully formatted message
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit `message` unchanged with the given envelope
    async fn send_raw(&self, envelope_from: &str, recipients: &[String], message: &[u8])
        -> Result<()>;
}

/// Plain SMTP submission to the local relay
pub struct SmtpRelay {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelay {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .timeout(Some(timeout))
            .build();
        Self { mailer }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.smtp.host,
            config.smtp.port,
            Duration::from_secs(config.smtp.timeout_secs),
        )
    }
}

fn parse_address(address: &str) -> Result<Address> {
    address
        .parse()
        .map_err(|e| Error::Transport(format!("Invalid address '{}': {}", address, e)))
}

#[async_trait]
impl Transport for SmtpRelay {
    async fn send_raw(
        &self,
        envelope_from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<()> {
        let from = parse_address(envelope_from)?;
        let to = recipients
            .iter()
            .map(|r| parse_address(r))
            .collect::<Result<Vec<_>>>()?;

        let envelope = Envelope::new(Some(from), to)
            .map_err(|e| Error::Transport(format!("Invalid envelope: {}", e)))?;

        let response = self
            .mailer
            .send_raw(&envelope, message)
            .await
            .map_err(|e| Error::Transport(format!("SMTP submission failed: {}", e)))?;
        debug!(code = %response.code(), recipients = recipients.len(), "Message submitted");

        Ok(())
    }
}

/// A message captured by [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub envelope_from: String,
    pub recipients: Vec<String>,
    pub message: Vec<u8>,
}

impl SentMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}

/// Keeps submitted messages in memory; used for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<SentMessage>>,
    failing: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following submission fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_raw(
        &self,
        envelope_from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transport("Relay refused the message".to_string()));
        }

        let mut sent = self
            .sent
            .lock()
            .map_err(|_| Error::Internal("MemoryTransport lock poisoned".to_string()))?;
        sent.push(SentMessage {
            envelope_from: envelope_from.to_string(),
            recipients: recipients.to_vec(),
            message: message.to_vec(),
        });
        Ok(())
    }
}
