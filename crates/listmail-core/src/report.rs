//! Administrator fault reports
//!
//! The only place internal error detail is allowed to leave the process.

use crate::delivery::{mailbox, message_id, Transport};
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::Message;
use listmail_common::{Config, Error, Result};
use std::fmt;
use tracing::info;

/// Where in the delivery of which message a fault happened
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub recipient: Option<String>,
    pub return_path: Option<String>,
    pub list: Option<String>,
    pub message_id: Option<String>,
    pub subject: Option<String>,
}

impl fmt::Display for ReportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("Recipient", &self.recipient),
            ("Return-Path", &self.return_path),
            ("List", &self.list),
            ("Message-ID", &self.message_id),
            ("Subject", &self.subject),
        ];
        for (name, value) in fields {
            writeln!(f, "{}: {}", name, value.as_deref().unwrap_or("(unknown)"))?;
        }
        Ok(())
    }
}

/// Mails fault reports to the configured administrator
pub struct ErrorReporter<'a> {
    config: &'a Config,
    transport: &'a dyn Transport,
}

impl<'a> ErrorReporter<'a> {
    pub fn new(config: &'a Config, transport: &'a dyn Transport) -> Self {
        Self { config, transport }
    }

    /// Send the full detail of `error` to the administrator
    pub async fn report(&self, error: &Error, context: &ReportContext) -> Result<()> {
        let administrator = &self.config.general.administrator;
        let report = Message::builder()
            .from(mailbox(&self.config.manager_address())?)
            .to(mailbox(administrator)?)
            .subject(error.report_subject())
            .date(Utc::now().into())
            .message_id(Some(message_id(&self.config.general.domain)))
            .header(ContentType::TEXT_PLAIN)
            .body(render(error, context))
            .map_err(|e| Error::Internal(format!("Failed to build report: {}", e)))?;

        self.transport
            .send_raw(
                &self.config.bounce_address(),
                &[administrator.clone()],
                &report.formatted(),
            )
            .await?;
        info!(code = error.code(), administrator = %administrator, "Reported fault");
        Ok(())
    }
}

fn render(error: &Error, context: &ReportContext) -> String {
    format!(
        "The list manager hit an error it could not handle.\n\
\n\
Code: {code}\n\
Error: {error}\n\
\n\
{context}\n\
Detail:\n\
{error:#?}\n",
        code = error.code(),
        error = error,
        context = context,
    )
}
