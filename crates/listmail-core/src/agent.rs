//! Delivery agent: one inbound message per invocation
//!
//! `DeliveryAgent::handle` is the fault boundary. Sender errors become a
//! bounce, everything else becomes an administrator report plus a generic
//! apology. Only lock timeouts, raised before anything was sent, make the
//! MTA retry; every other outcome exits successfully so a requeue can never
//! duplicate mail that already went out.

use crate::address::AddressResolver;
use crate::delivery::{DeliveryDispatcher, Transport};
use crate::email_auth::{AuthResultsVerifier, DkimVerifier};
use crate::message::InboundMessage;
use crate::policy::{Decision, ListPolicyEngine};
use crate::report::{ErrorReporter, ReportContext};
use listmail_common::{normalize_address, Audience, Config, Error, Result};
use listmail_storage::SubscriberStore;
use std::sync::Arc;
use tracing::{error, info, warn};

/// sysexits(3) temporary failure; the MTA requeues the message
pub const EX_TEMPFAIL: i32 = 75;

/// sysexits(3) configuration error
pub const EX_CONFIG: i32 = 78;

/// Addressing context the MTA passes in the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Local part the MTA delivered to (`$LOCAL`)
    pub local: String,
    /// Domain the MTA delivered to (`$DOMAIN`)
    pub domain: String,
    /// Envelope recipient before alias expansion (`$ORIGINAL_RECIPIENT`)
    pub recipient: String,
    /// Envelope return path (`$SENDER`)
    pub return_path: ReturnPath,
}

/// Envelope return path as passed by the MTA
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnPath {
    /// `$SENDER` was not set; the Return-Path header is used instead
    Unset,
    /// The null sender `<>`; nothing is ever bounced
    Null,
    Address(String),
}

impl ReturnPath {
    fn from_sender(sender: Option<String>) -> Self {
        match sender.map(|s| normalize_address(&s)) {
            None => ReturnPath::Unset,
            Some(s) if s.is_empty() => ReturnPath::Null,
            Some(s) => ReturnPath::Address(s),
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            ReturnPath::Address(address) => Some(address),
            ReturnPath::Unset | ReturnPath::Null => None,
        }
    }
}

impl Invocation {
    /// Read the invocation from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name).ok_or_else(|| {
                Error::Config(format!("${} is not set; run me from the MTA", name))
            })
        };

        Ok(Self {
            local: required("LOCAL")?,
            domain: required("DOMAIN")?,
            recipient: required("ORIGINAL_RECIPIENT")?,
            return_path: ReturnPath::from_sender(lookup("SENDER")),
        })
    }
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A post went out to `recipients` addresses
    Delivered { recipients: usize },
    Subscribed,
    Unsubscribed,
    /// Mail for the list manager itself went to the administrator
    Forwarded,
    /// The sender got a bounce (or had no return path)
    Rejected,
    /// The administrator got a report and the sender an apology
    Faulted,
    /// A lock could not be taken in time; nothing was sent and the MTA
    /// should retry
    Deferred,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Deferred => EX_TEMPFAIL,
            _ => 0,
        }
    }
}

/// Handles messages piped in by the MTA
pub struct DeliveryAgent {
    config: Config,
    store: SubscriberStore,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn DkimVerifier>,
    resolver: AddressResolver,
}

impl DeliveryAgent {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        verifier: Arc<dyn DkimVerifier>,
    ) -> Self {
        Self {
            store: SubscriberStore::from_config(&config),
            resolver: AddressResolver::from_config(&config),
            config,
            transport,
            verifier,
        }
    }

    /// Agent trusting the MTA's Authentication-Results for DKIM
    pub fn from_config(config: Config, transport: Arc<dyn Transport>) -> Self {
        let verifier = Arc::new(AuthResultsVerifier::new(config.authserv_id()));
        Self::new(config, transport, verifier)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle one message; never fails, the outcome carries the exit status
    pub async fn handle(&self, invocation: &Invocation, raw: Vec<u8>) -> Outcome {
        let mut context = ReportContext {
            recipient: Some(invocation.recipient.clone()),
            return_path: invocation.return_path.address().map(str::to_string),
            ..Default::default()
        };

        match self.deliver(invocation, &raw, &mut context).await {
            Ok(outcome) => {
                info!(recipient = %invocation.recipient, outcome = ?outcome, "Handled message");
                outcome
            }
            Err(e) if e.is_retryable() => {
                warn!(recipient = %invocation.recipient, error = %e, "Deferring message");
                Outcome::Deferred
            }
            Err(e) => match e.audience() {
                Audience::Sender => self.reject(&e, &raw, &context).await,
                Audience::Administrator => self.fault(&e, &raw, &context).await,
            },
        }
    }

    async fn deliver(
        &self,
        invocation: &Invocation,
        raw: &[u8],
        context: &mut ReportContext,
    ) -> Result<Outcome> {
        let general = &self.config.general;
        if !invocation.local.eq_ignore_ascii_case(&general.localname)
            || !invocation.domain.eq_ignore_ascii_case(&general.domain)
        {
            return Err(Error::Config(format!(
                "Invoked for {}@{} but configured as {}@{}",
                invocation.local, invocation.domain, general.localname, general.domain
            )));
        }

        let recipient = normalize_address(&invocation.recipient);
        let address = self.resolver.parse(&recipient)?;
        if address.domain != general.domain {
            return Err(Error::Config(format!(
                "ORIGINAL_RECIPIENT's domain {} is not the domain {} configured.",
                address.domain, general.domain
            )));
        }
        context.list = Some(address.list_name.clone());

        let dispatcher = DeliveryDispatcher::new(&self.config, self.transport.as_ref());

        // Unsolicited mail to the list manager itself, including bounces.
        if address.list_name == general.localname {
            dispatcher.forward_to_administrator(raw).await?;
            return Ok(Outcome::Forwarded);
        }

        let mut message = InboundMessage::parse(raw)?;
        context.message_id = message.header("Message-ID");
        context.subject = message.header("Subject");
        if invocation.return_path == ReturnPath::Unset {
            context.return_path = message.return_path().filter(|s| !s.is_empty());
        }

        let engine = ListPolicyEngine::new(&self.config, &self.store, self.verifier.as_ref());
        match engine.evaluate(&address, &recipient, &mut message).await? {
            Decision::Subscribed { .. } => Ok(Outcome::Subscribed),
            Decision::Unsubscribed { .. } => Ok(Outcome::Unsubscribed),
            Decision::Distribute {
                members,
                archiver,
                message,
                ..
            } => {
                dispatcher.dispatch(&message, &members).await?;
                let mut recipients = members.len();
                if let Some(archiver) = archiver {
                    dispatcher.dispatch(&message, &[archiver]).await?;
                    recipients += 1;
                }
                Ok(Outcome::Delivered { recipients })
            }
        }
    }

    async fn reject(&self, cause: &Error, raw: &[u8], context: &ReportContext) -> Outcome {
        info!(
            recipient = ?context.recipient,
            return_path = ?context.return_path,
            reason = %cause,
            "Rejecting message"
        );

        let Some(return_path) = context.return_path.as_deref() else {
            // Null sender: bouncing a bounce only makes loops.
            return Outcome::Rejected;
        };

        let dispatcher = DeliveryDispatcher::new(&self.config, self.transport.as_ref());
        if let Err(e) = dispatcher.bounce(raw, &cause.to_string(), return_path).await {
            self.notify_administrator(&e, context).await;
        }
        Outcome::Rejected
    }

    async fn fault(&self, cause: &Error, raw: &[u8], context: &ReportContext) -> Outcome {
        error!(
            code = cause.code(),
            recipient = ?context.recipient,
            error = %cause,
            "Internal fault"
        );

        self.notify_administrator(cause, context).await;

        if let Some(return_path) = context.return_path.as_deref() {
            let dispatcher = DeliveryDispatcher::new(&self.config, self.transport.as_ref());
            if let Err(e) = dispatcher.apologize(raw, return_path).await {
                warn!(return_path = %return_path, error = %e, "Failed to send apology");
            }
        }
        Outcome::Faulted
    }

    /// Best effort: a failed report is logged, never retried
    async fn notify_administrator(&self, cause: &Error, context: &ReportContext) {
        let reporter = ErrorReporter::new(&self.config, self.transport.as_ref());
        if let Err(e) = reporter.report(cause, context).await {
            error!(error = %e, cause = %cause, "Could not notify the administrator");
        }
    }
}
