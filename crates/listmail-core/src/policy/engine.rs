//! List Policy Engine - decides the fate of one message
//!
//! Checks run in a fixed order so that the first violated precondition is
//! the one reported: list existence, anti-BCC, then either the membership
//! command or sender authorization, DKIM and signed-header conflicts.
//! Nothing is mutated or sent before every check has passed.

use super::headers::{check_signed_headers, rewrite_list_headers};
use crate::address::ListAddress;
use crate::email_auth::{DkimResult, DkimSignature, DkimVerifier};
use crate::message::InboundMessage;
use listmail_common::{AllowedSenders, Config, Error, Result};
use listmail_storage::{MailingList, SubscriberStore};
use tracing::{debug, info};

/// Outcome of a successful policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// `address` was added to the list
    Subscribed { list: String, address: String },
    /// Every entry of `address` was removed from the list
    Unsubscribed {
        list: String,
        address: String,
        removed: usize,
    },
    /// The rewritten message goes to the members and, if set, the archiver
    Distribute {
        list: String,
        members: Vec<String>,
        archiver: Option<String>,
        message: Vec<u8>,
    },
}

/// Evaluates list policy against inbound messages
pub struct ListPolicyEngine<'a> {
    config: &'a Config,
    store: &'a SubscriberStore,
    verifier: &'a dyn DkimVerifier,
}

impl<'a> ListPolicyEngine<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a SubscriberStore,
        verifier: &'a dyn DkimVerifier,
    ) -> Self {
        Self {
            config,
            store,
            verifier,
        }
    }

    /// Evaluate a message delivered to `recipient`, which resolved to
    /// `address`.
    ///
    /// On the posting path the list headers of `message` are rewritten and
    /// the result is returned in [`Decision::Distribute`].
    pub async fn evaluate(
        &self,
        address: &ListAddress,
        recipient: &str,
        message: &mut InboundMessage,
    ) -> Result<Decision> {
        let list_name = address.list_name.as_str();

        let mut snapshot = self.store.read_snapshot().await?;
        let list = snapshot.remove(list_name).ok_or_else(|| {
            Error::Config(format!(
                "I was asked to handle email for {} but I wasn't configured to do so. \
You have a broken MTA or list manager configuration.",
                list_name
            ))
        })?;

        if !message.is_addressed_to(recipient) {
            return Err(Error::Sender(
                "BCCing or otherwise sending emails to the mailing list services without the \
list's address being in To or CC headers is unsupported."
                    .to_string(),
            ));
        }

        match address.extension.as_str() {
            "" => self.post(list_name, &list, message).await,
            "subscribe" => self.subscribe(list_name, message).await,
            "unsubscribe" => self.unsubscribe(list_name, message).await,
            other => Err(Error::Sender(format!(
                "{} is not a valid subaddressing extension.",
                other
            ))),
        }
    }

    async fn subscribe(&self, list_name: &str, message: &InboundMessage) -> Result<Decision> {
        let sender = message.sole_sender()?;

        // The transaction re-reads the list under its lock.
        let mut tx = self.store.begin_update(list_name).await?;
        if tx.list().is_member(sender) {
            return Err(Error::AlreadyMember(sender.to_string()));
        }
        if !tx.list().self_subscribe_allowed {
            return Err(Error::Sender(format!(
                "This list does not allow self-subscription. Please contact the list owner at {} \
if you would like to be added.",
                tx.list().owner
            )));
        }

        tx.add_member(sender)?;
        tx.commit().await?;
        info!(list = %list_name, address = %sender, "Subscribed");

        Ok(Decision::Subscribed {
            list: list_name.to_string(),
            address: sender.to_string(),
        })
    }

    async fn unsubscribe(&self, list_name: &str, message: &InboundMessage) -> Result<Decision> {
        let sender = message.sole_sender()?;

        let mut tx = self.store.begin_update(list_name).await?;
        let removed = tx.remove_member(sender)?;
        tx.commit().await?;
        info!(list = %list_name, address = %sender, removed, "Unsubscribed");

        Ok(Decision::Unsubscribed {
            list: list_name.to_string(),
            address: sender.to_string(),
            removed,
        })
    }

    async fn post(
        &self,
        list_name: &str,
        list: &MailingList,
        message: &mut InboundMessage,
    ) -> Result<Decision> {
        let sender = message.sole_sender()?.to_string();

        match list.allowed_senders()? {
            AllowedSenders::Members if !list.is_member(&sender) => {
                return Err(Error::Sender(
                    "Only list members may post to this list.".to_string(),
                ));
            }
            AllowedSenders::Moderators if !list.is_moderator(&sender) => {
                return Err(Error::Sender(
                    "Only list moderators may post to this list.".to_string(),
                ));
            }
            _ => {}
        }

        let signature_header = message.header("DKIM-Signature").ok_or_else(|| {
            Error::Sender("Your email does not have a DKIM Signature.".to_string())
        })?;
        let dkim = self.verifier.verify(message).await;
        debug!(list = %list_name, sender = %sender, dkim = dkim.as_header_value(), "DKIM checked");
        if dkim != DkimResult::Pass {
            return Err(Error::Sender("Your email does not pass DKIM.".to_string()));
        }

        let signature = DkimSignature::parse(&signature_header)?;
        check_signed_headers(&signature)?;

        let archiver = if list.archive {
            let archiver = self.config.delivery.archiver_address.clone().ok_or_else(|| {
                Error::Config(format!(
                    "List {} is archived but delivery.archiver_address is not set",
                    list_name
                ))
            })?;
            Some(archiver)
        } else {
            None
        };

        rewrite_list_headers(message, self.config, list_name, list);

        Ok(Decision::Distribute {
            list: list_name.to_string(),
            members: list.members.clone(),
            archiver,
            message: message.to_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressResolver;
    use crate::email_auth::AuthResultsVerifier;
    use listmail_storage::SubscriberDatabase;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: Config,
        store: SubscriberStore,
        verifier: AuthResultsVerifier,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let database = dir.path().join("lists.json");
            let config = Config::parse(&format!(
                r#"
[general]
localname = "lists"
domain = "example.org"
administrator = "root@example.org"
web_root = "https://lists.example.org/"
database = "{}"

[delivery]
archiver_address = "archive@example.org"
lock_timeout_secs = 2

[dkim]
authserv_id = "mx.example.org"
"#,
                database.display()
            ))
            .unwrap();

            let mut lists = SubscriberDatabase::new();
            let mut dev = MailingList::new("Developers", "owner@example.org", AllowedSenders::Members);
            dev.members = vec!["alice@example.org".to_string(), "bob@example.org".to_string()];
            lists.insert("dev".to_string(), dev);

            let mut news = MailingList::new("News", "owner@example.org", AllowedSenders::Moderators);
            news.announcements_only = true;
            news.archive = true;
            news.self_subscribe_allowed = false;
            news.moderators = vec!["editor@example.org".to_string()];
            news.members = vec!["alice@example.org".to_string()];
            lists.insert("news".to_string(), news);

            let mut broken = MailingList::new("Broken", "owner@example.org", AllowedSenders::Anyone);
            broken.allowed_senders = "everyone".to_string();
            lists.insert("broken".to_string(), broken);

            std::fs::write(&database, serde_json::to_vec_pretty(&lists).unwrap()).unwrap();

            let store = SubscriberStore::new(&database, Duration::from_secs(2));
            let verifier = AuthResultsVerifier::new(config.authserv_id());
            Self {
                _dir: dir,
                config,
                store,
                verifier,
            }
        }

        async fn evaluate(&self, recipient: &str, raw: &str) -> Result<Decision> {
            let engine = ListPolicyEngine::new(&self.config, &self.store, &self.verifier);
            let address = AddressResolver::new('+').parse(recipient).unwrap();
            let mut message = InboundMessage::parse(raw.as_bytes()).unwrap();
            engine.evaluate(&address, recipient, &mut message).await
        }
    }

    fn signed_post(from: &str, to: &str, signed: &str, dkim: &str) -> String {
        format!(
            "Authentication-Results: mx.example.org; dkim={dkim} header.d=example.org\r\n\
DKIM-Signature: v=1; a=rsa-sha256; d=example.org; s=mail; h={signed}; bh=x; b=y\r\n\
From: {from}\r\n\
To: {to}\r\n\
Subject: hello\r\n\
\r\n\
body\r\n"
        )
    }

    fn command(from: &str, to: &str) -> String {
        format!("From: {from}\r\nTo: {to}\r\nSubject: command\r\n\r\n")
    }

    #[tokio::test]
    async fn test_member_post_is_distributed() {
        let fx = Fixture::new();
        let raw = signed_post("Alice <Alice@example.org>", "dev@example.org", "from:to:subject", "pass");

        let decision = fx.evaluate("dev@example.org", &raw).await.unwrap();
        let Decision::Distribute {
            list,
            members,
            archiver,
            message,
        } = decision
        else {
            panic!("expected distribution");
        };
        assert_eq!(list, "dev");
        assert_eq!(members, vec!["alice@example.org", "bob@example.org"]);
        assert_eq!(archiver, None);

        let message = String::from_utf8(message).unwrap();
        assert!(message.contains("List-Post: <dev@example.org>\r\n"));
        assert!(message.contains("Sender: lists+bounces@example.org\r\n"));
        assert!(message.ends_with("\r\n\r\nbody\r\n"));
    }

    #[tokio::test]
    async fn test_non_member_post_is_rejected() {
        let fx = Fixture::new();
        let raw = signed_post("mallory@example.net", "dev@example.org", "from:to", "pass");

        let err = fx.evaluate("dev@example.org", &raw).await.unwrap_err();
        assert_eq!(err.to_string(), "Only list members may post to this list.");
    }

    #[tokio::test]
    async fn test_moderated_list() {
        let fx = Fixture::new();
        let raw = signed_post("alice@example.org", "news@example.org", "from:to", "pass");
        let err = fx.evaluate("news@example.org", &raw).await.unwrap_err();
        assert_eq!(err.to_string(), "Only list moderators may post to this list.");

        let raw = signed_post("editor@example.org", "news@example.org", "from:to", "pass");
        let Decision::Distribute {
            archiver, message, ..
        } = fx.evaluate("news@example.org", &raw).await.unwrap()
        else {
            panic!("expected distribution");
        };
        assert_eq!(archiver.as_deref(), Some("archive@example.org"));
        let message = InboundMessage::parse(&message).unwrap();
        assert_eq!(message.headers("List-Post"), vec!["NO".to_string()]);
        assert_eq!(
            message.header("List-Archive").as_deref(),
            Some("<https://lists.example.org/news/archive>")
        );
    }

    #[tokio::test]
    async fn test_bcc_is_rejected_before_authorization() {
        let fx = Fixture::new();
        let raw = signed_post("mallory@example.net", "someone@example.org", "from:to", "pass");

        let err = fx.evaluate("dev@example.org", &raw).await.unwrap_err();
        assert!(err.to_string().starts_with("BCCing"));
    }

    #[tokio::test]
    async fn test_unknown_list_is_configuration_error() {
        let fx = Fixture::new();
        let raw = signed_post("alice@example.org", "nope@example.org", "from:to", "pass");

        let err = fx.evaluate("nope@example.org", &raw).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_allowed_senders_is_configuration_error() {
        let fx = Fixture::new();
        let raw = signed_post("alice@example.org", "broken@example.org", "from:to", "pass");

        let err = fx.evaluate("broken@example.org", &raw).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_dkim_required() {
        let fx = Fixture::new();
        let raw = "From: alice@example.org\r\nTo: dev@example.org\r\n\r\nhi\r\n";
        let err = fx.evaluate("dev@example.org", raw).await.unwrap_err();
        assert_eq!(err.to_string(), "Your email does not have a DKIM Signature.");

        let raw = signed_post("alice@example.org", "dev@example.org", "from:to", "fail");
        let err = fx.evaluate("dev@example.org", &raw).await.unwrap_err();
        assert_eq!(err.to_string(), "Your email does not pass DKIM.");
    }

    #[tokio::test]
    async fn test_signed_list_id_is_rejected() {
        let fx = Fixture::new();
        let raw = signed_post("alice@example.org", "dev@example.org", "from:to:list-id", "pass");

        let err = fx.evaluate("dev@example.org", &raw).await.unwrap_err();
        assert!(matches!(err, Error::Sender(ref m) if m.contains("list-id")));
    }

    #[tokio::test]
    async fn test_multiple_from_addresses_rejected() {
        let fx = Fixture::new();
        let raw = signed_post(
            "alice@example.org, bob@example.org",
            "dev@example.org",
            "from:to",
            "pass",
        );
        let err = fx.evaluate("dev@example.org", &raw).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "You must use one and only one address in the From header."
        );
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let fx = Fixture::new();

        let decision = fx
            .evaluate(
                "dev+subscribe@example.org",
                &command("Carol <Carol@Example.org>", "dev+subscribe@example.org"),
            )
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Subscribed {
                list: "dev".to_string(),
                address: "carol@example.org".to_string(),
            }
        );
        let snapshot = fx.store.read_snapshot().await.unwrap();
        assert!(snapshot["dev"].is_member("carol@example.org"));

        let decision = fx
            .evaluate(
                "dev+unsubscribe@example.org",
                &command("carol@example.org", "dev+unsubscribe@example.org"),
            )
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Unsubscribed {
                list: "dev".to_string(),
                address: "carol@example.org".to_string(),
                removed: 1,
            }
        );
        let snapshot = fx.store.read_snapshot().await.unwrap();
        assert!(!snapshot["dev"].is_member("carol@example.org"));
    }

    #[tokio::test]
    async fn test_subscribe_existing_member_leaves_store_untouched() {
        let fx = Fixture::new();
        let before = std::fs::read(fx.store.path()).unwrap();

        let err = fx
            .evaluate(
                "dev+subscribe@example.org",
                &command("ALICE@example.org", "dev+subscribe@example.org"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyMember(_)));
        assert_eq!(std::fs::read(fx.store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_unsubscribe_non_member_leaves_store_untouched() {
        let fx = Fixture::new();
        let before = std::fs::read(fx.store.path()).unwrap();

        let err = fx
            .evaluate(
                "dev+unsubscribe@example.org",
                &command("dave@example.org", "dev+unsubscribe@example.org"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotMember(_)));
        assert_eq!(std::fs::read(fx.store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_self_subscription_disallowed_names_owner() {
        let fx = Fixture::new();
        let err = fx
            .evaluate(
                "news+subscribe@example.org",
                &command("carol@example.org", "news+subscribe@example.org"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sender(ref m) if m.contains("owner@example.org")));
    }

    #[tokio::test]
    async fn test_unknown_extension() {
        let fx = Fixture::new();
        let err = fx
            .evaluate(
                "dev+digest@example.org",
                &command("alice@example.org", "dev+digest@example.org"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "digest is not a valid subaddressing extension.");
    }
}
