//! RFC 2369 / RFC 2919 list headers

use crate::email_auth::DkimSignature;
use crate::message::InboundMessage;
use listmail_common::{Config, Error, Result};
use listmail_storage::MailingList;

/// Headers the list manager overwrites or deletes on every post (lower case)
pub const MUNGED_HEADERS: [&str; 9] = [
    "list-post",
    "list-help",
    "list-subscribe",
    "list-unsubscribe",
    "list-archive",
    "list-owner",
    "list-id",
    "sender",
    "list-unsubscribe-post",
];

/// Reject signatures covering headers that [`rewrite_list_headers`] changes
pub fn check_signed_headers(signature: &DkimSignature) -> Result<()> {
    let conflicts: Vec<&str> = MUNGED_HEADERS
        .iter()
        .copied()
        .filter(|name| signature.covers(name))
        .collect();

    if conflicts.is_empty() {
        return Ok(());
    }

    Err(Error::Sender(format!(
        "Please do not include any of {{{}}} in your DKIM h= tag; your signature covers {{{}}}. \
This makes it impossible for the mailing list program to add list-related headers properly.",
        MUNGED_HEADERS.join(", "),
        conflicts.join(", ")
    )))
}

/// Replace the list headers of a post about to be distributed
pub fn rewrite_list_headers(
    message: &mut InboundMessage,
    config: &Config,
    list_name: &str,
    list: &MailingList,
) {
    let web_root = &config.general.web_root;

    if list.announcements_only {
        message.set_header("List-Post", "NO");
    } else {
        message.set_header("List-Post", &format!("<{}>", config.list_address(list_name)));
    }

    message.set_header("List-Help", &format!("<{}{}>", web_root, list_name));
    message.set_header(
        "List-Subscribe",
        &format!("<{}>", config.command_address(list_name, "subscribe")),
    );
    message.set_header(
        "List-Unsubscribe",
        &format!("<{}>", config.command_address(list_name, "unsubscribe")),
    );

    if list.archive {
        message.set_header("List-Archive", &format!("<{}{}/archive>", web_root, list_name));
    } else {
        message.remove_header("List-Archive");
    }

    message.set_header("List-Owner", &format!("<{}>", list.owner));
    message.set_header(
        "List-ID",
        &format!("{} <{}.lists.{}>", list.shortname, list_name, config.general.domain),
    );
    message.set_header("Sender", &config.bounce_address());

    // No RFC 8058 one-click unsubscribe.
    message.remove_header("List-Unsubscribe-Post");
}
