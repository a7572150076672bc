//! Original-recipient identification
//!
//! The upstream mailbox is a catch-all, so the To header usually names
//! the catch-all account rather than the disposable address a sender
//! used. The forwarding chain records the original recipient in one of
//! several headers; the first email-shaped candidate whose domain is on
//! the merged allow-list wins.

use mailparse::MailAddr;

use crate::allowlist::AllowList;
use crate::mime::ParsedEmail;

/// Header fields that may carry the original recipient, highest priority
/// first
const RECIPIENT_HEADERS: [&str; 6] = [
    "X-Forwarded-To",
    "Envelope-To",
    "X-Envelope-To",
    "X-Original-To",
    "Delivered-To",
    "To",
];

/// A recipient resolved to an allow-listed `(domain, local)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Lower-cased domain, present on the merged allow-list
    pub domain: String,
    /// Lower-cased, trimmed local-part
    pub local: String,
    /// The normalized full address the message was resolved to
    pub address: String,
}

/// Identify the original recipient of a catch-all delivery
///
/// Scans the prioritized header list; each candidate value has the
/// `<...>` address extracted when present, else the trimmed value is
/// used as-is. Falls back to every parsed To address. Returns `None`
/// when nothing matches the allow-list; the caller discards the message.
pub fn identify(email: &ParsedEmail, allow: &AllowList) -> Option<Recipient> {
    for name in RECIPIENT_HEADERS {
        for (key, value) in &email.headers {
            if !key.eq_ignore_ascii_case(name) {
                continue;
            }
            if let Some(recipient) = match_candidate(&extract_address(value), allow) {
                return Some(recipient);
            }
        }
    }

    // Last resort: every address in the To list, not just the first.
    let to_value = email.header("to")?;
    for addr in parse_address_list(to_value) {
        if let Some(recipient) = match_candidate(&addr, allow) {
            return Some(recipient);
        }
    }
    None
}

/// Extract the address between `<` and `>`, else the trimmed string
fn extract_address(value: &str) -> String {
    if let Some(start) = value.find('<')
        && let Some(end) = value[start + 1..].find('>')
    {
        return value[start + 1..start + 1 + end].trim().to_owned();
    }
    value.trim().to_owned()
}

/// Accept a candidate when it is email-shaped with an allow-listed domain
fn match_candidate(candidate: &str, allow: &AllowList) -> Option<Recipient> {
    let normalized = candidate.trim().to_ascii_lowercase();
    let (local, domain) = normalized.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() || !allow.contains(domain) {
        return None;
    }
    Some(Recipient {
        domain: domain.to_owned(),
        local: local.to_owned(),
        address: normalized,
    })
}

/// Flatten a To header value into bare addresses
fn parse_address_list(value: &str) -> Vec<String> {
    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(single) => vec![single.addr.clone()],
                MailAddr::Group(group) => {
                    group.addrs.iter().map(|a| a.addr.clone()).collect()
                }
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use crate::allowlist::AllowList;
    use crate::mime::parse_email;

    use super::{extract_address, identify};

    fn allow() -> AllowList {
        AllowList::from_static(&["catty.my.id".to_owned()])
    }

    #[test]
    fn forwarded_to_wins_over_catchall_to() {
        let raw = concat!(
            "X-Forwarded-To: alice@catty.my.id\r\n",
            "To: catchall@upstream.example\r\n",
            "From: sender@example.com\r\n",
            "\r\n",
            "body",
        )
        .as_bytes();
        let email = parse_email(raw).expect("parse");
        let recipient = identify(&email, &allow()).expect("must resolve");

        assert_eq!(recipient.domain, "catty.my.id");
        assert_eq!(recipient.local, "alice");
        assert_eq!(recipient.address, "alice@catty.my.id");
    }

    #[test]
    fn display_form_extracts_angle_address() {
        let raw = concat!(
            "Delivered-To: Alice Test <ALICE@Catty.My.Id>\r\n",
            "To: catchall@upstream.example\r\n",
            "\r\n",
            "body",
        )
        .as_bytes();
        let email = parse_email(raw).expect("parse");
        let recipient = identify(&email, &allow()).expect("must resolve");

        assert_eq!(recipient.local, "alice");
        assert_eq!(recipient.domain, "catty.my.id");
    }

    #[test]
    fn falls_back_to_later_to_addresses() {
        let raw = concat!(
            "To: catchall@upstream.example, bob@catty.my.id\r\n",
            "\r\n",
            "body",
        )
        .as_bytes();
        let email = parse_email(raw).expect("parse");
        let recipient = identify(&email, &allow()).expect("must resolve");

        assert_eq!(recipient.local, "bob");
    }

    #[test]
    fn unmatched_domains_discard_the_message() {
        let raw = concat!(
            "X-Forwarded-To: alice@evil.com\r\n",
            "To: catchall@upstream.example\r\n",
            "\r\n",
            "body",
        )
        .as_bytes();
        let email = parse_email(raw).expect("parse");
        assert!(identify(&email, &allow()).is_none());
    }

    #[test]
    fn extract_address_handles_both_forms() {
        assert_eq!(
            extract_address("Alice <alice@catty.my.id>"),
            "alice@catty.my.id"
        );
        assert_eq!(extract_address(" alice@catty.my.id "), "alice@catty.my.id");
    }
}
