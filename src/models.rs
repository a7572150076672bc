//! Request/response DTOs
//!
//! Defines all data structures crossing the HTTP boundary and the JSON
//! shape persisted in message records. Dates are RFC 3339 strings.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A claimed disposable address
///
/// Returned by both allocation endpoints. `expires_at` is advisory; the
/// store TTL on the reservation key is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    /// Full address, `{local}@{domain}`
    pub email: String,
    /// Normalized local-part
    pub local: String,
    /// Allow-listed domain
    pub domain: String,
    /// Advisory expiry, `now + retention`, RFC 3339
    pub expires_at: String,
}

impl Address {
    /// Build an address payload with its computed advisory expiry
    pub fn new(domain: &str, local: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            email: format!("{local}@{domain}"),
            local: local.to_owned(),
            domain: domain.to_owned(),
            expires_at: expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Canonical message record, stored as JSON under `msg:{id}`
///
/// The inbox index holds only ids; this record carries the body and
/// metadata. Listing drops ids whose record has already expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Time-ordered, lexicographically sortable identifier
    pub id: String,
    /// Recipient domain (allow-listed)
    pub domain: String,
    /// Recipient local-part (normalized)
    pub local: String,
    /// The identified original recipient address
    pub original_to: String,
    /// Sender, as declared in the From header
    pub from: String,
    /// Subject header, possibly empty
    pub subject: String,
    /// Sender-declared date with internal-date fallback, RFC 3339
    pub date: String,
    /// Concatenated text/plain bodies (or a text rendering of the HTML)
    pub text: String,
    /// Concatenated, sanitized text/html bodies
    pub html: String,
    /// Source folder on the upstream mailbox
    pub folder: String,
    /// Source UID within that folder
    pub uid: u32,
}

/// Input: allocate a random address
#[derive(Debug, Clone, Deserialize)]
pub struct RandomAddressInput {
    /// Target domain; must be on the merged allow-list
    pub domain: String,
}

/// Input: allocate or refresh a chosen address
#[derive(Debug, Clone, Deserialize)]
pub struct CustomAddressInput {
    /// Target domain; must be on the merged allow-list
    pub domain: String,
    /// Requested local-part; normalized to lowercase/trimmed
    pub local: String,
}

/// Input: admin mutation of the dynamic allow-list
#[derive(Debug, Clone, Deserialize)]
pub struct AdminDomainInput {
    /// Domain to add to `config:domains`
    pub domain: String,
}

/// Query parameters for inbox listing
#[derive(Debug, Clone, Deserialize)]
pub struct ListInboxQuery {
    /// Page size, 1..=100
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Exclusive upper score bound in epoch seconds; 0 means unbounded
    #[serde(default)]
    pub before: i64,
}

/// Service status payload; served even past the expiry date
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Whether the service is past end-of-day of its expiry date
    pub expired: bool,
    /// The configured sunset date, `DD/MM/YYYY`, if any
    #[serde(rename = "expirationDate", skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<String>,
    /// Human-readable note, present when expired
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload for `GET /domains`
#[derive(Debug, Clone, Serialize)]
pub struct DomainsResponse {
    /// The merged static + dynamic allow-list
    pub domains: Vec<String>,
}

/// Default page size for inbox listing
///
/// Half the hard ceiling; enough for a full first screen without paging.
fn default_limit() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{Address, ListInboxQuery};

    #[test]
    fn address_formats_email_and_expiry() {
        let expires = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let address = Address::new("catty.my.id", "alice.test", expires);
        assert_eq!(address.email, "alice.test@catty.my.id");
        assert_eq!(address.expires_at, "2026-06-01T12:00:00Z");
    }

    #[test]
    fn list_query_defaults() {
        let query: ListInboxQuery = serde_json::from_str("{}").expect("defaults apply");
        assert_eq!(query.limit, 50);
        assert_eq!(query.before, 0);
    }
}
