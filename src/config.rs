//! Configuration module for the gateway process
//!
//! All configuration is loaded from environment variables following the
//! pattern `TEMPBOX_<KEY>`, with documented defaults. The store-resident
//! dynamic layer (`config:domains`, `config:imap:*`) is applied on top at
//! runtime and wins on read; it is handled by the store and ingestor, not
//! here.

use std::env;
use std::env::VarError;

use chrono::{DateTime, NaiveDate, Utc};
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Which long-running responsibilities this process hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// HTTP API only
    Api,
    /// IMAP ingestion loop only
    Ingestor,
    /// Both in one process
    All,
}

impl Role {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "api" => Some(Self::Api),
            "ingestor" => Some(Self::Ingestor),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Whether this process serves the HTTP API
    pub fn serves_api(self) -> bool {
        matches!(self, Self::Api | Self::All)
    }

    /// Whether this process runs the ingestion loop
    pub fn runs_ingestor(self) -> bool {
        matches!(self, Self::Ingestor | Self::All)
    }
}

/// Upstream IMAP catch-all account
///
/// Holds connection details and credentials for the catch-all mailbox.
/// The password is stored using `SecretString` to prevent accidental
/// logging. Dynamic store overrides (`config:imap:*`) replace these
/// values at the top of each ingestion cycle.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (typically 993 for TLS)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
    /// Folders to poll each cycle (e.g. `INBOX`, `Junk`)
    pub folders: Vec<String>,
    /// Whether to verify the server certificate. `false` accepts
    /// self-signed certs, an operational concession for catch-all hosts.
    pub tls_verify: bool,
}

/// Gateway-wide configuration
///
/// Static (boot-time) layer only. Cloned into handlers via `Arc` for
/// thread-safe shared access.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Which responsibilities this process hosts
    pub role: Role,
    /// API bind address
    pub listen_addr: String,
    /// Redis endpoint; unreachable at boot is fatal
    pub redis_url: String,
    /// Retention window `R` in seconds; the TTL for all ephemeral state
    pub retention_seconds: u64,
    /// Ingestion tick period in seconds
    pub poll_seconds: u64,
    /// Raw message size above which ingestion skips the message
    pub max_email_bytes: usize,
    /// Per-client address-allocation budget per minute
    pub rate_limit_create_per_min: u64,
    /// Per-client inbox/message-read budget per minute
    pub rate_limit_fetch_per_min: u64,
    /// Static domain allow-list; not removable at runtime
    pub allowed_domains: Vec<String>,
    /// Upstream account; present when the role runs the ingestor
    pub imap: Option<ImapConfig>,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// Optional service sunset date; past end-of-day, the API gates to 503
    pub expiry_date: Option<NaiveDate>,
    /// Bearer token for admin operations; unset disables them
    pub admin_token: Option<String>,
}

impl GatewayConfig {
    /// Load all configuration from environment variables
    ///
    /// IMAP credentials are only required when the role runs the
    /// ingestor. An unparseable `TEMPBOX_EXPIRY_DATE` is treated as
    /// unset with a warning, never a startup failure.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are
    /// missing or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// TEMPBOX_REDIS_URL=redis://127.0.0.1:6379
    /// TEMPBOX_ALLOWED_DOMAINS=catty.my.id,inbox.example
    /// TEMPBOX_IMAP_HOST=mail.upstream.example
    /// TEMPBOX_IMAP_USER=catchall@upstream.example
    /// TEMPBOX_IMAP_PASS=secret
    /// TEMPBOX_EXPIRY_DATE=31/12/2026
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let role = match env::var("TEMPBOX_ROLE") {
            Ok(v) => Role::parse(&v).ok_or_else(|| {
                AppError::InvalidInput(format!("invalid TEMPBOX_ROLE: '{v}' (api|ingestor|all)"))
            })?,
            Err(_) => Role::All,
        };

        let allowed_domains = parse_list_env("TEMPBOX_ALLOWED_DOMAINS")?;
        if allowed_domains.is_empty() {
            return Err(AppError::InvalidInput(
                "TEMPBOX_ALLOWED_DOMAINS must name at least one domain".to_owned(),
            ));
        }

        let imap = if role.runs_ingestor() {
            Some(load_imap_config()?)
        } else {
            None
        };

        Ok(Self {
            role,
            listen_addr: optional_env("TEMPBOX_LISTEN_ADDR")
                .unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
            redis_url: optional_env("TEMPBOX_REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_owned()),
            retention_seconds: parse_u64_env("TEMPBOX_RETENTION_SECONDS", 86_400)?,
            poll_seconds: parse_u64_env("TEMPBOX_POLL_SECONDS", 60)?,
            max_email_bytes: parse_usize_env("TEMPBOX_MAX_EMAIL_BYTES", 1_048_576)?,
            rate_limit_create_per_min: parse_u64_env("TEMPBOX_RATE_LIMIT_CREATE_PER_MIN", 10)?,
            rate_limit_fetch_per_min: parse_u64_env("TEMPBOX_RATE_LIMIT_FETCH_PER_MIN", 120)?,
            allowed_domains,
            imap,
            connect_timeout_ms: parse_u64_env("TEMPBOX_CONNECT_TIMEOUT_MS", 30_000)?,
            socket_timeout_ms: parse_u64_env("TEMPBOX_SOCKET_TIMEOUT_MS", 300_000)?,
            expiry_date: load_expiry_date(),
            admin_token: optional_env("TEMPBOX_ADMIN_TOKEN"),
        })
    }

    /// Whether the service is past end-of-day of its expiry date
    ///
    /// With no date configured, the service never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date
            .is_some_and(|date| now.date_naive() > date)
    }
}

/// Load the upstream account configuration from environment
fn load_imap_config() -> AppResult<ImapConfig> {
    let host = required_env("TEMPBOX_IMAP_HOST")?;
    let user = required_env("TEMPBOX_IMAP_USER")?;
    let pass = required_env("TEMPBOX_IMAP_PASS")?;

    let mut folders = parse_list_env("TEMPBOX_IMAP_FOLDERS")?;
    if folders.is_empty() {
        folders.push("INBOX".to_owned());
    }

    Ok(ImapConfig {
        host,
        port: parse_u16_env("TEMPBOX_IMAP_PORT", 993)?,
        user,
        pass: SecretString::new(pass.into()),
        folders,
        tls_verify: parse_bool_env("TEMPBOX_IMAP_TLS_VERIFY", true)?,
    })
}

/// Load the optional service-expiry date
///
/// A malformed value logs a warning and behaves as unset; startup never
/// fails on this.
fn load_expiry_date() -> Option<NaiveDate> {
    let raw = optional_env("TEMPBOX_EXPIRY_DATE")?;
    match parse_expiry_date(&raw) {
        Some(date) => Some(date),
        None => {
            tracing::warn!(value = %raw, "ignoring unparseable TEMPBOX_EXPIRY_DATE (expected DD/MM/YYYY)");
            None
        }
    }
}

/// Parse a `DD/MM/YYYY` service-expiry date
pub fn parse_expiry_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%d/%m/%Y").ok()
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable, treating empty as unset
fn optional_env(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Parse a comma-separated list environment variable
///
/// Entries are trimmed and lower-cased is NOT applied here; callers that
/// need normalized values (the allow-list) normalize on use. Unset or
/// empty yields an empty list.
fn parse_list_env(key: &str) -> AppResult<Vec<String>> {
    match env::var(key) {
        Ok(v) => Ok(parse_list_value(&v)),
        Err(VarError::NotPresent) => Ok(Vec::new()),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_list_value(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set to an unrecognized value.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` environment variable with default fallback
fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    match env::var(key) {
        Ok(v) => v.parse::<u16>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u64` environment variable with default fallback
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `usize` environment variable with default fallback
fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().map_err(|_| {
            AppError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{
        GatewayConfig, Role, parse_bool_value, parse_expiry_date, parse_list_value,
    };

    fn config_expiring(date: Option<NaiveDate>) -> GatewayConfig {
        GatewayConfig {
            role: Role::Api,
            listen_addr: "127.0.0.1:0".to_owned(),
            redis_url: "redis://127.0.0.1:6379".to_owned(),
            retention_seconds: 86_400,
            poll_seconds: 60,
            max_email_bytes: 1_048_576,
            rate_limit_create_per_min: 10,
            rate_limit_fetch_per_min: 120,
            allowed_domains: vec!["catty.my.id".to_owned()],
            imap: None,
            connect_timeout_ms: 30_000,
            socket_timeout_ms: 300_000,
            expiry_date: date,
            admin_token: None,
        }
    }

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn parse_list_value_trims_and_drops_empties() {
        assert_eq!(
            parse_list_value(" catty.my.id , inbox.example ,,"),
            vec!["catty.my.id".to_owned(), "inbox.example".to_owned()]
        );
        assert!(parse_list_value("").is_empty());
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!(Role::parse("API"), Some(Role::Api));
        assert_eq!(Role::parse(" ingestor "), Some(Role::Ingestor));
        assert_eq!(Role::parse("all"), Some(Role::All));
        assert_eq!(Role::parse("both"), None);
    }

    #[test]
    fn expiry_date_parses_day_month_year() {
        assert_eq!(
            parse_expiry_date("31/12/2026"),
            NaiveDate::from_ymd_opt(2026, 12, 31)
        );
        assert_eq!(parse_expiry_date("2026-12-31"), None);
        assert_eq!(parse_expiry_date("99/99/9999"), None);
    }

    #[test]
    fn service_expires_after_end_of_day() {
        let date = NaiveDate::from_ymd_opt(2026, 6, 1);
        let config = config_expiring(date);

        let same_day = Utc.with_ymd_and_hms(2026, 6, 1, 23, 59, 59).unwrap();
        assert!(!config.is_expired(same_day));

        let next_day = Utc.with_ymd_and_hms(2026, 6, 2, 0, 0, 1).unwrap();
        assert!(config.is_expired(next_day));
    }

    #[test]
    fn service_without_expiry_never_expires() {
        let config = config_expiring(None);
        let far_future = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
        assert!(!config.is_expired(far_future));
    }
}
