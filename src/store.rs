//! Redis-backed state store
//!
//! The store is the only state shared between the API and the ingestor.
//! Every user-visible key carries the retention TTL; high-water marks and
//! the dynamic config layer are the only persistent keys. Writes are
//! single-key or a single atomic pipeline; address reservation relies on
//! the store's SET NX semantics rather than simulating a lock.
//!
//! Key namespaces:
//!
//! - `addr:{domain}:{local}` — reservation sentinel, TTL `R`
//! - `msg:{id}` — message record JSON, TTL `R`
//! - `inbox:{domain}:{local}` — sorted set, score = date epoch seconds,
//!   TTL `R` reset on insert; doubles as the pub/sub channel name
//! - `imap:uid:{folder}:{uid}` — dedup marker, TTL `R`
//! - `imap:last_uid:{user}:{folder}` — folder high-water mark, persistent
//! - `config:domains`, `config:imap:*` — dynamic configuration, persistent
//! - `ratelimit:{action}:{client}` — fixed-window counter, TTL 60 s

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::errors::{AppError, AppResult};
use crate::models::StoredMessage;

/// Rate-limit window length in seconds
const RATE_WINDOW_SECONDS: i64 = 60;

/// Dynamic IMAP credential overrides read from `config:imap:*`
///
/// Any field may be absent; present fields replace the static
/// configuration for the next ingestion cycle.
#[derive(Debug, Clone, Default)]
pub struct ImapOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

/// Shared handle to the redis store
///
/// Cheap to clone; the connection manager multiplexes and reconnects
/// internally. A dedicated pub/sub connection is opened per subscriber
/// from the retained client.
#[derive(Clone)]
pub struct Store {
    client: redis::Client,
    conn: ConnectionManager,
    retention_seconds: i64,
}

impl Store {
    /// Connect to redis and verify the connection with a PING
    ///
    /// An unreachable store at boot is fatal to the process; callers exit
    /// non-zero on error here.
    pub async fn connect(redis_url: &str, retention_seconds: u64) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Internal(format!("invalid redis url: {e}")))?;
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            client,
            conn,
            retention_seconds: retention_seconds as i64,
        })
    }

    /// Liveness probe for `/readyz`
    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    // ----- address reservation -----

    /// Claim an address if unclaimed (SET NX EX)
    ///
    /// Returns `true` when this call created the reservation, `false`
    /// when the address was already held.
    pub async fn reserve_address(&self, domain: &str, local: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(keys::addr(domain, local))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.retention_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    /// Claim or refresh an address unconditionally (SET EX)
    ///
    /// Creates the reservation or resets its TTL to the full retention
    /// window.
    pub async fn refresh_address(&self, domain: &str, local: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("SET")
            .arg(keys::addr(domain, local))
            .arg("1")
            .arg("EX")
            .arg(self.retention_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    // ----- message records and inbox index -----

    /// Persist one ingested message and notify subscribers
    ///
    /// Record, inbox index insert, index TTL reset, and dedup marker go
    /// in one atomic pipeline; the publish follows so subscribers never
    /// see an id before its record is readable.
    pub async fn put_message(&self, message: &StoredMessage, score: i64) -> AppResult<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| AppError::Internal(format!("serializing message record: {e}")))?;
        let inbox_key = keys::inbox(&message.domain, &message.local);

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(keys::msg(&message.id))
            .arg(&json)
            .arg("EX")
            .arg(self.retention_seconds)
            .ignore()
            .cmd("ZADD")
            .arg(&inbox_key)
            .arg(score)
            .arg(&message.id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&inbox_key)
            .arg(self.retention_seconds)
            .ignore()
            .cmd("SET")
            .arg(keys::dedup(&message.folder, message.uid))
            .arg("1")
            .arg("EX")
            .arg(self.retention_seconds)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        let _: i64 = redis::cmd("PUBLISH")
            .arg(&inbox_key)
            .arg(&message.id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// List an inbox newest-first
    ///
    /// `before > 0` is an exclusive upper score bound in epoch seconds.
    /// Ids whose record has already expired are silently dropped.
    pub async fn list_inbox(
        &self,
        domain: &str,
        local: &str,
        limit: usize,
        before: i64,
    ) -> AppResult<Vec<StoredMessage>> {
        let mut conn = self.conn.clone();
        let max = if before > 0 {
            format!("({before}")
        } else {
            "+inf".to_owned()
        };
        let ids: Vec<String> = redis::cmd("ZREVRANGEBYSCORE")
            .arg(keys::inbox(domain, local))
            .arg(max)
            .arg("-inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let msg_keys: Vec<String> = ids.iter().map(|id| keys::msg(id)).collect();
        let records: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&msg_keys)
            .query_async(&mut conn)
            .await?;

        let mut messages = Vec::with_capacity(records.len());
        for record in records.into_iter().flatten() {
            match serde_json::from_str::<StoredMessage>(&record) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(error = %e, "dropping undecodable message record"),
            }
        }
        Ok(messages)
    }

    /// Fetch one message record
    pub async fn get_message(&self, id: &str) -> AppResult<Option<StoredMessage>> {
        let mut conn = self.conn.clone();
        let record: Option<String> = conn.get(keys::msg(id)).await?;
        match record {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| AppError::Internal(format!("decoding message record: {e}"))),
            None => Ok(None),
        }
    }

    /// Remove a message record and its inbox index member
    ///
    /// Reads the record to learn its inbox, then deletes both in one
    /// atomic pipeline.
    pub async fn delete_message(&self, id: &str) -> AppResult<()> {
        let message = self
            .get_message(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message '{id}' does not exist")))?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(keys::msg(id))
            .ignore()
            .cmd("ZREM")
            .arg(keys::inbox(&message.domain, &message.local))
            .arg(id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    // ----- ingestion bookkeeping -----

    /// Whether a `(folder, uid)` was already ingested inside retention
    pub async fn dedup_seen(&self, folder: &str, uid: u32) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let seen: bool = conn.exists(keys::dedup(folder, uid)).await?;
        Ok(seen)
    }

    /// Write a dedup marker without a record
    ///
    /// Used when a message is skipped (oversized) so a high-water reset
    /// inside retention cannot resurrect it.
    pub async fn mark_dedup(&self, folder: &str, uid: u32) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("SET")
            .arg(keys::dedup(folder, uid))
            .arg("1")
            .arg("EX")
            .arg(self.retention_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Read the high-water mark for `(user, folder)`
    ///
    /// Scoping by user prevents a stale mark from a prior mailbox from
    /// blackholing a replacement mailbox.
    pub async fn highwater(&self, user: &str, folder: &str) -> AppResult<u32> {
        let mut conn = self.conn.clone();
        let mark: Option<u32> = conn.get(keys::highwater(user, folder)).await?;
        Ok(mark.unwrap_or(0))
    }

    /// Advance the high-water mark, keeping it non-decreasing
    ///
    /// The ingestor is the single writer; a read-compare-write suffices.
    pub async fn advance_highwater(&self, user: &str, folder: &str, uid: u32) -> AppResult<()> {
        if uid <= self.highwater(user, folder).await? {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.set(keys::highwater(user, folder), uid).await?;
        Ok(())
    }

    // ----- dynamic configuration -----

    /// Read the dynamic domain set `config:domains`
    pub async fn dynamic_domains(&self) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let domains: Vec<String> = conn.smembers(keys::CONFIG_DOMAINS).await?;
        Ok(domains)
    }

    /// Add a domain to the dynamic set
    pub async fn add_dynamic_domain(&self, domain: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .sadd(keys::CONFIG_DOMAINS, domain.trim().to_ascii_lowercase())
            .await?;
        Ok(())
    }

    /// Remove a domain from the dynamic set
    ///
    /// Callers refuse removal of static domains before reaching here.
    pub async fn remove_dynamic_domain(&self, domain: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .srem(keys::CONFIG_DOMAINS, domain.trim().to_ascii_lowercase())
            .await?;
        Ok(())
    }

    /// Read the dynamic IMAP credential overrides `config:imap:*`
    pub async fn imap_overrides(&self) -> AppResult<ImapOverrides> {
        let mut conn = self.conn.clone();
        let (host, port, user, pass): (
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = redis::cmd("MGET")
            .arg("config:imap:host")
            .arg("config:imap:port")
            .arg("config:imap:user")
            .arg("config:imap:pass")
            .query_async(&mut conn)
            .await?;

        Ok(ImapOverrides {
            host,
            port: port.and_then(|p| p.parse().ok()),
            user,
            pass,
        })
    }

    // ----- rate limiting -----

    /// Bump the fixed-window counter for `(action, client)`
    ///
    /// Increment and window expiry go in one atomic pipeline; returns the
    /// post-increment count.
    pub async fn rate_incr(&self, action: &str, client: &str) -> AppResult<u64> {
        let mut conn = self.conn.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(keys::ratelimit(action, client))
            .cmd("EXPIRE")
            .arg(keys::ratelimit(action, client))
            .arg(RATE_WINDOW_SECONDS)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    // ----- pub/sub -----

    /// Open a dedicated subscription to one inbox channel
    ///
    /// Notifications are at-most-once to subscribers present at publish
    /// time; late joiners reconcile by re-listing.
    pub async fn subscribe(&self, domain: &str, local: &str) -> AppResult<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(keys::inbox(domain, local)).await?;
        Ok(pubsub)
    }
}

/// Key construction for every namespace
///
/// Kept together so the schema reads in one place.
pub mod keys {
    /// Dynamic allow-list set
    pub const CONFIG_DOMAINS: &str = "config:domains";

    /// Address reservation sentinel
    pub fn addr(domain: &str, local: &str) -> String {
        format!("addr:{domain}:{local}")
    }

    /// Message record
    pub fn msg(id: &str) -> String {
        format!("msg:{id}")
    }

    /// Inbox index; also the pub/sub channel for that inbox
    pub fn inbox(domain: &str, local: &str) -> String {
        format!("inbox:{domain}:{local}")
    }

    /// Dedup marker for an ingested `(folder, uid)`
    pub fn dedup(folder: &str, uid: u32) -> String {
        format!("imap:uid:{folder}:{uid}")
    }

    /// Folder high-water mark, scoped by upstream user
    pub fn highwater(user: &str, folder: &str) -> String {
        format!("imap:last_uid:{user}:{folder}")
    }

    /// Fixed-window rate counter
    pub fn ratelimit(action: &str, client: &str) -> String {
        format!("ratelimit:{action}:{client}")
    }
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn keys_follow_the_documented_schema() {
        assert_eq!(keys::addr("catty.my.id", "alice"), "addr:catty.my.id:alice");
        assert_eq!(keys::msg("01890abc"), "msg:01890abc");
        assert_eq!(
            keys::inbox("catty.my.id", "alice"),
            "inbox:catty.my.id:alice"
        );
        assert_eq!(keys::dedup("INBOX", 42), "imap:uid:INBOX:42");
        assert_eq!(
            keys::highwater("catchall@upstream.example", "INBOX"),
            "imap:last_uid:catchall@upstream.example:INBOX"
        );
        assert_eq!(
            keys::ratelimit("create", "203.0.113.7"),
            "ratelimit:create:203.0.113.7"
        );
    }

    #[test]
    fn inbox_key_doubles_as_channel_name() {
        // Subscribers listen on exactly the key the writer publishes to.
        assert_eq!(
            keys::inbox("catty.my.id", "alice"),
            "inbox:catty.my.id:alice"
        );
    }
}
