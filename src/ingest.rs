//! IMAP ingestion pipeline
//!
//! A single periodic task. Each tick refreshes the dynamic configuration
//! layer, opens one TLS session to the upstream catch-all mailbox, and
//! drains every configured folder: UIDs above the stored high-water mark
//! (bounded by a retention-window SINCE floor) are fetched, parsed,
//! demultiplexed by original recipient, and written to the store in one
//! pipelined transaction each, followed by a pub/sub notification.
//!
//! Nothing in a cycle is fatal. A per-message error skips the message, a
//! per-folder error skips the folder, a connection error aborts the
//! cycle; the next tick retries. High-water marks advance to the maximum
//! UID observed even across skips, so a poisoned message cannot wedge a
//! folder.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use secrecy::SecretString;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allowlist::AllowList;
use crate::config::{GatewayConfig, ImapConfig};
use crate::errors::{AppError, AppResult};
use crate::imap::{self, ImapSession};
use crate::message_id::new_message_id;
use crate::mime;
use crate::models::StoredMessage;
use crate::recipient;
use crate::store::Store;

/// The periodic catch-all ingestor
pub struct Ingestor {
    config: Arc<GatewayConfig>,
    account: ImapConfig,
    store: Store,
}

impl Ingestor {
    /// Build an ingestor; the config must carry an IMAP account
    pub fn new(config: Arc<GatewayConfig>, store: Store) -> AppResult<Self> {
        let account = config.imap.clone().ok_or_else(|| {
            AppError::InvalidInput(
                "ingestor role requires TEMPBOX_IMAP_HOST/USER/PASS".to_owned(),
            )
        })?;
        Ok(Self {
            config,
            account,
            store,
        })
    }

    /// Run the polling loop until shutdown
    ///
    /// The first tick fires immediately; afterwards the loop runs every
    /// `poll_seconds`. Cycle failures are logged at warn and retried on
    /// the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_seconds = self.config.poll_seconds,
            "ingestor started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("ingestor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.cycle(&shutdown).await {
                        warn!(%error, "ingestion cycle failed, retrying next tick");
                    }
                }
            }
        }
    }

    /// One ingestion cycle
    ///
    /// Refreshes dynamic inputs, opens one session, processes every
    /// folder, logs out.
    async fn cycle(&self, shutdown: &CancellationToken) -> AppResult<()> {
        let allow = self.refresh_allow_list().await;
        let account = self.effective_account().await;

        let mut session = imap::connect_authenticated(&self.config, &account).await?;
        let floor = (Utc::now() - ChronoDuration::seconds(self.config.retention_seconds as i64))
            .date_naive();

        for folder in &account.folders {
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(error) = self
                .process_folder(&mut session, &account, folder, floor, &allow, shutdown)
                .await
            {
                warn!(folder, %error, "folder skipped");
            }
        }

        if let Err(error) = imap::logout(&self.config, &mut session).await {
            debug!(%error, "logout failed");
        }
        Ok(())
    }

    /// Merge the static allow-list with a fresh dynamic read
    ///
    /// A store failure here keeps the static list; demultiplexing must
    /// not stall on a store blip.
    async fn refresh_allow_list(&self) -> AllowList {
        let mut allow = AllowList::from_static(&self.config.allowed_domains);
        match self.store.dynamic_domains().await {
            Ok(dynamic) => allow.set_dynamic(dynamic),
            Err(error) => warn!(%error, "dynamic domain read failed, using static allow-list"),
        }
        allow
    }

    /// The static IMAP account with dynamic overrides applied
    async fn effective_account(&self) -> ImapConfig {
        let mut account = self.account.clone();

        match self.store.imap_overrides().await {
            Ok(overrides) => {
                if let Some(host) = overrides.host {
                    account.host = host;
                }
                if let Some(port) = overrides.port {
                    account.port = port;
                }
                if let Some(user) = overrides.user {
                    account.user = user;
                }
                if let Some(pass) = overrides.pass {
                    account.pass = SecretString::new(pass.into());
                }
            }
            Err(error) => warn!(%error, "imap override read failed, using static credentials"),
        }
        account
    }

    /// Drain one folder
    ///
    /// Selects read-only, computes the candidate UID set (search mode:
    /// `SINCE` floor, filtered above the high-water mark), processes
    /// ascending, then advances the mark to the maximum UID observed —
    /// even when messages were skipped, so the folder always makes
    /// progress.
    async fn process_folder(
        &self,
        session: &mut ImapSession,
        account: &ImapConfig,
        folder: &str,
        floor: chrono::NaiveDate,
        allow: &AllowList,
        shutdown: &CancellationToken,
    ) -> AppResult<()> {
        imap::examine_folder(&self.config, session, folder).await?;

        let highwater = self.store.highwater(&account.user, folder).await?;
        let uids = imap::uid_search_since(&self.config, session, floor).await?;
        let candidates = candidates_above(uids, highwater);
        if candidates.is_empty() {
            return Ok(());
        }
        debug!(folder, count = candidates.len(), highwater, "processing candidates");

        let mut max_observed = highwater;
        for uid in candidates {
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(error) = self.process_message(session, account, folder, uid, allow).await {
                warn!(folder, uid, %error, "message skipped");
            }
            max_observed = uid;
        }

        if max_observed > highwater {
            self.store
                .advance_highwater(&account.user, folder, max_observed)
                .await?;
        }
        Ok(())
    }

    /// Ingest one message
    ///
    /// Dedup check, fetch, size gate, parse, recipient identification,
    /// pipelined write, publish. Skips (dedup hit, oversized, no
    /// allow-listed recipient) return `Ok` so the high-water mark still
    /// advances past them.
    async fn process_message(
        &self,
        session: &mut ImapSession,
        account: &ImapConfig,
        folder: &str,
        uid: u32,
        allow: &AllowList,
    ) -> AppResult<()> {
        if self.store.dedup_seen(folder, uid).await? {
            debug!(folder, uid, "already ingested");
            return Ok(());
        }

        let fetch = imap::fetch_full(&self.config, session, uid).await?;
        let raw = fetch
            .body()
            .ok_or_else(|| AppError::Parse(format!("uid {uid} fetch returned no body")))?;

        if raw.len() > self.config.max_email_bytes {
            info!(folder, uid, bytes = raw.len(), "skipping oversized message");
            self.store.mark_dedup(folder, uid).await?;
            return Ok(());
        }

        let email = mime::parse_email(raw)?;
        let Some(recipient) = recipient::identify(&email, allow) else {
            debug!(folder, uid, "no allow-listed recipient, discarding");
            return Ok(());
        };

        let internal_epoch = fetch.internal_date().map(|d| d.timestamp());
        let epoch = message_date(email.date_epoch, internal_epoch, Utc::now().timestamp());
        let date = DateTime::from_timestamp(epoch, 0)
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let message = StoredMessage {
            id: new_message_id(),
            domain: recipient.domain,
            local: recipient.local,
            original_to: recipient.address,
            from: email.from,
            subject: email.subject,
            date,
            text: email.text,
            html: email.html,
            folder: folder.to_owned(),
            uid,
        };

        self.store.put_message(&message, epoch).await?;
        info!(
            folder,
            uid,
            id = %message.id,
            inbox = %format!("{}@{}", message.local, message.domain),
            "message ingested"
        );
        Ok(())
    }
}

/// Filter search results to UIDs strictly above the high-water mark
///
/// Ascending order is preserved so an interrupted batch leaves the mark
/// at the last attempted UID.
fn candidates_above(uids: Vec<u32>, highwater: u32) -> Vec<u32> {
    uids.into_iter().filter(|uid| *uid > highwater).collect()
}

/// Pick the message date: sender-declared, else server internal, else now
fn message_date(declared: Option<i64>, internal: Option<i64>, now: i64) -> i64 {
    declared.or(internal).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::{candidates_above, message_date};

    #[test]
    fn candidates_are_strictly_above_the_mark_in_order() {
        assert_eq!(candidates_above(vec![40, 41, 42, 43, 44], 42), vec![43, 44]);
        assert_eq!(candidates_above(vec![1, 2, 3], 0), vec![1, 2, 3]);
        assert!(candidates_above(vec![1, 2, 3], 3).is_empty());
    }

    #[test]
    fn message_date_prefers_declared_then_internal() {
        assert_eq!(message_date(Some(100), Some(200), 300), 100);
        assert_eq!(message_date(None, Some(200), 300), 200);
        assert_eq!(message_date(None, None, 300), 300);
    }
}
