//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations
//! against the upstream catch-all mailbox. Connections are always TLS;
//! certificate verification is a config switch (`IMAP_TLS_VERIFY=false`
//! accepts self-signed certs, common on small catch-all hosts).

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::Fetch;
use async_imap::{Client, Session};
use chrono::NaiveDate;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::{GatewayConfig, ImapConfig};
use crate::errors::{AppError, AppResult};

/// Type alias for an authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Get socket timeout duration from gateway config
fn socket_timeout(config: &GatewayConfig) -> Duration {
    Duration::from_millis(config.socket_timeout_ms)
}

/// Connect to the upstream IMAP server and authenticate
///
/// Performs the full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake (webpki roots, or an accept-all verifier when
///    `tls_verify` is off)
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Errors
///
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if authentication fails
/// - `Imap` for TCP, TLS, or greeting failures
pub async fn connect_authenticated(
    config: &GatewayConfig,
    account: &ImapConfig,
) -> AppResult<ImapSession> {
    let connect_duration = Duration::from_millis(config.connect_timeout_ms);
    let io_duration = socket_timeout(config);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Imap(format!("tcp connect failed: {e}"))))?;

    let connector = tls_connector(account.tls_verify);
    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::Imap("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(io_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Imap(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(io_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Imap(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Imap(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = account.pass.expose_secret();
    let session = timeout(io_duration, client.login(account.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    AppError::AuthFailed(msg)
                } else {
                    AppError::Imap(msg)
                }
            })
        })?;

    Ok(session)
}

/// Build the TLS connector for the configured verification policy
fn tls_connector(verify: bool) -> TlsConnector {
    let tls_config = if verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(tls_config))
}

/// Select a folder in read-only mode
///
/// Uses `EXAMINE` so polling never mutates upstream message flags. A
/// failure here skips the folder (it may simply not exist on this
/// mailbox).
pub async fn examine_folder(
    config: &GatewayConfig,
    session: &mut ImapSession,
    folder: &str,
) -> AppResult<()> {
    timeout(socket_timeout(config), session.examine(folder))
        .await
        .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for folder '{folder}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::Imap(format!("cannot examine folder '{folder}': {e}")))
        })?;
    Ok(())
}

/// Search for candidate UIDs no older than the floor date
///
/// Runs `UID SEARCH SINCE <floor>` and returns matching UIDs in
/// ascending order. The caller filters to UIDs above the stored
/// high-water mark.
pub async fn uid_search_since(
    config: &GatewayConfig,
    session: &mut ImapSession,
    floor: NaiveDate,
) -> AppResult<Vec<u32>> {
    let query = format!("SINCE {}", imap_date(floor));
    let set = timeout(socket_timeout(config), session.uid_search(&query))
        .await
        .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Imap(format!("uid search failed: {e}"))))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

/// Fetch one message's UID, internal date, and full body
///
/// Uses `BODY.PEEK[]` so the fetch never marks the message as read.
///
/// # Errors
///
/// - `NotFound` if the UID vanished between search and fetch
/// - `Timeout` or `Imap` for network/protocol errors
pub async fn fetch_full(
    config: &GatewayConfig,
    session: &mut ImapSession,
    uid: u32,
) -> AppResult<Fetch> {
    use futures::TryStreamExt;

    let stream = timeout(
        socket_timeout(config),
        session.uid_fetch(uid.to_string(), "(UID INTERNALDATE BODY.PEEK[])"),
    )
    .await
    .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Imap(format!("uid fetch failed: {e}"))))?;
    let fetches: Vec<Fetch> = timeout(socket_timeout(config), stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Imap(format!("uid fetch stream failed: {e}"))))?;

    fetches
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))
}

/// Log out and drop the session
///
/// Failures are reported but harmless; the server reaps dead sessions.
pub async fn logout(config: &GatewayConfig, session: &mut ImapSession) -> AppResult<()> {
    timeout(socket_timeout(config), session.logout())
        .await
        .map_err(|_| AppError::Timeout("LOGOUT timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Imap(format!("LOGOUT failed: {e}"))))
}

/// Format a date as an IMAP SEARCH date (e.g., "1-Jan-2025")
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

/// Certificate verifier that accepts any certificate
///
/// Installed only when `IMAP_TLS_VERIFY=false`; catch-all mailboxes on
/// hosts with self-signed certs have no other option.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::imap_date;

    #[test]
    fn formats_search_dates_without_zero_padding() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date");
        assert_eq!(imap_date(date), "1-Jan-2025");

        let date = NaiveDate::from_ymd_opt(2025, 11, 30).expect("valid date");
        assert_eq!(imap_date(date), "30-Nov-2025");
    }
}
