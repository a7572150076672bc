//! Message parsing and MIME handling
//!
//! Parses RFC822 messages using `mailparse` and assembles the stored
//! body: text/plain parts concatenate into `text`, text/html parts are
//! sanitized with `ammonia` and concatenate into `html`; attachments and
//! every other content type are dropped. HTML-only messages get a plain
//! text rendering so listings always have previewable text.

use mailparse::{DispositionType, MailHeader, ParsedMail};

use crate::errors::{AppError, AppResult};

/// Rendered width for the text fallback of HTML-only messages
const HTML_FALLBACK_WIDTH: usize = 80;

/// Parsed message representation
///
/// Carries everything the ingestor needs: the full header list for
/// recipient identification, the assembled bodies, and the
/// sender-declared date (callers fall back to the IMAP internal date
/// when absent or malformed).
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    /// All headers in order of appearance
    pub headers: Vec<(String, String)>,
    /// From header, possibly empty
    pub from: String,
    /// Subject header, possibly empty
    pub subject: String,
    /// Sender-declared Date as epoch seconds, when parseable
    pub date_epoch: Option<i64>,
    /// Concatenated text/plain bodies, or an HTML rendering fallback
    pub text: String,
    /// Concatenated sanitized text/html bodies
    pub html: String,
}

impl ParsedEmail {
    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find_map(|(k, v)| k.eq_ignore_ascii_case(name).then_some(v.as_str()))
    }
}

/// Parse an RFC822 message into the gateway's stored shape
///
/// # Errors
///
/// Returns `Parse` if `mailparse` rejects the message outright; the
/// ingestor logs and skips that single message.
pub fn parse_email(raw: &[u8]) -> AppResult<ParsedEmail> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Parse(format!("failed to parse RFC822 message: {e}")))?;

    let headers = to_tuples(&parsed.headers);
    let mut text = String::new();
    let mut html = String::new();
    collect_bodies(&parsed, &mut text, &mut html);

    if text.is_empty() && !html.is_empty() {
        text = html2text::from_read(html.as_bytes(), HTML_FALLBACK_WIDTH).unwrap_or_default();
    }

    let date_epoch = header_value(&headers, "date")
        .and_then(|raw_date| mailparse::dateparse(raw_date).ok());

    Ok(ParsedEmail {
        from: header_value(&headers, "from").unwrap_or_default().to_owned(),
        subject: header_value(&headers, "subject")
            .unwrap_or_default()
            .to_owned(),
        date_epoch,
        text,
        html,
        headers,
    })
}

/// Accumulate body text across MIME parts
///
/// Leaves with an attachment disposition (or a filename) are dropped.
/// Multipart containers are descended so alternative/mixed nesting still
/// yields both bodies.
fn collect_bodies(part: &ParsedMail<'_>, text: &mut String, html: &mut String) {
    if part.subparts.is_empty() {
        let disp = part.get_content_disposition();
        let is_attachment = disp.disposition == DispositionType::Attachment
            || disp.params.contains_key("filename")
            || part.ctype.params.contains_key("name");
        if is_attachment {
            return;
        }

        match part.ctype.mimetype.to_ascii_lowercase().as_str() {
            "text/plain" => {
                if let Ok(body) = part.get_body() {
                    push_body(text, &body);
                }
            }
            "text/html" => {
                if let Ok(body) = part.get_body() {
                    push_body(html, &ammonia::clean(&body));
                }
            }
            _ => {}
        }
        return;
    }

    for sub in &part.subparts {
        collect_bodies(sub, text, html);
    }
}

fn push_body(accumulator: &mut String, body: &str) {
    if !accumulator.is_empty() {
        accumulator.push('\n');
    }
    accumulator.push_str(body);
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find_map(|(k, v)| k.eq_ignore_ascii_case(name).then_some(v.as_str()))
}

fn to_tuples(headers: &[MailHeader<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::parse_email;

    #[test]
    fn parses_simple_plain_text_message() {
        let raw = b"From: sender@example.com\r\nTo: user@example.com\r\nSubject: Hi\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nHello there";
        let parsed = parse_email(raw).expect("parse should succeed");

        assert_eq!(parsed.subject, "Hi");
        assert_eq!(parsed.from, "sender@example.com");
        assert_eq!(parsed.header("to"), Some("user@example.com"));
        assert_eq!(parsed.text, "Hello there");
        assert!(parsed.html.is_empty());
        assert_eq!(parsed.date_epoch, Some(1_735_689_600));
    }

    #[test]
    fn concatenates_alternative_bodies() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "To: b@example.com\r\n",
            "Subject: multi\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n",
            "\r\n",
            "--XYZ\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain body\r\n",
            "--XYZ\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>html body</p>\r\n",
            "--XYZ--\r\n",
        )
        .as_bytes();
        let parsed = parse_email(raw).expect("parse should succeed");

        assert_eq!(parsed.text.trim(), "plain body");
        assert!(parsed.html.contains("html body"));
    }

    #[test]
    fn html_only_message_gets_text_fallback() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Subject: html only\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<html><body><p>Rendered content</p></body></html>\r\n",
        )
        .as_bytes();
        let parsed = parse_email(raw).expect("parse should succeed");

        assert!(parsed.html.contains("Rendered content"));
        assert!(parsed.text.contains("Rendered content"));
    }

    #[test]
    fn attachments_are_dropped_from_bodies() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n",
            "\r\n",
            "--XYZ\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "real body\r\n",
            "--XYZ\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"notes.txt\"\r\n",
            "\r\n",
            "attached text\r\n",
            "--XYZ--\r\n",
        )
        .as_bytes();
        let parsed = parse_email(raw).expect("parse should succeed");

        assert!(parsed.text.contains("real body"));
        assert!(!parsed.text.contains("attached text"));
    }

    #[test]
    fn missing_date_yields_no_epoch() {
        let raw = b"From: a@example.com\r\nSubject: undated\r\n\r\nbody";
        let parsed = parse_email(raw).expect("parse should succeed");
        assert_eq!(parsed.date_epoch, None);
    }
}
