//! Message extraction
//!
//! Peek-fetches envelope, a fixed set of header fields and the text part,
//! then flattens them into [`MailData`]. Headers that fail to parse degrade
//! to empty values instead of failing the fetch.

use super::{uid_set, MailData, MailError, MailResult};
use async_imap::types::Fetch;
use async_imap::Session;
use chrono::{DateTime, Utc};
use futures::io::{AsyncRead, AsyncWrite};
use futures::StreamExt;
use lazy_static::lazy_static;
use mailparse::{MailAddr, MailHeaderMap};
use regex_lite::Regex;
use std::collections::BTreeSet;
use std::fmt;

/// FETCH items. `BODY.PEEK` keeps `\Seen` untouched.
pub const FETCH_QUERY: &str = "(UID ENVELOPE INTERNALDATE \
    BODY.PEEK[HEADER.FIELDS (LIST-ID LIST-UNSUBSCRIBE PRECEDENCE X-MAILER USER-AGENT \
    REPLY-TO RETURN-PATH CONTENT-TYPE CONTENT-TRANSFER-ENCODING)] \
    BODY.PEEK[TEXT])";

lazy_static! {
    static ref SUBJECT_DATE_PATTERNS: [Regex; 2] = [
        Regex::new(r"\b\d{4}[-/]\d{1,2}[-/]\d{1,2}\b").unwrap(),
        Regex::new(r"\b\d{1,2}[-/]\d{1,2}[-/]\d{2,4}\b").unwrap(),
    ];
    static ref SUBJECT_MONTH_PATTERN: Regex =
        Regex::new(r"\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\b").unwrap();
    static ref SUBJECT_COUNTER_PATTERNS: [Regex; 2] = [
        Regex::new(r"\(\s*\d+\s*\)").unwrap(),
        Regex::new(r"#\d+").unwrap(),
    ];
    static ref SUBJECT_NUMBER_PATTERN: Regex = Regex::new(r"\d+").unwrap();
    static ref RECIPIENT_TAG_PATTERN: Regex = Regex::new(r"[^a-z0-9]").unwrap();
}

/// Address split the way ENVELOPE reports it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedAddress {
    pub mailbox: String,
    pub host: String,
}

impl FetchedAddress {
    pub fn new(mailbox: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            mailbox: mailbox.into(),
            host: host.into(),
        }
    }

    /// Split `local@host`; anything without a host keeps an empty host.
    pub fn parse(address: &str) -> Self {
        match address.rsplit_once('@') {
            Some((mailbox, host)) => Self::new(mailbox, host),
            None => Self::new(address, ""),
        }
    }

    pub fn address(&self) -> String {
        if self.host.is_empty() {
            self.mailbox.clone()
        } else {
            format!("{}@{}", self.mailbox, self.host)
        }
    }
}

/// Raw pieces of one FETCH response, before normalization
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    pub uid: u32,
    pub subject: Option<String>,
    pub date: Option<String>,
    pub from: Vec<FetchedAddress>,
    pub to: Vec<FetchedAddress>,
    pub cc: Vec<FetchedAddress>,
    pub header: Vec<u8>,
    pub text: Vec<u8>,
    pub internal_date: Option<DateTime<Utc>>,
}

impl FetchedMessage {
    /// Messages without UID or envelope are skipped.
    fn from_fetch(fetch: &Fetch) -> Option<Self> {
        let uid = fetch.uid?;
        let envelope = fetch.envelope()?;

        let lossy = |bytes: &[u8]| String::from_utf8_lossy(bytes).to_string();
        let addresses = |list: &Option<Vec<async_imap::imap_proto::Address<'_>>>| {
            list.iter()
                .flatten()
                .filter_map(|addr| {
                    let mailbox = addr.mailbox.as_deref().map(lossy)?;
                    // group start/end markers carry no host
                    let host = addr.host.as_deref().map(lossy)?;
                    Some(FetchedAddress::new(mailbox, host))
                })
                .collect::<Vec<_>>()
        };

        Some(Self {
            uid,
            subject: envelope.subject.as_deref().map(lossy),
            date: envelope.date.as_deref().map(lossy),
            from: addresses(&envelope.from),
            to: addresses(&envelope.to),
            cc: addresses(&envelope.cc),
            header: fetch.header().map(|h| h.to_vec()).unwrap_or_default(),
            text: fetch.text().map(|t| t.to_vec()).unwrap_or_default(),
            internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        })
    }
}

/// Fetches and normalizes messages
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageExtractor;

impl MessageExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Fetch UIDs from the selected mailbox without marking them seen.
    pub async fn fetch<T>(&self, session: &mut Session<T>, uids: &[u32]) -> MailResult<Vec<MailData>>
    where
        T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
    {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages_stream = session
            .uid_fetch(uid_set(uids), FETCH_QUERY)
            .await
            .map_err(|e| MailError::Fetch(e.to_string()))?;

        let mut rows = Vec::with_capacity(uids.len());
        while let Some(result) = messages_stream.next().await {
            let fetch = result.map_err(|e| MailError::Fetch(e.to_string()))?;
            match FetchedMessage::from_fetch(&fetch) {
                Some(message) => rows.push(self.extract(&message)),
                None => log::debug!("skipping FETCH response without uid/envelope"),
            }
        }

        rows.sort_by_key(|m| m.uid);
        log::debug!("fetched {} of {} message(s)", rows.len(), uids.len());
        Ok(rows)
    }

    /// Normalize one fetched message.
    pub fn extract(&self, message: &FetchedMessage) -> MailData {
        let headers = mailparse::parse_headers(&message.header)
            .map(|(headers, _)| headers)
            .unwrap_or_else(|e| {
                log::debug!("uid {}: unparseable header block: {}", message.uid, e);
                Vec::new()
            });
        let header_text = |name: &str| {
            headers
                .get_first_value(name)
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        let subject_raw = message
            .subject
            .as_deref()
            .map(decode_header_value)
            .unwrap_or_default();

        let list_unsubscribe_targets =
            parse_list_unsubscribe_targets(&headers.get_all_values("List-Unsubscribe"));
        let precedence_raw = header_text("Precedence");

        let message_date = message
            .date
            .as_deref()
            .and_then(|d| mailparse::dateparse(d).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or(message.internal_date);

        let has_content_headers = headers.get_first_header("Content-Type").is_some()
            || headers.get_first_header("Content-Transfer-Encoding").is_some();

        MailData {
            uid: message.uid,
            from: message.from.iter().map(FetchedAddress::address).collect(),
            sender_domains: host_set(message.from.iter().map(|a| a.host.as_str())),
            reply_to_domains: parse_reply_to_domains(&header_text("Reply-To")),
            return_path_domains: parse_return_path_domain(&header_text("Return-Path"))
                .into_iter()
                .collect(),
            recipients: message.to.iter().map(FetchedAddress::address).collect(),
            recipient_tags: message.to.iter().map(|a| recipient_tag(&a.mailbox)).collect(),
            cc: message.cc.iter().map(FetchedAddress::address).collect(),
            list_id: header_text("List-ID"),
            list_unsubscribe: !list_unsubscribe_targets.is_empty(),
            list_unsubscribe_targets,
            precedence_category: normalize_precedence(&precedence_raw),
            precedence_raw,
            x_mailer: header_text("X-Mailer"),
            user_agent: header_text("User-Agent"),
            subject_normalized: normalize_subject(&subject_raw),
            subject_raw,
            body: decode_body(&message.header, &message.text, has_content_headers),
            message_date,
        }
    }
}

/// Decode RFC 2047 encoded words in a raw header value.
pub fn decode_header_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.contains("=?") {
        return trimmed.to_string();
    }
    let line = format!("Subject: {}", trimmed);
    match mailparse::parse_header(line.as_bytes()) {
        Ok((header, _)) => header.get_value().trim().to_string(),
        Err(_) => trimmed.to_string(),
    }
}

/// Template a subject for clustering: dates removed, months become
/// `{{mm}}`, counters removed, remaining numbers become `{{n}}`.
pub fn normalize_subject(subject: &str) -> String {
    let mut normalized = subject.trim().to_lowercase();
    if normalized.is_empty() {
        return normalized;
    }
    for pattern in SUBJECT_DATE_PATTERNS.iter() {
        normalized = pattern.replace_all(&normalized, "").into_owned();
    }
    normalized = SUBJECT_MONTH_PATTERN
        .replace_all(&normalized, "{{mm}}")
        .into_owned();
    for pattern in SUBJECT_COUNTER_PATTERNS.iter() {
        normalized = pattern.replace_all(&normalized, "").into_owned();
    }
    normalized = SUBJECT_NUMBER_PATTERN
        .replace_all(&normalized, "{{n}}")
        .into_owned();
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lower-cased local part with everything outside `[a-z0-9]` mapped to `_`.
pub fn recipient_tag(local_part: &str) -> String {
    RECIPIENT_TAG_PATTERN
        .replace_all(&local_part.trim().to_lowercase(), "_")
        .into_owned()
}

/// Targets from every List-Unsubscribe occurrence: comma split, angle
/// brackets stripped, de-duplicated and sorted.
pub fn parse_list_unsubscribe_targets(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(|token| {
            let token = token.trim();
            let token = token.strip_prefix('<').unwrap_or(token);
            token.strip_suffix('>').unwrap_or(token).trim().to_string()
        })
        .filter(|target| !target.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn parse_reply_to_domains(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    let Ok(addresses) = mailparse::addrparse(raw) else {
        return Vec::new();
    };

    let mut singles = Vec::new();
    for addr in addresses.iter() {
        match addr {
            MailAddr::Single(info) => singles.push(info.addr.clone()),
            MailAddr::Group(group) => singles.extend(group.addrs.iter().map(|i| i.addr.clone())),
        }
    }
    host_set(singles.iter().filter_map(|a| a.split_once('@').map(|(_, host)| host)))
}

pub fn parse_return_path_domain(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let raw = raw.strip_prefix('<').unwrap_or(raw);
    let raw = raw.strip_suffix('>').unwrap_or(raw);

    let mut parts = raw.split('@');
    let (_local, host) = (parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let host = host.trim().to_lowercase();
    (!host.is_empty()).then_some(host)
}

/// `bulk` or `list`; anything else is uncategorized.
pub fn normalize_precedence(raw: &str) -> String {
    let normalized = raw.trim().to_lowercase();
    match normalized.as_str() {
        "bulk" | "list" => normalized,
        _ => String::new(),
    }
}

fn host_set<'a>(hosts: impl Iterator<Item = &'a str>) -> Vec<String> {
    hosts
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Decode the text part with its content headers, falling back to raw text.
fn decode_body(header: &[u8], text: &[u8], has_content_headers: bool) -> String {
    if has_content_headers {
        let mut raw = Vec::with_capacity(header.len() + text.len() + 2);
        raw.extend_from_slice(header);
        if !header.ends_with(b"\r\n\r\n") && !header.ends_with(b"\n\n") {
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(text);

        if let Some(message) = mail_parser::MessageParser::default().parse(&raw[..]) {
            if let Some(body) = message.body_text(0) {
                return body.to_string();
            }
        }
    }
    String::from_utf8_lossy(text).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fetched() -> FetchedMessage {
        FetchedMessage {
            uid: 12,
            subject: Some("=?UTF-8?Q?Weekly_Digest_#42?=".to_string()),
            date: Some("Tue, 05 Mar 2024 10:00:00 +0000".to_string()),
            from: vec![FetchedAddress::new("news", "Example.COM")],
            to: vec![FetchedAddress::new("Me+Shopping", "example.net")],
            cc: vec![FetchedAddress::new("friend", "example.org")],
            header: b"List-ID: Example News <id.mcsv.net>\r\n\
List-Unsubscribe: <mailto:u@example.com>, <https://example.com/u>\r\n\
Precedence: Bulk\r\n\
Reply-To: Help <help@Replies.example.com>, other@replies.example.com\r\n\
Return-Path: <bounce@Bounce.Example.com>\r\n\
\r\n"
                .to_vec(),
            text: b"Hello, click to unsubscribe".to_vec(),
            internal_date: None,
        }
    }

    #[test]
    fn test_fetch_query_only_peeks() {
        assert!(FETCH_QUERY.contains("BODY.PEEK[HEADER.FIELDS"));
        assert!(FETCH_QUERY.contains("BODY.PEEK[TEXT]"));
        assert!(!FETCH_QUERY.contains("BODY["));
        assert!(!FETCH_QUERY.contains("RFC822"));
    }

    #[test]
    fn test_extract_message() {
        let data = MessageExtractor::new().extract(&fetched());

        assert_eq!(data.uid, 12);
        assert_eq!(data.from, vec!["news@Example.COM"]);
        assert_eq!(data.sender_domains, vec!["example.com"]);
        assert_eq!(data.reply_to_domains, vec!["replies.example.com"]);
        assert_eq!(data.return_path_domains, vec!["bounce.example.com"]);
        assert_eq!(data.recipients, vec!["Me+Shopping@example.net"]);
        assert_eq!(data.recipient_tags, vec!["me_shopping"]);
        assert_eq!(data.cc, vec!["friend@example.org"]);
        assert_eq!(data.list_id, "Example News <id.mcsv.net>");
        assert!(data.list_unsubscribe);
        assert_eq!(
            data.list_unsubscribe_targets,
            vec!["https://example.com/u", "mailto:u@example.com"]
        );
        assert_eq!(data.precedence_raw, "Bulk");
        assert_eq!(data.precedence_category, "bulk");
        assert_eq!(data.subject_raw, "Weekly Digest #42");
        assert_eq!(data.subject_normalized, "weekly digest");
        assert_eq!(data.body, "Hello, click to unsubscribe");
        assert_eq!(
            data.message_date,
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_malformed_headers_degrade() {
        let mut message = fetched();
        message.header = b"\xff\xfe not a header block".to_vec();
        message.date = Some("yesterday-ish".to_string());
        message.internal_date = Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());

        let data = MessageExtractor::new().extract(&message);
        assert_eq!(data.list_id, "");
        assert!(!data.list_unsubscribe);
        assert!(data.return_path_domains.is_empty());
        assert_eq!(data.sender_domains, vec!["example.com"]);
        assert_eq!(data.message_date, message.internal_date);
    }

    #[test]
    fn test_quoted_printable_body_decoded() {
        let mut message = fetched();
        message.header = b"Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\r\n"
            .to_vec();
        message.text = b"Caf=C3=A9 updates".to_vec();

        let data = MessageExtractor::new().extract(&message);
        assert_eq!(data.body.trim(), "Café updates");
    }

    #[test]
    fn test_normalize_subject() {
        assert_eq!(
            normalize_subject("Your March statement 2024-03-01 (3) #12"),
            "your {{mm}} statement"
        );
        assert_eq!(normalize_subject("Order 12345 shipped"), "order {{n}} shipped");
        assert_eq!(normalize_subject("  "), "");
    }

    #[test]
    fn test_recipient_tag() {
        assert_eq!(recipient_tag("John.Doe+News"), "john_doe_news");
    }

    #[test]
    fn test_return_path_domain() {
        assert_eq!(
            parse_return_path_domain("<b@Mail.Example.com>"),
            Some("mail.example.com".to_string())
        );
        assert_eq!(parse_return_path_domain("<>"), None);
        assert_eq!(parse_return_path_domain("a@b@c"), None);
    }

    #[test]
    fn test_precedence() {
        assert_eq!(normalize_precedence(" LIST "), "list");
        assert_eq!(normalize_precedence("junk"), "");
    }
}
