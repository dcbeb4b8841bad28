//! Server-side search criteria
//!
//! Compiles declarative server matchers into an IMAP SEARCH tree. The tree
//! is built fresh for every search and rendered straight into a UID SEARCH
//! query string.

use super::conditions::ServerMatchers;
use crate::mail::{MailError, MailResult};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::fmt;

/// System flags the compiler searches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFlag {
    Seen,
    Deleted,
}

impl SearchFlag {
    fn keyword(self, set: bool) -> &'static str {
        match (self, set) {
            (SearchFlag::Seen, true) => "SEEN",
            (SearchFlag::Seen, false) => "UNSEEN",
            (SearchFlag::Deleted, true) => "DELETED",
            (SearchFlag::Deleted, false) => "UNDELETED",
        }
    }
}

/// Boolean IMAP search tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    /// Every message in the mailbox
    All,
    /// `UID n:*`
    UidFrom(u32),
    Flag { flag: SearchFlag, set: bool },
    /// Header substring test; an empty value tests for header presence
    Header { name: String, value: String },
    Body(String),
    /// Internal date on or after the given day
    Since(NaiveDate),
    /// Internal date strictly before the given day
    Before(NaiveDate),
    And(Vec<SearchCriteria>),
    Or(Box<SearchCriteria>, Box<SearchCriteria>),
    Not(Box<SearchCriteria>),
}

impl SearchCriteria {
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        SearchCriteria::Header {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn or(left: SearchCriteria, right: SearchCriteria) -> Self {
        SearchCriteria::Or(Box::new(left), Box::new(right))
    }

    pub fn not(inner: SearchCriteria) -> Self {
        SearchCriteria::Not(Box::new(inner))
    }

    /// Criteria for every UID strictly greater than `last_uid`.
    pub fn uids_newer_than(last_uid: u32) -> Self {
        SearchCriteria::UidFrom(last_uid.saturating_add(1))
    }

    /// True if a top-level conjunct excludes `\Deleted` messages.
    pub fn excludes_deleted(&self) -> bool {
        let undeleted = SearchCriteria::Flag {
            flag: SearchFlag::Deleted,
            set: false,
        };
        match self {
            SearchCriteria::And(items) => items.contains(&undeleted),
            other => *other == undeleted,
        }
    }

    /// Query string for UID SEARCH, with a CHARSET prefix when needed.
    pub fn to_search_query(&self) -> String {
        if self.has_non_ascii() {
            format!("CHARSET UTF-8 {}", self)
        } else {
            self.to_string()
        }
    }

    fn has_non_ascii(&self) -> bool {
        match self {
            SearchCriteria::Header { name, value } => !name.is_ascii() || !value.is_ascii(),
            SearchCriteria::Body(value) => !value.is_ascii(),
            SearchCriteria::And(items) => items.iter().any(|c| c.has_non_ascii()),
            SearchCriteria::Or(left, right) => left.has_non_ascii() || right.has_non_ascii(),
            SearchCriteria::Not(inner) => inner.has_non_ascii(),
            _ => false,
        }
    }

    fn render(&self, nested: bool) -> String {
        match self {
            SearchCriteria::All => "ALL".to_string(),
            SearchCriteria::UidFrom(start) => format!("UID {}:*", start),
            SearchCriteria::Flag { flag, set } => flag.keyword(*set).to_string(),
            SearchCriteria::Header { name, value } => {
                format!("HEADER {} {}", quote(name), quote(value))
            }
            SearchCriteria::Body(value) => format!("BODY {}", quote(value)),
            SearchCriteria::Since(date) => format!("SINCE {}", imap_date(date)),
            SearchCriteria::Before(date) => format!("BEFORE {}", imap_date(date)),
            SearchCriteria::And(items) => match items.len() {
                0 => "ALL".to_string(),
                1 => items[0].render(nested),
                _ => {
                    let joined = items
                        .iter()
                        .map(|c| c.render(true))
                        .collect::<Vec<_>>()
                        .join(" ");
                    if nested {
                        format!("({})", joined)
                    } else {
                        joined
                    }
                }
            },
            SearchCriteria::Or(left, right) => {
                format!("OR {} {}", left.render(true), right.render(true))
            }
            SearchCriteria::Not(inner) => format!("NOT {}", inner.render(true)),
        }
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(false))
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn imap_date(date: &NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

/// Compile server matchers relative to the current time.
pub fn compile(matchers: &ServerMatchers) -> MailResult<SearchCriteria> {
    compile_at(matchers, Utc::now())
}

/// Compile server matchers relative to `now`.
///
/// Values inside one category are AND-ed: listing two body substrings
/// requires both. Each recipient value is a To-or-Cc test.
pub fn compile_at(matchers: &ServerMatchers, now: DateTime<Utc>) -> MailResult<SearchCriteria> {
    let mut criteria = vec![SearchCriteria::Flag {
        flag: SearchFlag::Deleted,
        set: false,
    }];

    if let Some(window) = &matchers.age_window {
        if let Some(max) = non_blank(window.max.as_deref()) {
            let age = parse_relative_duration(max)
                .map_err(|e| MailError::Compile(format!("invalid age_window.max: {}", e)))?;
            criteria.push(SearchCriteria::Since(day_before(now, age, "max")?));
        }
        if let Some(min) = non_blank(window.min.as_deref()) {
            let age = parse_relative_duration(min)
                .map_err(|e| MailError::Compile(format!("invalid age_window.min: {}", e)))?;
            criteria.push(SearchCriteria::Before(day_before(now, age, "min")?));
        }
    }

    push_group(&mut criteria, "sender_substring", &matchers.sender_substring, |v| {
        SearchCriteria::header("From", v)
    })?;
    push_group(&mut criteria, "recipients", &matchers.recipients, |v| {
        SearchCriteria::or(SearchCriteria::header("To", v), SearchCriteria::header("Cc", v))
    })?;
    push_group(&mut criteria, "cc_substring", &matchers.cc_substring, |v| {
        SearchCriteria::header("Cc", v)
    })?;
    push_group(&mut criteria, "return_path_substring", &matchers.return_path_substring, |v| {
        SearchCriteria::header("Return-Path", v)
    })?;
    push_group(&mut criteria, "body_substring", &matchers.body_substring, |v| {
        SearchCriteria::Body(v.to_string())
    })?;
    push_group(&mut criteria, "reply_to_substring", &matchers.reply_to_substring, |v| {
        SearchCriteria::header("Reply-To", v)
    })?;
    push_group(&mut criteria, "list_id_substring", &matchers.list_id_substring, |v| {
        SearchCriteria::header("List-ID", v)
    })?;

    if let Some(seen) = matchers.seen {
        criteria.push(SearchCriteria::Flag {
            flag: SearchFlag::Seen,
            set: seen,
        });
    }
    if let Some(list_unsubscribe) = matchers.list_unsubscribe {
        let present = SearchCriteria::header("List-Unsubscribe", "");
        if list_unsubscribe {
            criteria.push(present);
        } else {
            criteria.push(SearchCriteria::not(present));
        }
    }

    Ok(SearchCriteria::And(criteria))
}

fn day_before(now: DateTime<Utc>, age: Duration, bound: &str) -> MailResult<NaiveDate> {
    now.checked_sub_signed(age)
        .map(|at| at.date_naive())
        .ok_or_else(|| MailError::Compile(format!("age_window.{} is out of range", bound)))
}

fn push_group(
    criteria: &mut Vec<SearchCriteria>,
    field: &str,
    values: &[String],
    build: impl Fn(&str) -> SearchCriteria,
) -> MailResult<()> {
    let mut group = Vec::with_capacity(values.len());
    for value in values {
        if value.trim().is_empty() {
            continue;
        }
        if value.contains(['\r', '\n', '\0']) {
            return Err(MailError::Compile(format!(
                "{} value {:?} contains a line break",
                field, value
            )));
        }
        group.push(build(value));
    }

    match group.len() {
        0 => {}
        1 => criteria.extend(group),
        _ => criteria.push(SearchCriteria::And(group)),
    }
    Ok(())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Parse a relative duration such as `36h`, `1h30m` or `2.5d`.
///
/// A `d` suffix is fractional days; otherwise the value is a sequence of
/// number/unit pairs using `h`, `m`, `s`, `ms`, `us`/`µs` or `ns`. Blank
/// input and a bare `0` are zero.
pub fn parse_relative_duration(value: &str) -> Result<Duration, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Duration::zero());
    }
    if trimmed.starts_with('-') {
        return Err(format!("duration {:?} must be positive", trimmed));
    }
    if matches!(trimmed.trim_start_matches('+'), "0") {
        return Ok(Duration::zero());
    }

    if let Some(days) = trimmed.strip_suffix('d') {
        let days: f64 = days
            .trim()
            .parse()
            .map_err(|_| format!("invalid day count in {:?}", trimmed))?;
        if !days.is_finite() || days < 0.0 {
            return Err(format!("duration {:?} must be positive", trimmed));
        }
        return milliseconds(days * 86_400_000.0, trimmed);
    }

    let mut total_ms = 0f64;
    let mut rest = trimmed.trim_start_matches('+');
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration {:?}", trimmed));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid duration {:?}", trimmed))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3_600_000.0,
            "m" => 60_000.0,
            "s" => 1_000.0,
            "ms" => 1.0,
            "us" | "µs" | "μs" => 0.001,
            "ns" => 0.000_001,
            "" => return Err(format!("missing unit in duration {:?}", trimmed)),
            unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, trimmed)),
        };
        rest = &rest[unit_len..];
        total_ms += number * scale;
    }

    milliseconds(total_ms, trimmed)
}

fn milliseconds(total_ms: f64, input: &str) -> Result<Duration, String> {
    // Duration::milliseconds panics past i64::MAX / 1000
    if !total_ms.is_finite() || total_ms >= (i64::MAX / 1_000) as f64 {
        return Err(format!("duration {:?} is out of range", input));
    }
    Ok(Duration::milliseconds(total_ms as i64))
}
