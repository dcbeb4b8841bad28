//! # Owlivion Sweep - Mail Module
//!
//! IMAP transport: session handling, IDLE, searches, message extraction and
//! the move/delete actions applied by rules.

pub mod actions;
pub mod async_imap;
pub mod client;
pub mod config;
pub mod extract;
pub mod idle;
#[cfg(test)]
mod scripted;
pub mod search;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// Re-export commonly used types
pub use self::async_imap::AsyncImapClient;
pub use actions::ActionManager;
pub use client::{IdleHandle, MailClient};
pub use config::{ImapConfig, ImapConfigBuilder};
pub use extract::{FetchedAddress, FetchedMessage, MessageExtractor};
pub use idle::{mailbox_updates, IdleCommand, UpdateReceiver, UpdateSender};
pub use search::SearchManager;

/// Result type alias for mail operations
pub type MailResult<T> = Result<T, MailError>;

/// Matched UIDs keyed by the folder they belong to.
///
/// UIDs are only unique inside one mailbox, so every batch API keys its
/// results by folder name.
pub type UidsByMailbox = BTreeMap<String, Vec<u32>>;

/// Unified error type for mail operations
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Search criteria error: {0}")]
    Compile(String),

    #[error("Regex error: {0}")]
    Regex(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Action error: {0}")]
    Action(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    /// The local end of the connection is already gone.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// Errors raised while starting or stopping IDLE that only mean the
    /// connection dropped underneath us. These are recovered by reconnecting;
    /// everything else is fatal for the watch loop.
    pub fn is_benign_idle_error(&self) -> bool {
        matches!(self, MailError::ConnectionClosed(_))
    }
}

/// Mailbox metadata returned by SELECT
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxSelection {
    pub name: String,
    pub exists: u32,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
}

impl MailboxSelection {
    /// Highest UID currently assigned in the mailbox, derived from UIDNEXT.
    pub fn last_uid(&self) -> u32 {
        self.uid_next.map(|next| next.saturating_sub(1)).unwrap_or(0)
    }
}

pub const CAP_IDLE: &str = "IDLE";
pub const CAP_MOVE: &str = "MOVE";
pub const CAP_UIDPLUS: &str = "UIDPLUS";

/// Capabilities this client cares about
const KNOWN_CAPABILITIES: [&str; 3] = [CAP_IDLE, CAP_MOVE, CAP_UIDPLUS];

/// Server capabilities negotiated for the current session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    names: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|name| name.as_ref().trim().to_uppercase())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }

    /// Build the set by probing the capabilities we know how to use.
    pub fn from_lookup(has: impl Fn(&str) -> bool) -> Self {
        Self::new(KNOWN_CAPABILITIES.iter().filter(|name| has(name)))
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.contains(&name.to_uppercase())
    }
}

/// Flat per-message record extracted from a FETCH
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailData {
    pub uid: u32,
    pub from: Vec<String>,
    pub sender_domains: Vec<String>,
    pub reply_to_domains: Vec<String>,
    pub return_path_domains: Vec<String>,
    pub recipients: Vec<String>,
    pub recipient_tags: Vec<String>,
    pub cc: Vec<String>,
    pub list_id: String,
    pub list_unsubscribe: bool,
    pub list_unsubscribe_targets: Vec<String>,
    pub precedence_raw: String,
    pub precedence_category: String,
    pub x_mailer: String,
    pub user_agent: String,
    pub subject_raw: String,
    pub subject_normalized: String,
    pub body: String,
    pub message_date: Option<DateTime<Utc>>,
}

/// Render UIDs as a compact IMAP sequence set, e.g. `1:3,7`.
pub fn uid_set(uids: &[u32]) -> String {
    let mut sorted: Vec<u32> = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(next) = end.checked_add(1).filter(|next| iter.peek() == Some(next)) {
            end = next;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}:{}", start, end));
        }
    }
    parts.join(",")
}
