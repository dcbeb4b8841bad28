//! Sync Module - applying rules to a live mailbox
//!
//! - `watch`: long-lived IDLE loop evaluating client rules per new message
//! - `cleanup`: one-shot batch over server rules, acting per folder
//! - `announce`: reporting matches to the log or a webhook

pub mod announce;
pub mod cleanup;
pub mod watch;


pub use announce::{Announcer, LogAnnouncer, WebhookAnnouncer};
pub use cleanup::{CleanupReport, CleanupRunner};
pub use watch::{test_rule, WatchRunner, WatchState, DEFAULT_MAILBOX, DEFAULT_RELOAD_INTERVAL};
