//! Watch mode
//!
//! Keeps one session idling on a mailbox. Each EXISTS bump triggers a search
//! for UIDs above the last one processed; every new message is run through
//! the client-side rules and matching rules act on that message alone.
//!
//! `last_uid` only advances after a whole batch has been processed, so a
//! failure or cancellation mid-batch replays messages instead of skipping
//! them.

use super::announce::Announcer;
use crate::filters::{
    matches_client, Action, ExecutionMode, FilterEngine, Rule, RuleSource, RulesConfig,
};
use crate::mail::{IdleHandle, MailClient, MailData, MailError, MailResult};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAILBOX: &str = "INBOX";
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Batch size used when scanning existing mail with `--test`
pub const TEST_FETCH_CHUNK: usize = 200;
pub const DEFAULT_TEST_LIMIT: usize = 10;

/// Progress through the watched mailbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchState {
    pub last_uid: u32,
    pub last_count: u32,
}

/// Why the runner woke up from IDLE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Update(u32),
    Reload,
    Cancelled,
    IdleEnded,
}

/// Long-lived IDLE loop applying client rules to new mail
pub struct WatchRunner<C: MailClient> {
    client: C,
    engine: FilterEngine,
    announcer: Box<dyn Announcer>,
    rule_source: Option<Box<dyn RuleSource>>,
    mailbox: String,
    reload_interval: Duration,
    state: WatchState,
}

impl<C: MailClient> WatchRunner<C> {
    /// Rules are validated for watch mode up front.
    pub fn new(client: C, rules: Vec<Rule>, announcer: Box<dyn Announcer>) -> MailResult<Self> {
        let rules = validate_watch_rules(rules)?;
        Ok(Self {
            client,
            engine: FilterEngine::new(rules),
            announcer,
            rule_source: None,
            mailbox: DEFAULT_MAILBOX.to_string(),
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            state: WatchState::default(),
        })
    }

    pub fn with_mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = mailbox.into();
        self
    }

    /// Re-read rules from `source` every `interval`.
    pub fn with_reload(mut self, source: impl RuleSource + 'static, interval: Duration) -> Self {
        self.rule_source = Some(Box::new(source));
        self.reload_interval = interval;
        self
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn rules(&self) -> &[Rule] {
        self.engine.rules()
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Run until cancelled or a non-recoverable error occurs. The client
    /// must already be connected.
    pub async fn run(&mut self, cancel: CancellationToken) -> MailResult<()> {
        let selection = self.client.select_mailbox(&self.mailbox).await?;
        self.state = WatchState {
            last_uid: selection.last_uid(),
            last_count: selection.exists,
        };
        log::info!(
            "Watching {}: {} messages, last uid {}",
            self.mailbox,
            self.state.last_count,
            self.state.last_uid
        );

        let mut updates = self.client.subscribe_updates();
        let mut reload = interval_at(Instant::now() + self.reload_interval, self.reload_interval);
        reload.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancel.is_cancelled() {
                log::info!("Watch cancelled");
                return Ok(());
            }

            let mut idle = match self.client.start_idle().await {
                Ok(idle) => idle,
                Err(e) if e.is_benign_idle_error() => {
                    log::warn!("IDLE could not start ({}), reconnecting", e);
                    self.reconnect(&cancel).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let wake = tokio::select! {
                count = updates.recv() => Wake::Update(count),
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = reload.tick() => Wake::Reload,
                _ = idle.terminated() => Wake::IdleEnded,
            };
            log::debug!("Woke from IDLE: {:?}", wake);

            if let Err(e) = self.client.stop_idle(idle).await {
                if wake == Wake::Cancelled {
                    log::warn!("Closing IDLE on shutdown failed: {}", e);
                    return Ok(());
                }
                if e.is_benign_idle_error() {
                    log::warn!("IDLE connection lost ({}), reconnecting", e);
                    self.reconnect(&cancel).await?;
                    continue;
                }
                return Err(e);
            }

            match wake {
                Wake::Update(count) => self.handle_update(count, &cancel).await?,
                Wake::Reload => self.reload_rules(),
                Wake::Cancelled => {
                    log::info!("Watch cancelled");
                    return Ok(());
                }
                Wake::IdleEnded => {}
            }
        }
    }

    async fn handle_update(&mut self, count: u32, cancel: &CancellationToken) -> MailResult<()> {
        if count <= self.state.last_count {
            log::debug!(
                "Mailbox count {} not above {}, nothing new",
                count,
                self.state.last_count
            );
            self.state.last_count = count;
            return Ok(());
        }

        log::info!("New mail detected: {} messages", count);
        let uids = self.client.search_uids_newer_than(self.state.last_uid).await?;
        let removed = self.process_uids(&uids, cancel).await?;
        self.state.last_count = count.saturating_sub(removed);
        Ok(())
    }

    /// Fetch, match and act on `uids`. Returns how many messages the rules
    /// took out of the mailbox.
    async fn process_uids(&mut self, uids: &[u32], cancel: &CancellationToken) -> MailResult<u32> {
        log::debug!("Processing {} uid(s) above {}", uids.len(), self.state.last_uid);
        if uids.is_empty() {
            return Ok(0);
        }

        let messages = self.client.fetch_mail_data(uids).await?;
        let mut removed = 0;
        for message in &messages {
            if cancel.is_cancelled() {
                log::info!("Cancelled mid-batch, uid {} will be replayed", message.uid);
                return Ok(removed);
            }

            let matched = self.engine.matching_rules(message)?;
            if matched.is_empty() {
                log::info!("No rule matched uid {}", message.uid);
                self.announcer.announce_match("").await;
                continue;
            }

            let mut taken = false;
            for rule in matched {
                FilterEngine::execute_actions(&mut self.client, rule, &[message.uid]).await?;
                taken |= removes_message(rule);
                log::info!(
                    "Rule '{}' matched uid {} (list-id: {})",
                    rule.name,
                    message.uid,
                    message.list_id
                );
                self.announcer.announce_match(&rule.name).await;
            }
            if taken {
                removed += 1;
            }
        }

        if let Some(max) = uids.iter().copied().max() {
            self.state.last_uid = self.state.last_uid.max(max);
        }
        log::debug!("Advanced last uid to {}", self.state.last_uid);
        Ok(removed)
    }

    /// Best-effort: a broken rule file keeps the current rules running.
    fn reload_rules(&mut self) {
        let Some(source) = &self.rule_source else {
            return;
        };
        match source.load_rules().and_then(validate_watch_rules) {
            Ok(rules) => {
                log::info!("Reloaded {} rule(s)", rules.len());
                self.engine.replace_rules(rules);
            }
            Err(e) => log::error!(
                "Rule reload failed, keeping {} active rule(s): {}",
                self.engine.rules().len(),
                e
            ),
        }
    }

    /// Fresh session, then catch up on everything above `last_uid`.
    async fn reconnect(&mut self, cancel: &CancellationToken) -> MailResult<()> {
        if let Err(e) = self.client.close().await {
            log::debug!("Ignoring close error before reconnect: {}", e);
        }
        self.client.connect().await?;
        let selection = self.client.select_mailbox(&self.mailbox).await?;
        log::info!(
            "Reconnected to {}: {} messages",
            self.mailbox,
            selection.exists
        );

        let uids = self.client.search_uids_newer_than(self.state.last_uid).await?;
        let removed = self.process_uids(&uids, cancel).await?;
        self.state.last_count = selection.exists.saturating_sub(removed);
        Ok(())
    }
}

fn validate_watch_rules(rules: Vec<Rule>) -> MailResult<Vec<Rule>> {
    let config = RulesConfig { rules };
    config.validate_for(ExecutionMode::Watch)?;
    Ok(config.rules)
}

/// True if running the rule takes the message out of the mailbox.
fn removes_message(rule: &Rule) -> bool {
    rule.actions.iter().any(|action| match action {
        Action::Move { .. } => true,
        Action::Delete {
            expunge_after_delete,
        } => *expunge_after_delete,
    })
}

/// Evaluate one client rule against existing mail, newest first, without
/// acting on anything. Returns at most `limit` matches.
pub async fn test_rule<C: MailClient>(
    client: &mut C,
    rule: &Rule,
    mailbox: &str,
    limit: usize,
) -> MailResult<Vec<MailData>> {
    let Some(matchers) = rule.client.as_ref() else {
        return Err(MailError::Config(format!(
            "rule {:?} does not define client matchers",
            rule.name
        )));
    };
    let limit = if limit == 0 { DEFAULT_TEST_LIMIT } else { limit };

    client.select_mailbox(mailbox).await?;
    let uids = client.search_uids_newer_than(0).await?;
    if uids.is_empty() {
        log::info!("No messages found in {}", mailbox);
        return Ok(Vec::new());
    }
    log::info!(
        "Testing rule '{}' against {} message(s) in {}",
        rule.name,
        uids.len(),
        mailbox
    );

    let mut matches = Vec::new();
    for batch in uids.rchunks(TEST_FETCH_CHUNK) {
        let mut messages = client.fetch_mail_data(batch).await?;
        messages.sort_by(|a, b| b.message_date.cmp(&a.message_date));

        for message in messages {
            if !matches_client(Some(matchers), &message)? {
                continue;
            }
            log::info!(
                "Test match: uid {} date {:?} subject '{}' list-id '{}' senders {:?}",
                message.uid,
                message.message_date,
                message.subject_raw,
                message.list_id,
                message.sender_domains
            );
            matches.push(message);
            if matches.len() >= limit {
                return Ok(matches);
            }
        }
    }

    log::info!("Rule test complete: {} match(es)", matches.len());
    Ok(matches)
}
