//! Cleanup mode - one-shot batch over server-side rules

use super::announce::Announcer;
use crate::filters::{ExecutionMode, FilterEngine, Rule, RulesConfig};
use crate::mail::{MailClient, MailResult, UidsByMailbox};

/// What one rule matched during a cleanup run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub rule: String,
    pub matched: UidsByMailbox,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.matched.values().map(Vec::len).sum()
    }
}

/// Searches each rule's folders on the server and acts on whole UID sets
pub struct CleanupRunner<'a, C: MailClient> {
    client: &'a mut C,
    announcer: &'a dyn Announcer,
    dry_run: bool,
}

impl<'a, C: MailClient> CleanupRunner<'a, C> {
    pub fn new(client: &'a mut C, announcer: &'a dyn Announcer) -> Self {
        Self {
            client,
            announcer,
            dry_run: false,
        }
    }

    /// Log intended actions instead of running them.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run every rule in order. The client must already be connected.
    pub async fn run(&mut self, rules: &[Rule]) -> MailResult<Vec<CleanupReport>> {
        RulesConfig {
            rules: rules.to_vec(),
        }
        .validate_for(ExecutionMode::Cleanup)?;

        let mut reports = Vec::with_capacity(rules.len());
        for rule in rules {
            reports.push(self.run_rule(rule).await?);
        }
        Ok(reports)
    }

    async fn run_rule(&mut self, rule: &Rule) -> MailResult<CleanupReport> {
        let mut report = CleanupReport {
            rule: rule.name.clone(),
            matched: UidsByMailbox::new(),
        };
        let Some(server) = rule.server.as_ref() else {
            return Ok(report);
        };

        report.matched = self.client.search_by_server_matchers(server).await?;
        for (mailbox, uids) in &report.matched {
            log::info!(
                "Rule '{}' mailbox '{}' matched {} messages",
                rule.name,
                mailbox,
                uids.len()
            );
            self.announcer
                .announce_cleanup(&rule.name, mailbox, uids.len())
                .await;
        }
        if report.matched.is_empty() {
            log::info!("Rule '{}' matched no messages", rule.name);
        }

        FilterEngine::execute_actions_by_mailbox(self.client, rule, &report.matched, self.dry_run)
            .await?;
        Ok(report)
    }
}
