//! Filter engine - evaluates rules and applies their actions

use super::{matches_client, Action, Rule};
use crate::mail::{MailClient, MailData, MailResult, UidsByMailbox};

/// Holds the active rule list
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    rules: Vec<Rule>,
}

impl FilterEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Swap in a freshly loaded rule list.
    pub fn replace_rules(&mut self, rules: Vec<Rule>) {
        self.rules = rules;
    }

    /// Test if a single rule's client matchers accept a message
    pub fn test_filter(&self, rule: &Rule, mail: &MailData) -> MailResult<bool> {
        matches_client(rule.client.as_ref(), mail)
    }

    /// Rules whose client matchers accept the message, in declared order.
    /// An invalid pattern fails the evaluation instead of counting as a miss.
    pub fn matching_rules(&self, mail: &MailData) -> MailResult<Vec<&Rule>> {
        let mut matched = Vec::new();
        for rule in &self.rules {
            if self.test_filter(rule, mail)? {
                matched.push(rule);
            }
        }
        Ok(matched)
    }

    /// Run a rule's actions, in order, against UIDs in the selected mailbox.
    /// Earlier actions are not undone when a later one fails.
    pub async fn execute_actions<C>(client: &mut C, rule: &Rule, uids: &[u32]) -> MailResult<()>
    where
        C: MailClient + ?Sized,
    {
        if uids.is_empty() {
            return Ok(());
        }

        for action in &rule.actions {
            match action {
                Action::Move { destination } => {
                    client.move_uids(uids, destination).await?;
                }
                Action::Delete {
                    expunge_after_delete,
                } => {
                    client.delete_uids(uids, *expunge_after_delete).await?;
                }
            }
        }

        Ok(())
    }

    /// Run a rule's actions against every folder of a batch result.
    pub async fn execute_actions_by_mailbox<C>(
        client: &mut C,
        rule: &Rule,
        uids_by_mailbox: &UidsByMailbox,
        dry_run: bool,
    ) -> MailResult<()>
    where
        C: MailClient + ?Sized,
    {
        if uids_by_mailbox.values().all(|uids| uids.is_empty()) {
            return Ok(());
        }

        for action in &rule.actions {
            if dry_run {
                for (mailbox, uids) in uids_by_mailbox {
                    log::info!(
                        "[dry-run] rule '{}' would {} {} message(s) in {}",
                        rule.name,
                        action.as_str(),
                        uids.len(),
                        mailbox
                    );
                }
                continue;
            }

            match action {
                Action::Move { destination } => {
                    client.move_by_mailbox(uids_by_mailbox, destination).await?;
                }
                Action::Delete {
                    expunge_after_delete,
                } => {
                    client
                        .delete_by_mailbox(uids_by_mailbox, *expunge_after_delete)
                        .await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::ClientMatchers;

    fn rule(name: &str, subject: &str) -> Rule {
        Rule {
            name: name.to_string(),
            client: Some(ClientMatchers {
                subject_regex: vec![subject.to_string()],
                ..Default::default()
            }),
            actions: vec![Action::delete()],
            ..Default::default()
        }
    }

    #[test]
    fn test_matching_rules_in_order() {
        let engine = FilterEngine::new(vec![
            rule("receipts", "(?i)receipt"),
            rule("digests", "(?i)digest"),
            rule("anything", "."),
        ]);
        let mail = MailData {
            uid: 1,
            subject_raw: "Weekly Digest".to_string(),
            ..Default::default()
        };

        let names: Vec<_> = engine
            .matching_rules(&mail)
            .unwrap()
            .into_iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["digests", "anything"]);
    }

    #[test]
    fn test_invalid_pattern_fails_evaluation() {
        let engine = FilterEngine::new(vec![rule("broken", "(")]);
        assert!(engine.matching_rules(&MailData::default()).is_err());
    }

    #[test]
    fn test_replace_rules() {
        let mut engine = FilterEngine::default();
        assert!(engine.rules().is_empty());
        engine.replace_rules(vec![rule("a", "a")]);
        assert_eq!(engine.rules().len(), 1);
    }
}
