//! Mailbox rules
//!
//! Declarative rules pairing server-side or client-side matchers with a list
//! of actions, loaded from a TOML rule file.

pub mod actions;
pub mod conditions;
pub mod criteria;
pub mod engine;

pub use actions::Action;
pub use conditions::{matches_client, AgeWindow, ClientMatchers, ServerMatchers};
pub use criteria::{compile, parse_relative_duration, SearchCriteria, SearchFlag};
pub use engine::FilterEngine;

use crate::mail::{MailError, MailResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A named rule: exactly one matcher kind plus the actions to run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub server: Option<ServerMatchers>,
    #[serde(default)]
    pub client: Option<ClientMatchers>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Rule {
    pub fn is_client_rule(&self) -> bool {
        self.client.is_some()
    }

    pub fn is_server_rule(&self) -> bool {
        self.server.is_some()
    }
}

/// Which runner a rule set is validated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Long-lived IDLE loop evaluating client matchers
    Watch,
    /// One-shot batch over server matchers
    Cleanup,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Watch => "watch",
            ExecutionMode::Cleanup => "cleanup",
        }
    }
}

/// Top-level rule file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RulesConfig {
    pub fn from_toml_str(content: &str) -> MailResult<Self> {
        toml::from_str(content).map_err(|e| MailError::Config(format!("invalid rule file: {}", e)))
    }

    /// Read and parse a rule file without validating it.
    pub fn load(path: impl AsRef<Path>) -> MailResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MailError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load a rule file and validate it for one execution mode.
    pub fn load_for(path: impl AsRef<Path>, mode: ExecutionMode) -> MailResult<Self> {
        let config = Self::load(path)?;
        config.validate_for(mode)?;
        Ok(config)
    }

    /// Mode-independent checks.
    pub fn validate(&self) -> MailResult<()> {
        if self.rules.is_empty() {
            return Err(MailError::Config("at least one rule is required".to_string()));
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if rule.name.trim().is_empty() {
                return Err(MailError::Config(format!("rule {} has no name", index + 1)));
            }
            if rule.server.is_none() && rule.client.is_none() {
                return Err(MailError::Config(format!(
                    "rule {:?} must define server or client matchers",
                    rule.name
                )));
            }
            if rule.server.is_some() && rule.client.is_some() {
                return Err(MailError::Config(format!(
                    "rule {:?} mixes server and client matchers",
                    rule.name
                )));
            }
            if let Some(server) = &rule.server {
                if server.folders.is_empty() {
                    return Err(MailError::Config(format!(
                        "rule {:?}: server.folders is required",
                        rule.name
                    )));
                }
                if server.folders.iter().any(|f| f.trim().is_empty()) {
                    return Err(MailError::Config(format!(
                        "rule {:?}: server.folders contains a blank name",
                        rule.name
                    )));
                }
            }
            if let Some(client) = &rule.client {
                client
                    .validate_patterns()
                    .map_err(|e| MailError::Config(format!("rule {:?}: {}", rule.name, e)))?;
            }
            for action in &rule.actions {
                action.validate(&rule.name)?;
            }
        }

        Ok(())
    }

    /// Checks for a specific runner: cleanup only takes server rules, watch
    /// only takes client rules.
    pub fn validate_for(&self, mode: ExecutionMode) -> MailResult<()> {
        self.validate()?;

        for rule in &self.rules {
            let rejected = match mode {
                ExecutionMode::Watch => rule.is_server_rule(),
                ExecutionMode::Cleanup => rule.is_client_rule(),
            };
            if rejected {
                return Err(MailError::Config(format!(
                    "rule {:?} uses {} matchers, which {} mode does not support",
                    rule.name,
                    if rule.is_server_rule() { "server" } else { "client" },
                    mode.as_str()
                )));
            }
        }

        Ok(())
    }

    pub fn find_rule(&self, name: &str) -> MailResult<&Rule> {
        self.rules
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| MailError::NotFound(format!("rule {:?}", name)))
    }

    /// One line per rule, for the `validate` command.
    pub fn summary(&self) -> Vec<String> {
        self.rules
            .iter()
            .map(|rule| {
                let kind = if rule.is_server_rule() { "server" } else { "client" };
                let actions = rule
                    .actions
                    .iter()
                    .map(|a| match a {
                        Action::Move { destination } => format!("move -> {}", destination),
                        Action::Delete {
                            expunge_after_delete,
                        } => format!("delete (expunge: {})", expunge_after_delete),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{} [{}] {}", rule.name, kind, actions)
            })
            .collect()
    }
}

/// Source of the active rule list, re-read on every reload tick
pub trait RuleSource: Send + Sync {
    fn load_rules(&self) -> MailResult<Vec<Rule>>;
}

/// Rules re-read from a TOML file and validated for one mode
#[derive(Debug, Clone)]
pub struct RulesFile {
    path: PathBuf,
    mode: ExecutionMode,
}

impl RulesFile {
    pub fn new(path: impl Into<PathBuf>, mode: ExecutionMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }
}

impl RuleSource for RulesFile {
    fn load_rules(&self) -> MailResult<Vec<Rule>> {
        Ok(RulesConfig::load_for(&self.path, self.mode)?.rules)
    }
}

impl<F> RuleSource for F
where
    F: Fn() -> MailResult<Vec<Rule>> + Send + Sync,
{
    fn load_rules(&self) -> MailResult<Vec<Rule>> {
        self()
    }
}
