//! Actions to perform on matched messages

use crate::mail::{MailError, MailResult};
use serde::{Deserialize, Serialize};

fn default_expunge() -> bool {
    true
}

/// Action to perform when a rule matches, applied in declared order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Action {
    /// Move to another mailbox
    Move { destination: String },
    /// Flag `\Deleted`, optionally expunging afterwards
    Delete {
        #[serde(default = "default_expunge")]
        expunge_after_delete: bool,
    },
}

impl Action {
    /// Create a move action
    pub fn move_to(destination: impl Into<String>) -> Self {
        Action::Move {
            destination: destination.into(),
        }
    }

    /// Create a delete action that expunges afterwards
    pub fn delete() -> Self {
        Action::Delete {
            expunge_after_delete: true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Move { .. } => "move",
            Action::Delete { .. } => "delete",
        }
    }

    pub fn validate(&self, rule_name: &str) -> MailResult<()> {
        match self {
            Action::Move { destination } if destination.trim().is_empty() => Err(
                MailError::Config(format!("rule {:?}: move destination is required", rule_name)),
            ),
            _ => Ok(()),
        }
    }
}
