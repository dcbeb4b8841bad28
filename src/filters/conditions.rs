//! Rule matcher definitions and client-side matching logic

use crate::mail::{MailData, MailError, MailResult};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Relative age bounds, e.g. `min = "24h"`, `max = "30d"`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgeWindow {
    /// Message must be at least this old
    #[serde(default)]
    pub min: Option<String>,
    /// Message must be no older than this
    #[serde(default)]
    pub max: Option<String>,
}

/// Predicates evaluated by the server through UID SEARCH
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerMatchers {
    pub folders: Vec<String>,
    pub age_window: Option<AgeWindow>,
    pub sender_substring: Vec<String>,
    pub recipients: Vec<String>,
    pub cc_substring: Vec<String>,
    pub body_substring: Vec<String>,
    pub reply_to_substring: Vec<String>,
    pub return_path_substring: Vec<String>,
    pub list_id_substring: Vec<String>,
    pub seen: Option<bool>,
    pub list_unsubscribe: Option<bool>,
}

/// Regex predicates evaluated locally against fetched [`MailData`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientMatchers {
    pub list_id_regex: Vec<String>,
    pub subject_regex: Vec<String>,
    pub recipients_regex: Vec<String>,
    pub cc_regex: Vec<String>,
    pub sender_regex: Vec<String>,
    pub reply_to_regex: Vec<String>,
    pub return_path_regex: Vec<String>,
    pub body_regex: Vec<String>,
    pub recipient_tag_regex: Vec<String>,
    pub list_unsubscribe: Option<bool>,
}

impl ClientMatchers {
    /// True when no predicate is configured; such matchers accept everything.
    pub fn is_empty(&self) -> bool {
        self.pattern_groups().iter().all(|(_, patterns)| patterns.is_empty())
            && self.list_unsubscribe.is_none()
    }

    /// Compile every non-blank pattern, failing on the first invalid one.
    pub fn validate_patterns(&self) -> MailResult<()> {
        for (field, patterns) in self.pattern_groups() {
            compile_patterns(field, patterns)?;
        }
        Ok(())
    }

    /// Evaluate against one message.
    ///
    /// Categories are AND-ed; inside a category any pattern matching any
    /// candidate is enough. All patterns are compiled before evaluation, so
    /// an invalid pattern is reported even if an earlier category misses.
    pub fn matches(&self, mail: &MailData) -> MailResult<bool> {
        if self.is_empty() {
            return Ok(true);
        }

        let mut compiled = Vec::new();
        for (field, patterns) in self.pattern_groups() {
            if patterns.is_empty() {
                continue;
            }
            compiled.push((field, compile_patterns(field, patterns)?));
        }

        for (field, regexes) in &compiled {
            let candidates = candidates_for(field, mail);
            if !any_match(regexes, &candidates) {
                log::debug!("uid {} failed client predicate {}", mail.uid, field);
                return Ok(false);
            }
        }

        if let Some(expected) = self.list_unsubscribe {
            if mail.list_unsubscribe != expected {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn pattern_groups(&self) -> [(&'static str, &[String]); 9] {
        [
            ("list_id_regex", self.list_id_regex.as_slice()),
            ("subject_regex", self.subject_regex.as_slice()),
            ("recipients_regex", self.recipients_regex.as_slice()),
            ("cc_regex", self.cc_regex.as_slice()),
            ("return_path_regex", self.return_path_regex.as_slice()),
            ("sender_regex", self.sender_regex.as_slice()),
            ("reply_to_regex", self.reply_to_regex.as_slice()),
            ("body_regex", self.body_regex.as_slice()),
            ("recipient_tag_regex", self.recipient_tag_regex.as_slice()),
        ]
    }
}

/// Evaluate optional client matchers; absent matchers accept every message.
pub fn matches_client(matchers: Option<&ClientMatchers>, mail: &MailData) -> MailResult<bool> {
    match matchers {
        Some(matchers) => matchers.matches(mail),
        None => Ok(true),
    }
}

fn compile_patterns(field: &str, patterns: &[String]) -> MailResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            Regex::new(p)
                .map_err(|e| MailError::Regex(format!("{}: invalid pattern {:?}: {}", field, p, e)))
        })
        .collect()
}

fn candidates_for<'a>(field: &str, mail: &'a MailData) -> Vec<&'a str> {
    let list: &'a [String] = match field {
        "list_id_regex" => return vec![mail.list_id.as_str()],
        "subject_regex" => return vec![mail.subject_raw.as_str()],
        "body_regex" => return vec![mail.body.as_str()],
        "recipients_regex" => &mail.recipients,
        "cc_regex" => &mail.cc,
        "return_path_regex" => &mail.return_path_domains,
        "sender_regex" => &mail.sender_domains,
        "reply_to_regex" => &mail.reply_to_domains,
        "recipient_tag_regex" => &mail.recipient_tags,
        _ => &[],
    };
    list.iter().map(String::as_str).collect()
}

fn any_match(regexes: &[Regex], candidates: &[&str]) -> bool {
    candidates
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .any(|candidate| regexes.iter().any(|re| re.is_match(candidate)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_mail() -> MailData {
        MailData {
            uid: 7,
            from: vec!["news@example.com".to_string()],
            sender_domains: vec!["example.com".to_string()],
            reply_to_domains: vec!["replies.example.com".to_string()],
            return_path_domains: vec!["bounce.example.com".to_string()],
            recipients: vec!["me+shopping@example.net".to_string()],
            recipient_tags: vec!["me_shopping".to_string()],
            list_id: "Example News <id.mcsv.net>".to_string(),
            list_unsubscribe: true,
            subject_raw: "Your Weekly Digest #42".to_string(),
            body: "Click here to unsubscribe".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_absent_or_empty_matchers_match_everything() {
        let mail = create_test_mail();
        assert!(matches_client(None, &mail).unwrap());
        assert!(matches_client(Some(&ClientMatchers::default()), &mail).unwrap());
        assert!(ClientMatchers::default().is_empty());
    }

    #[test]
    fn test_list_id_regex() {
        let matchers = ClientMatchers {
            list_id_regex: vec![r"<id\.mcsv\.net>".to_string()],
            ..Default::default()
        };
        let mut mail = create_test_mail();
        assert!(matchers.matches(&mail).unwrap());

        mail.list_id = "Other <list.example.org>".to_string();
        assert!(!matchers.matches(&mail).unwrap());

        mail.list_id.clear();
        assert!(!matchers.matches(&mail).unwrap());
    }

    #[test]
    fn test_categories_are_anded() {
        let mail = create_test_mail();
        let matchers = ClientMatchers {
            sender_regex: vec![r"^example\.com$".to_string()],
            subject_regex: vec!["(?i)digest".to_string()],
            ..Default::default()
        };
        assert!(matchers.matches(&mail).unwrap());

        let matchers = ClientMatchers {
            sender_regex: vec![r"^example\.com$".to_string()],
            subject_regex: vec!["invoice".to_string()],
            ..Default::default()
        };
        assert!(!matchers.matches(&mail).unwrap());
    }

    #[test]
    fn test_any_pattern_within_category() {
        let matchers = ClientMatchers {
            recipient_tag_regex: vec!["^travel$".to_string(), "^me_shop".to_string()],
            ..Default::default()
        };
        assert!(matchers.matches(&create_test_mail()).unwrap());
    }

    #[test]
    fn test_blank_patterns_and_candidates_skipped() {
        let matchers = ClientMatchers {
            cc_regex: vec!["  ".to_string(), ".*".to_string()],
            ..Default::default()
        };
        let mut mail = create_test_mail();
        mail.cc = vec![" ".to_string()];
        assert!(!matchers.matches(&mail).unwrap());

        mail.cc = vec!["friend@example.org".to_string()];
        assert!(matchers.matches(&mail).unwrap());
    }

    #[test]
    fn test_invalid_regex_is_error() {
        let matchers = ClientMatchers {
            subject_regex: vec!["no-match-here".to_string()],
            body_regex: vec!["(unclosed".to_string()],
            ..Default::default()
        };
        let err = matchers.matches(&create_test_mail()).unwrap_err();
        assert!(matches!(err, MailError::Regex(_)));
        assert!(matchers.validate_patterns().is_err());
    }

    #[test]
    fn test_list_unsubscribe_flag() {
        let matchers = ClientMatchers {
            list_unsubscribe: Some(false),
            ..Default::default()
        };
        assert!(!matchers.is_empty());
        assert!(!matchers.matches(&create_test_mail()).unwrap());
    }
}
