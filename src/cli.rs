//! Command line parsing

use crate::mail::{MailError, MailResult};
use std::path::PathBuf;

pub const ENV_CONFIG: &str = "SWEEP_CONFIG";
pub const DEFAULT_CONFIG: &str = "rules.toml";

pub const USAGE: &str = "\
owlivion-sweep - rule-driven IMAP mailbox cleanup and watcher

Usage:
  owlivion-sweep [--config PATH] validate
  owlivion-sweep [--config PATH] cleanup [--dry-run]
  owlivion-sweep [--config PATH] watch [--mailbox NAME] [--verbose]
  owlivion-sweep [--config PATH] watch --test RULE [--limit N] [--mailbox NAME]
  owlivion-sweep --help

Options:
  --config PATH   Rule file (default: $SWEEP_CONFIG, then rules.toml)
  --dry-run       Log what cleanup would do without touching mail
  --mailbox NAME  Mailbox to watch (default: INBOX)
  --test RULE     Evaluate one client rule against existing mail, newest first
  --limit N       Maximum matches reported by --test (default: 10)
  --verbose, -v   Debug logging

Environment:
  SWEEP_IMAP_HOST, SWEEP_IMAP_PORT (default 993), SWEEP_IMAP_USER,
  SWEEP_IMAP_PASS, SWEEP_IMAP_ACCEPT_INVALID_CERTS, SWEEP_WEBHOOK_URL
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Validate,
    Cleanup {
        dry_run: bool,
    },
    Watch {
        mailbox: Option<String>,
        test: Option<String>,
        limit: usize,
    },
    Help,
}

/// Parsed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub command: Command,
    pub config: Option<PathBuf>,
    pub verbose: bool,
}

impl Cli {
    pub fn parse<I>(args: I) -> MailResult<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let mut iter = args.iter();

        let mut command_name: Option<&str> = None;
        let mut config = None;
        let mut verbose = false;
        let mut dry_run = false;
        let mut mailbox = None;
        let mut test = None;
        let mut limit = None;

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" | "help" => {
                    return Ok(Self {
                        command: Command::Help,
                        config: None,
                        verbose: false,
                    })
                }
                "--config" | "-c" => config = Some(PathBuf::from(value_for(arg, iter.next())?)),
                "--verbose" | "-v" => verbose = true,
                "--dry-run" => dry_run = true,
                "--mailbox" => mailbox = Some(value_for(arg, iter.next())?),
                "--test" => test = Some(value_for(arg, iter.next())?),
                "--limit" => {
                    let raw = value_for(arg, iter.next())?;
                    let parsed = raw
                        .parse::<usize>()
                        .map_err(|_| MailError::Config(format!("invalid --limit {:?}", raw)))?;
                    limit = Some(parsed);
                }
                flag if flag.starts_with('-') => {
                    return Err(MailError::Config(format!("unknown option {}", flag)))
                }
                name if command_name.is_none() => command_name = Some(name),
                extra => return Err(MailError::Config(format!("unexpected argument {:?}", extra))),
            }
        }

        let command = match command_name {
            Some("validate") => Command::Validate,
            Some("cleanup") => Command::Cleanup { dry_run },
            Some("watch") => Command::Watch {
                mailbox,
                test,
                limit: limit.unwrap_or(0),
            },
            Some(other) => return Err(MailError::Config(format!("unknown command {:?}", other))),
            None => return Err(MailError::Config("no command given".to_string())),
        };

        let watch_only = !matches!(command, Command::Watch { .. });
        if watch_only && has_watch_flags(&args) {
            return Err(MailError::Config(
                "--mailbox, --test and --limit only apply to watch".to_string(),
            ));
        }
        if dry_run && !matches!(command, Command::Cleanup { .. }) {
            return Err(MailError::Config("--dry-run only applies to cleanup".to_string()));
        }
        if let Command::Watch {
            test: None,
            limit: l,
            ..
        } = &command
        {
            if *l != 0 {
                return Err(MailError::Config("--limit requires --test".to_string()));
            }
        }

        Ok(Self {
            command,
            config,
            verbose,
        })
    }

    /// `--config`, then `SWEEP_CONFIG`, then `rules.toml`.
    pub fn config_path(&self) -> PathBuf {
        self.config_path_with(std::env::var(ENV_CONFIG).ok())
    }

    fn config_path_with(&self, env_value: Option<String>) -> PathBuf {
        if let Some(path) = &self.config {
            return path.clone();
        }
        match env_value {
            Some(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
            _ => PathBuf::from(DEFAULT_CONFIG),
        }
    }
}

fn value_for(flag: &str, value: Option<&String>) -> MailResult<String> {
    match value {
        Some(v) if !v.starts_with('-') || v.len() == 1 => Ok(v.clone()),
        _ => Err(MailError::Config(format!("{} requires a value", flag))),
    }
}

fn has_watch_flags(args: &[String]) -> bool {
    args.iter()
        .any(|a| matches!(a.as_str(), "--mailbox" | "--test" | "--limit"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::parse(["validate"]).unwrap();
        assert_eq!(cli.command, Command::Validate);
        assert!(!cli.verbose);

        let cli = Cli::parse(["--config", "my.toml", "cleanup", "--dry-run"]).unwrap();
        assert_eq!(cli.command, Command::Cleanup { dry_run: true });
        assert_eq!(cli.config, Some(PathBuf::from("my.toml")));

        let cli = Cli::parse(["watch", "--mailbox", "Lists", "-v"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Watch {
                mailbox: Some("Lists".to_string()),
                test: None,
                limit: 0,
            }
        );
        assert!(cli.verbose);
    }

    #[test]
    fn test_parse_watch_test_mode() {
        let cli = Cli::parse(["watch", "--test", "newsletters", "--limit", "5"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Watch {
                mailbox: None,
                test: Some("newsletters".to_string()),
                limit: 5,
            }
        );
    }

    #[test]
    fn test_help_flag() {
        let cli = Cli::parse(["watch", "--bogus", "--help"]);
        assert!(cli.is_err());
        assert_eq!(Cli::parse(["--help"]).unwrap().command, Command::Help);
        assert_eq!(Cli::parse(["cleanup", "-h"]).unwrap().command, Command::Help);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Cli::parse(Vec::<String>::new()).is_err());
        assert!(Cli::parse(["sweep"]).is_err());
        assert!(Cli::parse(["watch", "--limit"]).is_err());
        assert!(Cli::parse(["watch", "--test", "x", "--limit", "ten"]).is_err());
        assert!(Cli::parse(["watch", "--limit", "3"]).is_err());
        assert!(Cli::parse(["watch", "--dry-run"]).is_err());
        assert!(Cli::parse(["cleanup", "--mailbox", "INBOX"]).is_err());
        assert!(Cli::parse(["validate", "cleanup"]).is_err());
        assert!(Cli::parse(["--config", "--verbose", "validate"]).is_err());
    }

    #[test]
    fn test_config_path_precedence() {
        let explicit = Cli::parse(["--config", "a.toml", "validate"]).unwrap();
        assert_eq!(
            explicit.config_path_with(Some("b.toml".to_string())),
            PathBuf::from("a.toml")
        );

        let implicit = Cli::parse(["validate"]).unwrap();
        assert_eq!(
            implicit.config_path_with(Some("b.toml".to_string())),
            PathBuf::from("b.toml")
        );
        assert_eq!(
            implicit.config_path_with(Some("  ".to_string())),
            PathBuf::from(DEFAULT_CONFIG)
        );
        assert_eq!(implicit.config_path_with(None), PathBuf::from(DEFAULT_CONFIG));
    }
}
