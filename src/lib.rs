//! # Owlivion Sweep
//!
//! Applies declarative rules to an IMAP mailbox, either as a one-shot batch
//! (`cleanup`, server-side SEARCH) or continuously (`watch`, IDLE plus
//! client-side regex matching).

pub mod cli;
pub mod filters;
pub mod mail;
pub mod sync;

use cli::{Cli, Command, USAGE};
use filters::{ExecutionMode, RulesConfig, RulesFile};
use mail::{AsyncImapClient, ImapConfig, MailClient, MailError, MailResult};
use std::path::Path;
use sync::{
    test_rule, Announcer, CleanupRunner, LogAnnouncer, WatchRunner, WebhookAnnouncer,
    DEFAULT_MAILBOX, DEFAULT_RELOAD_INTERVAL,
};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Application Entry Point
// ============================================================================

pub fn run() {
    // Load .env file for IMAP credentials
    dotenvy::dotenv().ok();

    let cli = match Cli::parse(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(execute(cli)) {
        log::error!("{}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}

/// Dispatch a parsed command.
pub async fn execute(cli: Cli) -> MailResult<()> {
    let config_path = cli.config_path();
    match cli.command {
        Command::Help => {
            print!("{}", USAGE);
            Ok(())
        }
        Command::Validate => validate(&config_path),
        Command::Cleanup { dry_run } => cleanup(&config_path, dry_run).await,
        Command::Watch {
            mailbox,
            test: Some(rule),
            limit,
        } => {
            let mailbox = mailbox.unwrap_or_else(|| DEFAULT_MAILBOX.to_string());
            test_watch_rule(&config_path, &rule, &mailbox, limit).await
        }
        Command::Watch {
            mailbox, test: None, ..
        } => {
            let mailbox = mailbox.unwrap_or_else(|| DEFAULT_MAILBOX.to_string());
            watch(&config_path, &mailbox).await
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn validate(path: &Path) -> MailResult<()> {
    let config = RulesConfig::load(path)?;
    config.validate()?;

    let modes: Vec<&str> = [ExecutionMode::Watch, ExecutionMode::Cleanup]
        .into_iter()
        .filter(|mode| config.validate_for(*mode).is_ok())
        .map(|mode| mode.as_str())
        .collect();
    if modes.is_empty() {
        return Err(MailError::Config(format!(
            "{}: mixes client and server rules, usable by neither watch nor cleanup",
            path.display()
        )));
    }

    println!("{}: {} rule(s), valid for {}", path.display(), config.rules.len(), modes.join(" and "));
    for line in config.summary() {
        println!("  {}", line);
    }
    Ok(())
}

async fn cleanup(path: &Path, dry_run: bool) -> MailResult<()> {
    let config = RulesConfig::load_for(path, ExecutionMode::Cleanup)?;
    let announcer = announcer()?;

    let mut client = AsyncImapClient::new(ImapConfig::from_env()?);
    client.connect().await?;

    let result = CleanupRunner::new(&mut client, announcer.as_ref())
        .dry_run(dry_run)
        .run(&config.rules)
        .await;

    if let Err(e) = client.close().await {
        log::warn!("Logout failed: {}", e);
    }

    let reports = result?;
    let total: usize = reports.iter().map(|r| r.total()).sum();
    log::info!(
        "Cleanup finished: {} rule(s), {} message(s) matched{}",
        reports.len(),
        total,
        if dry_run { " (dry run)" } else { "" }
    );
    Ok(())
}

async fn watch(path: &Path, mailbox: &str) -> MailResult<()> {
    let config = RulesConfig::load_for(path, ExecutionMode::Watch)?;
    let announcer = announcer()?;

    let mut client = AsyncImapClient::new(ImapConfig::from_env()?);
    client.connect().await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, stopping watch");
            interrupt.cancel();
        }
    });

    let mut runner = WatchRunner::new(client, config.rules, announcer)?
        .with_mailbox(mailbox)
        .with_reload(
            RulesFile::new(path, ExecutionMode::Watch),
            DEFAULT_RELOAD_INTERVAL,
        );
    let result = runner.run(cancel).await;

    if let Err(e) = runner.client_mut().close().await {
        log::warn!("Logout failed: {}", e);
    }
    result
}

async fn test_watch_rule(path: &Path, name: &str, mailbox: &str, limit: usize) -> MailResult<()> {
    let config = RulesConfig::load_for(path, ExecutionMode::Watch)?;
    let rule = config.find_rule(name)?.clone();

    let mut client = AsyncImapClient::new(ImapConfig::from_env()?);
    client.connect().await?;
    let result = test_rule(&mut client, &rule, mailbox, limit).await;
    if let Err(e) = client.close().await {
        log::warn!("Logout failed: {}", e);
    }

    let matches = result?;
    println!("Rule '{}': {} match(es) in {}", rule.name, matches.len(), mailbox);
    for mail in &matches {
        let date = mail
            .message_date
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  uid {} | {} | {} | list-id: {}",
            mail.uid,
            date,
            mail.subject_raw,
            if mail.list_id.is_empty() { "-" } else { mail.list_id.as_str() }
        );
    }
    Ok(())
}

fn announcer() -> MailResult<Box<dyn Announcer>> {
    match WebhookAnnouncer::from_env()? {
        Some(webhook) => {
            log::info!("Announcing matches to {}", webhook.endpoint());
            Ok(Box::new(webhook))
        }
        None => Ok(Box::new(LogAnnouncer)),
    }
}
