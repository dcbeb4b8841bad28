//! Async IMAP Client Implementation using async-imap
//!
//! Owns one TLS session and composes the search, action and extraction
//! managers on top of it. Only one command may be in flight, so IDLE takes
//! the session away until it is stopped.

use crate::filters::SearchCriteria;
use crate::mail::{
    client::MailClient,
    config::ImapConfig,
    idle::{mailbox_updates, IdleCommand, UpdateReceiver, UpdateSender},
    ActionManager, CapabilitySet, MailData, MailError, MailResult, MailboxSelection,
    MessageExtractor, SearchManager, CAP_IDLE,
};
use async_imap::types::UnsolicitedResponse;
use async_imap::Session;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::compat::TokioAsyncReadCompatExt;

type TlsStream = async_native_tls::TlsStream<tokio_util::compat::Compat<tokio::net::TcpStream>>;

/// Re-issue IDLE before the 30 minute server timeout
pub const DEFAULT_IDLE_KEEPALIVE: Duration = Duration::from_secs(29 * 60);

/// Async IMAP Client wrapper
pub struct AsyncImapClient {
    session: Option<Session<TlsStream>>,
    config: ImapConfig,
    capabilities: Option<CapabilitySet>,
    updates: UpdateSender,
    idle_keepalive: Duration,
    search: SearchManager,
    actions: ActionManager,
    extractor: MessageExtractor,
}

impl AsyncImapClient {
    /// Create a new async IMAP client
    pub fn new(config: ImapConfig) -> Self {
        let (updates, _) = mailbox_updates();
        Self {
            session: None,
            config,
            capabilities: None,
            updates,
            idle_keepalive: DEFAULT_IDLE_KEEPALIVE,
            search: SearchManager::new(),
            actions: ActionManager::new(),
            extractor: MessageExtractor::new(),
        }
    }

    fn get_session(&mut self) -> MailResult<&mut Session<TlsStream>> {
        self.session.as_mut().ok_or(MailError::NotConnected)
    }

    /// Forward EXISTS counts the session buffered while other commands ran.
    fn drain_unsolicited(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            if let UnsolicitedResponse::Exists(count) = response {
                self.updates.publish(count);
            }
        }
    }
}

#[async_trait]
impl MailClient for AsyncImapClient {
    type Idle = IdleCommand<TlsStream>;

    async fn connect(&mut self) -> MailResult<()> {
        self.config
            .validate()
            .map_err(|errors| MailError::Connection(errors.join(", ")))?;

        // Configure TLS based on account settings
        let tls = if self.config.accept_invalid_certs {
            log::warn!("Accepting invalid TLS certificates for {}", self.config.host);
            async_native_tls::TlsConnector::new().danger_accept_invalid_certs(true)
        } else {
            async_native_tls::TlsConnector::new()
        };

        let address = self.config.address();
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| MailError::Connection(format!("{}: {}", address, e)))?;

        // Convert to futures-io compatible stream
        let compat_stream = stream.compat();

        let tls_stream = tls
            .connect(self.config.host.as_str(), compat_stream)
            .await
            .map_err(|e| MailError::Connection(format!("TLS handshake with {}: {}", address, e)))?;

        let client = async_imap::Client::new(tls_stream);
        let session = client
            .login(&self.config.username, &self.config.password)
            .await
            .map_err(|e| MailError::Authentication(e.0.to_string()))?;

        self.session = Some(session);
        self.capabilities = None;
        log::info!("Connected to {} as {}", address, self.config.username);
        Ok(())
    }

    async fn close(&mut self) -> MailResult<()> {
        self.capabilities = None;
        if let Some(mut session) = self.session.take() {
            session
                .logout()
                .await
                .map_err(|e| MailError::Imap(e.to_string()))?;
            log::debug!("Logged out of {}", self.config.host);
        }
        Ok(())
    }

    async fn capabilities(&mut self) -> MailResult<CapabilitySet> {
        if let Some(caps) = &self.capabilities {
            return Ok(caps.clone());
        }

        let session = self.get_session()?;
        let caps = session
            .capabilities()
            .await
            .map_err(|e| MailError::Imap(format!("CAPABILITY failed: {}", e)))?;
        let caps = CapabilitySet::from_lookup(|name| caps.has_str(name));

        log::debug!("Server capabilities: {:?}", caps);
        self.capabilities = Some(caps.clone());
        Ok(caps)
    }

    async fn select_mailbox(&mut self, mailbox: &str) -> MailResult<MailboxSelection> {
        let name = mailbox.trim();
        if name.is_empty() {
            return Err(MailError::Connection("mailbox is required".to_string()));
        }

        let session = self.get_session()?;
        let selected = session
            .select(name)
            .await
            .map_err(|e| MailError::Connection(format!("SELECT {} failed: {}", name, e)))?;

        Ok(MailboxSelection {
            name: name.to_string(),
            exists: selected.exists,
            uid_next: selected.uid_next,
            uid_validity: selected.uid_validity,
        })
    }

    async fn uid_search(&mut self, criteria: &SearchCriteria) -> MailResult<Vec<u32>> {
        let search = self.search;
        let session = self.get_session()?;
        search.uid_search(session, criteria).await
    }

    async fn fetch_mail_data(&mut self, uids: &[u32]) -> MailResult<Vec<MailData>> {
        let extractor = self.extractor;
        let session = self.get_session()?;
        extractor.fetch(session, uids).await
    }

    async fn move_uids(&mut self, uids: &[u32], destination: &str) -> MailResult<()> {
        let caps = self.capabilities().await?;
        let actions = self.actions;
        let session = self.get_session()?;
        actions.move_uids(session, &caps, uids, destination).await
    }

    async fn delete_uids(&mut self, uids: &[u32], expunge: bool) -> MailResult<()> {
        let caps = self.capabilities().await?;
        let actions = self.actions;
        let session = self.get_session()?;
        actions.delete_uids(session, &caps, uids, expunge).await
    }

    fn subscribe_updates(&self) -> UpdateReceiver {
        self.updates.subscribe()
    }

    async fn start_idle(&mut self) -> MailResult<Self::Idle> {
        if self.session.is_none() {
            return Err(MailError::ConnectionClosed(
                "no session to start IDLE on".to_string(),
            ));
        }
        let caps = self.capabilities().await?;
        if !caps.has(CAP_IDLE) {
            return Err(MailError::Imap("server does not support IDLE".to_string()));
        }

        self.drain_unsolicited();
        let session = self.session.take().ok_or(MailError::NotConnected)?;

        log::debug!("Starting IDLE");
        Ok(IdleCommand::spawn(
            session,
            self.updates.clone(),
            self.idle_keepalive,
        ))
    }

    async fn stop_idle(&mut self, idle: Self::Idle) -> MailResult<()> {
        let session = idle.finish().await?;
        self.session = Some(session);
        self.drain_unsolicited();
        log::debug!("IDLE stopped");
        Ok(())
    }
}
