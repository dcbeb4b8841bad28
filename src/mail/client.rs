//! Mail client seams
//!
//! [`MailClient`] is the narrow set of IMAP primitives the watch and cleanup
//! runners drive. The folder-keyed batch operations are provided on top of
//! the single-mailbox primitives, so every implementation selects each
//! mailbox before delegating and a SELECT failure aborts the whole batch.

use super::{
    CapabilitySet, MailData, MailError, MailResult, MailboxSelection, UidsByMailbox,
    UpdateReceiver,
};
use crate::filters::{criteria, SearchCriteria, ServerMatchers};
use async_trait::async_trait;

/// An outstanding IDLE command.
///
/// Must be handed back to [`MailClient::stop_idle`] before any other command
/// is issued on the connection.
#[async_trait]
pub trait IdleHandle: Send {
    /// Resolves once IDLE has ended on its own, usually because the
    /// connection dropped. Pending for as long as IDLE is healthy.
    async fn terminated(&mut self);
}

#[async_trait]
pub trait MailClient: Send {
    type Idle: IdleHandle;

    /// Dial, negotiate TLS and authenticate.
    async fn connect(&mut self) -> MailResult<()>;

    /// Log out. A no-op when already closed.
    async fn close(&mut self) -> MailResult<()>;

    /// Capabilities of the current session, queried once per connection.
    async fn capabilities(&mut self) -> MailResult<CapabilitySet>;

    async fn select_mailbox(&mut self, mailbox: &str) -> MailResult<MailboxSelection>;

    /// UID SEARCH in the selected mailbox.
    async fn uid_search(&mut self, criteria: &SearchCriteria) -> MailResult<Vec<u32>>;

    /// Peek-fetch and extract messages from the selected mailbox.
    async fn fetch_mail_data(&mut self, uids: &[u32]) -> MailResult<Vec<MailData>>;

    async fn move_uids(&mut self, uids: &[u32], destination: &str) -> MailResult<()>;

    async fn delete_uids(&mut self, uids: &[u32], expunge: bool) -> MailResult<()>;

    /// Receiver for EXISTS counts pushed while idling. Survives reconnects.
    fn subscribe_updates(&self) -> UpdateReceiver;

    /// Issue IDLE on the selected mailbox.
    async fn start_idle(&mut self) -> MailResult<Self::Idle>;

    /// End IDLE and wait for the server to complete it.
    async fn stop_idle(&mut self, idle: Self::Idle) -> MailResult<()>;

    /// Every UID strictly greater than `last_uid`, ascending.
    async fn search_uids_newer_than(&mut self, last_uid: u32) -> MailResult<Vec<u32>> {
        let mut uids = self
            .uid_search(&SearchCriteria::uids_newer_than(last_uid))
            .await?;
        // `n:*` always includes the highest UID, even when it is below n
        uids.retain(|uid| *uid > last_uid);
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    /// Run compiled server matchers in each configured folder. Folders with
    /// no hits are left out of the result.
    async fn search_by_server_matchers(
        &mut self,
        matchers: &ServerMatchers,
    ) -> MailResult<UidsByMailbox> {
        let criteria = criteria::compile(matchers)?;
        log::debug!("compiled search: {}", criteria);

        let mut results = UidsByMailbox::new();
        for folder in &matchers.folders {
            let folder = folder.trim();
            if folder.is_empty() {
                return Err(MailError::Config("mailbox is required".to_string()));
            }
            self.select_mailbox(folder).await?;

            let mut uids = self.uid_search(&criteria).await?;
            if uids.is_empty() {
                continue;
            }
            uids.sort_unstable();
            results.insert(folder.to_string(), uids);
        }

        Ok(results)
    }

    async fn move_by_mailbox(
        &mut self,
        uids_by_mailbox: &UidsByMailbox,
        destination: &str,
    ) -> MailResult<()> {
        for (mailbox, uids) in uids_by_mailbox {
            if uids.is_empty() {
                continue;
            }
            self.select_mailbox(mailbox).await?;
            self.move_uids(uids, destination).await?;
        }
        Ok(())
    }

    async fn delete_by_mailbox(
        &mut self,
        uids_by_mailbox: &UidsByMailbox,
        expunge: bool,
    ) -> MailResult<()> {
        for (mailbox, uids) in uids_by_mailbox {
            if uids.is_empty() {
                continue;
            }
            self.select_mailbox(mailbox).await?;
            self.delete_uids(uids, expunge).await?;
        }
        Ok(())
    }
}
