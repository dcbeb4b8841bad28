//! UID SEARCH against the selected mailbox

use super::{MailError, MailResult};
use crate::filters::SearchCriteria;
use async_imap::Session;
use futures::io::{AsyncRead, AsyncWrite};
use std::fmt;

/// Runs compiled criteria through UID SEARCH
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchManager;

impl SearchManager {
    pub fn new() -> Self {
        Self
    }

    /// Search the selected mailbox, returning ascending UIDs.
    pub async fn uid_search<T>(
        &self,
        session: &mut Session<T>,
        criteria: &SearchCriteria,
    ) -> MailResult<Vec<u32>>
    where
        T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
    {
        let query = criteria.to_search_query();
        log::debug!("UID SEARCH {}", query);

        let uids_set = session
            .uid_search(&query)
            .await
            .map_err(|e| MailError::Fetch(format!("UID SEARCH failed: {}", e)))?;

        let mut uids: Vec<u32> = uids_set.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }
}
