//! Move and delete, choosing protocol paths from server capabilities

use super::{uid_set, CapabilitySet, MailError, MailResult, CAP_MOVE, CAP_UIDPLUS};
use async_imap::Session;
use futures::io::{AsyncRead, AsyncWrite};
use futures::{pin_mut, StreamExt};
use std::fmt;

/// How a move is carried out on this server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovePlan {
    /// UID MOVE
    Native,
    /// UID COPY, flag `\Deleted`, then expunge
    CopyFallback { uid_expunge: bool },
}

/// How a delete is carried out on this server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePlan {
    FlagOnly,
    /// Expunge just the flagged UIDs
    FlagAndUidExpunge,
    /// Expunge the whole mailbox, including unrelated `\Deleted` messages
    FlagAndExpunge,
}

/// Applies rule actions to UIDs in the selected mailbox
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionManager;

impl ActionManager {
    pub fn new() -> Self {
        Self
    }

    pub fn move_plan(caps: &CapabilitySet) -> MovePlan {
        if caps.has(CAP_MOVE) {
            MovePlan::Native
        } else {
            MovePlan::CopyFallback {
                uid_expunge: caps.has(CAP_UIDPLUS),
            }
        }
    }

    pub fn delete_plan(caps: &CapabilitySet, expunge: bool) -> DeletePlan {
        match (expunge, caps.has(CAP_UIDPLUS)) {
            (false, _) => DeletePlan::FlagOnly,
            (true, true) => DeletePlan::FlagAndUidExpunge,
            (true, false) => DeletePlan::FlagAndExpunge,
        }
    }

    /// Move UIDs to `destination`. Fails if the destination does not exist,
    /// leaving the messages where they were.
    pub async fn move_uids<T>(
        &self,
        session: &mut Session<T>,
        caps: &CapabilitySet,
        uids: &[u32],
        destination: &str,
    ) -> MailResult<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
    {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(MailError::Action("move destination is required".to_string()));
        }
        if uids.is_empty() {
            return Ok(());
        }

        let set = uid_set(uids);
        match Self::move_plan(caps) {
            MovePlan::Native => {
                session
                    .uid_mv(&set, destination)
                    .await
                    .map_err(|e| MailError::Action(format!("UID MOVE to {} failed: {}", destination, e)))?;
            }
            MovePlan::CopyFallback { uid_expunge } => {
                log::debug!("server lacks MOVE, copying {} to {}", set, destination);
                session
                    .uid_copy(&set, destination)
                    .await
                    .map_err(|e| MailError::Action(format!("UID COPY to {} failed: {}", destination, e)))?;

                self.flag_deleted(session, &set).await?;
                if uid_expunge {
                    self.uid_expunge(session, &set).await?;
                } else {
                    self.expunge(session).await?;
                }
            }
        }

        log::info!("Moved {} message(s) to {}", uids.len(), destination);
        Ok(())
    }

    /// Flag UIDs `\Deleted`, then expunge them if asked.
    pub async fn delete_uids<T>(
        &self,
        session: &mut Session<T>,
        caps: &CapabilitySet,
        uids: &[u32],
        expunge: bool,
    ) -> MailResult<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
    {
        if uids.is_empty() {
            return Ok(());
        }

        let set = uid_set(uids);
        self.flag_deleted(session, &set).await?;

        match Self::delete_plan(caps, expunge) {
            DeletePlan::FlagOnly => {}
            DeletePlan::FlagAndUidExpunge => self.uid_expunge(session, &set).await?,
            DeletePlan::FlagAndExpunge => {
                log::debug!("server lacks UIDPLUS, expunging whole mailbox");
                self.expunge(session).await?;
            }
        }

        log::info!("Deleted {} message(s) (expunge: {})", uids.len(), expunge);
        Ok(())
    }

    async fn flag_deleted<T>(&self, session: &mut Session<T>, set: &str) -> MailResult<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
    {
        let mut stream = session
            .uid_store(set, "+FLAGS.SILENT (\\Deleted)")
            .await
            .map_err(|e| MailError::Action(format!("UID STORE \\Deleted failed: {}", e)))?;
        while let Some(result) = stream.next().await {
            result.map_err(|e| MailError::Action(format!("UID STORE \\Deleted failed: {}", e)))?;
        }
        Ok(())
    }

    async fn uid_expunge<T>(&self, session: &mut Session<T>, set: &str) -> MailResult<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
    {
        let expunge_stream = session
            .uid_expunge(set)
            .await
            .map_err(|e| MailError::Action(format!("UID EXPUNGE failed: {}", e)))?;
        pin_mut!(expunge_stream);
        while let Some(result) = expunge_stream.next().await {
            result.map_err(|e| MailError::Action(format!("UID EXPUNGE failed: {}", e)))?;
        }
        Ok(())
    }

    async fn expunge<T>(&self, session: &mut Session<T>) -> MailResult<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
    {
        let expunge_stream = session
            .expunge()
            .await
            .map_err(|e| MailError::Action(format!("EXPUNGE failed: {}", e)))?;
        pin_mut!(expunge_stream);
        while let Some(result) = expunge_stream.next().await {
            result.map_err(|e| MailError::Action(format!("EXPUNGE failed: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::scripted::{commands_after_login, login, Script};
    use crate::mail::CAP_IDLE;

    #[test]
    fn test_move_prefers_native() {
        let caps = CapabilitySet::new([CAP_MOVE, CAP_UIDPLUS]);
        assert_eq!(ActionManager::move_plan(&caps), MovePlan::Native);
    }

    #[test]
    fn test_move_falls_back_to_copy() {
        let caps = CapabilitySet::new([CAP_UIDPLUS]);
        assert_eq!(
            ActionManager::move_plan(&caps),
            MovePlan::CopyFallback { uid_expunge: true }
        );

        let caps = CapabilitySet::new([CAP_IDLE]);
        assert_eq!(
            ActionManager::move_plan(&caps),
            MovePlan::CopyFallback { uid_expunge: false }
        );
    }

    #[test]
    fn test_delete_plan() {
        let uidplus = CapabilitySet::new([CAP_UIDPLUS]);
        let plain = CapabilitySet::default();

        assert_eq!(ActionManager::delete_plan(&uidplus, false), DeletePlan::FlagOnly);
        assert_eq!(ActionManager::delete_plan(&plain, false), DeletePlan::FlagOnly);
        assert_eq!(
            ActionManager::delete_plan(&uidplus, true),
            DeletePlan::FlagAndUidExpunge
        );
        assert_eq!(ActionManager::delete_plan(&plain, true), DeletePlan::FlagAndExpunge);
    }

    #[tokio::test]
    async fn test_native_move_sends_uid_move() {
        let (mut session, server) = login(Script::default()).await;
        let caps = CapabilitySet::new([CAP_MOVE]);

        ActionManager::new()
            .move_uids(&mut session, &caps, &[4, 3], "Archive")
            .await
            .unwrap();

        let commands = commands_after_login(session, server).await;
        assert_eq!(commands, vec!["UID MOVE 3:4 Archive"]);
    }

    #[tokio::test]
    async fn test_copy_fallback_with_uidplus_expunges_only_moved_uids() {
        let (mut session, server) = login(Script::default()).await;
        let caps = CapabilitySet::new([CAP_UIDPLUS]);

        ActionManager::new()
            .move_uids(&mut session, &caps, &[4, 3, 9], "Archive")
            .await
            .unwrap();

        let commands = commands_after_login(session, server).await;
        assert_eq!(
            commands,
            vec![
                "UID COPY 3:4,9 Archive",
                "UID STORE 3:4,9 +FLAGS.SILENT (\\Deleted)",
                "UID EXPUNGE 3:4,9",
            ]
        );
    }

    #[tokio::test]
    async fn test_copy_fallback_without_uidplus_expunges_mailbox() {
        let (mut session, server) = login(Script::default()).await;

        ActionManager::new()
            .move_uids(&mut session, &CapabilitySet::default(), &[12], "Archive")
            .await
            .unwrap();

        let commands = commands_after_login(session, server).await;
        assert_eq!(
            commands,
            vec![
                "UID COPY 12 Archive",
                "UID STORE 12 +FLAGS.SILENT (\\Deleted)",
                "EXPUNGE",
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_copy_leaves_messages_untouched() {
        let (mut session, server) = login(Script {
            reject: Some("UID COPY"),
            ..Default::default()
        })
        .await;

        let err = ActionManager::new()
            .move_uids(&mut session, &CapabilitySet::default(), &[3], "Missing")
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Action(_)));

        let commands = commands_after_login(session, server).await;
        assert_eq!(commands, vec!["UID COPY 3 Missing"]);
    }

    #[tokio::test]
    async fn test_delete_command_sequences() {
        let actions = ActionManager::new();

        let (mut session, server) = login(Script::default()).await;
        actions
            .delete_uids(&mut session, &CapabilitySet::default(), &[7], false)
            .await
            .unwrap();
        assert_eq!(
            commands_after_login(session, server).await,
            vec!["UID STORE 7 +FLAGS.SILENT (\\Deleted)"]
        );

        let (mut session, server) = login(Script::default()).await;
        actions
            .delete_uids(&mut session, &CapabilitySet::new([CAP_UIDPLUS]), &[7, 8], true)
            .await
            .unwrap();
        assert_eq!(
            commands_after_login(session, server).await,
            vec!["UID STORE 7:8 +FLAGS.SILENT (\\Deleted)", "UID EXPUNGE 7:8"]
        );

        let (mut session, server) = login(Script::default()).await;
        actions
            .delete_uids(&mut session, &CapabilitySet::default(), &[7], true)
            .await
            .unwrap();
        assert_eq!(
            commands_after_login(session, server).await,
            vec!["UID STORE 7 +FLAGS.SILENT (\\Deleted)", "EXPUNGE"]
        );
    }

    #[tokio::test]
    async fn test_empty_uid_list_sends_nothing() {
        let (mut session, server) = login(Script::default()).await;
        let actions = ActionManager::new();
        actions
            .move_uids(&mut session, &CapabilitySet::default(), &[], "Archive")
            .await
            .unwrap();
        actions
            .delete_uids(&mut session, &CapabilitySet::default(), &[], true)
            .await
            .unwrap();

        assert!(commands_after_login(session, server).await.is_empty());
    }
}
