//! IDLE support
//!
//! The IDLE round trip runs on its own task so the watch loop can wait on
//! mailbox updates, cancellation and timers at the same time. EXISTS counts
//! are published into a single-slot channel where the latest count wins.

use super::{client::IdleHandle, MailError, MailResult};
use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::Session;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::pin_mut;
use std::fmt;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Create the single-slot update channel.
pub fn mailbox_updates() -> (UpdateSender, UpdateReceiver) {
    let (tx, rx) = watch::channel(None);
    (UpdateSender { tx }, UpdateReceiver { rx })
}

/// Producer side; publishing never blocks and overwrites any pending count.
#[derive(Debug, Clone)]
pub struct UpdateSender {
    tx: watch::Sender<Option<u32>>,
}

impl UpdateSender {
    pub fn publish(&self, count: u32) {
        log::debug!("mailbox update: {} messages", count);
        self.tx.send_replace(Some(count));
    }

    pub fn subscribe(&self) -> UpdateReceiver {
        UpdateReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consumer side of the update channel
#[derive(Debug, Clone)]
pub struct UpdateReceiver {
    rx: watch::Receiver<Option<u32>>,
}

impl UpdateReceiver {
    /// Wait for the next unseen count. Pending forever once every sender is
    /// gone, so it can sit in a `select!` without spinning.
    pub async fn recv(&mut self) -> u32 {
        loop {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            if let Some(count) = *self.rx.borrow_and_update() {
                return count;
            }
        }
    }

    /// Take a pending count without waiting.
    pub fn try_recv(&mut self) -> Option<u32> {
        if self.rx.has_changed().unwrap_or(false) {
            *self.rx.borrow_and_update()
        } else {
            None
        }
    }
}

/// Map an error from the IDLE round trip. Only "the socket is already gone"
/// failures become [`MailError::ConnectionClosed`].
pub fn classify_idle_error(err: async_imap::error::Error) -> MailError {
    use async_imap::error::Error;

    let closed = match &err {
        Error::ConnectionLost => true,
        Error::Io(io) => matches!(
            io.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::UnexpectedEof
                | ErrorKind::NotConnected
        ),
        _ => false,
    };

    if closed {
        MailError::ConnectionClosed(err.to_string())
    } else {
        MailError::Imap(format!("IDLE failed: {}", err))
    }
}

type IdleOutcome<T> = MailResult<Session<T>>;

/// IDLE running on a background task that owns the session until stopped.
pub struct IdleCommand<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<IdleOutcome<T>>>,
    outcome: Option<IdleOutcome<T>>,
}

impl<T> IdleCommand<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    /// Take ownership of the session and start idling.
    ///
    /// IDLE is re-issued every `keepalive` so servers that drop idle
    /// connections after 30 minutes keep us around.
    pub fn spawn(session: Session<T>, updates: UpdateSender, keepalive: Duration) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(idle_loop(session, updates, keepalive, stop_rx));
        Self {
            stop: Some(stop_tx),
            task: Some(task),
            outcome: None,
        }
    }

    /// Send DONE, wait for the server to finish IDLE and hand the session back.
    pub async fn finish(mut self) -> IdleOutcome<T> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.task.take() {
            Some(task) => join_outcome(task.await),
            None => Err(MailError::NotConnected),
        }
    }
}

fn join_outcome<T>(
    joined: Result<IdleOutcome<T>, tokio::task::JoinError>,
) -> IdleOutcome<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    joined.unwrap_or_else(|e| Err(MailError::Imap(format!("IDLE task failed: {}", e))))
}

#[async_trait]
impl<T> IdleHandle for IdleCommand<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    async fn terminated(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        match self.task.as_mut() {
            Some(task) => {
                let joined = task.await;
                self.task = None;
                self.outcome = Some(join_outcome(joined));
            }
            None => std::future::pending::<()>().await,
        }
    }
}

async fn idle_loop<T>(
    mut session: Session<T>,
    updates: UpdateSender,
    keepalive: Duration,
    mut stop: oneshot::Receiver<()>,
) -> IdleOutcome<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    loop {
        let mut handle = session.idle();
        handle.init().await.map_err(classify_idle_error)?;

        let stopped = {
            let (wait, interrupt) = handle.wait_with_timeout(keepalive);
            pin_mut!(wait);

            let (response, stopped) = tokio::select! {
                response = &mut wait => (response, false),
                _ = &mut stop => {
                    drop(interrupt);
                    (wait.await, true)
                }
            };

            match response.map_err(classify_idle_error)? {
                IdleResponse::NewData(data) => {
                    if let Response::MailboxData(MailboxDatum::Exists(count)) = data.parsed() {
                        updates.publish(*count);
                    }
                }
                IdleResponse::Timeout => log::debug!("IDLE keepalive expired, re-issuing"),
                IdleResponse::ManualInterrupt => {}
            }
            stopped
        };

        session = handle.done().await.map_err(classify_idle_error)?;
        if stopped {
            return Ok(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_updates_coalesce_to_latest() {
        let (tx, mut rx) = mailbox_updates();
        tx.publish(3);
        tx.publish(4);
        tx.publish(5);

        assert_eq!(rx.recv().await, 5);
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_publish_never_blocks_without_reader() {
        let (tx, rx) = mailbox_updates();
        drop(rx);
        tx.publish(1);

        let mut late = tx.subscribe();
        tx.publish(2);
        assert_eq!(late.try_recv(), Some(2));
    }

    #[tokio::test]
    async fn test_recv_pends_after_sender_dropped() {
        let (tx, mut rx) = mailbox_updates();
        drop(tx);

        let waited = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_classify_idle_errors() {
        use async_imap::error::Error;

        let reset = Error::Io(std::io::Error::new(ErrorKind::ConnectionReset, "reset"));
        assert!(classify_idle_error(reset).is_benign_idle_error());
        assert!(classify_idle_error(Error::ConnectionLost).is_benign_idle_error());

        let refused = Error::Io(std::io::Error::new(ErrorKind::PermissionDenied, "nope"));
        assert!(!classify_idle_error(refused).is_benign_idle_error());
        assert!(!classify_idle_error(Error::Bad("IDLE".into())).is_benign_idle_error());
    }

    #[tokio::test]
    async fn test_idle_publishes_exists_and_hands_session_back() {
        use crate::mail::scripted::{commands_after_login, login, Script};

        let (session, server) = login(Script {
            exists_on_first_idle: Some(5),
            ..Default::default()
        })
        .await;
        let (tx, mut rx) = mailbox_updates();
        let idle = IdleCommand::spawn(session, tx, Duration::from_secs(60));

        let count = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(count, 5);

        let mut session = tokio::time::timeout(Duration::from_secs(5), idle.finish())
            .await
            .unwrap()
            .unwrap();
        session.noop().await.unwrap();

        let commands = commands_after_login(session, server).await;
        assert_eq!(commands, vec!["IDLE", "DONE", "IDLE", "DONE", "NOOP"]);
    }

    #[tokio::test]
    async fn test_idle_hang_up_is_benign() {
        use crate::mail::scripted::{login, Script};

        let (session, server) = login(Script {
            hang_up_on_idle: true,
            ..Default::default()
        })
        .await;
        let (tx, _rx) = mailbox_updates();
        let mut idle = IdleCommand::spawn(session, tx, Duration::from_secs(60));

        tokio::time::timeout(Duration::from_secs(5), idle.terminated())
            .await
            .unwrap();
        let err = idle.finish().await.unwrap_err();
        assert!(err.is_benign_idle_error(), "{:?}", err);

        let commands = server.await.unwrap();
        assert_eq!(commands.last().map(String::as_str), Some("IDLE"));
    }
}
