//! In-memory IMAP server for driving a real `Session`.
//!
//! Every command is answered with a tagged OK unless it matches `reject`.
//! The server records each command line without its tag and with quotes
//! stripped, and hands the list back once the client hangs up.

use async_imap::Session;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

pub type ScriptedSession = Session<Compat<DuplexStream>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct Script {
    /// Commands starting with this prefix get a tagged NO
    pub reject: Option<&'static str>,
    /// EXISTS count pushed right after the first IDLE continuation
    pub exists_on_first_idle: Option<u32>,
    /// Close the connection as soon as IDLE is accepted
    pub hang_up_on_idle: bool,
}

/// Log in over a fresh duplex pipe and return the session plus the server
/// task, which resolves to the recorded commands.
pub async fn login(script: Script) -> (ScriptedSession, JoinHandle<Vec<String>>) {
    let (client_io, server_io) = tokio::io::duplex(8 * 1024);
    let server = tokio::spawn(serve(server_io, script));

    let client = async_imap::Client::new(client_io.compat());
    let session = client
        .login("sweep", "secret")
        .await
        .map_err(|(e, _)| e)
        .unwrap();
    (session, server)
}

/// Commands recorded after LOGIN, once the session is gone.
pub async fn commands_after_login(
    session: ScriptedSession,
    server: JoinHandle<Vec<String>>,
) -> Vec<String> {
    drop(session);
    let commands = server.await.unwrap();
    assert!(commands[0].starts_with("LOGIN"), "{:?}", commands);
    commands[1..].to_vec()
}

async fn serve(io: DuplexStream, script: Script) -> Vec<String> {
    let (read, mut write) = tokio::io::split(io);
    let mut lines = BufReader::new(read).lines();
    let mut commands = Vec::new();
    let mut idle_tag: Option<String> = None;
    let mut idles = 0;

    while let Ok(Some(line)) = lines.next_line().await {
        if line == "DONE" {
            commands.push(line);
            if let Some(tag) = idle_tag.take() {
                let reply = format!("{} OK IDLE terminated\r\n", tag);
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            continue;
        }

        let (tag, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let command = rest.replace('"', "");
        commands.push(command.clone());

        let reply = if command == "IDLE" {
            idles += 1;
            if script.hang_up_on_idle {
                let _ = write.write_all(b"+ idling\r\n").await;
                break;
            }
            idle_tag = Some(tag.to_string());
            let mut reply = "+ idling\r\n".to_string();
            if let (1, Some(count)) = (idles, script.exists_on_first_idle) {
                reply.push_str(&format!("* {} EXISTS\r\n", count));
            }
            reply
        } else if script.reject.is_some_and(|prefix| command.starts_with(prefix)) {
            format!("{} NO [TRYCREATE] mailbox does not exist\r\n", tag)
        } else {
            let verb = command.split(' ').next().unwrap_or_default();
            format!("{} OK {} completed\r\n", tag, verb)
        };

        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }

    commands
}
