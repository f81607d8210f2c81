//! Client - connection to a practica server and the interactive console

mod commands;
mod input;
mod renderer;

pub use renderer::{render_event, render_snapshot};

use crate::client::commands::{handle_control_command, CommandResult, HELP};
use crate::client::input::{parse_input, ParsedInput};
use crate::error::ErrorKind;
use crate::protocol::{
    recv_message, send_message, ClientMessage, Request, ServerMessage, PROTOCOL_VERSION,
};
use crate::session::{Role, SessionCode, SessionSnapshot, UserId};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Heartbeat period used by the console
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// A request the server refused
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct Rejection {
    pub kind: ErrorKind,
    pub message: String,
}

/// Connection to a practica server
pub struct Client {
    writer: OwnedWriteHalf,
    inbound: mpsc::Receiver<ServerMessage>,
    /// Messages read while waiting for a reply
    backlog: VecDeque<ServerMessage>,
    reader: JoinHandle<()>,
    next_id: u64,
    user: UserId,
}

impl Client {
    /// Connect and complete the handshake
    pub async fn connect(addr: SocketAddr, token: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        let (mut read_half, mut writer) = stream.into_split();

        send_message(
            &mut writer,
            &ClientMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                token: token.to_string(),
            },
        )
        .await?;

        let user = match recv_message::<ServerMessage, _>(&mut read_half).await? {
            Some(ServerMessage::Welcome { user_id, .. }) => user_id,
            Some(ServerMessage::Error { message }) => bail!("Server refused connection: {}", message),
            Some(other) => bail!("Unexpected handshake response: {:?}", other),
            None => bail!("Server closed the connection during handshake"),
        };

        let (tx, inbound) = mpsc::channel(256);
        let reader = tokio::spawn(async move {
            loop {
                match recv_message::<ServerMessage, _>(&mut read_half).await {
                    Ok(Some(msg)) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Failed to read from server: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!("Client reader task finished");
        });

        Ok(Self {
            writer,
            inbound,
            backlog: VecDeque::new(),
            reader,
            next_id: 1,
            user,
        })
    }

    /// Identity the server resolved for our token
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Send a request and wait for the message answering it.
    ///
    /// Events that arrive in the meantime are kept for [`Client::next_message`].
    pub async fn request(&mut self, request: Request) -> Result<ServerMessage> {
        let id = self.next_id;
        self.next_id += 1;
        send_message(&mut self.writer, &ClientMessage::Request { id, request }).await?;

        loop {
            let msg = self
                .inbound
                .recv()
                .await
                .ok_or_else(|| anyhow!("Connection closed while waiting for reply"))?;
            match &msg {
                ServerMessage::Reply { id: reply_id, .. }
                | ServerMessage::Roles { id: reply_id, .. }
                | ServerMessage::Rejected { id: reply_id, .. }
                    if *reply_id == id =>
                {
                    return Ok(msg)
                }
                _ => self.backlog.push_back(msg),
            }
        }
    }

    /// Send a session request and return the resulting snapshot.
    ///
    /// A refusal comes back as an error wrapping [`Rejection`].
    pub async fn act(&mut self, request: Request) -> Result<SessionSnapshot> {
        match self.request(request).await? {
            ServerMessage::Reply { snapshot, .. } => Ok(snapshot),
            ServerMessage::Rejected { kind, message, .. } => Err(Rejection { kind, message }.into()),
            other => bail!("Unexpected response: {:?}", other),
        }
    }

    pub async fn available_roles(&mut self, code: SessionCode) -> Result<Vec<Role>> {
        match self.request(Request::AvailableRoles { code }).await? {
            ServerMessage::Roles { roles, .. } => Ok(roles),
            ServerMessage::Rejected { kind, message, .. } => Err(Rejection { kind, message }.into()),
            other => bail!("Unexpected response: {:?}", other),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        send_message(&mut self.writer, &ClientMessage::Ping).await
    }

    /// Tell the server we are going away
    pub async fn leaving(&mut self) -> Result<()> {
        send_message(&mut self.writer, &ClientMessage::Leaving).await
    }

    /// Next message that was not a reply. `None` once the server is gone.
    pub async fn next_message(&mut self) -> Option<ServerMessage> {
        if let Some(msg) = self.backlog.pop_front() {
            return Some(msg);
        }
        self.inbound.recv().await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Interactive session: print events, turn input lines into requests.
pub async fn run_console(mut client: Client, snapshot: SessionSnapshot) -> Result<()> {
    println!("{}", render_snapshot(&snapshot));
    println!("Type :help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut heartbeat = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let request = match parse_input(&line) {
                    ParsedInput::Empty => continue,
                    ParsedInput::Text(text) => Request::Chat { text },
                    ParsedInput::ControlCommand { command, args } => {
                        match handle_control_command(&command, &args) {
                            Ok(CommandResult::Send(request)) => request,
                            Ok(CommandResult::Help) => {
                                println!("{}", HELP);
                                continue;
                            }
                            Ok(CommandResult::Exit) => break,
                            Err(e) => {
                                println!("{}", e);
                                continue;
                            }
                        }
                    }
                };
                let is_state = matches!(request, Request::Snapshot { .. });
                match client.act(request).await {
                    Ok(snapshot) if is_state => println!("{}", render_snapshot(&snapshot)),
                    Ok(_) => {}
                    Err(e) => println!("! {}", e),
                }
            }

            msg = client.next_message() => {
                match msg {
                    Some(ServerMessage::Event(envelope)) => println!("{}", render_event(&envelope)),
                    Some(ServerMessage::Unsubscribed { code }) => {
                        println!("No longer receiving events for {}", code);
                        break;
                    }
                    Some(ServerMessage::Error { message }) => println!("! {}", message),
                    Some(_) => {}
                    None => {
                        println!("Server closed the connection");
                        return Ok(());
                    }
                }
            }

            _ = heartbeat.tick() => {
                client.ping().await?;
            }
        }
    }

    if let Err(e) = client.act(Request::Leave).await {
        tracing::debug!("Leave on exit failed: {}", e);
    }
    client.leaving().await
}
