//! Client connection handling

use crate::collab::IdentityResolver;
use crate::error::SessionError;
use crate::gateway::{Action, SessionGateway};
use crate::hub::{ConnectionId, DisconnectCause, Envelope, Subscriber};
use crate::protocol::{
    check_version_compatibility, recv_message, send_message, ClientMessage, Request,
    ServerMessage, PROTOCOL_VERSION,
};
use crate::session::{SessionCode, UserId};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A connected, greeted client
pub struct ClientConnection {
    /// Unique connection identifier
    id: ConnectionId,

    /// Resolved identity
    user: UserId,

    /// Session the connection is bound to after create or join
    bound: Option<SessionCode>,

    /// Channel to the writer task
    sender: mpsc::Sender<ServerMessage>,
}

impl ClientConnection {
    pub fn new(user: UserId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            bound: None,
            sender,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Send a message to the client
    pub async fn send(&self, msg: ServerMessage) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| anyhow!("Failed to send message to client"))
    }
}

/// Task to write outgoing messages to the client
pub async fn client_writer_task(mut writer: OwnedWriteHalf, mut receiver: mpsc::Receiver<ServerMessage>) {
    while let Some(msg) = receiver.recv().await {
        if let Err(e) = send_message(&mut writer, &msg).await {
            tracing::error!("Failed to write message to client: {}", e);
            break;
        }
    }
    tracing::debug!("Client writer task finished");
}

/// Relay a subscription's events to the writer until the hub drops it.
async fn forward_events(
    code: SessionCode,
    mut events: mpsc::Receiver<Envelope>,
    out: mpsc::Sender<ServerMessage>,
) {
    while let Some(envelope) = events.recv().await {
        if out.send(ServerMessage::Event(envelope)).await.is_err() {
            return;
        }
    }
    let _ = out.send(ServerMessage::Unsubscribed { code }).await;
}

/// Create an error message
pub fn create_error_message(message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        message: message.into(),
    }
}

fn rejected(id: u64, error: &SessionError) -> ServerMessage {
    ServerMessage::Rejected {
        id,
        kind: error.kind(),
        message: error.to_string(),
    }
}

/// Handle a single client connection from handshake to close
pub async fn handle_client(
    stream: TcpStream,
    gateway: Arc<SessionGateway>,
    identity: Arc<dyn IdentityResolver>,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();

    let (tx, rx) = mpsc::channel::<ServerMessage>(gateway.limits().subscriber_buffer);
    let writer_handle = tokio::spawn(client_writer_task(writer, rx));

    let Some(mut conn) = handshake(&mut reader, &tx, identity.as_ref()).await? else {
        // let the writer flush the handshake error before closing
        drop(tx);
        let _ = writer_handle.await;
        return Ok(());
    };
    tracing::info!(connection = %conn.id(), user = %conn.user(), peer = ?peer, "Client connected");

    let cause = loop {
        match recv_message::<ClientMessage, _>(&mut reader).await {
            Ok(Some(ClientMessage::Request { id, request })) => {
                gateway.touch(&conn.id());
                let response = process_request(&mut conn, &gateway, id, request).await;
                if let Err(e) = conn.send(response).await {
                    tracing::error!("Failed to send response: {}", e);
                    break DisconnectCause::Closed;
                }
            }
            Ok(Some(ClientMessage::Ping)) => {
                gateway.touch(&conn.id());
                if conn.send(ServerMessage::Pong).await.is_err() {
                    break DisconnectCause::Closed;
                }
            }
            Ok(Some(ClientMessage::Leaving)) => {
                tracing::info!(connection = %conn.id(), "Client is leaving");
                break DisconnectCause::Leaving;
            }
            Ok(Some(ClientMessage::Hello { .. })) => {
                let _ = conn.send(create_error_message("Already greeted")).await;
            }
            Ok(None) => {
                tracing::info!(connection = %conn.id(), "Client disconnected");
                break DisconnectCause::Closed;
            }
            Err(e) => {
                tracing::warn!(connection = %conn.id(), "Error reading from client: {}", e);
                break DisconnectCause::Closed;
            }
        }
    };

    gateway.connection_lost(&conn.id(), cause);
    writer_handle.abort();
    tracing::debug!(connection = %conn.id(), "Client handler finished");
    Ok(())
}

/// Expect `Hello`, check the version, resolve the token, and send `Welcome`.
async fn handshake<R>(
    reader: &mut R,
    tx: &mpsc::Sender<ServerMessage>,
    identity: &dyn IdentityResolver,
) -> Result<Option<ClientConnection>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let (protocol_version, token) = match recv_message::<ClientMessage, _>(reader).await? {
        Some(ClientMessage::Hello {
            protocol_version,
            token,
        }) => (protocol_version, token),
        Some(_) => {
            tx.send(create_error_message("Expected Hello")).await?;
            return Ok(None);
        }
        None => return Ok(None),
    };

    if let Err(e) = check_version_compatibility(protocol_version, PROTOCOL_VERSION) {
        tx.send(create_error_message(e.to_string())).await?;
        return Ok(None);
    }

    let user = match identity.resolve_identity(&token).await {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!("Handshake rejected: {}", e);
            tx.send(create_error_message(e.to_string())).await?;
            return Ok(None);
        }
    };

    let conn = ClientConnection::new(user, tx.clone());
    conn.send(ServerMessage::Welcome {
        connection_id: conn.id(),
        user_id: conn.user().clone(),
        protocol_version: PROTOCOL_VERSION,
    })
    .await?;
    Ok(Some(conn))
}

/// Process a request and build the message answering it
async fn process_request(
    conn: &mut ClientConnection,
    gateway: &SessionGateway,
    id: u64,
    request: Request,
) -> ServerMessage {
    let name = request.name();
    match run_request(conn, gateway, id, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(connection = %conn.id(), request = name, error = %e, "Request rejected");
            rejected(id, &e)
        }
    }
}

async fn run_request(
    conn: &mut ClientConnection,
    gateway: &SessionGateway,
    id: u64,
    request: Request,
) -> std::result::Result<ServerMessage, SessionError> {
    let snapshot = match request {
        Request::CreateSession { config, role } => {
            let created = gateway.create_session(conn.user(), config, role).await?;
            let (subscriber, events) = new_subscription(conn, gateway);
            let snapshot = gateway.subscribe(&created.code, subscriber).await?;
            attach(conn, created.code, events);
            snapshot
        }
        Request::Join { code, role } => {
            if gateway.hub().connection_code(&conn.id()).as_ref() == Some(&code) {
                // already receiving this session's events
                gateway
                    .dispatch(&code, conn.user(), Action::Join { role })
                    .await?
            } else {
                let (subscriber, events) = new_subscription(conn, gateway);
                let snapshot = gateway.join(&code, role, subscriber).await?;
                attach(conn, code, events);
                snapshot
            }
        }
        Request::Snapshot { code } => {
            let code = code.or_else(|| conn.bound.clone()).ok_or_else(not_bound)?;
            gateway.snapshot(&code).await?
        }
        Request::AvailableRoles { code } => {
            let roles = gateway.available_roles(&code).await?;
            return Ok(ServerMessage::Roles { id, code, roles });
        }
        Request::Leave => {
            let code = conn.bound.clone().ok_or_else(not_bound)?;
            let snapshot = gateway.dispatch(&code, conn.user(), Action::Leave).await?;
            conn.bound = None;
            snapshot
        }
        other => {
            let code = conn.bound.clone().ok_or_else(not_bound)?;
            let action = session_action(other).ok_or_else(|| {
                SessionError::validation("request does not act on a session")
            })?;
            gateway.dispatch(&code, conn.user(), action).await?
        }
    };
    Ok(ServerMessage::Reply { id, snapshot })
}

/// A subscription request for this connection and the queue it feeds.
fn new_subscription(conn: &ClientConnection, gateway: &SessionGateway) -> (Subscriber, mpsc::Receiver<Envelope>) {
    let (events_tx, events_rx) = mpsc::channel(gateway.limits().subscriber_buffer);
    let subscriber = Subscriber {
        connection: conn.id(),
        user: conn.user().clone(),
        sender: events_tx,
    };
    (subscriber, events_rx)
}

/// Start relaying `events` and make `code` the bound session.
fn attach(conn: &mut ClientConnection, code: SessionCode, events: mpsc::Receiver<Envelope>) {
    tokio::spawn(forward_events(code.clone(), events, conn.sender.clone()));
    conn.bound = Some(code);
}

fn not_bound() -> SessionError {
    SessionError::validation("create or join a session first")
}

fn session_action(request: Request) -> Option<Action> {
    let action = match request {
        Request::AssignRole { role } => Action::AssignRole { role },
        Request::Configure { config } => Action::Configure { config },
        Request::SelectCase { case } => Action::SelectCase { case },
        Request::NewCase => Action::NewCase,
        Request::Start => Action::Start,
        Request::SkipPhase => Action::SkipPhase,
        Request::EndConsultation => Action::EndConsultation,
        Request::SubmitFeedback { to, payload } => Action::SubmitFeedback { to, payload },
        Request::ForceComplete => Action::ForceComplete,
        Request::Chat { text } => Action::Chat { text },
        Request::EndSession => Action::EndSession,
        Request::Leave => Action::Leave,
        Request::CreateSession { .. }
        | Request::Join { .. }
        | Request::Snapshot { .. }
        | Request::AvailableRoles { .. } => return None,
    };
    Some(action)
}
