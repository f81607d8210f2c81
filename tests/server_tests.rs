//! Integration tests for the server module

use practica::client::{Client, Rejection};
use practica::collab::{Collaborators, InMemoryCatalog, InMemoryFeedback, StaticIdentity};
use practica::config::SessionsConfig;
use practica::error::ErrorKind;
use practica::gateway::SessionGateway;
use practica::hub::SessionEvent;
use practica::protocol::{
    recv_message, send_message, ClientMessage, Request, ServerMessage, PROTOCOL_VERSION,
};
use practica::server::ServerListener;
use practica::session::{
    Phase, Role, SessionCode, SessionConfig, SessionStatus, SessionStore, UserId,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct TestServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = timeout(Duration::from_secs(2), self.handle).await;
    }
}

/// Start a server on an ephemeral port where any token names its own user.
async fn start_server() -> TestServer {
    let catalog = InMemoryCatalog::new().with_topic("respiratory", ["asthma", "copd"]);
    let collab = Collaborators::new(Arc::new(catalog), Arc::new(InMemoryFeedback::new()));
    let gateway = SessionGateway::start(
        SessionStore::in_memory(),
        collab,
        SessionsConfig::default(),
    )
    .await
    .unwrap();

    let identity = StaticIdentity::new(HashMap::new()).with_anonymous(true);
    let listener = ServerListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        gateway,
        Arc::new(identity),
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let handle = tokio::spawn(async move { listener.run(shutdown_rx).await });

    TestServer {
        addr,
        shutdown_tx,
        handle,
    }
}

fn session_config() -> SessionConfig {
    SessionConfig::topics(vec!["respiratory".into()], &SessionsConfig::default())
}

async fn next_event(client: &mut Client) -> SessionEvent {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next_message())
            .await
            .expect("Should receive message")
            .expect("Connection should stay open");
        if let ServerMessage::Event(envelope) = msg {
            return envelope.event;
        }
    }
}

#[tokio::test]
async fn test_server_handles_hello() {
    let server = start_server().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    send_message(
        &mut stream,
        &ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            token: "alice".into(),
        },
    )
    .await
    .unwrap();

    let response: ServerMessage = timeout(Duration::from_secs(2), recv_message(&mut stream))
        .await
        .expect("Should receive response")
        .unwrap()
        .expect("Response should not be empty");

    match response {
        ServerMessage::Welcome {
            user_id,
            protocol_version,
            ..
        } => {
            assert_eq!(user_id.as_str(), "alice");
            assert_eq!(protocol_version, PROTOCOL_VERSION);
        }
        _ => panic!("Expected Welcome message, got {:?}", response),
    }

    send_message(&mut stream, &ClientMessage::Ping).await.unwrap();
    let pong: Option<ServerMessage> = recv_message(&mut stream).await.unwrap();
    assert_eq!(pong, Some(ServerMessage::Pong));

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_server_rejects_wrong_protocol_version() {
    let server = start_server().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    send_message(
        &mut stream,
        &ClientMessage::Hello {
            protocol_version: 999,
            token: "alice".into(),
        },
    )
    .await
    .unwrap();

    let response: ServerMessage = timeout(Duration::from_secs(2), recv_message(&mut stream))
        .await
        .expect("Should receive response")
        .unwrap()
        .expect("Response should not be empty");

    match response {
        ServerMessage::Error { message } => {
            assert!(message.contains("Protocol version mismatch"));
        }
        _ => panic!("Expected Error message, got {:?}", response),
    }

    // the server closes the connection afterwards
    let closed: Option<ServerMessage> = timeout(Duration::from_secs(2), recv_message(&mut stream))
        .await
        .unwrap()
        .unwrap();
    assert!(closed.is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_server_requires_hello_first() {
    let server = start_server().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    send_message(&mut stream, &ClientMessage::Ping).await.unwrap();

    let response: Option<ServerMessage> = recv_message(&mut stream).await.unwrap();
    assert!(matches!(response, Some(ServerMessage::Error { .. })));

    server.stop().await;
}

#[tokio::test]
async fn test_create_join_and_events() {
    let server = start_server().await;

    let mut host = Client::connect(server.addr, "host").await.unwrap();
    let created = host
        .act(Request::CreateSession {
            config: session_config(),
            role: Role::Host,
        })
        .await
        .unwrap();
    assert_eq!(created.phase, Phase::Waiting);
    let code = created.code.clone();
    assert!(matches!(next_event(&mut host).await, SessionEvent::SessionUpdate { .. }));

    let mut doctor = Client::connect(server.addr, "doc").await.unwrap();
    let joined = doctor
        .act(Request::Join {
            code: code.clone(),
            role: Role::Doctor,
        })
        .await
        .unwrap();
    assert_eq!(joined.available_roles, vec![Role::Patient, Role::Observer]);
    assert!(matches!(
        next_event(&mut host).await,
        SessionEvent::RoleChange { .. } | SessionEvent::ParticipantUpdate { .. }
    ));

    let mut patient = Client::connect(server.addr, "pat").await.unwrap();
    assert_eq!(
        patient.available_roles(code.clone()).await.unwrap(),
        vec![Role::Patient, Role::Observer]
    );
    patient
        .act(Request::Join {
            code: code.clone(),
            role: Role::Patient,
        })
        .await
        .unwrap();

    let started = doctor.act(Request::Start).await.unwrap();
    assert_eq!(started.phase, Phase::Reading);
    assert_eq!(started.status, SessionStatus::InProgress);

    loop {
        if let SessionEvent::PhaseChange { phase, .. } = next_event(&mut patient).await {
            assert_eq!(phase, Phase::Reading);
            break;
        }
    }

    host.act(Request::Chat {
        text: "good luck".into(),
    })
    .await
    .unwrap();
    loop {
        if let SessionEvent::ChatMessage { from, text, .. } = next_event(&mut patient).await {
            assert_eq!(from.as_str(), "host");
            assert_eq!(text, "good luck");
            break;
        }
    }

    server.stop().await;
}

#[tokio::test]
async fn test_rejections_are_typed() {
    let server = start_server().await;

    let mut host = Client::connect(server.addr, "host").await.unwrap();

    let err = host.act(Request::Start).await.unwrap_err();
    let rejection = err.downcast_ref::<Rejection>().expect("typed rejection");
    assert_eq!(rejection.kind, ErrorKind::Validation);

    let code = host
        .act(Request::CreateSession {
            config: session_config(),
            role: Role::Host,
        })
        .await
        .unwrap()
        .code;

    let mut doc = Client::connect(server.addr, "doc").await.unwrap();
    doc.act(Request::Join {
        code: code.clone(),
        role: Role::Doctor,
    })
    .await
    .unwrap();

    let mut rival = Client::connect(server.addr, "rival").await.unwrap();
    let err = rival
        .act(Request::Join {
            code: code.clone(),
            role: Role::Doctor,
        })
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<Rejection>().map(|r| r.kind),
        Some(ErrorKind::RoleConflict)
    );

    let err = host.act(Request::Start).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<Rejection>().map(|r| r.kind),
        Some(ErrorKind::InvalidTransition)
    );

    let err = rival
        .act(Request::Snapshot {
            code: Some(SessionCode::parse("QQQQ22").unwrap()),
        })
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<Rejection>().map(|r| r.kind),
        Some(ErrorKind::NotFound)
    );

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_token_is_refused() {
    let catalog = InMemoryCatalog::new();
    let collab = Collaborators::new(Arc::new(catalog), Arc::new(InMemoryFeedback::new()));
    let gateway = SessionGateway::start(
        SessionStore::in_memory(),
        collab,
        SessionsConfig::default(),
    )
    .await
    .unwrap();
    let tokens = HashMap::from([("t-1".to_string(), UserId::new("alice"))]);
    let listener = ServerListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        gateway,
        Arc::new(StaticIdentity::new(tokens)),
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let handle = tokio::spawn(async move { listener.run(shutdown_rx).await });

    assert!(Client::connect(addr, "nope").await.is_err());
    let client = Client::connect(addr, "t-1").await.unwrap();
    assert_eq!(client.user().as_str(), "alice");

    let _ = shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn test_leaving_client_is_removed() {
    let server = start_server().await;

    let mut host = Client::connect(server.addr, "host").await.unwrap();
    let code = host
        .act(Request::CreateSession {
            config: session_config(),
            role: Role::Host,
        })
        .await
        .unwrap()
        .code;

    let mut observer = Client::connect(server.addr, "obs").await.unwrap();
    observer
        .act(Request::Join {
            code: code.clone(),
            role: Role::Observer,
        })
        .await
        .unwrap();
    observer.leaving().await.unwrap();
    drop(observer);

    loop {
        if let SessionEvent::UserLeft {
            user_id,
            disconnected,
            ..
        } = next_event(&mut host).await
        {
            assert_eq!(user_id.as_str(), "obs");
            assert!(disconnected);
            break;
        }
    }

    let snapshot = host.act(Request::Snapshot { code: None }).await.unwrap();
    assert!(!snapshot.participant(&UserId::new("obs")).is_some_and(|p| p.is_active));
    // a host alone without a DOCTOR cannot go on
    assert_eq!(snapshot.status, SessionStatus::Cancelled);

    server.stop().await;
}

#[tokio::test]
async fn test_rejoining_same_session_keeps_subscription() {
    let server = start_server().await;

    let mut host = Client::connect(server.addr, "host").await.unwrap();
    let code = host
        .act(Request::CreateSession {
            config: session_config(),
            role: Role::Host,
        })
        .await
        .unwrap()
        .code;

    let mut doctor = Client::connect(server.addr, "doc").await.unwrap();
    for _ in 0..2 {
        doctor
            .act(Request::Join {
                code: code.clone(),
                role: Role::Doctor,
            })
            .await
            .unwrap();
    }

    host.act(Request::Chat {
        text: "still there?".into(),
    })
    .await
    .unwrap();

    loop {
        let msg = timeout(Duration::from_secs(2), doctor.next_message())
            .await
            .expect("Should receive message")
            .expect("Connection should stay open");
        match msg {
            ServerMessage::Unsubscribed { .. } => panic!("subscription dropped on rejoin"),
            ServerMessage::Event(envelope) => {
                if let SessionEvent::ChatMessage { text, .. } = envelope.event {
                    assert_eq!(text, "still there?");
                    break;
                }
            }
            _ => {}
        }
    }

    server.stop().await;
}
