//! Integration tests for protocol serialization

use chrono::Utc;
use practica::error::ErrorKind;
use practica::hub::{Envelope, SessionEvent};
use practica::protocol::{
    deserialize, frame_message, read_frame, recv_message, serialize, write_frame,
    ClientMessage, Request, ServerMessage,
};
use practica::session::{EndReason, Phase, Role, SessionCode, SessionStatus, TimingType, UserId};

fn code() -> SessionCode {
    SessionCode::parse("abc234").unwrap()
}

#[test]
fn test_client_message_roundtrip() {
    let messages = vec![
        ClientMessage::Hello {
            protocol_version: 1,
            token: "t-1".to_string(),
        },
        ClientMessage::Request {
            id: 3,
            request: Request::Join {
                code: code(),
                role: Role::Patient,
            },
        },
        ClientMessage::Request {
            id: 4,
            request: Request::SubmitFeedback {
                to: UserId::new("doc"),
                payload: serde_json::json!({"comment": "clear", "score": 4}),
            },
        },
        ClientMessage::Ping,
        ClientMessage::Leaving,
    ];

    for msg in messages {
        let encoded = serialize(&msg).expect("serialize failed");
        let decoded: ClientMessage = deserialize(&encoded).expect("deserialize failed");
        assert_eq!(msg, decoded);
    }
}

#[test]
fn test_server_event_roundtrip() {
    let msg = ServerMessage::Event(Envelope {
        code: code(),
        seq: 12,
        event: SessionEvent::TimerStart {
            phase: Phase::Consultation,
            generation: 2,
            timing: TimingType::Stopwatch,
            started_at: Utc::now(),
            duration_secs: None,
            deadline: None,
        },
    });

    let encoded = serialize(&msg).expect("serialize failed");
    let decoded: ServerMessage = deserialize(&encoded).expect("deserialize failed");
    assert_eq!(msg, decoded);
}

#[test]
fn test_rejection_roundtrip() {
    let msg = ServerMessage::Rejected {
        id: 9,
        kind: ErrorKind::RoleConflict,
        message: "role DOCTOR is already held in session ABC234".to_string(),
    };

    let decoded: ServerMessage = deserialize(&serialize(&msg).unwrap()).unwrap();
    assert_eq!(msg, decoded);
}

#[test]
fn test_event_json_shape() {
    let event = SessionEvent::SessionEnded {
        reason: EndReason::ParticipantsLeft,
        status: SessionStatus::Completed,
        phase: Phase::Completed,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "SESSION_ENDED");
    assert_eq!(json["reason"], "PARTICIPANTS_LEFT");
    assert_eq!(json["phase"], "COMPLETED");
}

#[test]
fn test_session_code_rejected_on_decode() {
    let bogus = serialize(&ClientMessage::Request {
        id: 1,
        request: Request::AvailableRoles { code: code() },
    })
    .unwrap();
    // swap the code for one with a forbidden character
    let mut tampered = bogus.clone();
    let at = tampered
        .windows(6)
        .position(|w| w == b"ABC234")
        .expect("code is encoded as a string");
    tampered[at + 3] = b'-';
    assert!(deserialize::<ClientMessage>(&tampered).is_err());
}

#[tokio::test]
async fn test_back_to_back_frames() {
    let mut buffer = frame_message(&serialize(&ClientMessage::Ping).unwrap());
    buffer.extend(frame_message(&serialize(&ClientMessage::Leaving).unwrap()));

    let mut reader = &buffer[..];
    let first: Option<ClientMessage> = recv_message(&mut reader).await.unwrap();
    assert_eq!(first, Some(ClientMessage::Ping));
    let second: Option<ClientMessage> = recv_message(&mut reader).await.unwrap();
    assert_eq!(second, Some(ClientMessage::Leaving));
    assert_eq!(read_frame(&mut reader).await.unwrap(), None);

    // a payload cut short is an error, not a clean end
    let mut truncated = &buffer[..6];
    assert!(read_frame(&mut truncated).await.is_err());
}

#[tokio::test]
async fn test_async_frames() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    write_frame(&mut a, b"hello").await.unwrap();
    drop(a);

    assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
    assert_eq!(read_frame(&mut b).await.unwrap(), None);
}
