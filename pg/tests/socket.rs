//! Socket framing tests for `PgConnection`.
//!
//! A loopback listener plays the server, so these run without PostgreSQL.
//! Run: `cargo test -p typeprobe-pg --test socket`

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use typeprobe_pg::{
    BackendMessage, ConnectionOptions, FrontendMessage, MessageChannel, PgConnection, PgError,
    TransactionStatus,
};

/// Backend frame: tag, length, payload.
fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![tag];
    buf.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    frame(b'S', format!("{}\0{}\0", name, value).as_bytes())
}

fn ready_for_query() -> Vec<u8> {
    frame(b'Z', b"I")
}

/// Read one length-prefixed message; `tagged` for everything after startup.
async fn read_message(socket: &mut TcpStream, tagged: bool) -> Vec<u8> {
    let header_len = if tagged { 5 } else { 4 };
    let mut message = vec![0u8; header_len];
    socket.read_exact(&mut message).await.unwrap();
    let len_bytes: [u8; 4] = message[header_len - 4..].try_into().unwrap();
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len - 4];
    socket.read_exact(&mut body).await.unwrap();
    message.extend_from_slice(&body);
    message
}

/// Write `bytes` one at a time so the client sees every partial frame.
async fn trickle(socket: &mut TcpStream, bytes: &[u8]) {
    for byte in bytes {
        socket.write_all(&[*byte]).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn expected_startup() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&196608i32.to_be_bytes());
    for part in [
        "user",
        "app_user",
        "database",
        "app",
        "client_encoding",
        "UTF8",
        "application_name",
        "typeprobe",
    ] {
        body.extend_from_slice(part.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut message = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    message.extend_from_slice(&body);
    message
}

#[tokio::test]
async fn test_partial_and_batched_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.set_nodelay(true).unwrap();
        let startup = read_message(&mut socket, false).await;

        // AuthenticationOk, ParameterStatus, BackendKeyData, ReadyForQuery
        let mut handshake = frame(b'R', &0i32.to_be_bytes());
        handshake.extend(parameter_status("server_version", "17.0"));
        let mut key_data = 4242i32.to_be_bytes().to_vec();
        key_data.extend_from_slice(&7i32.to_be_bytes());
        handshake.extend(frame(b'K', &key_data));
        handshake.extend(ready_for_query());
        trickle(&mut socket, &handshake).await;

        let query = read_message(&mut socket, true).await;

        // Two frames in a single write
        let mut batch = parameter_status("TimeZone", "UTC");
        batch.extend(ready_for_query());
        socket.write_all(&batch).await.unwrap();
        socket.flush().await.unwrap();

        // Header claiming a ~2 GiB DataRow
        let mut oversized = vec![b'D'];
        oversized.extend_from_slice(&0x7fff_ffffu32.to_be_bytes());
        socket.write_all(&oversized).await.unwrap();
        socket.flush().await.unwrap();

        // Hold the socket until the client has read everything
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
        (startup, query)
    });

    let options = ConnectionOptions::new("127.0.0.1", port, "app_user", "app");
    let mut conn = PgConnection::connect(&options).await.unwrap();

    conn.send(FrontendMessage::Query("SELECT 1".to_string()))
        .await
        .unwrap();

    assert_eq!(
        conn.recv().await.unwrap(),
        BackendMessage::ParameterStatus {
            name: "TimeZone".to_string(),
            value: "UTC".to_string(),
        }
    );
    assert_eq!(
        conn.recv().await.unwrap(),
        BackendMessage::ReadyForQuery(TransactionStatus::Idle)
    );

    match conn.recv().await {
        Err(PgError::Protocol(message)) => {
            assert!(message.contains("Invalid message length"), "{}", message);
            assert!(message.contains("'D'"), "{}", message);
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
    drop(conn);

    let (startup, query) = server.await.unwrap();
    assert_eq!(startup, expected_startup());
    assert_eq!(query, frame(b'Q', b"SELECT 1\0"));
}

#[tokio::test]
async fn test_undersized_length_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_message(&mut socket, false).await;
        // Length 3 is shorter than the length field itself
        socket.write_all(&[b'R', 0, 0, 0, 3]).await.unwrap();
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let options = ConnectionOptions::new("127.0.0.1", port, "app_user", "app");
    // Framing faults during startup surface as a failed handshake
    let result = PgConnection::connect(&options).await;
    assert!(
        matches!(
            result,
            Err(PgError::Auth(ref reason)) if reason.contains("Invalid message length 3")
        ),
        "unexpected result: {:?}",
        result.as_ref().err()
    );
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_hangup_mid_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_message(&mut socket, false).await;
        // Half an AuthenticationOk, then close
        socket.write_all(&[b'R', 0, 0, 0, 8, 0]).await.unwrap();
    });

    let options = ConnectionOptions::new("127.0.0.1", port, "app_user", "app");
    let result = PgConnection::connect(&options).await;
    assert!(
        matches!(result, Err(PgError::Auth(ref reason)) if reason.contains("Connection closed")),
        "unexpected result: {:?}",
        result.as_ref().err()
    );
    server.await.unwrap();
}
