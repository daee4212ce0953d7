//! Link behavior against a scripted in-process manager endpoint

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use switchboard_ami_core::{AmiAction, AmiClient, AmiError, AmiLink, AmiLinkConfig, LinkStatus};

const BANNER: &[u8] = b"Asterisk Call Manager/5.0.2\r\n";

/// Route link logs through the test harness; filter with `RUST_LOG`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Read one `\r\n\r\n`-terminated frame and return its fields
async fn read_frame(stream: &mut TcpStream) -> Option<HashMap<String, String>> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => buf.push(byte[0]),
        }
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let mut fields = HashMap::new();
    for line in text.split("\r\n") {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Some(fields)
}

async fn write_response(stream: &mut TcpStream, action_id: &str, status: &str, message: &str) {
    let frame = format!(
        "Response: {}\r\nActionID: {}\r\nMessage: {}\r\n\r\n",
        status, action_id, message
    );
    stream.write_all(frame.as_bytes()).await.unwrap();
}

/// Accept a connection, send the banner, and accept the login
async fn accept_and_login(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    stream.write_all(BANNER).await.unwrap();
    let login = read_frame(&mut stream).await.unwrap();
    assert_eq!(login.get("Action").map(String::as_str), Some("Login"));
    let action_id = login.get("ActionID").unwrap().clone();
    write_response(&mut stream, &action_id, "Success", "Authentication accepted").await;
    stream
}

fn config_for(listener: &TcpListener) -> AmiLinkConfig {
    init_tracing();
    let addr = listener.local_addr().unwrap();
    AmiLinkConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        username: "switchboard".to_string(),
        secret: "secret".to_string(),
        action_timeout: Duration::from_secs(2),
        reconnect_base: Duration::from_millis(50),
        reconnect_cap: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn login_and_round_trip_an_action() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&listener);

    let server = tokio::spawn(async move {
        let mut stream = accept_and_login(&listener).await;
        let ping = read_frame(&mut stream).await.unwrap();
        assert_eq!(ping.get("Action").map(String::as_str), Some("Ping"));
        let action_id = ping.get("ActionID").unwrap().clone();
        write_response(&mut stream, &action_id, "Success", "Pong").await;
        stream
    });

    let link = AmiLink::connect(config).await.unwrap();
    assert!(link.is_connected());

    let response = link.send(AmiAction::new("Ping")).await.unwrap();
    assert_eq!(response.message(), "Pong");

    let stream = server.await.unwrap();
    link.close().await;
    drop(stream);
}

#[tokio::test]
async fn rejected_credentials_surface_auth_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&listener);

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(BANNER).await.unwrap();
        let login = read_frame(&mut stream).await.unwrap();
        let action_id = login.get("ActionID").unwrap().clone();
        write_response(&mut stream, &action_id, "Error", "Authentication failed").await;
        // Hold the socket open so the client sees the response, not a reset.
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    match AmiLink::connect(config).await {
        Err(AmiError::AuthFailed) => {}
        other => panic!("expected AuthFailed, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn list_action_collects_members_until_complete() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&listener);

    let server = tokio::spawn(async move {
        let mut stream = accept_and_login(&listener).await;
        let action = read_frame(&mut stream).await.unwrap();
        assert_eq!(
            action.get("Action").map(String::as_str),
            Some("CoreShowChannels")
        );
        let id = action.get("ActionID").unwrap().clone();
        let body = format!(
            "Response: Success\r\nActionID: {id}\r\nMessage: Channels will follow\r\n\r\n\
             Event: CoreShowChannel\r\nActionID: {id}\r\nChannel: PJSIP/1016-0000002a\r\n\r\n\
             Event: CoreShowChannel\r\nActionID: {id}\r\nChannel: PJSIP/1017-0000002b\r\n\r\n\
             Event: CoreShowChannelsComplete\r\nActionID: {id}\r\nListItems: 2\r\n\r\n"
        );
        stream.write_all(body.as_bytes()).await.unwrap();
        stream
    });

    let link = AmiLink::connect(config).await.unwrap();
    let response = link
        .send_expecting(AmiAction::new("CoreShowChannels"), "CoreShowChannelsComplete")
        .await
        .unwrap();
    assert_eq!(response.events.len(), 2);
    assert_eq!(
        response.events[0].fields.get("Channel"),
        Some("PJSIP/1016-0000002a")
    );

    let stream = server.await.unwrap();
    link.close().await;
    drop(stream);
}

#[tokio::test]
async fn drop_fails_pending_and_link_recovers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&listener);

    let server = tokio::spawn(async move {
        // First session: accept login, then hang up mid-action.
        let mut stream = accept_and_login(&listener).await;
        let _pending = read_frame(&mut stream).await.unwrap();
        drop(stream);
        // Second session: let the reconnect succeed and answer a ping.
        let mut stream = accept_and_login(&listener).await;
        let ping = read_frame(&mut stream).await.unwrap();
        let action_id = ping.get("ActionID").unwrap().clone();
        write_response(&mut stream, &action_id, "Success", "Pong").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let link = AmiLink::connect(config).await.unwrap();
    let mut status = link.status();

    match link.send(AmiAction::new("QueuePause")).await {
        Err(AmiError::LinkLost { .. }) => {}
        other => panic!("expected LinkLost, got {:?}", other.map(|_| ())),
    }

    assert_eq!(status.recv().await.unwrap(), LinkStatus::Lost);
    assert_eq!(status.recv().await.unwrap(), LinkStatus::Connected);
    assert!(link.is_connected());

    let response = link.send(AmiAction::new("Ping")).await.unwrap();
    assert_eq!(response.message(), "Pong");

    link.close().await;
    server.abort();
}

#[tokio::test]
async fn uncorrelated_events_reach_subscribers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&listener);

    let server = tokio::spawn(async move {
        let mut stream = accept_and_login(&listener).await;
        // Wait for the ping so the subscriber is in place before the event.
        let ping = read_frame(&mut stream).await.unwrap();
        let action_id = ping.get("ActionID").unwrap().clone();
        write_response(&mut stream, &action_id, "Success", "Pong").await;
        stream
            .write_all(
                b"Event: Hangup\r\nChannel: PJSIP/1016-0000002a\r\nCause: 16\r\n\r\n",
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let link = AmiLink::connect(config).await.unwrap();
    let mut events = link.events();
    link.send(AmiAction::new("Ping")).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "Hangup");
    assert_eq!(event.fields.get("Cause"), Some("16"));

    link.close().await;
    server.abort();
}
