use std::time::Duration;

use buckdesk::routing::{Client, DeskSpec};
use buckdesk::scheduler::{Job, JobResult, Notice};
use buckdesk::transport::codec::decode_line;
use buckdesk::transport::{Envelope, EnvelopeCodec, Socket, SocketOptions};
use buckdesk::worker::Registry;
use buckdesk::BuckError;
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(2);

async fn server() -> Socket {
    Socket::listen("127.0.0.1", 0, SocketOptions::default()).await.unwrap()
}

fn strlen(arg: &str) -> Job {
    Job::call("strlen").arg(arg).build(&Registry::builtin()).unwrap()
}

#[tokio::test]
async fn test_frames_arrive_intact_and_in_order() {
    let mut server = server().await;
    assert!(server.is_server());
    let mut client = Socket::connect("127.0.0.1", server.port(), SocketOptions::client())
        .await
        .unwrap();

    let sent = vec![
        Envelope::Job(strlen("first")),
        Envelope::Job(Job::notice(Notice::DrawerRefresh)),
        Envelope::Job(strlen("third\nwith newline")),
    ];
    for envelope in &sent {
        let delivery = client.send(envelope, TIMEOUT).await.unwrap();
        assert!(delivery.is_complete());
    }

    for expected in &sent {
        let received = server.receive(TIMEOUT).await.unwrap();
        assert_eq!(received.as_ref(), Some(expected));
    }
    assert_eq!(server.peer_count(), 1);
}

#[tokio::test]
async fn test_server_merges_several_peers() {
    let mut server = server().await;
    let mut a = Socket::connect("127.0.0.1", server.port(), SocketOptions::client())
        .await
        .unwrap();
    let mut b = Socket::connect("127.0.0.1", server.port(), SocketOptions::client())
        .await
        .unwrap();

    a.send(&Envelope::Job(strlen("a")), TIMEOUT).await.unwrap();
    b.send(&Envelope::Job(strlen("b")), TIMEOUT).await.unwrap();

    let mut targets = Vec::new();
    for _ in 0..2 {
        match server.receive(TIMEOUT).await.unwrap() {
            Some(Envelope::Job(job)) => targets.push(job.args().unwrap().to_value()),
            other => panic!("expected a job, got {:?}", other),
        }
    }
    targets.sort_by_key(|v| v.to_string());
    assert_eq!(targets, vec![json!(["a"]), json!(["b"])]);
}

#[tokio::test]
async fn test_receive_times_out_with_nothing_pending() {
    let mut server = server().await;

    let started = tokio::time::Instant::now();
    assert!(server.receive(Duration::from_millis(50)).await.unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));

    // Zero timeout polls once
    assert!(server.receive(Duration::ZERO).await.unwrap().is_none());
}

#[tokio::test]
async fn test_oversized_message_is_refused() {
    let server = server().await;
    let options = SocketOptions::client().with_max_message_size(64);
    let mut client = Socket::connect("127.0.0.1", server.port(), options).await.unwrap();

    let big = "x".repeat(1024);
    let err = client.send(&Envelope::Job(strlen(&big)), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, BuckError::MessageTooLarge { limit: 64, .. }));
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = Socket::connect("127.0.0.1", port, SocketOptions::client())
        .await
        .unwrap_err();
    assert!(matches!(err, BuckError::SocketSetupFailure { .. }));
}

#[tokio::test]
async fn test_open_listens_on_local_host() {
    let socket = Socket::open("127.0.0.1", 0, SocketOptions::default()).await.unwrap();
    assert!(socket.is_server());
    assert_ne!(socket.port(), 0);
}

#[test]
fn test_frame_is_single_base64_line() {
    let codec = EnvelopeCodec::default();
    let result = JobResult::new(42, strlen("test"), json!(4), None, None);
    let envelope = Envelope::Result(Box::new(result));

    let frame = codec.frame(&envelope).unwrap();
    assert_eq!(frame.last(), Some(&b'\n'));
    let line = std::str::from_utf8(&frame[..frame.len() - 1]).unwrap();
    assert!(!line.contains('\n'));
    assert_eq!(decode_line(line).unwrap(), envelope);

    assert!(matches!(
        decode_line("not base64!"),
        Err(BuckError::MalformedFrame(_))
    ));
}

#[tokio::test]
async fn test_closed_peer_is_dropped() {
    let mut server = server().await;
    let mut client = Socket::connect("127.0.0.1", server.port(), SocketOptions::client())
        .await
        .unwrap();
    client.send(&Envelope::Job(strlen("bye")), TIMEOUT).await.unwrap();
    assert!(server.receive(TIMEOUT).await.unwrap().is_some());
    assert_eq!(server.peer_count(), 1);

    drop(client);
    assert!(server.receive(Duration::from_millis(200)).await.unwrap().is_none());
    assert_eq!(server.peer_count(), 0);
}

#[tokio::test]
async fn test_broken_connection_is_evicted_from_client() {
    let mut desk = server().await;
    let port = desk.port();
    let mut client = Client::new([DeskSpec::local(port)]);
    let job = strlen("gone");

    client.send_buck(&job).await.unwrap();
    assert!(desk.receive(TIMEOUT).await.unwrap().is_some());
    drop(desk);

    // The first write after the desk left may still land in the kernel
    let mut failure = None;
    for _ in 0..5 {
        match client.send_buck(&job).await {
            Ok(()) => tokio::time::sleep(Duration::from_millis(100)).await,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    assert!(
        matches!(failure, Some(BuckError::DeliveryFailure { .. })),
        "unexpected outcome: {:?}",
        failure
    );

    // The cached connection is gone, so the next send tries to reconnect
    let err = client.send_buck(&job).await.unwrap_err();
    assert!(matches!(err, BuckError::SocketSetupFailure { .. }), "unexpected error: {:?}", err);
}
