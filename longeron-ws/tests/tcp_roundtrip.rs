//! End-to-end tests over loopback TCP.

use longeron_core::message::{kind, Message};
use longeron_core::monitor::TransportEvent;
use longeron_core::pipe::{Pipe, PipeStatus};
use longeron_ws::{connect, Opcode, SpProtocol, WsError, WsListener, WsOptions};
use std::time::Duration;

fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

async fn echo_server(options: WsOptions) -> (std::net::SocketAddr, flume::Receiver<()>) {
    init_tracing();
    let mut listener = WsListener::bind("127.0.0.1:0", options).await.unwrap();
    let addr = listener.local_addr();
    let (done_tx, done_rx) = flume::bounded(1);
    compio::runtime::spawn(async move {
        let ws = listener.accept().await.unwrap();
        while let Ok(msg) = ws.recv().await {
            if ws.send(msg).await.is_err() {
                break;
            }
        }
        let _ = done_tx.send(());
    })
    .detach();
    (addr, done_rx)
}

#[compio::test]
async fn test_text_and_binary_echo() {
    let (addr, _done) = echo_server(WsOptions::new()).await;
    let ws = connect(&addr.to_string(), WsOptions::new()).await.unwrap();

    ws.send_frame(Opcode::Text, "Hello".as_bytes()).await.unwrap();
    let reply = ws.recv().await.unwrap();
    assert_eq!(reply.body.as_slice(), b"Hello");
    assert_eq!(reply.ancillary(kind::WS_OPCODE), Some(&[0x1][..]));

    let big: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
    ws.send(Message::from_slice(&big).unwrap()).await.unwrap();
    let reply = ws.recv().await.unwrap();
    assert_eq!(reply.body.as_slice(), &big[..]);
    assert_eq!(reply.ancillary(kind::WS_OPCODE), Some(&[0x2][..]));

    let stats = ws.stats();
    assert_eq!(stats.messages_sent, 2);
    assert_eq!(stats.messages_received, 2);
}

#[compio::test]
async fn test_ping_is_reported_to_application() {
    let (addr, _done) = echo_server(WsOptions::new()).await;
    let ws = connect(&addr.to_string(), WsOptions::new()).await.unwrap();

    ws.send_frame(Opcode::Ping, b"tick").await.unwrap();
    // The echo server answers the ping with a ping of its own.
    let reply = ws.recv().await.unwrap();
    assert_eq!(reply.ancillary(kind::WS_OPCODE), Some(&[0x9][..]));
    assert_eq!(reply.body.as_slice(), b"tick");
    assert_eq!(ws.stats().pings_received, 1);

    let oversized = ws.send_frame(Opcode::Pong, &[0u8; 126]).await;
    assert!(matches!(oversized, Err(WsError::Protocol { code: 1002, .. })));
}

#[compio::test]
async fn test_size_limit_closes_connection() {
    let server_opts = WsOptions::new().with_recv_max_size(Some(1024));
    let (addr, done) = echo_server(server_opts).await;
    let ws = connect(&addr.to_string(), WsOptions::new()).await.unwrap();

    ws.send(Message::from_slice(&[7u8; 2048]).unwrap()).await.unwrap();
    assert!(matches!(ws.recv().await, Err(WsError::Closed)));
    done.recv_async().await.unwrap();
}

#[compio::test]
async fn test_pipe_feeds_session() {
    let (addr, _done) = echo_server(WsOptions::new()).await;
    let ws = connect(&addr.to_string(), WsOptions::new()).await.unwrap();

    let mut pipe = ws.pipe();
    assert_eq!(pipe.id(), ws.id());
    assert_eq!(
        pipe.send(Message::from_slice(b"via pipe").unwrap()),
        PipeStatus::Ready
    );
    assert_eq!(ws.recv().await.unwrap().body.as_slice(), b"via pipe");

    ws.close();
    assert!(matches!(ws.recv().await, Err(WsError::Closed)));
    compio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        pipe.send(Message::from_slice(b"late").unwrap()),
        PipeStatus::Release
    );
}

#[compio::test]
async fn test_incompatible_protocol_is_rejected_and_accept_continues() {
    let mut listener = WsListener::bind(
        "127.0.0.1:0",
        WsOptions::new().with_protocol(SpProtocol::Rep),
    )
    .await
    .unwrap();
    let monitor = listener.monitor();
    let addr = listener.local_addr().to_string();

    let clients = async {
        let bad = connect(&addr, WsOptions::new().with_protocol(SpProtocol::Rep)).await;
        let good = connect(&addr, WsOptions::new().with_protocol(SpProtocol::Req)).await;
        (bad, good)
    };
    let (accepted, (bad, good)) = futures::join!(listener.accept(), clients);

    assert!(matches!(bad, Err(WsError::Handshake(_))));
    let good = good.unwrap();
    let accepted = accepted.unwrap();
    assert_eq!(accepted.peer_protocol(), Some(SpProtocol::Req));
    assert_eq!(good.peer_protocol(), Some(SpProtocol::Rep));
    assert_eq!(listener.stats().accepted, 2);

    let events: Vec<TransportEvent> = monitor.drain().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, TransportEvent::HandshakeFailed { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TransportEvent::Accepted(_)))
            .count(),
        2
    );
}

#[compio::test]
async fn test_handshake_timeout() {
    let options = WsOptions::new().with_handshake_timeout(Some(Duration::from_millis(50)));
    let mut listener = WsListener::bind("127.0.0.1:0", options).await.unwrap();
    let addr = listener.local_addr();

    // A raw TCP client that never sends its opening handshake.
    let silent = compio::net::TcpStream::connect(addr).await.unwrap();
    let accept = compio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(accept.is_err(), "no session can start without a handshake");
    drop(silent);
}

#[compio::test]
async fn test_silent_peer_does_not_hold_up_other_handshakes() {
    let options = WsOptions::new().with_handshake_timeout(None);
    let mut listener = WsListener::bind("127.0.0.1:0", options).await.unwrap();
    let addr = listener.local_addr();

    let _silent = compio::net::TcpStream::connect(addr).await.unwrap();
    compio::time::sleep(Duration::from_millis(20)).await;

    let addr_str = addr.to_string();
    let client = compio::time::timeout(
        Duration::from_secs(2),
        connect(&addr_str, WsOptions::new()),
    );
    let (accepted, client) = futures::join!(listener.accept(), client);
    let client = client
        .expect("handshake answered while another peer stays silent")
        .unwrap();
    let accepted = accepted.unwrap();

    accepted
        .send(Message::from_slice(b"welcome").unwrap())
        .await
        .unwrap();
    assert_eq!(client.recv().await.unwrap().body.as_slice(), b"welcome");
    assert_eq!(listener.stats().accepted, 2);
}

#[compio::test]
async fn test_close_is_honoured_while_application_is_not_reading() {
    let options = WsOptions::new().with_pipe_capacity(1);
    let mut listener = WsListener::bind("127.0.0.1:0", options).await.unwrap();
    let addr = listener.local_addr().to_string();

    let (accepted, client) = futures::join!(listener.accept(), connect(&addr, WsOptions::new()));
    let (server, client) = (accepted.unwrap(), client.unwrap());

    // Fill the server's inbound queue and leave one more message waiting.
    for i in 0..4u8 {
        client.send(Message::from_slice(&[i]).unwrap()).await.unwrap();
    }
    compio::time::sleep(Duration::from_millis(50)).await;

    server.close();
    let ended = compio::time::timeout(Duration::from_secs(2), client.recv()).await;
    assert!(matches!(ended, Ok(Err(WsError::Closed))));
}
