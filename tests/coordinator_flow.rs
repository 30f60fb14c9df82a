//! End-to-end flows against a scripted Game Coordinator and STUN server on
//! loopback. The client is driven by `tick` on the test thread; the fake
//! servers run on their own threads with blocking sockets.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_test::assert_ok;
use waypoint::coordinator::{
    AddressFamily, ClientMessage, ConnectionType, ServerMessage, ServerRegistration, SessionStatus,
    StunRequest, PACKET_STUN_CLIENT_STUN,
};
use waypoint::packet::Packet;
use waypoint::{CoordinatorClient, CoordinatorConfig, GameInfo, JoinError, ServerGameType};

type JoinResult = Rc<RefCell<Option<Result<TcpStream, JoinError>>>>;

fn config(coordinator_port: u16, stun_port: u16) -> CoordinatorConfig {
    CoordinatorConfig {
        coordinator_host: "127.0.0.1".into(),
        coordinator_port,
        stun_host: "127.0.0.1".into(),
        stun_port,
        enable_ipv6: false,
        ..CoordinatorConfig::default()
    }
}

/// A loopback port nothing listens on
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn read_packet(stream: &mut TcpStream) -> Packet {
    let mut size = [0u8; 2];
    stream.read_exact(&mut size).unwrap();
    let mut frame = size.to_vec();
    frame.resize(u16::from_le_bytes(size) as usize, 0);
    stream.read_exact(&mut frame[2..]).unwrap();
    assert_ok!(Packet::from_frame(frame))
}

fn read_client(stream: &mut TcpStream) -> ClientMessage {
    assert_ok!(ClientMessage::decode(&mut read_packet(stream)))
}

fn send(stream: &mut TcpStream, msg: ServerMessage) {
    stream.write_all(&msg.to_packet().into_frame().unwrap()).unwrap();
}

/// Accept one session and run `script` on it. The socket is handed back
/// through the returned channel so it stays open for the rest of the test.
fn spawn_coordinator<F>(script: F) -> (u16, mpsc::Receiver<TcpStream>)
where
    F: FnOnce(&mut TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        script(&mut stream);
        let _ = tx.send(stream);
    });
    (port, rx)
}

/// Accept one probe, decode its request, report it with the address the
/// probe came from. The probe socket is kept alive inside the message.
fn spawn_stun() -> (u16, mpsc::Receiver<(StunRequest, SocketAddr, TcpStream)>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let (mut stream, peer) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut packet = read_packet(&mut stream);
        assert_eq!(packet.packet_type(), PACKET_STUN_CLIENT_STUN);
        let request = assert_ok!(StunRequest::decode(&mut packet));
        let _ = tx.send((request, peer, stream));
    });
    (port, rx)
}

fn tick_until(client: &mut CoordinatorClient, mut done: impl FnMut(&CoordinatorClient) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(&*client) {
        assert!(Instant::now() < deadline, "timed out driving the client");
        client.tick();
        thread::sleep(Duration::from_millis(5));
    }
}

fn join(client: &mut CoordinatorClient, join_key: &str) -> JoinResult {
    let result: JoinResult = Rc::new(RefCell::new(None));
    let sink = result.clone();
    client.connect_to_server(join_key, move |r| {
        assert!(sink.borrow().is_none(), "join callback fired twice");
        *sink.borrow_mut() = Some(r);
    });
    result
}

fn wait_for_join(client: &mut CoordinatorClient, result: &JoinResult) -> Result<TcpStream, JoinError> {
    tick_until(client, |_| result.borrow().is_some());
    let outcome = result.borrow_mut().take();
    outcome.unwrap()
}

#[test]
fn test_direct_join() {
    let game = TcpListener::bind("127.0.0.1:0").unwrap();
    let game_port = game.local_addr().unwrap().port();

    let (port, _keepalive) = spawn_coordinator(move |s| {
        assert_eq!(read_client(s), ClientMessage::Connect { join_key: "ABCD1234".into() });
        send(s, ServerMessage::Connecting { token: "T1".into(), join_key: "ABCD1234".into() });
        send(s, ServerMessage::DirectConnect { token: "T1".into(), host: "127.0.0.1".into(), port: game_port });
    });

    let mut client = CoordinatorClient::new(config(port, closed_port()));
    let result = join(&mut client, "ABCD1234");
    let stream = wait_for_join(&mut client, &result).unwrap();

    assert_eq!(stream.peer_addr().unwrap(), game.local_addr().unwrap());
    assert!(client.joins().is_empty());
    assert_eq!(client.status(), SessionStatus::Connected);
}

#[test]
fn test_stun_join_reuses_probe_port() {
    let game = TcpListener::bind("127.0.0.1:0").unwrap();
    let game_port = game.local_addr().unwrap().port();
    let (stun_port, stun_seen) = spawn_stun();
    let (observed_tx, observed_rx) = mpsc::channel();

    let (port, _keepalive) = spawn_coordinator(move |s| {
        assert_eq!(read_client(s), ClientMessage::Connect { join_key: "ABCD1234".into() });
        send(s, ServerMessage::Connecting { token: "T2".into(), join_key: "ABCD1234".into() });
        send(s, ServerMessage::StunRequest { token: "T2".into() });

        let (request, observed, probe) = stun_seen.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(request, StunRequest { token: "T2".into(), family: AddressFamily::Ipv4 });
        send(
            s,
            ServerMessage::StunConnect {
                token: "T2".into(),
                family: AddressFamily::Ipv4,
                host: "127.0.0.1".into(),
                port: game_port,
            },
        );
        let _ = observed_tx.send((observed, probe));
    });

    let mut client = CoordinatorClient::new(config(port, stun_port));
    let result = join(&mut client, "ABCD1234");
    let stream = wait_for_join(&mut client, &result).unwrap();

    let (observed, _probe) = observed_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(stream.local_addr().unwrap(), observed);
    assert_eq!(stream.peer_addr().unwrap(), game.local_addr().unwrap());

    // Every probe of the token is gone once the join resolved
    assert!(!client.stun_sessions().has_token("T2"));
    assert_eq!(client.stun_sessions().open_sockets(), 0);
}

#[test]
fn test_failed_direct_connect_is_reported_then_coordinator_gives_up() {
    let unreachable = closed_port();
    let (echo_tx, echo_rx) = mpsc::channel();

    let (port, _keepalive) = spawn_coordinator(move |s| {
        read_client(s);
        send(s, ServerMessage::Connecting { token: "T3".into(), join_key: "K".into() });
        send(s, ServerMessage::DirectConnect { token: "T3".into(), host: "127.0.0.1".into(), port: unreachable });
        let _ = echo_tx.send(read_client(s));
        send(s, ServerMessage::ConnectFailed { token: "T3".into() });
    });

    let mut client = CoordinatorClient::new(config(port, closed_port()));
    let result = join(&mut client, "K");
    let outcome = wait_for_join(&mut client, &result);

    assert_eq!(outcome.unwrap_err(), JoinError::CoordinatorGaveUp);
    assert_eq!(
        echo_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        ClientMessage::ConnectFailed { token: "T3".into() }
    );
    assert!(client.joins().is_empty());
}

#[test]
fn test_all_stun_probes_failing_is_reported() {
    let (echo_tx, echo_rx) = mpsc::channel();

    let (port, _keepalive) = spawn_coordinator(move |s| {
        read_client(s);
        send(s, ServerMessage::Connecting { token: "T4".into(), join_key: "K".into() });
        send(s, ServerMessage::StunRequest { token: "T4".into() });
        let _ = echo_tx.send(read_client(s));
        send(s, ServerMessage::ConnectFailed { token: "T4".into() });
    });

    let mut client = CoordinatorClient::new(config(port, closed_port()));
    let result = join(&mut client, "K");
    let outcome = wait_for_join(&mut client, &result);

    assert_eq!(outcome.unwrap_err(), JoinError::CoordinatorGaveUp);
    assert_eq!(
        echo_rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        ClientMessage::ConnectFailed { token: "T4".into() }
    );
    assert!(!client.stun_sessions().has_token("T4"));
}

fn server(join_key: &str, revision: &str) -> GameInfo {
    GameInfo {
        join_key: join_key.into(),
        server_name: format!("server {}", join_key),
        server_revision: revision.into(),
        ..GameInfo::default()
    }
}

#[test]
fn test_listing_refresh_expires_missing_servers() {
    let revision = CoordinatorConfig::default().revision;
    let (port, _keepalive) = spawn_coordinator(move |s| {
        assert_eq!(read_client(s), ClientMessage::Listing);
        send(s, ServerMessage::Listing { servers: vec![server("A", &revision)] });
        send(s, ServerMessage::Listing { servers: vec![server("B", "0.0.1-old")] });
        send(s, ServerMessage::Listing { servers: vec![server("C", &revision), server("D", &revision)] });
        send(s, ServerMessage::Listing { servers: vec![] });

        assert_eq!(read_client(s), ClientMessage::Listing);
        send(s, ServerMessage::Listing { servers: vec![server("A", &revision)] });
        send(s, ServerMessage::Listing { servers: vec![] });
    });

    let mut client = CoordinatorClient::new(config(port, closed_port()));
    client.game_list_mut().add_manual("MANUAL");

    client.get_listing();
    tick_until(&mut client, |c| !c.is_listing());
    let list = client.game_list();
    assert_eq!(list.len(), 5);
    assert!(list.entries().iter().filter(|e| !e.manually_added).all(|e| e.online));
    assert!(!list.get("MANUAL").unwrap().online);
    assert!(list.get("A").unwrap().compatible);
    assert!(!list.get("B").unwrap().compatible);

    client.get_listing();
    tick_until(&mut client, |c| !c.is_listing());
    let list = client.game_list();
    assert!(list.get("A").is_some());
    assert!(list.get("B").is_none());
    assert!(list.get("C").is_none());
    assert!(list.get("MANUAL").is_some());
}

#[test]
fn test_register_heartbeat_and_reregister_after_loss() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (keep_tx, _keepalive) = mpsc::channel();

    thread::spawn(move || {
        let (mut s, _) = listener.accept().unwrap();
        s.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        match read_client(&mut s) {
            ClientMessage::Register { game_type, local_port, info } => {
                assert_eq!(game_type, ServerGameType::Public);
                assert_eq!(local_port, 3979);
                assert_eq!(info.join_key, "");
                assert_eq!(info.server_name, "Test");
            }
            other => panic!("expected REGISTER, got {:?}", other),
        }
        send(&mut s, ServerMessage::RegisterAck { join_key: "K1".into(), connection_type: ConnectionType::Direct });
        match read_client(&mut s) {
            ClientMessage::Update { info } => assert_eq!(info.join_key, "K1"),
            other => panic!("expected UPDATE, got {:?}", other),
        }
        drop(s);

        let (mut s, _) = listener.accept().unwrap();
        s.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        assert!(matches!(read_client(&mut s), ClientMessage::Register { .. }));
        send(&mut s, ServerMessage::RegisterAck { join_key: "K2".into(), connection_type: ConnectionType::Stun });
        let _ = keep_tx.send(s);
    });

    let mut client = CoordinatorClient::new(config(port, closed_port()));
    let seen: Rc<RefCell<Vec<ServerRegistration>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    client.set_registration_observer(move |r| sink.borrow_mut().push(r.clone()));

    let provider = || GameInfo {
        server_name: "Test".into(),
        ..GameInfo::default()
    };
    client.register(ServerGameType::Public, 3979, provider);

    tick_until(&mut client, |c| c.registration().join_key == "K1");
    assert_eq!(client.connection_type(), ConnectionType::Direct);

    tick_until(&mut client, |c| c.registration().join_key == "K2");
    assert_eq!(client.connection_type(), ConnectionType::Stun);

    let keys: Vec<String> = seen.borrow().iter().map(|r| r.join_key.clone()).collect();
    let k1 = keys.iter().position(|k| k == "K1").unwrap();
    let k2 = keys.iter().position(|k| k == "K2").unwrap();
    assert!(keys[k1 + 1..k2].iter().any(|k| k.is_empty()), "no reset between sessions: {:?}", keys);
}

#[test]
fn test_desync_closes_session_and_fails_joins() {
    let (eof_tx, eof_rx) = mpsc::channel();
    let (port, _keepalive) = spawn_coordinator(move |s| {
        read_client(s);
        send(s, ServerMessage::Connecting { token: "T".into(), join_key: "NOT-REQUESTED".into() });
        let mut byte = [0u8; 1];
        let _ = eof_tx.send(matches!(s.read(&mut byte), Ok(0)));
    });

    let mut client = CoordinatorClient::new(config(port, closed_port()));
    let result = join(&mut client, "K");
    let outcome = wait_for_join(&mut client, &result);

    assert_eq!(outcome.unwrap_err(), JoinError::SessionLost);
    assert_eq!(client.status(), SessionStatus::Disconnected);
    assert!(eof_rx.recv_timeout(Duration::from_secs(10)).unwrap());
}

#[test]
fn test_server_accepts_stun_peer() {
    let player = TcpListener::bind("127.0.0.1:0").unwrap();
    let player_port = player.local_addr().unwrap().port();
    let (stun_port, stun_seen) = spawn_stun();

    let (port, _keepalive) = spawn_coordinator(move |s| {
        assert!(matches!(read_client(s), ClientMessage::Register { .. }));
        send(s, ServerMessage::RegisterAck { join_key: "SRV".into(), connection_type: ConnectionType::Stun });
        send(s, ServerMessage::StunRequest { token: "T5".into() });

        let (_, _, probe) = stun_seen.recv_timeout(Duration::from_secs(10)).unwrap();
        send(
            s,
            ServerMessage::StunConnect {
                token: "T5".into(),
                family: AddressFamily::Ipv4,
                host: "127.0.0.1".into(),
                port: player_port,
            },
        );
        // Hold the probe until the peer connect had its chance
        thread::sleep(Duration::from_millis(500));
        drop(probe);
    });

    let mut client = CoordinatorClient::new(config(port, stun_port));
    let incoming: Rc<RefCell<Vec<SocketAddr>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = incoming.clone();
    client.set_incoming_handler(move |stream| sink.borrow_mut().push(stream.peer_addr().unwrap()));
    client.register(ServerGameType::FriendsOnly, 3979, GameInfo::default);

    tick_until(&mut client, |_| !incoming.borrow().is_empty());
    assert_eq!(incoming.borrow()[0], player.local_addr().unwrap());
    assert!(!client.stun_sessions().has_token("T5"));
}

#[test]
fn test_shutdown_fails_outstanding_joins() {
    let (port, _keepalive) = spawn_coordinator(|s| {
        read_client(s);
    });

    let mut client = CoordinatorClient::new(config(port, closed_port()));
    let result = join(&mut client, "K");
    tick_until(&mut client, |c| c.status() == SessionStatus::Connected);
    client.shutdown();

    let outcome = result.borrow_mut().take();
    assert_eq!(outcome.unwrap().unwrap_err(), JoinError::Shutdown);
    assert_eq!(client.status(), SessionStatus::Disconnected);
}
