use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use tandem::{
    ClientSession, ConnectionState, Event, EventDelivery, NetConfig, NetServer, protocol,
};

fn fast_config() -> NetConfig {
    let mut config = NetConfig::default();
    config.reliable_ping_interval = Duration::from_millis(50);
    config.unreliable_ping_interval = Duration::from_millis(20);
    config.timeout = Duration::from_secs(2);
    config
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out: {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn write_frame(stream: &mut TcpStream, body: &[u8]) {
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .unwrap();
    stream.write_all(body).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).unwrap();
    let len = u32::from_le_bytes(prefix) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    body
}

/// Reads frames until the identity grant arrives, skipping keep-alives.
fn read_identity(stream: &mut TcpStream) -> (u8, u8) {
    loop {
        let frame = read_frame(stream);
        if frame.len() == 4
            && frame[0] == protocol::PROTOCOL_COMMAND
            && frame[1] == protocol::CONTROL_AUTH
        {
            return (frame[2], frame[3]);
        }
    }
}

#[test]
fn test_full_handshake_and_exchange() {
    let server = NetServer::bind(
        "127.0.0.1:0",
        "127.0.0.1:0",
        fast_config(),
        EventDelivery::Queued,
    )
    .unwrap();
    let client = ClientSession::connect(
        "127.0.0.1",
        server.local_tcp_addr().port(),
        server.local_udp_addr().port(),
        fast_config(),
        EventDelivery::Queued,
    )
    .unwrap();

    wait_until("accept", || server.connection_count() == 1);
    assert_eq!(server.connected_ids(), vec![1]);

    // Pre-authorization stream traffic surfaces for vetting.
    client.send_reliable(10, b"hello").unwrap();
    let mut server_events = Vec::new();
    wait_until("auth packet", || {
        server_events.extend(server.drain_events());
        server_events
            .iter()
            .any(|e| matches!(e, Event::AuthPacket { id: 1, command: 10, payload } if payload == b"hello"))
    });

    server.authorize(1).unwrap();
    wait_until("client ready", || client.state() == ConnectionState::Ready);
    wait_until("server ready", || {
        server.connection_state(1) == Some(ConnectionState::Ready)
    });
    assert_eq!(client.client_id(), 1);

    // Exactly one Ready on each side.
    let mut client_events = client.drain_events();
    wait_until("client ready event", || {
        client_events.extend(client.drain_events());
        client_events
            .iter()
            .any(|e| matches!(e, Event::Ready { id: 1 }))
    });
    assert_eq!(
        client_events
            .iter()
            .filter(|e| matches!(e, Event::Ready { .. }))
            .count(),
        1
    );
    assert!(
        client_events
            .iter()
            .any(|e| matches!(e, Event::Connected { id: 1 }))
    );
    server_events.extend(server.drain_events());
    assert_eq!(
        server_events
            .iter()
            .filter(|e| matches!(e, Event::Ready { .. }))
            .count(),
        1
    );

    // Reliable traffic both ways.
    client.send_reliable(20, b"from-client").unwrap();
    wait_until("server reliable", || {
        server_events.extend(server.drain_events());
        server_events.iter().any(
            |e| matches!(e, Event::ReliablePacket { id: 1, command: 20, payload } if payload == b"from-client"),
        )
    });
    server.send_reliable(1, 21, b"from-server").unwrap();
    wait_until("client reliable", || {
        client_events.extend(client.drain_events());
        client_events.iter().any(
            |e| matches!(e, Event::ReliablePacket { id: 1, command: 21, payload } if payload == b"from-server"),
        )
    });

    // Unreliable traffic both ways; resend each tick until seen so a
    // dropped datagram cannot hang the test.
    wait_until("server unreliable", || {
        let _ = client.send_unreliable(30, b"udp-up", true);
        thread::sleep(Duration::from_millis(5));
        server_events.extend(server.drain_events());
        server_events
            .iter()
            .any(|e| matches!(e, Event::UnreliablePacket { id: 1, command: 30, .. }))
    });
    wait_until("client unreliable", || {
        let _ = server.send_unreliable(1, 31, b"udp-down", true);
        thread::sleep(Duration::from_millis(5));
        client_events.extend(client.drain_events());
        client_events
            .iter()
            .any(|e| matches!(e, Event::UnreliablePacket { id: 1, command: 31, .. }))
    });
}

#[test]
fn test_endpoint_echo_mismatch_disconnects() {
    let server = NetServer::bind(
        "127.0.0.1:0",
        "127.0.0.1:0",
        fast_config(),
        EventDelivery::Queued,
    )
    .unwrap();

    let mut stream = TcpStream::connect(server.local_tcp_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    wait_until("accept", || server.connection_count() == 1);
    server.authorize(1).unwrap();
    let (id, secret) = read_identity(&mut stream);
    assert_eq!(id, 1);

    // Probe so the server records an observed endpoint and replies.
    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    udp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    udp.send_to(
        &[id, secret, protocol::PROTOCOL_COMMAND, protocol::CONTROL_PING],
        server.local_udp_addr(),
    )
    .unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = udp.recv_from(&mut buf).unwrap();
    assert!(n >= 2 + protocol::ENDPOINT_LEN);
    assert_eq!(buf[0], protocol::PROTOCOL_COMMAND);
    assert_eq!(buf[1], protocol::CONTROL_AUTH);

    // Echo back an address the server never observed.
    write_frame(
        &mut stream,
        &[
            protocol::PROTOCOL_COMMAND,
            protocol::CONTROL_AUTH,
            10,
            0,
            0,
            1,
            0,
            99,
        ],
    );

    wait_until("spoofed peer dropped", || server.connection_count() == 0);
    let events = server.drain_events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Disconnected { id: 1 }))
    );
    assert!(!events.iter().any(|e| matches!(e, Event::Ready { .. })));
}

/// Drives a hand-rolled client through authorization, the endpoint
/// probe, and the echo; returns its identity once the server is Ready.
fn promote_raw_client(server: &NetServer, stream: &mut TcpStream, udp: &UdpSocket) -> (u8, u8) {
    wait_until("accept", || server.connection_count() == 1);
    server.authorize(1).unwrap();
    let (id, secret) = read_identity(stream);

    udp.send_to(
        &[id, secret, protocol::PROTOCOL_COMMAND, protocol::CONTROL_PING],
        server.local_udp_addr(),
    )
    .unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = udp.recv_from(&mut buf).unwrap();
    assert!(n >= 2 + protocol::ENDPOINT_LEN);
    assert_eq!(buf[0], protocol::PROTOCOL_COMMAND);
    assert_eq!(buf[1], protocol::CONTROL_AUTH);

    let mut echo = vec![protocol::PROTOCOL_COMMAND, protocol::CONTROL_AUTH];
    echo.extend_from_slice(&buf[2..n]);
    write_frame(stream, &echo);
    wait_until("ready", || {
        server.connection_state(id) == Some(ConnectionState::Ready)
    });
    (id, secret)
}

#[test]
fn test_correct_echo_promotes_raw_client() {
    let server = NetServer::bind(
        "127.0.0.1:0",
        "127.0.0.1:0",
        fast_config(),
        EventDelivery::Queued,
    )
    .unwrap();

    let mut stream = TcpStream::connect(server.local_tcp_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    udp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let (id, secret) = promote_raw_client(&server, &mut stream, &udp);

    // A foreign socket with the right identity still gets dropped once
    // the endpoint is pinned.
    let intruder = UdpSocket::bind("127.0.0.1:0").unwrap();
    intruder
        .send_to(&[id, secret, 40, 1, 0xAA], server.local_udp_addr())
        .unwrap();
    // Wrong secret from the confirmed endpoint is dropped too.
    udp.send_to(
        &[id, secret.wrapping_add(1), 40, 1, 0xBB],
        server.local_udp_addr(),
    )
    .unwrap();
    thread::sleep(Duration::from_millis(100));
    let events = server.drain_events();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, Event::UnreliablePacket { .. }))
    );
    assert_eq!(server.connection_state(1), Some(ConnectionState::Ready));

    // The genuine endpoint still goes through.
    udp.send_to(&[id, secret, 40, 1, 0xCC], server.local_udp_addr())
        .unwrap();
    wait_until("payload accepted", || {
        server.drain_events().iter().any(
            |e| matches!(e, Event::UnreliablePacket { id: 1, command: 40, payload } if payload == &[0xCC]),
        )
    });
}

#[test]
fn test_data_datagram_serves_as_probe() {
    let server = NetServer::bind(
        "127.0.0.1:0",
        "127.0.0.1:0",
        fast_config(),
        EventDelivery::Queued,
    )
    .unwrap();

    let mut stream = TcpStream::connect(server.local_tcp_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    wait_until("accept", || server.connection_count() == 1);
    server.authorize(1).unwrap();
    let (id, secret) = read_identity(&mut stream);

    // The first valid-secret datagram is ordinary data, not a keep-alive;
    // it must still be treated as the endpoint probe.
    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    udp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    udp.send_to(&[id, secret, 40, 1, 0xEE], server.local_udp_addr())
        .unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = udp.recv_from(&mut buf).unwrap();
    assert_eq!(buf[0], protocol::PROTOCOL_COMMAND);
    assert_eq!(buf[1], protocol::CONTROL_AUTH);

    let mut echo = vec![protocol::PROTOCOL_COMMAND, protocol::CONTROL_AUTH];
    echo.extend_from_slice(&buf[2..n]);
    write_frame(&mut stream, &echo);
    wait_until("ready", || {
        server.connection_state(id) == Some(ConnectionState::Ready)
    });

    // The probe's payload is consumed by the handshake, not surfaced.
    assert!(
        !server
            .drain_events()
            .iter()
            .any(|e| matches!(e, Event::UnreliablePacket { .. }))
    );
}

#[test]
fn test_wrong_source_datagrams_do_not_refresh_liveness() {
    let mut config = fast_config();
    config.timeout = Duration::from_millis(400);
    let server = NetServer::bind("127.0.0.1:0", "127.0.0.1:0", config, EventDelivery::Queued)
        .unwrap();

    let mut stream = TcpStream::connect(server.local_tcp_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    udp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let (id, secret) = promote_raw_client(&server, &mut stream, &udp);

    // The confirmed endpoint goes silent; a foreign socket with the
    // right identity keeps talking. The stream stays alive so only the
    // datagram inactivity clause can fire.
    let intruder = UdpSocket::bind("127.0.0.1:0").unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while server.connection_count() != 0 {
        assert!(
            Instant::now() < deadline,
            "wrong-source datagrams kept the connection alive"
        );
        let _ = stream.write_all(&2u32.to_le_bytes());
        let _ = stream.write_all(&[protocol::PROTOCOL_COMMAND, protocol::CONTROL_PING]);
        let _ = intruder.send_to(&[id, secret, 41, 1, 0x01], server.local_udp_addr());
        let _ = intruder.send_to(
            &[id, secret, protocol::PROTOCOL_COMMAND, protocol::CONTROL_PING],
            server.local_udp_addr(),
        );
        thread::sleep(Duration::from_millis(40));
    }
    assert!(
        server
            .drain_events()
            .iter()
            .any(|e| matches!(e, Event::Disconnected { id: 1 }))
    );
}

#[test]
fn test_silent_peer_is_reaped_and_id_reused() {
    let mut config = fast_config();
    config.timeout = Duration::from_millis(300);
    let server = NetServer::bind("127.0.0.1:0", "127.0.0.1:0", config, EventDelivery::Queued)
        .unwrap();

    // Stream stays open but no datagram ever arrives.
    let _stale = TcpStream::connect(server.local_tcp_addr()).unwrap();
    wait_until("accept", || server.connection_count() == 1);
    wait_until("reap", || server.connection_count() == 0);
    assert!(
        server
            .drain_events()
            .iter()
            .any(|e| matches!(e, Event::Disconnected { id: 1 }))
    );

    // The freed id goes to the next arrival.
    let _fresh = TcpStream::connect(server.local_tcp_addr()).unwrap();
    wait_until("second accept", || server.connection_count() == 1);
    assert_eq!(server.connected_ids(), vec![1]);
}
