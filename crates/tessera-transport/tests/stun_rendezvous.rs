//! # STUN rendezvous tests
//!
//! A minimal rendezvous server runs on a loopback socket inside the test:
//! it remembers the server that announced a public port and pairs it with
//! the client that asks for that port.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use tessera_transport::config::ConnectionConfig;
use tessera_transport::stun::{StunEntry, StunRequest, StunRequestKind};
use tessera_transport::{PacketType, Role, SocketContext, TransportError};

const KEY: [u8; 16] = *b"0123456789abcdef";
const PUBLIC_PORT: u16 = 5000;

fn stun_config(stun: SocketAddr) -> ConnectionConfig {
    ConnectionConfig {
        port: PUBLIC_PORT,
        destination: Some(Ipv4Addr::LOCALHOST),
        stun: Some(stun),
        recv_timeout: Duration::from_millis(5),
        connection_timeout: Duration::from_secs(3),
        stun_timeout: Duration::from_secs(3),
        ..ConnectionConfig::new(KEY)
    }
}

fn send_entry(socket: &UdpSocket, entry: StunEntry, to: SocketAddr) {
    let mut buf = BytesMut::new();
    entry.encode(&mut buf);
    socket.send_to(&buf, to).unwrap();
}

fn observed_ip(addr: SocketAddr) -> Ipv4Addr {
    match addr {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => panic!("loopback test expects IPv4"),
    }
}

/// Pair one announcing server with one asking client. `answer` may rewrite
/// the entry sent to the client.
fn fake_stun(answer: fn(StunEntry) -> StunEntry) -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let addr = socket.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let mut server: Option<(SocketAddr, u16)> = None;
        let mut client: Option<(SocketAddr, StunEntry)> = None;
        let mut buf = [0u8; 64];
        while server.is_none() || client.is_none() {
            let Ok((n, from)) = socket.recv_from(&mut buf) else {
                return;
            };
            let Some(req) = StunRequest::decode(&mut &buf[..n]) else {
                continue;
            };
            match req.kind {
                StunRequestKind::PostInfo => server = Some((from, req.entry.public_port)),
                StunRequestKind::AskInfo => client = Some((from, req.entry)),
            }
        }
        let (Some((server_addr, public_port)), Some((client_addr, asked))) = (server, client) else {
            return;
        };

        let reply = if asked.public_port == public_port {
            StunEntry {
                private_port: server_addr.port(),
                ..asked
            }
        } else {
            asked
        };
        send_entry(&socket, answer(reply), client_addr);
        if reply.private_port != 0 {
            send_entry(
                &socket,
                StunEntry {
                    ip: observed_ip(client_addr),
                    public_port: client_addr.port(),
                    private_port: client_addr.port(),
                },
                server_addr,
            );
        }
    });
    (addr, handle)
}

#[test]
fn stun_pairs_server_and_client() {
    let (stun, rendezvous) = fake_stun(|e| e);
    let cfg = stun_config(stun);
    let server_cfg = cfg.clone();
    let server = thread::spawn(move || SocketContext::establish(Role::Server, &server_cfg));
    thread::sleep(Duration::from_millis(50));
    let client = SocketContext::establish(Role::Client, &cfg).unwrap();
    let server = server.join().unwrap().unwrap();
    rendezvous.join().unwrap();

    assert_eq!(server.peer_addr().port(), client.local_addr().unwrap().port());
    assert_eq!(client.peer_addr().port(), server.local_addr().unwrap().port());

    client.send_packet(PacketType::Message, b"ping", 0).unwrap();
    let mut got = None;
    for _ in 0..400 {
        if let Some(p) = server.read_packet().unwrap() {
            got = Some(p.payload().clone());
            break;
        }
    }
    assert_eq!(got.as_deref(), Some(&b"ping"[..]));
}

#[test]
fn unknown_server_is_reported() {
    let (stun, rendezvous) = fake_stun(|e| e);
    let cfg = stun_config(stun);
    // announce a different public port so the ask finds nobody
    let announcer = UdpSocket::bind("127.0.0.1:0").unwrap();
    announcer
        .send_to(&StunRequest::post_info(PUBLIC_PORT + 1).to_bytes(), stun)
        .unwrap();

    let result = SocketContext::connect_via_stun(stun, SocketAddrV4::new(Ipv4Addr::LOCALHOST, PUBLIC_PORT), &cfg);
    assert!(matches!(result, Err(TransportError::NoSuchPeer)));
    rendezvous.join().unwrap();
}

#[test]
fn mismatched_echo_is_rejected() {
    let (stun, rendezvous) = fake_stun(|e| StunEntry {
        public_port: e.public_port.wrapping_add(7),
        ..e
    });
    let cfg = stun_config(stun);
    let announcer = UdpSocket::bind("127.0.0.1:0").unwrap();
    announcer
        .send_to(&StunRequest::post_info(PUBLIC_PORT).to_bytes(), stun)
        .unwrap();

    let result = SocketContext::connect_via_stun(stun, SocketAddrV4::new(Ipv4Addr::LOCALHOST, PUBLIC_PORT), &cfg);
    assert!(matches!(result, Err(TransportError::StunMismatch)));
    rendezvous.join().unwrap();
}

#[test]
fn server_gives_up_without_client() {
    let (stun, _rendezvous) = fake_stun(|e| e);
    let cfg = ConnectionConfig {
        stun_timeout: Duration::from_millis(300),
        ..stun_config(stun)
    };
    let start = std::time::Instant::now();
    assert!(matches!(
        SocketContext::establish(Role::Server, &cfg),
        Err(TransportError::StunTimeout)
    ));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[test]
fn server_rejects_entry_without_client_port() {
    let rendezvous = UdpSocket::bind("127.0.0.1:0").unwrap();
    rendezvous.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let stun = rendezvous.local_addr().unwrap();
    let answer = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (_, server_addr) = rendezvous.recv_from(&mut buf).unwrap();
        send_entry(
            &rendezvous,
            StunEntry {
                ip: Ipv4Addr::LOCALHOST,
                public_port: 6000,
                private_port: 0,
            },
            server_addr,
        );
    });

    let result = SocketContext::accept_via_stun(stun, PUBLIC_PORT, &stun_config(stun));
    assert!(matches!(result, Err(TransportError::NoSuchPeer)));
    answer.join().unwrap();
}
