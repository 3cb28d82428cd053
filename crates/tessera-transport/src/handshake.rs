//! # Private-Key Handshake
//!
//! Both ends of a freshly connected socket prove possession of the shared
//! 16-byte key before any media flows:
//!
//! 1. Each side sends `CHALLENGE | 16 random bytes`.
//! 2. On receiving the peer's challenge, a side answers
//!    `PROOF | HMAC-SHA256(key, challenge)`.
//! 3. A side is done once it has answered the peer and verified the proof
//!    of its own challenge.
//!
//! The challenge is re-sent every [`RESEND_INTERVAL`] while the proof is
//! outstanding, so a peer that was not yet listening still completes.
//!
//! A side can finish while its own proof to the peer is lost. The peer then
//! keeps re-sending its challenge, so a finished side must go on answering
//! with [`answer_late_challenge`] for as long as it reads from the socket.

use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use quanta::Instant;

use crate::crypto::PacketCipher;
use crate::error::{Result, TransportError};

const CHALLENGE_TAG: u8 = 0xA1;
const PROOF_TAG: u8 = 0xA2;
const CHALLENGE_LEN: usize = 16;
const PROOF_LEN: usize = 32;

pub const RESEND_INTERVAL: Duration = Duration::from_millis(50);

fn is_challenge(datagram: &[u8]) -> bool {
    datagram.len() == 1 + CHALLENGE_LEN && datagram[0] == CHALLENGE_TAG
}

fn send_proof(socket: &UdpSocket, cipher: &PacketCipher, challenge: &[u8]) -> Result<()> {
    let tag = cipher.sign(challenge);
    let mut proof = [0u8; 1 + PROOF_LEN];
    proof[0] = PROOF_TAG;
    proof[1..].copy_from_slice(tag.as_ref());
    socket.send(&proof)?;
    Ok(())
}

/// Answer `datagram` if it is a peer challenge re-sent after this side
/// finished the handshake. Returns whether it was one.
///
/// Sealed datagrams are never mistaken for a challenge: they are longer than
/// a challenge, and plaintext packets start with a packet type byte.
pub fn answer_late_challenge(socket: &UdpSocket, cipher: &PacketCipher, datagram: &[u8]) -> Result<bool> {
    if !is_challenge(datagram) {
        return Ok(false);
    }
    tracing::debug!("answering late handshake challenge");
    send_proof(socket, cipher, &datagram[1..])?;
    Ok(true)
}

/// Run the handshake on a connected socket. Leaves the socket's read
/// timeout at [`RESEND_INTERVAL`]; the caller restores its own.
pub fn handshake_private_key(socket: &UdpSocket, cipher: &PacketCipher, timeout: Duration) -> Result<()> {
    socket.set_read_timeout(Some(RESEND_INTERVAL))?;

    let mut challenge = [0u8; 1 + CHALLENGE_LEN];
    challenge[0] = CHALLENGE_TAG;
    cipher.random(&mut challenge[1..])?;
    socket.send(&challenge)?;

    let deadline = Instant::now() + timeout;
    let mut answered = false;
    let mut verified = false;
    let mut buf = [0u8; 64];

    while !(answered && verified) {
        if Instant::now() >= deadline {
            tracing::warn!(answered, verified, "private-key handshake timed out");
            return Err(TransportError::HandshakeTimeout);
        }
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused
                ) =>
            {
                if !verified {
                    socket.send(&challenge)?;
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        match (buf.first().copied(), n) {
            (Some(CHALLENGE_TAG), len) if is_challenge(&buf[..len]) => {
                send_proof(socket, cipher, &buf[1..len])?;
                answered = true;
            }
            (Some(PROOF_TAG), len) if len == 1 + PROOF_LEN => {
                if !cipher.verify(&challenge[1..], &buf[1..len]) {
                    tracing::error!("peer failed to prove the private key");
                    return Err(TransportError::Handshake("peer proof did not verify"));
                }
                verified = true;
            }
            // NAT-opening empties and stray datagrams
            _ => tracing::trace!(len = n, "ignoring datagram during handshake"),
        }
    }

    tracing::debug!("private-key handshake complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn connected_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();
        (a, b)
    }

    #[test]
    fn matching_keys_complete() {
        let (a, b) = connected_pair();
        let peer = thread::spawn(move || {
            let cipher = PacketCipher::new(b"0123456789abcdef").unwrap();
            handshake_private_key(&b, &cipher, Duration::from_secs(2))
        });
        let cipher = PacketCipher::new(b"0123456789abcdef").unwrap();
        handshake_private_key(&a, &cipher, Duration::from_secs(2)).unwrap();
        peer.join().unwrap().unwrap();
    }

    #[test]
    fn mismatched_keys_fail() {
        let (a, b) = connected_pair();
        let peer = thread::spawn(move || {
            let cipher = PacketCipher::new(b"fedcba9876543210").unwrap();
            handshake_private_key(&b, &cipher, Duration::from_millis(500))
        });
        let cipher = PacketCipher::new(b"0123456789abcdef").unwrap();
        assert!(handshake_private_key(&a, &cipher, Duration::from_millis(500)).is_err());
        assert!(peer.join().unwrap().is_err());
    }

    #[test]
    fn silent_peer_times_out() {
        let (a, _b) = connected_pair();
        let cipher = PacketCipher::new(b"0123456789abcdef").unwrap();
        let start = std::time::Instant::now();
        assert!(matches!(
            handshake_private_key(&a, &cipher, Duration::from_millis(200)),
            Err(TransportError::HandshakeTimeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    /// Relay between `a` and `b` that drops the first proof `b` sends.
    fn lossy_relay() -> (UdpSocket, UdpSocket, thread::JoinHandle<()>) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let ra = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rb = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.connect(ra.local_addr().unwrap()).unwrap();
        ra.connect(a.local_addr().unwrap()).unwrap();
        b.connect(rb.local_addr().unwrap()).unwrap();
        rb.connect(b.local_addr().unwrap()).unwrap();
        ra.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
        rb.set_read_timeout(Some(Duration::from_millis(5))).unwrap();

        let relay = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            let mut dropped = false;
            let mut buf = [0u8; 64];
            while std::time::Instant::now() < deadline {
                if let Ok(n) = ra.recv(&mut buf) {
                    let _ = rb.send(&buf[..n]);
                }
                if let Ok(n) = rb.recv(&mut buf) {
                    if !dropped && n > 0 && buf[0] == PROOF_TAG {
                        dropped = true;
                        continue;
                    }
                    let _ = ra.send(&buf[..n]);
                }
            }
        });
        (a, b, relay)
    }

    #[test]
    fn lost_proof_is_answered_after_completion() {
        let (a, b, relay) = lossy_relay();
        let late = thread::spawn(move || {
            let cipher = PacketCipher::new(b"0123456789abcdef").unwrap();
            handshake_private_key(&b, &cipher, Duration::from_secs(2))?;
            // what the socket context's read path does once connected
            let mut answered = 0;
            let mut buf = [0u8; 64];
            let until = std::time::Instant::now() + Duration::from_millis(500);
            while std::time::Instant::now() < until {
                if let Ok(n) = b.recv(&mut buf) {
                    if answer_late_challenge(&b, &cipher, &buf[..n])? {
                        answered += 1;
                    }
                }
            }
            Ok::<_, TransportError>(answered)
        });

        let cipher = PacketCipher::new(b"0123456789abcdef").unwrap();
        handshake_private_key(&a, &cipher, Duration::from_secs(2)).unwrap();
        let answered = late.join().unwrap().unwrap();
        assert!(answered >= 1);
        relay.join().unwrap();
    }

    #[test]
    fn only_challenges_are_answered_late() {
        let (a, _b) = connected_pair();
        let cipher = PacketCipher::new(b"0123456789abcdef").unwrap();
        assert!(!answer_late_challenge(&a, &cipher, &[PROOF_TAG; 1 + PROOF_LEN]).unwrap());
        assert!(!answer_late_challenge(&a, &cipher, &[CHALLENGE_TAG; 30]).unwrap());
        assert!(!answer_late_challenge(&a, &cipher, &[]).unwrap());
        assert!(answer_late_challenge(&a, &cipher, &[CHALLENGE_TAG; 1 + CHALLENGE_LEN]).unwrap());
    }
}
