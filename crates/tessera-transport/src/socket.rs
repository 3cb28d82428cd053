//! # UDP Socket Context
//!
//! One [`SocketContext`] per peer connection. It owns the connected UDP
//! socket, the packet cipher, the per-type NACK buffers, the server-side
//! throttler and the single reusable receive buffer.
//!
//! ## Connecting
//!
//! - **Direct**: the client sends an empty datagram to the server's listen
//!   port; the server connects its listen socket to whoever sent it.
//! - **STUN**: the server announces its public port to the rendezvous
//!   server until a client entry arrives; the client asks for the server's
//!   public address and gets back the port it can actually reach. Both then
//!   connect to each other and send an empty datagram to open NAT mappings.
//!
//! Either way both sides finish with the private-key handshake
//! ([`crate::handshake`]).
//!
//! ## Reading
//!
//! `read_packet` decrypts into one buffer per context and hands out a
//! [`PacketGuard`]. The guard's slot is claimed before the socket is read,
//! so only one reader receives at a time; a second read while one is in
//! progress or outstanding fails with [`TransportError::PacketInUse`].
//! Handshake challenges the peer re-sends after this side finished are
//! answered on the read path.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use socket2::{Domain, Protocol, Socket, Type};

use crate::bitrate::STARTING_BURST_BITRATE;
use crate::config::ConnectionConfig;
use crate::crypto::{PacketCipher, MAX_DATAGRAM_SIZE};
use crate::error::{Result, TransportError};
use crate::fragment::{fragment_payload, num_indices};
use crate::handshake::{answer_late_challenge, handshake_private_key};
use crate::message::ControlMessage;
use crate::nack::NackBuffers;
use crate::stats::{SocketCounters, SocketStats};
use crate::stun::{StunEntry, StunRequest, STUN_ENTRY_SIZE};
use crate::throttle::NetworkThrottler;
use crate::wire::{Packet, PacketType, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};

/// Resend attempts when the OS reports its send buffer full.
pub const RETRIES_ON_BUFFER_FULL: u32 = 5;
const BUFFER_FULL_BACKOFF: Duration = Duration::from_millis(1);

const RECV_BUFFER_SIZE: usize = 65535;
/// DSCP expedited forwarding (46) in the TOS byte.
const TOS_DSCP_EF: u32 = 46 << 2;

const STUN_REANNOUNCE_INTERVAL: Duration = Duration::from_millis(100);
/// Pause after opening a NAT mapping so the peer's mapping exists too.
const NAT_SETTLE: Duration = Duration::from_millis(150);

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle of a connection. Each state is entered at most once and never
/// left for an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Uninitialized = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Uninitialized,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }

    /// Move forward to `next`; any other move is rejected.
    pub fn advance(self, next: ConnectionState) -> Result<ConnectionState> {
        if next <= self {
            return Err(TransportError::InvalidTransition { from: self, to: next });
        }
        tracing::debug!(from = ?self, to = ?next, "connection state");
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Streaming host: accepts one client, owns the send throttler.
    Server,
    /// Viewer: dials the server.
    Client,
}

// ─── Socket Helpers ──────────────────────────────────────────────────────────

fn new_udp_socket(bind: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        tracing::warn!(error = %e, "could not set receive buffer size");
    }
    if bind.is_ipv4() {
        if let Err(e) = socket.set_tos(TOS_DSCP_EF) {
            tracing::debug!(error = %e, "could not set DSCP");
        }
    }
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn is_buffer_full(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOBUFS) || e.kind() == io::ErrorKind::WouldBlock
}

/// Call `send`, retrying up to [`RETRIES_ON_BUFFER_FULL`] times while the OS
/// reports its send buffer full. Returns the outcome and the retries used.
fn send_with_retry(mut send: impl FnMut() -> io::Result<usize>) -> (io::Result<usize>, u32) {
    let mut retries = 0;
    loop {
        match send() {
            Err(e) if is_buffer_full(&e) && retries < RETRIES_ON_BUFFER_FULL => {
                retries += 1;
                thread::sleep(BUFFER_FULL_BACKOFF);
            }
            result => return (result, retries),
        }
    }
}

/// Hand every fragment to `send`, carrying on past failures.
fn send_fragments(fragments: &[Packet], mut send: impl FnMut(&Packet) -> Result<()>) -> Result<()> {
    let total = fragments.len();
    let mut sent = 0;
    for packet in fragments {
        match send(packet) {
            Ok(()) => sent += 1,
            Err(e) => tracing::warn!(
                packet_type = ?packet.packet_type,
                id = packet.id,
                index = packet.index,
                error = %e,
                "fragment send failed"
            ),
        }
    }
    if sent == total {
        Ok(())
    } else {
        Err(TransportError::PartialSend { sent, total })
    }
}

/// Send an empty datagram to open the local NAT mapping towards the peer.
fn open_nat_mapping(socket: &UdpSocket) -> Result<()> {
    match socket.send(&[]) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ─── Packet Guard ────────────────────────────────────────────────────────────

/// Checked-out packet from [`SocketContext::read_packet`]. Releases the
/// context's receive slot when dropped or passed to `free_packet`.
pub struct PacketGuard<'a> {
    ctx: &'a SocketContext,
    packet: Packet,
}

impl PacketGuard<'_> {
    pub fn payload(&self) -> &Bytes {
        &self.packet.payload
    }
}

impl Deref for PacketGuard<'_> {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        &self.packet
    }
}

impl Drop for PacketGuard<'_> {
    fn drop(&mut self) {
        self.ctx.packet_in_use.store(false, Ordering::Release);
    }
}

// ─── Socket Context ──────────────────────────────────────────────────────────

pub struct SocketContext {
    socket: UdpSocket,
    role: Role,
    peer: SocketAddr,
    cipher: PacketCipher,
    nack_buffers: NackBuffers,
    throttler: Option<NetworkThrottler>,
    fec_packet_ratio: AtomicU64,
    send_lock: Mutex<()>,
    next_message_id: AtomicI32,
    recv_buf: Mutex<Vec<u8>>,
    packet_in_use: AtomicBool,
    state: AtomicU8,
    counters: SocketCounters,
}

impl SocketContext {
    // ─── Connection Setup ───────────────────────────────────────────────

    /// Bind the socket a direct-mode server waits on.
    pub fn create_listen_socket(bind: SocketAddr) -> Result<UdpSocket> {
        let socket = new_udp_socket(bind)?;
        tracing::debug!(addr = %bind, "listen socket bound");
        Ok(socket)
    }

    /// Connect according to `config`: server or client, direct or STUN.
    pub fn establish(role: Role, config: &ConnectionConfig) -> Result<Self> {
        match (role, config.stun, config.destination) {
            (Role::Server, Some(stun), _) => Self::accept_via_stun(stun, config.port, config),
            (Role::Server, None, _) => {
                let listen = Self::create_listen_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)))?;
                Self::accept(listen, config)
            }
            (Role::Client, _, None) => Err(TransportError::Config("client needs a destination".into())),
            (Role::Client, Some(stun), Some(ip)) => {
                Self::connect_via_stun(stun, SocketAddrV4::new(ip, config.port), config)
            }
            (Role::Client, None, Some(ip)) => Self::connect(SocketAddr::from((ip, config.port)), config),
        }
    }

    /// Direct-mode server: wait for a client's empty datagram on `listen`,
    /// connect to it and handshake.
    pub fn accept(listen: UdpSocket, config: &ConnectionConfig) -> Result<Self> {
        let state = ConnectionState::Uninitialized.advance(ConnectionState::Connecting)?;
        tracing::info!(addr = ?listen.local_addr().ok(), "waiting for client");
        listen.set_read_timeout(Some(config.connection_timeout))?;
        let deadline = Instant::now() + config.connection_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let peer = loop {
            if Instant::now() >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no client connected").into());
            }
            match listen.recv_from(&mut buf) {
                Ok((0, from)) => break from,
                Ok((n, from)) => tracing::debug!(%from, len = n, "ignoring non-empty datagram while accepting"),
                Err(e) if is_timeout(&e) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no client connected").into())
                }
                Err(e) => return Err(e.into()),
            }
        };
        tracing::info!(%peer, "client connecting");
        listen.connect(peer)?;

        let cipher = PacketCipher::new(&config.key)?;
        handshake_private_key(&listen, &cipher, config.connection_timeout)?;
        Self::finish(listen, state, Role::Server, peer, cipher, config)
    }

    /// Direct-mode client.
    pub fn connect(destination: SocketAddr, config: &ConnectionConfig) -> Result<Self> {
        let state = ConnectionState::Uninitialized.advance(ConnectionState::Connecting)?;
        let bind = if destination.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = new_udp_socket(bind)?;
        socket.connect(destination)?;
        tracing::info!(%destination, "connecting to server");
        socket.send(&[])?;

        let cipher = PacketCipher::new(&config.key)?;
        handshake_private_key(&socket, &cipher, config.connection_timeout)?;
        Self::finish(socket, state, Role::Client, destination, cipher, config)
    }

    /// STUN-mode server: announce `public_port` until the rendezvous server
    /// pairs us with a client.
    pub fn accept_via_stun(stun: SocketAddr, public_port: u16, config: &ConnectionConfig) -> Result<Self> {
        let state = ConnectionState::Uninitialized.advance(ConnectionState::Connecting)?;
        let socket = new_udp_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        socket.set_read_timeout(Some(STUN_REANNOUNCE_INTERVAL))?;
        let announce = StunRequest::post_info(public_port).to_bytes();
        tracing::info!(%stun, public_port, "announcing to STUN server");

        let deadline = Instant::now() + config.stun_timeout;
        let mut buf = [0u8; 64];
        socket.send_to(&announce, stun)?;
        let entry = loop {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) if from == stun && n == STUN_ENTRY_SIZE => {
                    break StunEntry::from_datagram(&buf[..n])?;
                }
                Ok((n, from)) => tracing::debug!(%from, len = n, "ignoring datagram while waiting for STUN"),
                Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::ConnectionRefused => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                tracing::warn!(%stun, "no client arrived through STUN");
                return Err(TransportError::StunTimeout);
            }
            socket.send_to(&announce, stun)?;
        };

        if entry.private_port == 0 {
            tracing::error!(?entry, "STUN entry carries no client port");
            return Err(TransportError::NoSuchPeer);
        }

        let peer = entry.private_addr();
        tracing::info!(%peer, "STUN paired a client");
        socket.connect(peer)?;
        open_nat_mapping(&socket)?;
        thread::sleep(NAT_SETTLE);

        let cipher = PacketCipher::new(&config.key)?;
        handshake_private_key(&socket, &cipher, config.connection_timeout)?;
        Self::finish(socket, state, Role::Server, peer, cipher, config)
    }

    /// STUN-mode client: ask for the server at `destination`.
    pub fn connect_via_stun(stun: SocketAddr, destination: SocketAddrV4, config: &ConnectionConfig) -> Result<Self> {
        let state = ConnectionState::Uninitialized.advance(ConnectionState::Connecting)?;
        let socket = new_udp_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        socket.set_read_timeout(Some(STUN_REANNOUNCE_INTERVAL))?;
        let request = StunRequest::ask_info(*destination.ip(), destination.port());
        let bytes = request.to_bytes();
        tracing::info!(%stun, %destination, "asking STUN server for peer");

        let deadline = Instant::now() + config.stun_timeout;
        let mut buf = [0u8; 64];
        socket.send_to(&bytes, stun)?;
        let entry = loop {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) if from == stun => break StunEntry::from_datagram(&buf[..n])?,
                Ok((n, from)) => tracing::debug!(%from, len = n, "ignoring datagram while waiting for STUN"),
                Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::ConnectionRefused => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(TransportError::StunTimeout);
            }
            socket.send_to(&bytes, stun)?;
        };
        if let Err(e) = request.validate_response(&entry) {
            tracing::error!(?entry, error = %e, "STUN response rejected");
            return Err(e);
        }

        let peer = entry.private_addr();
        socket.connect(peer)?;
        open_nat_mapping(&socket)?;
        thread::sleep(NAT_SETTLE);

        let cipher = PacketCipher::new(&config.key)?;
        handshake_private_key(&socket, &cipher, config.connection_timeout)?;
        Self::finish(socket, state, Role::Client, peer, cipher, config)
    }

    fn finish(
        socket: UdpSocket,
        state: ConnectionState,
        role: Role,
        peer: SocketAddr,
        cipher: PacketCipher,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        socket.set_read_timeout(Some(config.recv_timeout))?;
        let state = state.advance(ConnectionState::Connected)?;
        let throttler = match role {
            Role::Server => Some(NetworkThrottler::new(STARTING_BURST_BITRATE)),
            Role::Client => None,
        };
        tracing::info!(?role, %peer, "connected");
        Ok(SocketContext {
            socket,
            role,
            peer,
            cipher,
            nack_buffers: NackBuffers::new(),
            throttler,
            fec_packet_ratio: AtomicU64::new(0f64.to_bits()),
            send_lock: Mutex::new(()),
            next_message_id: AtomicI32::new(0),
            recv_buf: Mutex::new(vec![0u8; MAX_DATAGRAM_SIZE]),
            packet_in_use: AtomicBool::new(false),
            state: AtomicU8::new(state as u8),
            counters: SocketCounters::default(),
        })
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> SocketStats {
        self.counters.snapshot()
    }

    pub fn fec_packet_ratio(&self) -> f64 {
        f64::from_bits(self.fec_packet_ratio.load(Ordering::Relaxed))
    }

    /// Current throttler rate; `None` on the client.
    pub fn burst_bitrate(&self) -> Option<u32> {
        self.throttler.as_ref().map(NetworkThrottler::burst_bitrate)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Stop the context. Blocked reads return `Closed` within one read
    /// timeout.
    pub fn close(&self) {
        let prev = self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if prev != ConnectionState::Closed as u8 {
            tracing::info!(peer = %self.peer, "socket context closed");
        }
    }

    // ─── Sending ────────────────────────────────────────────────────────

    pub fn register_nack_buffer(&self, packet_type: PacketType, max_payload_size: usize, num_buffers: usize) -> Result<()> {
        self.nack_buffers.register(packet_type, max_payload_size, num_buffers)
    }

    /// Fragment `payload` as unit `id` of `packet_type` and send every
    /// fragment, keeping copies in the type's NACK buffer.
    ///
    /// A failed fragment does not stop the others; the result reports how
    /// many went out.
    pub fn send_packet(&self, packet_type: PacketType, payload: &[u8], id: i32) -> Result<()> {
        self.ensure_open()?;
        let count = num_indices(payload.len(), MAX_PAYLOAD_SIZE);
        {
            let guard = self.nack_buffers.lock(packet_type);
            let (mut max_indices, max_size) = match guard.as_ref() {
                Some(buf) => (buf.max_indices().min(u16::MAX as usize), buf.max_payload_size()),
                None => (1, MAX_PAYLOAD_SIZE),
            };
            // control messages are never reassembled
            if packet_type == PacketType::Message {
                max_indices = 1;
            }
            if count > max_indices || payload.len() > max_size {
                tracing::error!(?packet_type, id, size = payload.len(), "payload too large to send");
                return Err(TransportError::PayloadTooLarge {
                    packet_type,
                    size: payload.len(),
                    num_indices: count,
                    max_indices,
                    max_size,
                });
            }
        }

        let payload = Bytes::copy_from_slice(payload);
        let fragments = fragment_payload(packet_type, id, &payload, MAX_PAYLOAD_SIZE);
        send_fragments(&fragments, |packet| {
            if let Some(buf) = self.nack_buffers.lock(packet_type).as_mut() {
                buf.store(packet);
            }
            self.send_constructed(packet)
        })
    }

    /// Encrypt and send one already-built packet.
    pub fn send_constructed(&self, packet: &Packet) -> Result<()> {
        self.ensure_open()?;
        let size = packet.encoded_len();
        if size > MAX_PACKET_SIZE {
            return Err(TransportError::PacketTooLarge {
                size,
                max: MAX_PACKET_SIZE,
            });
        }
        let mut sealed = Vec::with_capacity(MAX_DATAGRAM_SIZE);
        self.cipher.seal(&packet.to_bytes(), &mut sealed)?;
        if let Some(throttler) = &self.throttler {
            throttler.wait_byte_allocation(sealed.len());
        }

        let _guard = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
        match send_with_retry(|| self.socket.send(&sealed)) {
            (Ok(_), _) => {
                SocketCounters::bump(&self.counters.packets_sent, 1);
                SocketCounters::bump(&self.counters.bytes_sent, sealed.len() as u64);
                Ok(())
            }
            (Err(e), retries) => {
                SocketCounters::bump(&self.counters.send_failures, 1);
                tracing::warn!(retries, error = %e, "datagram send failed");
                Err(e.into())
            }
        }
    }

    /// Send a control message as the next MESSAGE unit.
    pub fn send_message(&self, message: &ControlMessage) -> Result<()> {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        self.send_packet(PacketType::Message, &message.to_bytes(), id)
    }

    /// Resend fragment `index` of unit `id` from the NACK buffer.
    pub fn nack(&self, packet_type: PacketType, id: i32, index: u16) -> Result<()> {
        match self.nack_buffers.nack(packet_type, id, index) {
            Ok(packet) => {
                tracing::debug!(?packet_type, id, index, "resending nacked packet");
                SocketCounters::bump(&self.counters.retransmissions, 1);
                self.send_constructed(&packet)
            }
            Err(e @ TransportError::NackNotFound { .. }) => {
                SocketCounters::bump(&self.counters.nacks_not_found, 1);
                tracing::warn!(?packet_type, id, index, "nacked packet not found");
                Err(e)
            }
            Err(e) => {
                tracing::error!(?packet_type, error = %e, "nack for unregistered packet type");
                Err(e)
            }
        }
    }

    /// Apply client-requested settings to the server's throttler. A
    /// non-zero FEC ratio is recorded but not acted on.
    pub fn update_bitrate_settings(&self, burst_bitrate: u32, fec_packet_ratio: f64) -> Result<()> {
        let Some(throttler) = &self.throttler else {
            tracing::error!("bitrate settings can only be applied on the server");
            return Err(TransportError::NoThrottler);
        };
        if fec_packet_ratio > 0.0 {
            tracing::error!(fec_packet_ratio, "FEC isn't implemented");
        }
        self.fec_packet_ratio.store(fec_packet_ratio.to_bits(), Ordering::Relaxed);
        throttler.set_burst_bitrate(burst_bitrate);
        Ok(())
    }

    // ─── Receiving ──────────────────────────────────────────────────────

    /// Receive and decrypt one packet, waiting at most the read timeout.
    ///
    /// `Ok(None)` covers timeouts, empty datagrams, late handshake
    /// challenges and datagrams that fail to decrypt or decode.
    pub fn read_packet(&self) -> Result<Option<PacketGuard<'_>>> {
        self.ensure_open()?;
        if self
            .packet_in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::error!("read_packet called while another packet read is in progress or unreturned");
            return Err(TransportError::PacketInUse);
        }

        match self.receive_one() {
            Ok(Some(packet)) => Ok(Some(PacketGuard { ctx: self, packet })),
            other => {
                self.packet_in_use.store(false, Ordering::Release);
                other.map(|_| None)
            }
        }
    }

    /// Body of `read_packet`, run with the receive slot held.
    fn receive_one(&self) -> Result<Option<Packet>> {
        let mut buf = self.recv_buf.lock().unwrap_or_else(|e| e.into_inner());
        let n = match self.socket.recv(&mut buf[..]) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {
                SocketCounters::bump(&self.counters.read_timeouts, 1);
                return Ok(None);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::debug!("peer port unreachable");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "socket receive failed");
                return Err(e.into());
            }
        };
        if n == 0 || answer_late_challenge(&self.socket, &self.cipher, &buf[..n])? {
            return Ok(None);
        }

        let plain = match self.cipher.open(&mut buf[..n]) {
            Ok(p) => p,
            Err(_) => {
                SocketCounters::bump(&self.counters.decrypt_failures, 1);
                tracing::warn!(len = n, "failed to decrypt datagram");
                return Ok(None);
            }
        };
        let Some(packet) = Packet::decode(&mut &plain[..]) else {
            SocketCounters::bump(&self.counters.decrypt_failures, 1);
            tracing::warn!(len = plain.len(), "malformed packet");
            return Ok(None);
        };
        SocketCounters::bump(&self.counters.packets_received, 1);
        SocketCounters::bump(&self.counters.bytes_received, n as u64);
        Ok(Some(packet))
    }

    /// Return a packet obtained from `read_packet`.
    pub fn free_packet(&self, guard: PacketGuard<'_>) -> Result<()> {
        if !std::ptr::eq(guard.ctx, self) {
            return Err(TransportError::Malformed("packet guard from another context"));
        }
        drop(guard);
        Ok(())
    }

    /// Whether a packet from `read_packet` is still checked out.
    pub fn packet_in_use(&self) -> bool {
        self.packet_in_use.load(Ordering::Acquire)
    }
}

impl Drop for SocketContext {
    fn drop(&mut self) {
        self.close();
    }
}
