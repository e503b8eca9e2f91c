use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::Mutex;
use zvnet_core::login::{LoginRecord, NodeIdentity};
use zvnet_core::nat::NatType;
use zvnet_reliable::Arq;

use crate::protocol::protocol_type::ProtocolType;
use crate::protocol::NetPacket;

mod handle;
mod manager;
mod plane;

pub use handle::SessionId;
pub(crate) use handle::SessionArena;
pub use manager::{SessionManager, Transmit};
pub(crate) use plane::SharedArq;
pub use plane::{DataPlane, Telemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Init,
    Connecting,
    Authenticating,
    Connected,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `self -> to` is a legal edge.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Init, Connecting)
                | (Init, Authenticating)
                | (Connecting, Authenticating)
                | (Authenticating, Connected)
                | (Connected, Closing)
                | (Init | Connecting | Authenticating | Connected | Closing, Closed)
        )
    }
}

/// Why a session ended. Discriminants are part of the callback contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Handshake or authentication failure, malformed record, unreachable peer.
    ConnectError = 0,
    /// No login answer within the connect timeout.
    ConnectTimeout = 1,
    /// Closed locally.
    DisconnectActive = 2,
    /// Closed by the peer.
    DisconnectPassive = 3,
    /// Retransmission budget exhausted or keepalive lost.
    DisconnectTimeout = 4,
}

impl From<DisconnectReason> for u32 {
    fn from(value: DisconnectReason) -> Self {
        value as u32
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::ConnectError => "connect_error",
            DisconnectReason::ConnectTimeout => "connect_timeout",
            DisconnectReason::DisconnectActive => "disconnect_active",
            DisconnectReason::DisconnectPassive => "disconnect_passive",
            DisconnectReason::DisconnectTimeout => "disconnect_timeout",
        };
        f.write_str(name)
    }
}

/// Keys of the pending-work cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PendingKey {
    Connect(u64),
    Probe(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Outbound,
    Inbound,
}

/// Path datagrams of a session take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Direct(SocketAddr),
    Relay(SocketAddr),
}

impl Route {
    pub fn addr(&self) -> SocketAddr {
        match self {
            Route::Direct(addr) | Route::Relay(addr) => *addr,
        }
    }
    /// Frames `payload` for `dst_id`, wrapping it for the proxy when relayed.
    pub fn frame(
        &self,
        protocol: ProtocolType,
        src_id: u64,
        dst_id: u64,
        payload: &[u8],
    ) -> BytesMut {
        let packet = NetPacket::build(protocol, src_id, dst_id, payload).into_buffer();
        match self {
            Route::Direct(_) => packet,
            Route::Relay(_) => NetPacket::relay(&packet, src_id, dst_id).into_buffer(),
        }
    }
}

/// ARQ output: frames each segment batch as a `Data` datagram.
pub(crate) struct SessionOutput {
    route: Route,
    local_id: u64,
    peer_id: u64,
    queue: Vec<BytesMut>,
}

impl SessionOutput {
    fn new(route: Route, local_id: u64, peer_id: u64) -> Self {
        Self {
            route,
            local_id,
            peer_id,
            queue: Vec::new(),
        }
    }
    pub fn drain(&mut self) -> std::vec::Drain<'_, BytesMut> {
        self.queue.drain(..)
    }
}

impl io::Write for SessionOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queue.push(
            self.route
                .frame(ProtocolType::Data, self.local_id, self.peer_id, buf),
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct Session {
    pub peer_id: u64,
    pub direction: Direction,
    pub state: SessionState,
    pub route: Route,
    /// Local NAT type when the session was created.
    pub nat_type: NatType,
    pub identity: Option<NodeIdentity>,
    /// Set once the handle was reported through `connected` or `accepted`.
    pub exposed: bool,
    pub started: Instant,
    pub last_recv: Instant,
    pub last_send: Instant,
    pub last_login_sent: Option<Instant>,
    pub local_login: LoginRecord,
    /// `cur_time` of the peer's login, 0 until one was verified.
    pub remote_login_time: u64,
    pub arq: SharedArq,
    pub closing: Option<DisconnectReason>,
}

impl Session {
    pub fn new(
        peer_id: u64,
        direction: Direction,
        route: Route,
        nat_type: NatType,
        local_login: LoginRecord,
        now: Instant,
    ) -> Self {
        Self {
            peer_id,
            direction,
            state: SessionState::Init,
            route,
            nat_type,
            identity: None,
            exposed: false,
            started: now,
            last_recv: now,
            last_send: now,
            last_login_sent: None,
            local_login,
            remote_login_time: 0,
            arq: Arc::new(Mutex::new(None)),
            closing: None,
        }
    }

    /// Moves to `to`, refusing illegal edges.
    pub fn transition(&mut self, to: SessionState) -> bool {
        if !self.state.can_transition(to) {
            log::debug!(
                "peer {} ignoring transition {:?} -> {:?}",
                self.peer_id,
                self.state,
                to
            );
            return false;
        }
        log::debug!("peer {} {:?} -> {:?}", self.peer_id, self.state, to);
        self.state = to;
        true
    }

    pub fn start_arq(&mut self, conv: u32, local_id: u64, config: zvnet_reliable::ArqConfig) {
        let output = SessionOutput::new(self.route, local_id, self.peer_id);
        *self.arq.lock() = Some(Arq::new(conv, config, output));
    }
}

/// Conversation id shared by both ends, derived from the initiating login.
pub(crate) fn conversation(initiator: u64, acceptor: u64, cur_time: u64) -> u32 {
    let mixed = initiator ^ acceptor.rotate_left(17) ^ cur_time.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed as u32) ^ ((mixed >> 32) as u32)
}
