use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use flume::Sender;
use zvnet_core::cache::ExpireCache;
use zvnet_core::login::{LoginRecord, NodeIdentity};
use zvnet_core::nat::NatType;

use super::{
    conversation, DataPlane, Direction, DisconnectReason, PendingKey, Route, Session,
    SessionArena, SessionId, SessionState, Telemetry,
};
use crate::auth::Authenticator;
use crate::checker::{CheckResult, NatChecker};
use crate::config::EngineConfig;
use crate::dispatch::Event;
use crate::error::{Error, Result};
use crate::protocol::probe::ProbeReply;
use crate::protocol::protocol_type::ProtocolType;
use crate::protocol::NetPacket;

/// A datagram to put on the wire.
#[derive(Debug)]
pub struct Transmit {
    pub to: SocketAddr,
    pub data: BytesMut,
}

fn emit(events: &Sender<Event>, event: Event) {
    if events.send(event).is_err() {
        log::debug!("event receiver dropped");
    }
}

/// Owns every session of one node and drives their state machines.
///
/// The manager performs no I/O. Inbound datagrams are fed to
/// [`handle_datagram`](Self::handle_datagram), timers advance on
/// [`tick`](Self::tick), outbound datagrams are collected with
/// [`take_transmits`](Self::take_transmits), and events go to the channel given
/// at construction in the order they happen. Connected sessions are also
/// published on a [`DataPlane`] so they can be written to without the manager.
pub struct SessionManager {
    local_id: u64,
    config: EngineConfig,
    auth: Authenticator,
    epoch: Instant,
    unix_base: u64,
    sessions: SessionArena<Session>,
    by_peer: HashMap<u64, SessionId>,
    plane: DataPlane,
    // highest verified login time per peer, and when to forget it
    replay: HashMap<u64, (u64, Instant)>,
    // login time last used towards each peer
    sent_logins: HashMap<u64, u64>,
    pending: ExpireCache<PendingKey, Instant>,
    checks: ExpireCache<SocketAddr, CheckResult>,
    checker: Option<NatChecker>,
    proxy: Option<SocketAddr>,
    listening: Option<SocketAddr>,
    nat_type: NatType,
    events: Sender<Event>,
    transmits: Vec<Transmit>,
}

impl SessionManager {
    /// `unix_now` is the wall clock in seconds at `now`.
    pub fn new(
        config: EngineConfig,
        auth: Authenticator,
        events: Sender<Event>,
        now: Instant,
        unix_now: u64,
    ) -> Self {
        let pending_ttl = config.connect_timeout.max(config.probe_timeout) * 2;
        let pending = ExpireCache::new(config.cache_capacity, pending_ttl);
        let checks = ExpireCache::new(16, config.probe_cache_ttl);
        Self {
            local_id: auth.local_id(),
            config,
            auth,
            epoch: now,
            unix_base: unix_now,
            sessions: SessionArena::default(),
            by_peer: HashMap::new(),
            plane: DataPlane::default(),
            replay: HashMap::new(),
            sent_logins: HashMap::new(),
            pending,
            checks,
            checker: None,
            proxy: None,
            listening: None,
            nat_type: NatType::Unknown,
            events,
            transmits: Vec::new(),
        }
    }
    pub fn local_id(&self) -> u64 {
        self.local_id
    }
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
    pub fn set_proxy(&mut self, proxy: Option<SocketAddr>) {
        self.proxy = proxy;
    }
    pub fn proxy(&self) -> Option<SocketAddr> {
        self.proxy
    }
    pub fn nat_type(&self) -> NatType {
        self.nat_type
    }
    pub fn is_listening(&self) -> bool {
        self.listening.is_some()
    }
    /// Entries in the pending-work cache: connect attempts and NAT probes in flight.
    pub fn cache_size(&self) -> usize {
        self.pending.len()
    }
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
    /// Shares the connected sessions' ARQs for sending outside the manager.
    pub fn data_plane(&self) -> DataPlane {
        self.plane.clone()
    }
    pub fn take_transmits(&mut self) -> Vec<Transmit> {
        std::mem::take(&mut self.transmits)
    }

    /// Starts a listen cycle on `local`. `host` is the concrete interface address
    /// when known, used to recognise an unmapped host.
    pub fn listen(&mut self, local: SocketAddr, host: Option<SocketAddr>, now: Instant) -> Result<()> {
        if self.listening.is_some() {
            return Err(Error::AlreadyListening);
        }
        self.listening = Some(local);
        match self.proxy {
            None => self.report_check(
                local,
                CheckResult {
                    nat_type: NatType::Unknown,
                    host,
                    napt: None,
                    latency: None,
                },
            ),
            Some(proxy) => match self.checks.get(&proxy, now) {
                Some(result) => {
                    log::debug!("reusing nat check of {proxy}");
                    self.report_check(local, result)
                }
                None => {
                    self.checker = Some(NatChecker::new(
                        proxy,
                        host,
                        now,
                        self.config.probe_timeout,
                        self.config.probe_resend_interval,
                        self.pending.clone(),
                    ));
                    self.poll_checker(now);
                }
            },
        }
        Ok(())
    }

    /// Stops listening and tears down every session with `disconnect_active`.
    pub fn close(&mut self) {
        self.listening = None;
        if let Some(checker) = self.checker.take() {
            checker.finish();
        }
        for id in self.sessions.ids() {
            if let Some(session) = self.sessions.get(id) {
                if matches!(session.state, SessionState::Connected) {
                    let frame = session
                        .route
                        .frame(ProtocolType::Close, self.local_id, session.peer_id, &[]);
                    self.transmits.push(Transmit {
                        to: session.route.addr(),
                        data: frame,
                    });
                }
            }
            self.finish(id, DisconnectReason::DisconnectActive);
        }
    }

    /// Starts an outbound attempt. A second call while an attempt or session to
    /// `peer_id` exists is a no-op; the outcome arrives as an event.
    pub fn connect(&mut self, peer_id: u64, addr: SocketAddr, now: Instant) -> Result<()> {
        if peer_id == self.local_id {
            return Err(Error::InvalidArgument("cannot connect to self".into()));
        }
        if self.listening.is_none() {
            return Err(Error::NotListening);
        }
        if let Some(&id) = self.by_peer.get(&peer_id) {
            match self.sessions.get(id).map(|v| v.state) {
                Some(SessionState::Closing) => self.finish(id, DisconnectReason::DisconnectActive),
                Some(state) => {
                    log::debug!("connect to {peer_id} ignored, session {id} is {state:?}");
                    return Ok(());
                }
                None => {
                    self.by_peer.remove(&peer_id);
                }
            }
        }
        if !self
            .pending
            .insert_if_absent(PendingKey::Connect(peer_id), now, now)
        {
            log::debug!("connect to {peer_id} already pending");
            return Ok(());
        }
        let route = match self.proxy {
            Some(proxy) if proxy == addr => Route::Relay(proxy),
            Some(proxy) if self.nat_type.prefers_relay() => {
                log::info!("local nat is {}, relaying {peer_id} through {proxy}", self.nat_type);
                Route::Relay(proxy)
            }
            _ => Route::Direct(addr),
        };
        let login = match self.login_for(peer_id, now) {
            Ok(login) => login,
            Err(e) => {
                log::warn!("signing login for {peer_id} failed: {e}");
                self.pending.remove(&PendingKey::Connect(peer_id));
                emit(
                    &self.events,
                    Event::Disconnected {
                        peer_id,
                        session: None,
                        reason: DisconnectReason::ConnectError,
                    },
                );
                return Ok(());
            }
        };
        if self.nat_type.prefers_relay() && matches!(route, Route::Direct(_)) {
            log::warn!(
                "local nat is {} and no proxy is set, direct connect to {peer_id} is unlikely to succeed",
                self.nat_type
            );
        }
        let mut session = Session::new(
            peer_id,
            Direction::Outbound,
            route,
            self.nat_type,
            login,
            now,
        );
        session.transition(SessionState::Connecting);
        let id = self.sessions.insert(session);
        self.by_peer.insert(peer_id, id);
        log::debug!("connecting to {peer_id} at {addr} as {id}");
        self.send_handshake(id, ProtocolType::Login, now);
        Ok(())
    }

    /// Requests a graceful close. Repeated calls and unknown ids are no-ops.
    pub fn shutdown(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        match session.state {
            SessionState::Connected => {
                session.transition(SessionState::Closing);
                session.closing = Some(DisconnectReason::DisconnectActive);
                // pending retransmissions are abandoned
                session.arq.lock().take();
                let frame = session
                    .route
                    .frame(ProtocolType::Close, self.local_id, session.peer_id, &[]);
                self.transmits.push(Transmit {
                    to: session.route.addr(),
                    data: frame,
                });
            }
            SessionState::Closing | SessionState::Closed => {}
            _ => self.finish(id, DisconnectReason::DisconnectActive),
        }
    }

    /// Queues bytes on a connected session.
    pub fn send(&self, id: SessionId, buf: &[u8]) -> Result<()> {
        self.plane.send(id, buf)
    }

    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(id).map(|v| v.state)
    }
    pub fn peer_of(&self, id: SessionId) -> Option<u64> {
        self.sessions.get(id).map(|v| v.peer_id)
    }
    pub fn peer_identity(&self, id: SessionId) -> Option<NodeIdentity> {
        self.sessions.get(id).and_then(|v| v.identity.clone())
    }
    pub fn telemetry(&self, id: SessionId) -> Option<Telemetry> {
        self.plane.telemetry(id)
    }

    pub fn handle_datagram(&mut self, from: SocketAddr, buf: &[u8], now: Instant) {
        let packet = match NetPacket::new(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("drop datagram from {from}: {e}");
                return;
            }
        };
        if packet.protocol() != ProtocolType::Relay {
            let relayed = self.proxy == Some(from);
            self.handle_packet(from, packet, relayed, now);
            return;
        }
        if self.proxy != Some(from) {
            log::debug!("drop relay datagram from non-proxy {from}");
            return;
        }
        match NetPacket::new(packet.payload()) {
            Ok(inner) if inner.protocol() != ProtocolType::Relay => {
                self.handle_packet(from, inner, true, now)
            }
            Ok(_) => log::debug!("drop nested relay from {from}"),
            Err(e) => log::debug!("drop relayed datagram from {from}: {e}"),
        }
    }

    fn handle_packet(&mut self, from: SocketAddr, packet: NetPacket<&[u8]>, relayed: bool, now: Instant) {
        let protocol = packet.protocol();
        if protocol == ProtocolType::ProbeReply {
            self.on_probe_reply(packet.payload(), now);
            return;
        }
        if packet.dst_id() != self.local_id {
            log::debug!("drop {protocol:?} for {} from {from}", packet.dst_id());
            return;
        }
        let src = packet.src_id();
        if src == self.local_id {
            return;
        }
        if protocol != ProtocolType::Login {
            // only a login may open a path, everything else must arrive on it
            let expected = self
                .by_peer
                .get(&src)
                .and_then(|&id| self.sessions.get(id))
                .map(|v| v.route.addr());
            match expected {
                Some(addr) if addr == from => {}
                Some(addr) => {
                    log::debug!("drop {protocol:?} from {from}, session with {src} is on {addr}");
                    return;
                }
                None => {
                    log::debug!("drop {protocol:?} from {from}, no session with {src}");
                    return;
                }
            }
        }
        let route = if relayed {
            Route::Relay(from)
        } else {
            Route::Direct(from)
        };
        match protocol {
            ProtocolType::Login => self.on_login(src, packet.payload(), route, now),
            ProtocolType::LoginAck => self.on_login_ack(src, packet.payload(), now),
            ProtocolType::LoginConfirm => self.on_login_confirm(src, now),
            ProtocolType::LoginReject => self.on_login_reject(src),
            ProtocolType::Data => self.on_data(src, packet.payload(), now),
            ProtocolType::Close => self.on_close(src),
            ProtocolType::Ping | ProtocolType::Pong => self.on_keepalive(src, protocol, now),
            _ => log::debug!("drop {protocol:?} from {from}"),
        }
    }

    fn on_probe_reply(&mut self, payload: &[u8], now: Instant) {
        let Some(checker) = self.checker.as_mut() else {
            log::debug!("probe reply without a check in progress");
            return;
        };
        match ProbeReply::decode(payload) {
            Ok(reply) => {
                if !checker.handle_reply(&reply, now) {
                    log::debug!("stale probe reply {}", reply.nonce);
                }
            }
            Err(e) => log::debug!("bad probe reply: {e}"),
        }
        self.poll_checker(now);
    }

    fn on_login(&mut self, src: u64, payload: &[u8], route: Route, now: Instant) {
        let record = match LoginRecord::decode(payload) {
            Ok(record) if record.id == src => record,
            Ok(record) => {
                log::debug!("login for {} sent by {src}", record.id);
                return;
            }
            Err(e) => {
                log::debug!("bad login from {src}: {e}");
                return;
            }
        };
        if let Some(&id) = self.by_peer.get(&src) {
            if let Some(existing) = self.sessions.get(id) {
                match (existing.direction, existing.state) {
                    (_, SessionState::Closing) => return,
                    (Direction::Outbound, SessionState::Connecting) => {
                        if self.local_id > src {
                            log::debug!("simultaneous connect with {src}, waiting for its ack");
                        } else {
                            self.accept_crossed(id, record, route, now);
                        }
                        return;
                    }
                    _ if record.cur_time == existing.remote_login_time => {
                        if existing.direction == Direction::Inbound {
                            self.send_handshake(id, ProtocolType::LoginAck, now);
                        }
                        return;
                    }
                    _ if record.cur_time < existing.remote_login_time => {
                        log::debug!("outdated login from {src}");
                        return;
                    }
                    _ => {}
                }
            }
        }
        if self.is_replay(src, record.cur_time) {
            log::debug!("replayed login from {src} at {}", record.cur_time);
            return;
        }
        let identity = match self.auth.verify(&record, self.now_secs(now), None) {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("login from {src} rejected: {e}");
                self.reject(src, route);
                return;
            }
        };
        self.remember_login(src, record.cur_time, now);
        let login = match self.login_for(src, now) {
            Ok(login) => login,
            Err(e) => {
                log::warn!("signing login for {src} failed: {e}");
                self.reject(src, route);
                return;
            }
        };
        if let Some(&old) = self.by_peer.get(&src) {
            let reason = match self.sessions.get(old) {
                Some(session) if session.exposed => DisconnectReason::DisconnectPassive,
                _ => DisconnectReason::ConnectError,
            };
            log::info!("newer login from {src} replaces session {old}");
            self.finish(old, reason);
        }
        let mut session = Session::new(
            src,
            Direction::Inbound,
            route,
            self.nat_type,
            login,
            now,
        );
        session.identity = Some(identity);
        session.remote_login_time = record.cur_time;
        session.transition(SessionState::Authenticating);
        session.start_arq(
            conversation(src, self.local_id, record.cur_time),
            self.local_id,
            self.config.arq.clone(),
        );
        let id = self.sessions.insert(session);
        self.by_peer.insert(src, id);
        self.send_handshake(id, ProtocolType::LoginAck, now);
    }

    /// Both sides connected at once and ours has the lower id: the outbound
    /// attempt becomes the accepting side of the peer's attempt.
    fn accept_crossed(&mut self, id: SessionId, record: LoginRecord, route: Route, now: Instant) {
        let src = record.id;
        if self.is_replay(src, record.cur_time) {
            log::debug!("replayed login from {src} at {}", record.cur_time);
            return;
        }
        let identity = match self.auth.verify(&record, self.now_secs(now), Some(src)) {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("crossed login from {src} rejected: {e}");
                self.reject(src, route);
                return;
            }
        };
        self.remember_login(src, record.cur_time, now);
        self.pending.remove(&PendingKey::Connect(src));
        let local_id = self.local_id;
        let arq = self.config.arq.clone();
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        log::debug!("simultaneous connect with {src}, accepting its attempt");
        session.direction = Direction::Inbound;
        session.route = route;
        session.identity = Some(identity);
        session.remote_login_time = record.cur_time;
        session.started = now;
        session.transition(SessionState::Authenticating);
        session.start_arq(conversation(src, local_id, record.cur_time), local_id, arq);
        self.send_handshake(id, ProtocolType::LoginAck, now);
    }

    fn on_login_ack(&mut self, src: u64, payload: &[u8], now: Instant) {
        let Some(&id) = self.by_peer.get(&src) else {
            return;
        };
        let record = match LoginRecord::decode(payload) {
            Ok(record) if record.id == src => record,
            _ => {
                log::debug!("bad login ack from {src}");
                return;
            }
        };
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        match (session.direction, session.state) {
            (Direction::Outbound, SessionState::Connecting) => {}
            (Direction::Outbound, SessionState::Connected)
                if record.cur_time == session.remote_login_time =>
            {
                self.send_control(id, ProtocolType::LoginConfirm);
                return;
            }
            _ => return,
        }
        session.transition(SessionState::Authenticating);
        let verified = if self.is_replay(src, record.cur_time) {
            Err("replayed".to_string())
        } else {
            self.auth
                .verify(&record, self.now_secs(now), Some(src))
                .map_err(|e| e.to_string())
        };
        let identity = match verified {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("login ack from {src} rejected: {e}");
                self.finish(id, DisconnectReason::ConnectError);
                return;
            }
        };
        self.remember_login(src, record.cur_time, now);
        self.pending.remove(&PendingKey::Connect(src));
        let local_id = self.local_id;
        let arq = self.config.arq.clone();
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.identity = Some(identity);
        session.remote_login_time = record.cur_time;
        session.last_recv = now;
        session.start_arq(
            conversation(local_id, src, session.local_login.cur_time),
            local_id,
            arq,
        );
        session.transition(SessionState::Connected);
        session.exposed = true;
        log::info!(
            "session {id} connected to {src} via {:?} (local nat {})",
            session.route,
            session.nat_type
        );
        self.plane.publish(id, session.arq.clone());
        emit(
            &self.events,
            Event::Connected {
                session: id,
                peer_id: src,
                nat_type: session.nat_type,
            },
        );
        self.send_control(id, ProtocolType::LoginConfirm);
    }

    fn on_login_confirm(&mut self, src: u64, now: Instant) {
        if let Some(&id) = self.by_peer.get(&src) {
            self.establish_inbound(id, now);
        }
    }

    fn establish_inbound(&mut self, id: SessionId, now: Instant) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.direction != Direction::Inbound || session.state != SessionState::Authenticating {
            return;
        }
        session.transition(SessionState::Connected);
        session.exposed = true;
        session.last_recv = now;
        log::info!(
            "session {id} accepted from {} via {:?} (local nat {})",
            session.peer_id,
            session.route,
            session.nat_type
        );
        self.plane.publish(id, session.arq.clone());
        emit(
            &self.events,
            Event::Accepted {
                session: id,
                peer_id: session.peer_id,
                addr: session.route.addr(),
                nat_type: session.nat_type,
            },
        );
    }

    fn on_login_reject(&mut self, src: u64) {
        let Some(&id) = self.by_peer.get(&src) else {
            return;
        };
        if matches!(
            self.sessions.get(id).map(|v| (v.direction, v.state)),
            Some((Direction::Outbound, SessionState::Connecting))
        ) {
            log::warn!("login rejected by {src}");
            self.finish(id, DisconnectReason::ConnectError);
        }
    }

    fn on_data(&mut self, src: u64, payload: &[u8], now: Instant) {
        let Some(&id) = self.by_peer.get(&src) else {
            log::debug!("data from {src} without a session");
            return;
        };
        // data implies the confirm was sent
        self.establish_inbound(id, now);
        let ms = self.millis(now);
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.state != SessionState::Connected {
            return;
        }
        session.last_recv = now;
        let mut guard = session.arq.lock();
        let Some(arq) = guard.as_mut() else {
            return;
        };
        if let Err(e) = arq.input(payload, ms) {
            log::debug!("session {id} bad segment: {e}");
        }
        while let Some(data) = arq.recv() {
            emit(
                &self.events,
                Event::Recved {
                    session: id,
                    peer_id: src,
                    data: data.freeze(),
                },
            );
        }
        if arq.take_resumed() {
            emit(&self.events, Event::SendWaited { session: id, peer_id: src });
        }
    }

    fn on_close(&mut self, src: u64) {
        let Some(&id) = self.by_peer.get(&src) else {
            return;
        };
        let reason = match self.sessions.get(id).map(|v| v.state) {
            Some(SessionState::Connected) => DisconnectReason::DisconnectPassive,
            Some(SessionState::Closing) => DisconnectReason::DisconnectActive,
            Some(_) => DisconnectReason::ConnectError,
            None => return,
        };
        self.finish(id, reason);
    }

    fn on_keepalive(&mut self, src: u64, protocol: ProtocolType, now: Instant) {
        let Some(&id) = self.by_peer.get(&src) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.state != SessionState::Connected {
            return;
        }
        session.last_recv = now;
        if protocol == ProtocolType::Ping {
            session.last_send = now;
            self.send_control(id, ProtocolType::Pong);
        }
    }

    /// Advances every timer: login resends, connect and idle timeouts,
    /// keepalives, ARQ retransmissions and the NAT check.
    pub fn tick(&mut self, now: Instant) {
        let ms = self.millis(now);
        for id in self.sessions.ids() {
            if let Some(reason) = self.tick_session(id, now, ms) {
                self.finish(id, reason);
            }
        }
        self.poll_checker(now);
        for (key, _) in self.pending.purge(now) {
            log::debug!("pending {key:?} expired");
        }
        let now_secs = self.now_secs(now);
        let window = self.config.freshness_window.as_secs();
        self.replay.retain(|_, (_, until)| *until > now);
        self.sent_logins.retain(|_, t| *t + window >= now_secs);
    }

    fn tick_session(&mut self, id: SessionId, now: Instant, ms: u32) -> Option<DisconnectReason> {
        let config = &self.config;
        let session = self.sessions.get_mut(id)?;
        match session.state {
            SessionState::Init | SessionState::Closed => None,
            SessionState::Closing => Some(session.closing.unwrap_or(DisconnectReason::DisconnectActive)),
            SessionState::Connecting | SessionState::Authenticating => {
                if now.saturating_duration_since(session.started) >= config.connect_timeout {
                    log::debug!("session {id} with {} timed out", session.peer_id);
                    return Some(DisconnectReason::ConnectTimeout);
                }
                let due = session
                    .last_login_sent
                    .map_or(true, |at| now.saturating_duration_since(at) >= config.login_resend_interval);
                // the acceptor repeats its ack until the confirm arrives
                let protocol = match session.direction {
                    Direction::Outbound => ProtocolType::Login,
                    Direction::Inbound => ProtocolType::LoginAck,
                };
                if due {
                    self.send_handshake(id, protocol, now);
                }
                None
            }
            SessionState::Connected => {
                if now.saturating_duration_since(session.last_recv) >= config.idle_timeout {
                    log::info!("session {id} with {} idle", session.peer_id);
                    return Some(DisconnectReason::DisconnectTimeout);
                }
                let peer_id = session.peer_id;
                let heartbeat = config.heartbeat_interval;
                let route = session.route;
                let shared = session.arq.clone();
                let mut guard = shared.lock();
                let arq = guard.as_mut()?;
                if let Err(e) = arq.update(ms) {
                    log::debug!("session {id} flush failed: {e}");
                }
                if arq.is_dead() {
                    log::info!("session {id} with {peer_id} exhausted its retransmissions");
                    return Some(DisconnectReason::DisconnectTimeout);
                }
                while let Some(data) = arq.recv() {
                    emit(
                        &self.events,
                        Event::Recved {
                            session: id,
                            peer_id,
                            data: data.freeze(),
                        },
                    );
                }
                if arq.take_resumed() {
                    emit(&self.events, Event::SendWaited { session: id, peer_id });
                }
                let mut sent = false;
                for data in arq.output_mut().drain() {
                    sent = true;
                    self.transmits.push(Transmit {
                        to: route.addr(),
                        data,
                    });
                }
                if sent {
                    session.last_send = now;
                } else if now.saturating_duration_since(session.last_send) >= heartbeat {
                    session.last_send = now;
                    self.transmits.push(Transmit {
                        to: route.addr(),
                        data: route.frame(ProtocolType::Ping, self.local_id, peer_id, &[]),
                    });
                }
                None
            }
        }
    }

    fn poll_checker(&mut self, now: Instant) {
        let Some(checker) = self.checker.as_mut() else {
            return;
        };
        if !checker.is_done(now) {
            for (to, data) in checker.poll_transmit(self.local_id, now) {
                self.transmits.push(Transmit { to, data });
            }
            return;
        }
        let Some(checker) = self.checker.take() else {
            return;
        };
        let proxy = checker.proxy();
        let result = checker.finish();
        self.checks.insert(proxy, result, now);
        if let Some(local) = self.listening {
            self.report_check(local, result);
        }
    }

    fn report_check(&mut self, local: SocketAddr, result: CheckResult) {
        self.nat_type = result.nat_type;
        if result.nat_type.prefers_relay() {
            log::warn!(
                "nat type {}, peers will likely need the relay",
                result.nat_type
            );
        } else {
            log::info!("nat type {} napt {:?}", result.nat_type, result.napt);
        }
        emit(
            &self.events,
            Event::Listened {
                addr: local,
                latency: result.latency,
            },
        );
        emit(
            &self.events,
            Event::Checked {
                nat_type: result.nat_type,
                host: result.host,
                napt: result.napt,
            },
        );
    }

    /// Removes a session for good and reports its single `disconnected` event.
    fn finish(&mut self, id: SessionId, reason: DisconnectReason) {
        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };
        session.transition(SessionState::Closed);
        self.plane.withdraw(id);
        if self.by_peer.get(&session.peer_id) == Some(&id) {
            self.by_peer.remove(&session.peer_id);
            self.pending.remove(&PendingKey::Connect(session.peer_id));
        }
        log::info!("session {id} with {} closed: {reason}", session.peer_id);
        emit(
            &self.events,
            Event::Disconnected {
                peer_id: session.peer_id,
                session: session.exposed.then_some(id),
                reason,
            },
        );
    }

    fn reject(&mut self, peer_id: u64, route: Route) {
        self.transmits.push(Transmit {
            to: route.addr(),
            data: route.frame(ProtocolType::LoginReject, self.local_id, peer_id, &[]),
        });
        emit(
            &self.events,
            Event::Disconnected {
                peer_id,
                session: None,
                reason: DisconnectReason::ConnectError,
            },
        );
    }

    /// Sends `Login` or `LoginAck` and restarts the resend timer.
    fn send_handshake(&mut self, id: SessionId, protocol: ProtocolType, now: Instant) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.last_login_sent = Some(now);
        self.send_control(id, protocol);
    }

    /// Sends a handshake or keepalive datagram on the session's route. Login
    /// and LoginAck carry the local login record.
    fn send_control(&mut self, id: SessionId, protocol: ProtocolType) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let data = match protocol {
            ProtocolType::Login | ProtocolType::LoginAck => {
                let login = session.local_login.to_bytes();
                session
                    .route
                    .frame(protocol, self.local_id, session.peer_id, &login)
            }
            _ => session
                .route
                .frame(protocol, self.local_id, session.peer_id, &[]),
        };
        self.transmits.push(Transmit {
            to: session.route.addr(),
            data,
        });
    }

    /// Signs a login towards `peer_id`, stamped strictly after the previous one.
    fn login_for(&mut self, peer_id: u64, now: Instant) -> io::Result<LoginRecord> {
        let mut cur_time = self.now_secs(now);
        if let Some(&last) = self.sent_logins.get(&peer_id) {
            cur_time = cur_time.max(last + 1);
        }
        let login = self.auth.local_login(cur_time)?;
        self.sent_logins.insert(peer_id, cur_time);
        Ok(login)
    }

    fn is_replay(&self, peer_id: u64, cur_time: u64) -> bool {
        self.replay
            .get(&peer_id)
            .is_some_and(|(highest, _)| cur_time <= *highest)
    }

    fn remember_login(&mut self, peer_id: u64, cur_time: u64, now: Instant) {
        let until = now + self.config.freshness_window * 2;
        self.replay.insert(peer_id, (cur_time, until));
    }

    fn now_secs(&self, now: Instant) -> u64 {
        self.unix_base + now.saturating_duration_since(self.epoch).as_secs()
    }

    fn millis(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_millis() as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::fake;
    use crate::protocol::probe::ProbeRequest;
    use crate::protocol::HEAD_LEN;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;
    use zvnet_reliable::ArqConfig;

    const UNIX: u64 = 1_700_000_000;

    struct Node {
        id: u64,
        addr: SocketAddr,
        mgr: SessionManager,
        events: flume::Receiver<Event>,
        seen: Vec<Event>,
    }

    impl Node {
        fn new(id: u64, port: u16, config: EngineConfig, now: Instant, unix: u64) -> Self {
            let (tx, rx) = flume::unbounded();
            let auth = fake::authenticator(id);
            let mut mgr = SessionManager::new(config, auth, tx, now, unix);
            let addr: SocketAddr = format!("10.0.0.{id}:{port}").parse().unwrap();
            mgr.listen(addr, None, now).unwrap();
            let mut node = Self {
                id,
                addr,
                mgr,
                events: rx,
                seen: Vec::new(),
            };
            node.drain();
            node.seen.clear();
            node
        }
        fn drain(&mut self) {
            self.seen.extend(self.events.try_iter());
        }
        fn sessions(&self) -> Vec<SessionId> {
            self.seen
                .iter()
                .filter_map(|v| match v {
                    Event::Connected { session, .. } | Event::Accepted { session, .. } => {
                        Some(*session)
                    }
                    _ => None,
                })
                .collect()
        }
        fn disconnects(&self) -> Vec<(u64, Option<SessionId>, DisconnectReason)> {
            self.seen
                .iter()
                .filter_map(|v| match v {
                    Event::Disconnected {
                        peer_id,
                        session,
                        reason,
                    } => Some((*peer_id, *session, *reason)),
                    _ => None,
                })
                .collect()
        }
        fn received(&self) -> Vec<u8> {
            let mut out = Vec::new();
            for event in &self.seen {
                if let Event::Recved { data, .. } = event {
                    out.extend_from_slice(data);
                }
            }
            out
        }
        fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
            self.seen.iter().filter(|v| f(v)).count()
        }
    }

    struct Net {
        nodes: Vec<Node>,
        relay: Option<SocketAddr>,
        now: Instant,
        loss: f64,
        rng: StdRng,
        // the next direct datagram of this kind is lost
        drop_once: Option<ProtocolType>,
        // datagrams seen on the wire: (from, to, bytes)
        wire: Vec<(SocketAddr, SocketAddr, BytesMut)>,
    }

    impl Net {
        fn new(nodes: Vec<Node>, now: Instant) -> Self {
            Self {
                nodes,
                relay: None,
                now,
                loss: 0.0,
                rng: StdRng::seed_from_u64(7),
                drop_once: None,
                wire: Vec::new(),
            }
        }
        fn node(&mut self, id: u64) -> &mut Node {
            self.nodes.iter_mut().find(|v| v.id == id).unwrap()
        }
        fn flush(&mut self) {
            let mut queue = Vec::new();
            for node in &mut self.nodes {
                for t in node.mgr.take_transmits() {
                    queue.push((node.addr, t.to, t.data));
                }
            }
            let now = self.now;
            for (from, to, data) in queue {
                self.wire.push((from, to, data.clone()));
                if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
                    continue;
                }
                if let Some(protocol) = self.drop_once {
                    if NetPacket::new(&data[..]).is_ok_and(|v| v.protocol() == protocol) {
                        self.drop_once = None;
                        continue;
                    }
                }
                let (from, to) = if Some(to) == self.relay {
                    let Ok(packet) = NetPacket::new(&data[..]) else {
                        continue;
                    };
                    let dst = packet.dst_id();
                    match self.nodes.iter().find(|v| v.id == dst) {
                        Some(target) => (to, target.addr),
                        None => continue,
                    }
                } else {
                    (from, to)
                };
                if let Some(node) = self.nodes.iter_mut().find(|v| v.addr == to) {
                    node.mgr.handle_datagram(from, &data, now);
                }
            }
            for node in &mut self.nodes {
                node.drain();
            }
        }
        fn step(&mut self) {
            self.now += Duration::from_millis(10);
            for node in &mut self.nodes {
                node.mgr.tick(self.now);
            }
            self.flush();
        }
        fn run(&mut self, duration: Duration) {
            let end = self.now + duration;
            while self.now < end {
                self.step();
            }
        }
        fn run_until(&mut self, limit: Duration, mut f: impl FnMut(&Net) -> bool) -> bool {
            let end = self.now + limit;
            while self.now < end {
                if f(self) {
                    return true;
                }
                self.step();
            }
            f(self)
        }
    }

    fn pair(config: EngineConfig) -> Net {
        let now = Instant::now();
        Net::new(
            vec![
                Node::new(1, 4001, config.clone(), now, UNIX),
                Node::new(2, 4002, config, now, UNIX),
            ],
            now,
        )
    }

    fn connected(config: EngineConfig) -> (Net, SessionId, SessionId) {
        let mut net = pair(config);
        let (b_addr, now) = (net.nodes[1].addr, net.now);
        net.node(1).mgr.connect(2, b_addr, now).unwrap();
        net.flush();
        assert!(net.run_until(Duration::from_secs(1), |net| {
            net.nodes[0].sessions().len() == 1 && net.nodes[1].sessions().len() == 1
        }));
        let a = net.nodes[0].sessions()[0];
        let b = net.nodes[1].sessions()[0];
        (net, a, b)
    }

    #[test]
    fn connect_and_exchange() {
        let (mut net, a, b) = connected(EngineConfig::default());
        let a_addr = net.nodes[0].addr;
        assert!(matches!(
            net.nodes[0].seen[0],
            Event::Connected {
                peer_id: 2,
                nat_type: NatType::Unknown,
                ..
            }
        ));
        assert!(matches!(
            net.nodes[1].seen[0],
            Event::Accepted { peer_id: 1, addr, .. } if addr == a_addr
        ));
        assert_eq!(net.nodes[0].mgr.cache_size(), 0);
        assert_eq!(net.nodes[1].mgr.peer_of(b), Some(1));
        assert_eq!(
            net.nodes[1].mgr.peer_identity(b).unwrap().public_key,
            fake::key_of(1)
        );

        net.node(1).mgr.send(a, b"hello ").unwrap();
        net.node(1).mgr.send(a, b"world").unwrap();
        net.run(Duration::from_millis(100));
        assert_eq!(net.nodes[1].received(), b"hello world");
        let telemetry = net.nodes[0].mgr.telemetry(a).unwrap();
        assert_eq!(telemetry.snd_nxt, 1);
        assert_eq!(telemetry.nsnd_buf, 0);
        assert_eq!(net.nodes[1].mgr.telemetry(b).unwrap().rcv_nxt, 1);
        assert!(net.nodes[0].disconnects().is_empty());
    }

    #[test]
    fn duplicate_connect_is_noop() {
        let mut net = pair(EngineConfig::default());
        let (b_addr, now) = (net.nodes[1].addr, net.now);
        let a = net.node(1);
        a.mgr.connect(2, b_addr, now).unwrap();
        a.mgr.connect(2, b_addr, now).unwrap();
        assert_eq!(a.mgr.take_transmits().len(), 1);
        assert_eq!(a.mgr.session_count(), 1);
        assert_eq!(a.mgr.cache_size(), 1);
        assert!(matches!(
            a.mgr.connect(1, b_addr, now),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            a.mgr.listen(a.addr, None, now),
            Err(Error::AlreadyListening)
        ));
        a.mgr.close();
        assert!(matches!(a.mgr.connect(2, b_addr, now), Err(Error::NotListening)));
        a.drain();
        assert_eq!(
            a.disconnects(),
            vec![(2, None, DisconnectReason::DisconnectActive)]
        );
    }

    #[test]
    fn simultaneous_connect_collapses() {
        let mut net = pair(EngineConfig::default());
        let (a_addr, b_addr, now) = (net.nodes[0].addr, net.nodes[1].addr, net.now);
        net.node(1).mgr.connect(2, b_addr, now).unwrap();
        net.node(2).mgr.connect(1, a_addr, now).unwrap();
        net.flush();
        net.run(Duration::from_secs(2));
        // lower id accepts, higher id connects
        assert_eq!(net.nodes[0].sessions().len(), 1);
        assert_eq!(net.nodes[1].sessions().len(), 1);
        assert!(matches!(net.nodes[0].seen[0], Event::Accepted { peer_id: 2, .. }));
        assert!(matches!(net.nodes[1].seen[0], Event::Connected { peer_id: 1, .. }));
        assert_eq!(net.nodes[0].mgr.session_count(), 1);
        assert_eq!(net.nodes[1].mgr.session_count(), 1);
        assert!(net.nodes[0].disconnects().is_empty());
        assert!(net.nodes[1].disconnects().is_empty());

        let (a, b) = (net.nodes[0].sessions()[0], net.nodes[1].sessions()[0]);
        net.node(2).mgr.send(b, b"ping").unwrap();
        net.node(1).mgr.send(a, b"pong").unwrap();
        net.run(Duration::from_millis(100));
        assert_eq!(net.nodes[0].received(), b"ping");
        assert_eq!(net.nodes[1].received(), b"pong");
    }

    #[test]
    fn stale_login_rejected_without_handles() {
        let now = Instant::now();
        let config = EngineConfig::default();
        let mut net = Net::new(
            vec![
                Node::new(1, 4001, config.clone(), now, UNIX - 1000),
                Node::new(2, 4002, config, now, UNIX),
            ],
            now,
        );
        let b_addr = net.nodes[1].addr;
        net.node(1).mgr.connect(2, b_addr, now).unwrap();
        net.flush();
        net.run(Duration::from_secs(4));
        assert!(net.nodes[0].sessions().is_empty());
        assert!(net.nodes[1].sessions().is_empty());
        assert_eq!(
            net.nodes[1].disconnects(),
            vec![(1, None, DisconnectReason::ConnectError)]
        );
        assert_eq!(
            net.nodes[0].disconnects(),
            vec![(2, None, DisconnectReason::ConnectError)]
        );
        assert_eq!(net.nodes[0].mgr.session_count(), 0);
        assert_eq!(net.nodes[1].mgr.session_count(), 0);
    }

    #[test]
    fn lossy_link_delivers_exact_stream() {
        let config =
            EngineConfig::default().set_arq_config(ArqConfig::default().set_mtu(600));
        let (mut net, a, _) = connected(config);
        net.loss = 0.1;
        let mut rng = StdRng::seed_from_u64(42);
        let payload: Vec<u8> = (0..10_000).map(|_| rng.gen()).collect();
        for chunk in payload.chunks(1000) {
            net.node(1).mgr.send(a, chunk).unwrap();
        }
        assert!(net.run_until(Duration::from_secs(60), |net| {
            net.nodes[1].received().len() >= payload.len()
        }));
        assert_eq!(net.nodes[1].received(), payload);
        assert!(net.nodes[0].disconnects().is_empty());
        assert!(net.nodes[1].disconnects().is_empty());
    }

    #[test]
    fn shutdown_reports_once_and_is_terminal() {
        let (mut net, a, b) = connected(EngineConfig::default());
        net.node(1).mgr.send(a, b"late").unwrap();
        net.step();
        let captured: Vec<BytesMut> = net
            .wire
            .iter()
            .filter(|(_, to, data)| {
                *to == net.nodes[0].addr && NetPacket::new(&data[..]).unwrap().protocol() != ProtocolType::Login
            })
            .map(|(_, _, data)| data.clone())
            .collect();

        net.node(1).mgr.shutdown(a);
        net.node(1).mgr.shutdown(a);
        assert_eq!(net.nodes[0].mgr.state(a), Some(SessionState::Closing));
        assert!(matches!(net.node(1).mgr.send(a, b"x"), Err(Error::SessionClosed)));
        net.run(Duration::from_millis(200));
        net.node(1).mgr.shutdown(a);
        net.run(Duration::from_millis(200));

        assert_eq!(
            net.nodes[0].disconnects(),
            vec![(2, Some(a), DisconnectReason::DisconnectActive)]
        );
        assert_eq!(
            net.nodes[1].disconnects(),
            vec![(1, Some(b), DisconnectReason::DisconnectPassive)]
        );
        assert_eq!(net.nodes[0].mgr.state(a), None);
        assert!(matches!(net.node(1).mgr.send(a, b"x"), Err(Error::UnknownSession)));

        // late datagrams of the old session change nothing
        let (b_addr, now) = (net.nodes[1].addr, net.now);
        let before = net.nodes[0].seen.len();
        for data in captured {
            net.node(1).mgr.handle_datagram(b_addr, &data, now);
        }
        net.node(1).drain();
        assert_eq!(net.nodes[0].seen.len(), before);
        assert_eq!(net.nodes[0].mgr.session_count(), 0);
    }

    #[test]
    fn connect_timeout() {
        let mut net = pair(EngineConfig::default());
        let now = net.now;
        net.node(1)
            .mgr
            .connect(9, "10.9.9.9:1".parse().unwrap(), now)
            .unwrap();
        net.run(Duration::from_secs(4));
        let logins = net
            .wire
            .iter()
            .filter(|(_, to, _)| to.port() == 1)
            .count();
        assert!(logins >= 5, "{logins}");
        assert_eq!(
            net.nodes[0].disconnects(),
            vec![(9, None, DisconnectReason::ConnectTimeout)]
        );
        assert_eq!(net.nodes[0].mgr.cache_size(), 0);
    }

    #[test]
    fn silence_times_out() {
        let config = EngineConfig::default()
            .set_heartbeat_interval(Duration::from_millis(200))
            .set_idle_timeout(Duration::from_secs(1));
        let (mut net, a, b) = connected(config);
        net.run(Duration::from_secs(3));
        assert!(net.nodes[0].disconnects().is_empty(), "keepalive holds the session");
        net.loss = 1.0;
        net.run(Duration::from_secs(2));
        assert_eq!(
            net.nodes[0].disconnects(),
            vec![(2, Some(a), DisconnectReason::DisconnectTimeout)]
        );
        assert_eq!(
            net.nodes[1].disconnects(),
            vec![(1, Some(b), DisconnectReason::DisconnectTimeout)]
        );
    }

    #[test]
    fn send_waited_fires_once_per_drain() {
        let arq = ArqConfig::default().set_mtu(HEAD_LEN + 64).set_send_buffer_cap(8);
        let (mut net, a, _) = connected(EngineConfig::default().set_arq_config(arq));
        let mut queued = 0;
        loop {
            match net.node(1).mgr.send(a, &[7u8; 16]) {
                Ok(()) => queued += 16,
                Err(Error::SendBufferFull) => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert!(queued > 0);
        net.run(Duration::from_secs(2));
        assert_eq!(net.nodes[1].received().len(), queued);
        assert_eq!(
            net.nodes[0].count(|v| matches!(v, Event::SendWaited { .. })),
            1
        );
    }

    #[test]
    fn newer_login_replaces_and_replay_is_ignored() {
        let (mut net, _, b) = connected(EngineConfig::default());
        let login = net
            .wire
            .iter()
            .find(|(_, _, data)| NetPacket::new(&data[..]).unwrap().protocol() == ProtocolType::Login)
            .map(|(_, _, data)| data.clone())
            .unwrap();

        // node 1 restarts with a clock a few seconds later
        let now = net.now;
        let restarted = Node::new(1, 4001, EngineConfig::default(), now, UNIX + 5);
        net.nodes[0] = restarted;
        let b_addr = net.nodes[1].addr;
        net.node(1).mgr.connect(2, b_addr, now).unwrap();
        net.flush();
        net.run(Duration::from_millis(200));
        assert_eq!(
            net.nodes[1].disconnects(),
            vec![(1, Some(b), DisconnectReason::DisconnectPassive)]
        );
        let sessions = net.nodes[1].sessions();
        assert_eq!(sessions.len(), 2);
        assert_ne!(sessions[1], b);
        assert!(matches!(net.nodes[0].seen[..], [Event::Connected { peer_id: 2, .. }]));

        // the captured first login is now a replay
        let (a_addr, now) = (net.nodes[0].addr, net.now);
        let before = net.nodes[1].seen.len();
        net.node(2).mgr.handle_datagram(a_addr, &login, now);
        assert!(net.node(2).mgr.take_transmits().is_empty());
        net.node(2).drain();
        assert_eq!(net.nodes[1].seen.len(), before);
        assert_eq!(net.nodes[1].mgr.session_count(), 1);
    }

    #[test]
    fn relayed_session() {
        let now = Instant::now();
        let proxy: SocketAddr = "10.0.0.100:3478".parse().unwrap();
        let mut a = Node::new(1, 4001, EngineConfig::default(), now, UNIX);
        let mut b = Node::new(2, 4002, EngineConfig::default(), now, UNIX);
        a.mgr.set_proxy(Some(proxy));
        b.mgr.set_proxy(Some(proxy));
        let mut net = Net::new(vec![a, b], now);
        net.relay = Some(proxy);
        net.node(1).mgr.connect(2, proxy, now).unwrap();
        net.flush();
        assert!(net.run_until(Duration::from_secs(1), |net| {
            net.nodes[1].sessions().len() == 1 && net.nodes[0].sessions().len() == 1
        }));
        let a = net.nodes[0].sessions()[0];
        net.node(1).mgr.send(a, b"via relay").unwrap();
        net.run(Duration::from_millis(100));
        assert_eq!(net.nodes[1].received(), b"via relay");
        let (a_addr, b_addr) = (net.nodes[0].addr, net.nodes[1].addr);
        for (from, to, data) in &net.wire {
            if *from == a_addr || *from == b_addr {
                assert_eq!(*to, proxy);
                let packet = NetPacket::new(&data[..]).unwrap();
                assert_eq!(packet.protocol(), ProtocolType::Relay);
            }
        }
    }

    #[test]
    fn listen_checks_nat_once_and_caches() {
        let now = Instant::now();
        let proxy: SocketAddr = "1.1.1.1:3478".parse().unwrap();
        let (tx, rx) = flume::unbounded();
        let mut mgr =
            SessionManager::new(EngineConfig::default(), fake::authenticator(1), tx, now, UNIX);
        mgr.set_proxy(Some(proxy));
        let local: SocketAddr = "0.0.0.0:4001".parse().unwrap();
        mgr.listen(local, None, now).unwrap();
        assert_eq!(mgr.cache_size(), 1);

        let mut answered = 0;
        let mut at = now;
        while mgr.is_listening() && answered < 2 {
            at += Duration::from_millis(20);
            for t in mgr.take_transmits() {
                let packet = NetPacket::new(&t.data[..]).unwrap();
                let nonce = ProbeRequest::decode(packet.payload()).unwrap().nonce;
                let reply = ProbeReply {
                    nonce,
                    mapped: "9.9.9.9:40000".parse().unwrap(),
                    alt_ip: None,
                    alt_port: if t.to == proxy { 3479 } else { 0 },
                };
                let mut body = Vec::new();
                reply.encode(&mut body);
                let reply = NetPacket::build(ProtocolType::ProbeReply, 0, 1, &body).into_buffer();
                mgr.handle_datagram(t.to, &reply, at);
                answered += 1;
            }
            mgr.tick(at);
        }
        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            Event::Listened {
                addr,
                latency: Some(_)
            } if addr == local
        ));
        assert_eq!(
            events[1],
            Event::Checked {
                nat_type: NatType::Full,
                host: None,
                napt: Some("9.9.9.9:40000".parse().unwrap()),
            }
        );
        assert_eq!(mgr.nat_type(), NatType::Full);
        assert_eq!(mgr.cache_size(), 0);

        // a second cycle within the cache ttl does not probe again
        mgr.close();
        mgr.listen(local, None, at).unwrap();
        assert!(mgr.take_transmits().is_empty());
        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Event::Checked { nat_type: NatType::Full, .. }));
    }

    #[test]
    fn lost_confirm_is_recovered() {
        let config = EngineConfig::default()
            .set_heartbeat_interval(Duration::from_secs(10))
            .set_idle_timeout(Duration::from_secs(30));
        let mut net = pair(config);
        net.drop_once = Some(ProtocolType::LoginConfirm);
        let (b_addr, now) = (net.nodes[1].addr, net.now);
        net.node(1).mgr.connect(2, b_addr, now).unwrap();
        net.flush();
        net.run(Duration::from_secs(5));
        assert!(net.drop_once.is_none());
        let acks = net
            .wire
            .iter()
            .filter(|(_, _, data)| NetPacket::new(&data[..]).unwrap().protocol() == ProtocolType::LoginAck)
            .count();
        assert!(acks >= 2, "{acks}");
        assert_eq!(net.nodes[0].sessions().len(), 1);
        assert_eq!(net.nodes[1].sessions().len(), 1);
        assert!(matches!(net.nodes[1].seen[0], Event::Accepted { peer_id: 1, .. }));
        assert!(net.nodes[0].disconnects().is_empty());
        assert!(net.nodes[1].disconnects().is_empty());
        assert_eq!(net.nodes[1].mgr.session_count(), 1);

        let (a, b) = (net.nodes[0].sessions()[0], net.nodes[1].sessions()[0]);
        net.node(1).mgr.send(a, b"after recovery").unwrap();
        net.run(Duration::from_millis(100));
        assert_eq!(net.nodes[1].received(), b"after recovery");
        assert_eq!(net.nodes[1].mgr.state(b), Some(SessionState::Connected));
    }

    #[test]
    fn control_from_foreign_address_is_ignored() {
        let (mut net, _, b) = connected(EngineConfig::default());
        let forger: SocketAddr = "66.6.6.6:999".parse().unwrap();
        let close = NetPacket::build(ProtocolType::Close, 1, 2, &[]).into_buffer();
        let now = net.now;
        net.node(2).mgr.handle_datagram(forger, &close, now);
        net.run(Duration::from_millis(100));
        assert!(net.nodes[1].disconnects().is_empty());
        assert_eq!(net.nodes[1].mgr.state(b), Some(SessionState::Connected));

        let now = net.now;
        net.node(1)
            .mgr
            .connect(9, "10.9.9.9:1".parse().unwrap(), now)
            .unwrap();
        let reject = NetPacket::build(ProtocolType::LoginReject, 9, 1, &[]).into_buffer();
        net.node(1).mgr.handle_datagram(forger, &reject, now);
        net.node(1).drain();
        assert!(net.nodes[0].disconnects().is_empty());
        assert_eq!(net.nodes[0].mgr.session_count(), 2);

        // the same close from the peer's own address is honoured
        let (a_addr, now) = (net.nodes[0].addr, net.now);
        net.node(2).mgr.handle_datagram(a_addr, &close, now);
        net.node(2).drain();
        assert_eq!(
            net.nodes[1].disconnects(),
            vec![(1, Some(b), DisconnectReason::DisconnectPassive)]
        );
    }

    #[test]
    fn relay_preferring_nat_connects_through_proxy() {
        let now = Instant::now();
        let proxy: SocketAddr = "10.0.0.100:3478".parse().unwrap();
        let mut a = Node::new(1, 4001, EngineConfig::default(), now, UNIX);
        let mut b = Node::new(2, 4002, EngineConfig::default(), now, UNIX);
        a.mgr.set_proxy(Some(proxy));
        b.mgr.set_proxy(Some(proxy));
        a.mgr.nat_type = NatType::Symmetric;
        let (a_addr, b_addr) = (a.addr, b.addr);
        let mut net = Net::new(vec![a, b], now);
        net.relay = Some(proxy);
        net.node(1).mgr.connect(2, b_addr, now).unwrap();
        net.flush();
        assert!(net.run_until(Duration::from_secs(1), |net| {
            net.nodes[1].sessions().len() == 1 && net.nodes[0].sessions().len() == 1
        }));
        assert!(matches!(
            net.nodes[0].seen[0],
            Event::Connected {
                nat_type: NatType::Symmetric,
                ..
            }
        ));
        assert!(matches!(
            net.nodes[1].seen[0],
            Event::Accepted { addr, .. } if addr == proxy
        ));
        assert!(net
            .wire
            .iter()
            .filter(|(from, _, _)| *from == a_addr)
            .all(|(_, to, _)| *to == proxy));
    }

    #[test]
    fn sessions_send_independently() {
        let now = Instant::now();
        let config = EngineConfig::default();
        let mut net = Net::new(
            vec![
                Node::new(1, 4001, config.clone(), now, UNIX),
                Node::new(2, 4002, config.clone(), now, UNIX),
                Node::new(3, 4003, config, now, UNIX),
            ],
            now,
        );
        let (b_addr, c_addr) = (net.nodes[1].addr, net.nodes[2].addr);
        net.node(1).mgr.connect(2, b_addr, now).unwrap();
        net.node(1).mgr.connect(3, c_addr, now).unwrap();
        net.flush();
        assert!(net.run_until(Duration::from_secs(1), |net| net.nodes[0].sessions().len() == 2));
        let plane = net.nodes[0].mgr.data_plane();
        assert_eq!(plane.len(), 2);
        let sessions = net.nodes[0].sessions();
        let peer_of = |peer| {
            *sessions
                .iter()
                .find(|v| net.nodes[0].mgr.peer_of(**v) == Some(peer))
                .unwrap()
        };
        let (to_b, to_c) = (peer_of(2), peer_of(3));

        // session to_b is busy flushing while to_c is written from another thread
        let busy = plane.arq(to_b).unwrap();
        let guard = busy.lock();
        std::thread::scope(|s| {
            s.spawn(|| plane.send(to_c, b"independent"))
                .join()
                .unwrap()
                .unwrap();
        });
        drop(guard);
        net.run(Duration::from_millis(100));
        assert!(net.nodes[1].received().is_empty());
        assert_eq!(net.nodes[2].received(), b"independent");
        assert_eq!(plane.telemetry(to_c).unwrap().snd_nxt, 1);

        net.node(1).mgr.shutdown(to_c);
        net.run(Duration::from_millis(50));
        assert_eq!(plane.len(), 1);
        assert!(matches!(plane.send(to_c, b"x"), Err(Error::UnknownSession)));
    }
}
