//! # zvnet - Authenticated peer-to-peer sessions over UDP
//!
//! `zvnet` establishes sessions between nodes identified by a `u64` id. A
//! session is only handed to the application after both ends proved their
//! identity with a signed, timestamped login record; from then on it carries an
//! ordered, reliable byte stream over a KCP-style ARQ.
//!
//! ## Architecture
//!
//! ```text
//!  Engine (tokio) ── lock ──▶ SessionManager (sans-IO) ──▶ Arq per session
//!     │   │                      │                      (own lock, zvnet-reliable)
//!     │   └── send ──▶ DataPlane ┼────────────────────────────▲
//!  UdpSocket                     │ events (flume)
//!     │                          ▼
//!     └── driver task        Dispatcher task ──▶ your Callback
//! ```
//!
//! - [`session::SessionManager`] owns every session and performs no I/O; it can
//!   be driven by hand for simulation.
//! - [`session::DataPlane`] maps connected sessions to their ARQ. Each ARQ has
//!   its own lock, so writing to one session never waits on another.
//! - [`Engine`] binds a UDP socket, feeds datagrams and timer ticks to the
//!   manager and sends what it produces.
//! - [`dispatch::Callback`] receives events in the order they happened, on a
//!   dedicated task.
//! - [`checker`] classifies the local NAT against a proxy when listening.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "ed25519")]
//! # async fn demo() -> zvnet::Result<()> {
//! use zvnet::auth::{Ed25519Signer, Ed25519Verifier};
//! use zvnet::{Builder, ChannelCallback, Event};
//!
//! let (callback, events) = ChannelCallback::channel();
//! let engine = Builder::new()
//!     .node_id(1)
//!     .signer(Ed25519Signer::generate())
//!     .verifier(Ed25519Verifier)
//!     .callback(callback)
//!     .build()?;
//! engine.listen("0.0.0.0:0".parse().unwrap()).await?;
//! engine.connect(2, "192.0.2.7:4000".parse().unwrap())?;
//! while let Ok(event) = events.recv_async().await {
//!     if let Event::Connected { session, .. } = event {
//!         engine.send(session, b"hello")?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! Argument errors, unknown sessions and bind failures are returned directly.
//! Everything that happens on the network surfaces once, as a
//! [`DisconnectReason`] in a `disconnected` event.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;

use crate::auth::{Authenticator, LoginSigner, LoginVerifier};
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::session::DataPlane;

pub mod auth;
pub mod checker;
pub mod config;
pub mod dispatch;
mod error;
pub mod protocol;
pub mod session;

pub use dispatch::{Callback, ChannelCallback, Event};
pub use error::{Error, Result};
pub use session::{
    DisconnectReason, SessionId, SessionManager, SessionState, Telemetry, Transmit,
};
pub use zvnet_core::login::{LoginRecord, NodeIdentity};
pub use zvnet_core::nat::NatType;

/// Configures an [`Engine`] once.
pub struct Builder {
    node_id: Option<u64>,
    signer: Option<Arc<dyn LoginSigner>>,
    verifier: Option<Arc<dyn LoginVerifier>>,
    callback: Option<Arc<dyn Callback>>,
    config: EngineConfig,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            node_id: None,
            signer: None,
            verifier: None,
            callback: None,
            config: EngineConfig::default(),
        }
    }
    pub fn node_id(mut self, node_id: u64) -> Self {
        self.node_id = Some(node_id);
        self
    }
    pub fn signer<S: LoginSigner + 'static>(mut self, signer: S) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }
    pub fn verifier<V: LoginVerifier + 'static>(mut self, verifier: V) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }
    pub fn callback<C: Callback>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
    /// Must be called inside a tokio runtime; the dispatcher task is spawned here.
    pub fn build(self) -> Result<Engine> {
        let node_id = self
            .node_id
            .ok_or_else(|| Error::InvalidArgument("node_id is required".into()))?;
        let signer = self
            .signer
            .ok_or_else(|| Error::InvalidArgument("signer is required".into()))?;
        let verifier = self
            .verifier
            .ok_or_else(|| Error::InvalidArgument("verifier is required".into()))?;
        self.config.check()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::InvalidArgument(format!("no tokio runtime: {e}")))?;

        let auth = Authenticator::new(
            node_id,
            signer,
            verifier,
            self.config.freshness_window.as_secs(),
        );
        let callback = self.callback.unwrap_or_else(|| Arc::new(()));
        let dispatcher = Dispatcher::new(callback);
        let (sender, receiver) = flume::unbounded();
        runtime.spawn(dispatcher.clone().run(receiver));

        let tick_interval = self.config.tick_interval;
        let manager = SessionManager::new(
            self.config,
            auth,
            sender,
            Instant::now(),
            zvnet_core::unix_now(),
        );
        let plane = manager.data_plane();
        Ok(Engine {
            manager: Arc::new(Mutex::new(manager)),
            plane,
            dispatcher,
            tick_interval,
            binding: Mutex::new(None),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

struct Binding {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shutdown_manager: ShutdownManager<()>,
}

/// A running node. Dropping it closes every session.
pub struct Engine {
    manager: Arc<Mutex<SessionManager>>,
    plane: DataPlane,
    dispatcher: Dispatcher,
    tick_interval: Duration,
    binding: Mutex<Option<Binding>>,
}

impl Engine {
    pub fn node_id(&self) -> u64 {
        self.manager.lock().local_id()
    }
    /// Sets the proxy used for NAT checks and relayed sessions. Takes effect on
    /// the next `listen`/`connect`.
    pub fn proxy(&self, addr: Option<SocketAddr>) {
        self.manager.lock().set_proxy(addr);
    }
    /// Binds `addr` and starts the NAT check. Returns the bound address;
    /// `listened` and `checked` follow as events.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.binding.lock().is_some() {
            return Err(Error::AlreadyListening);
        }
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let proxy = self.manager.lock().proxy();
        let host = match (local_addr.ip().is_unspecified(), proxy) {
            (false, _) => Some(local_addr),
            (true, Some(proxy)) => zvnet_core::extend::addr::local_ip_towards(proxy)
                .await
                .ok()
                .map(|ip| SocketAddr::new(ip, local_addr.port())),
            (true, None) => None,
        };
        let socket = Arc::new(socket);
        let mut binding = self.binding.lock();
        if binding.is_some() {
            return Err(Error::AlreadyListening);
        }
        {
            let mut manager = self.manager.lock();
            manager.listen(local_addr, host, Instant::now())?;
            flush(&mut manager, &socket);
        }
        let shutdown_manager = ShutdownManager::<()>::new();
        let driver = shutdown_manager.wrap_cancel(drive(
            self.manager.clone(),
            socket.clone(),
            self.tick_interval,
        ));
        tokio::spawn(async move {
            _ = driver.await;
        });
        log::info!("listening on {local_addr}, host {host:?}");
        binding.replace(Binding {
            socket,
            local_addr,
            shutdown_manager,
        });
        Ok(local_addr)
    }
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.binding.lock().as_ref().map(|v| v.local_addr)
    }
    /// Stops listening. Every session ends with `disconnect_active`.
    pub fn close(&self) {
        let Some(binding) = self.binding.lock().take() else {
            return;
        };
        {
            let mut manager = self.manager.lock();
            manager.close();
            flush(&mut manager, &binding.socket);
        }
        _ = binding.shutdown_manager.trigger_shutdown(());
        log::info!("closed {}", binding.local_addr);
    }
    /// Starts a connect attempt; the outcome arrives as `connected` or
    /// `disconnected`.
    pub fn connect(&self, peer_id: u64, addr: SocketAddr) -> Result<()> {
        self.with_manager(|manager| manager.connect(peer_id, addr, Instant::now()))
    }
    pub fn shutdown(&self, session: SessionId) {
        self.with_manager(|manager| manager.shutdown(session))
    }
    /// Queues bytes without blocking. [`Error::SendBufferFull`] asks the caller
    /// to wait for `send_waited`. Only the session's own ARQ is locked; the data
    /// goes out on the next tick.
    pub fn send(&self, session: SessionId, buf: &[u8]) -> Result<()> {
        self.plane.send(session, buf)
    }
    /// Registers the flow-control resume callback.
    pub fn on_send_waited<F>(&self, f: F)
    where
        F: Fn(SessionId, u64) + Send + Sync + 'static,
    {
        self.dispatcher.set_send_waited(Arc::new(f));
    }
    pub fn nat_type(&self) -> NatType {
        self.manager.lock().nat_type()
    }
    pub fn state(&self, session: SessionId) -> Option<SessionState> {
        self.manager.lock().state(session)
    }
    pub fn peer_identity(&self, session: SessionId) -> Option<NodeIdentity> {
        self.manager.lock().peer_identity(session)
    }
    pub fn telemetry(&self, session: SessionId) -> Option<Telemetry> {
        self.plane.telemetry(session)
    }
    pub fn snd_nxt(&self, session: SessionId) -> Option<u32> {
        self.telemetry(session).map(|v| v.snd_nxt)
    }
    pub fn rcv_nxt(&self, session: SessionId) -> Option<u32> {
        self.telemetry(session).map(|v| v.rcv_nxt)
    }
    pub fn rx_srtt(&self, session: SessionId) -> Option<u32> {
        self.telemetry(session).map(|v| v.rx_srtt)
    }
    pub fn nsnd_buf(&self, session: SessionId) -> Option<u32> {
        self.telemetry(session).map(|v| v.nsnd_buf)
    }
    pub fn nrcv_buf(&self, session: SessionId) -> Option<u32> {
        self.telemetry(session).map(|v| v.nrcv_buf)
    }
    pub fn cache_size(&self) -> usize {
        self.manager.lock().cache_size()
    }

    fn with_manager<R>(&self, f: impl FnOnce(&mut SessionManager) -> R) -> R {
        let binding = self.binding.lock();
        let mut manager = self.manager.lock();
        let rs = f(&mut manager);
        if let Some(binding) = binding.as_ref() {
            flush(&mut manager, &binding.socket);
        }
        rs
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

fn flush(manager: &mut SessionManager, socket: &UdpSocket) {
    for transmit in manager.take_transmits() {
        if let Err(e) = socket.try_send_to(&transmit.data, transmit.to) {
            log::debug!("send to {} failed: {e:?}", transmit.to);
        }
    }
}

async fn drive(manager: Arc<Mutex<SessionManager>>, socket: Arc<UdpSocket>, tick_interval: Duration) {
    let mut buf = vec![0u8; 65536];
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            rs = socket.recv_from(&mut buf) => match rs {
                Ok((len, from)) => {
                    let mut manager = manager.lock();
                    manager.handle_datagram(from, &buf[..len], Instant::now());
                    flush(&mut manager, &socket);
                }
                Err(e) => log::debug!("recv_from {e:?}"),
            },
            _ = interval.tick() => {
                let mut manager = manager.lock();
                manager.tick(Instant::now());
                flush(&mut manager, &socket);
            }
        }
    }
}
