use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::RwLock;
use zvnet_core::nat::NatType;

use crate::session::{DisconnectReason, SessionId};

/// Everything the engine reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Recved {
        session: SessionId,
        peer_id: u64,
        data: Bytes,
    },
    Checked {
        nat_type: NatType,
        host: Option<SocketAddr>,
        napt: Option<SocketAddr>,
    },
    Listened {
        addr: SocketAddr,
        latency: Option<Duration>,
    },
    /// `addr` is where the peer's datagrams come from, the proxy when relayed.
    Accepted {
        session: SessionId,
        peer_id: u64,
        addr: SocketAddr,
        nat_type: NatType,
    },
    /// `nat_type` is the local NAT type the session was set up under.
    Connected {
        session: SessionId,
        peer_id: u64,
        nat_type: NatType,
    },
    /// `session` is `None` when the attempt failed before a handle was handed out.
    Disconnected {
        peer_id: u64,
        session: Option<SessionId>,
        reason: DisconnectReason,
    },
    SendWaited {
        session: SessionId,
        peer_id: u64,
    },
}

/// Callback table of an engine. Every method defaults to doing nothing.
///
/// Methods run on the dispatcher task, one event at a time. They must not block.
#[allow(unused_variables)]
pub trait Callback: Send + Sync + 'static {
    fn recved(&self, session: SessionId, peer_id: u64, data: Bytes) {}
    fn checked(&self, nat_type: NatType, host: Option<SocketAddr>, napt: Option<SocketAddr>) {}
    fn listened(&self, addr: SocketAddr, latency: Option<Duration>) {}
    fn accepted(&self, session: SessionId, peer_id: u64, addr: SocketAddr, nat_type: NatType) {}
    fn connected(&self, session: SessionId, peer_id: u64, nat_type: NatType) {}
    fn disconnected(&self, peer_id: u64, session: Option<SessionId>, reason: DisconnectReason) {}
}

impl Callback for () {}

/// Forwards events into a channel.
#[derive(Clone)]
pub struct ChannelCallback {
    sender: Sender<Event>,
}

impl ChannelCallback {
    pub fn channel() -> (Self, Receiver<Event>) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver)
    }
}

impl Callback for ChannelCallback {
    fn recved(&self, session: SessionId, peer_id: u64, data: Bytes) {
        let _ = self.sender.send(Event::Recved {
            session,
            peer_id,
            data,
        });
    }
    fn checked(&self, nat_type: NatType, host: Option<SocketAddr>, napt: Option<SocketAddr>) {
        let _ = self.sender.send(Event::Checked {
            nat_type,
            host,
            napt,
        });
    }
    fn listened(&self, addr: SocketAddr, latency: Option<Duration>) {
        let _ = self.sender.send(Event::Listened { addr, latency });
    }
    fn accepted(&self, session: SessionId, peer_id: u64, addr: SocketAddr, nat_type: NatType) {
        let _ = self.sender.send(Event::Accepted {
            session,
            peer_id,
            addr,
            nat_type,
        });
    }
    fn connected(&self, session: SessionId, peer_id: u64, nat_type: NatType) {
        let _ = self.sender.send(Event::Connected {
            session,
            peer_id,
            nat_type,
        });
    }
    fn disconnected(&self, peer_id: u64, session: Option<SessionId>, reason: DisconnectReason) {
        let _ = self.sender.send(Event::Disconnected {
            peer_id,
            session,
            reason,
        });
    }
}

pub(crate) type SendWaitedFn = Arc<dyn Fn(SessionId, u64) + Send + Sync>;

/// Delivers queued events to the callback table in order.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    callback: Arc<dyn Callback>,
    send_waited: Arc<RwLock<Option<SendWaitedFn>>>,
}

impl Dispatcher {
    pub fn new(callback: Arc<dyn Callback>) -> Self {
        Self {
            callback,
            send_waited: Default::default(),
        }
    }
    pub fn set_send_waited(&self, f: SendWaitedFn) {
        self.send_waited.write().replace(f);
    }
    pub fn dispatch(&self, event: Event) {
        let callback = &self.callback;
        match event {
            Event::Recved {
                session,
                peer_id,
                data,
            } => callback.recved(session, peer_id, data),
            Event::Checked {
                nat_type,
                host,
                napt,
            } => callback.checked(nat_type, host, napt),
            Event::Listened { addr, latency } => callback.listened(addr, latency),
            Event::Accepted {
                session,
                peer_id,
                addr,
                nat_type,
            } => callback.accepted(session, peer_id, addr, nat_type),
            Event::Connected {
                session,
                peer_id,
                nat_type,
            } => callback.connected(session, peer_id, nat_type),
            Event::Disconnected {
                peer_id,
                session,
                reason,
            } => callback.disconnected(peer_id, session, reason),
            Event::SendWaited { session, peer_id } => {
                let f = self.send_waited.read().clone();
                match f {
                    Some(f) => f(session, peer_id),
                    None => log::debug!("send_waited {session} without a registered callback"),
                }
            }
        }
    }
    pub async fn run(self, events: Receiver<Event>) {
        while let Ok(event) = events.recv_async().await {
            self.dispatch(event);
        }
        log::debug!("dispatcher stopped");
    }
}
