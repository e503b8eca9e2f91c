use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use zvnet_reliable::Arq;

use super::{SessionId, SessionOutput};
use crate::error::{Error, Result};

/// ARQ of one session. `None` before the handshake finished and after a close.
pub(crate) type SharedArq = Arc<Mutex<Option<Arq<SessionOutput>>>>;

/// Snapshot of a session's ARQ counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Telemetry {
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub rx_srtt: u32,
    pub nsnd_buf: u32,
    pub nrcv_buf: u32,
}

/// Connected sessions, reachable without the manager.
///
/// The manager publishes a session once it is connected and withdraws it when
/// the session is removed. `send` and the telemetry getters lock only the ARQ
/// of the session they address, so a flush of one session never holds up
/// another.
#[derive(Clone, Default)]
pub struct DataPlane {
    arqs: Arc<DashMap<SessionId, SharedArq>>,
}

impl DataPlane {
    pub(crate) fn publish(&self, id: SessionId, arq: SharedArq) {
        self.arqs.insert(id, arq);
    }
    pub(crate) fn withdraw(&self, id: SessionId) {
        self.arqs.remove(&id);
    }
    pub(crate) fn arq(&self, id: SessionId) -> Option<SharedArq> {
        self.arqs.get(&id).map(|v| v.value().clone())
    }

    /// Queues bytes on a connected session.
    pub fn send(&self, id: SessionId, buf: &[u8]) -> Result<()> {
        let arq = self.arq(id).ok_or(Error::UnknownSession)?;
        let mut guard = arq.lock();
        let arq = guard.as_mut().ok_or(Error::SessionClosed)?;
        arq.send(buf)?;
        Ok(())
    }

    pub fn telemetry(&self, id: SessionId) -> Option<Telemetry> {
        let arq = self.arq(id)?;
        let guard = arq.lock();
        guard.as_ref().map(|arq| Telemetry {
            snd_nxt: arq.snd_nxt(),
            rcv_nxt: arq.rcv_nxt(),
            rx_srtt: arq.rx_srtt(),
            nsnd_buf: arq.nsnd_buf(),
            nrcv_buf: arq.nrcv_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.arqs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.arqs.is_empty()
    }
}
