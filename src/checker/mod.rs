//! NAT check against the proxy.
//!
//! A primary probe goes to the proxy. Its reply carries the mapped address and,
//! optionally, alternate endpoints; those are probed too so the mappings seen for
//! different destinations can be compared. The check ends when every probe is
//! answered or the timeout elapses, whichever comes first.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use zvnet_core::cache::ExpireCache;
use zvnet_core::nat::{classify, NatType, Observation};

use crate::protocol::probe::{ProbeReply, ProbeRequest};
use crate::protocol::protocol_type::ProtocolType;
use crate::protocol::NetPacket;
use crate::session::PendingKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub nat_type: NatType,
    /// Local address the probes were sent from, when known.
    pub host: Option<SocketAddr>,
    /// Address the proxy observed for the primary probe.
    pub napt: Option<SocketAddr>,
    /// Round trip of the primary probe, from its first transmission.
    pub latency: Option<Duration>,
}

struct Probe {
    nonce: u64,
    destination: SocketAddr,
    first_sent: Option<Instant>,
    // last (re)send, paces the resend timer
    sent_at: Option<Instant>,
    answered: bool,
}

pub(crate) struct NatChecker {
    proxy: SocketAddr,
    local: Option<SocketAddr>,
    deadline: Instant,
    resend_interval: Duration,
    pending: ExpireCache<PendingKey, Instant>,
    probes: Vec<Probe>,
    observations: Vec<Observation>,
    latency: Option<Duration>,
}

impl NatChecker {
    pub fn new(
        proxy: SocketAddr,
        local: Option<SocketAddr>,
        now: Instant,
        timeout: Duration,
        resend_interval: Duration,
        pending: ExpireCache<PendingKey, Instant>,
    ) -> Self {
        let mut checker = Self {
            proxy,
            local,
            deadline: now + timeout,
            resend_interval,
            pending,
            probes: Vec::with_capacity(3),
            observations: Vec::with_capacity(3),
            latency: None,
        };
        checker.add_probe(proxy, now);
        checker
    }
    pub fn proxy(&self) -> SocketAddr {
        self.proxy
    }

    fn add_probe(&mut self, destination: SocketAddr, now: Instant) {
        if self.probes.iter().any(|v| v.destination == destination) {
            return;
        }
        let nonce = loop {
            let nonce: u64 = rand::random();
            if self
                .pending
                .insert_if_absent(PendingKey::Probe(nonce), now, now)
            {
                break nonce;
            }
        };
        self.probes.push(Probe {
            nonce,
            destination,
            first_sent: None,
            sent_at: None,
            answered: false,
        });
    }

    /// Probe datagrams due at `now`.
    pub fn poll_transmit(&mut self, local_id: u64, now: Instant) -> Vec<(SocketAddr, BytesMut)> {
        let resend_interval = self.resend_interval;
        let mut out = Vec::new();
        for probe in self.probes.iter_mut().filter(|v| !v.answered) {
            if probe.sent_at.is_some_and(|at| now < at + resend_interval) {
                continue;
            }
            probe.sent_at = Some(now);
            probe.first_sent.get_or_insert(now);
            let mut body = Vec::with_capacity(ProbeRequest::LEN);
            ProbeRequest { nonce: probe.nonce }.encode(&mut body);
            let packet = NetPacket::build(ProtocolType::ProbeRequest, local_id, 0, &body);
            out.push((probe.destination, packet.into_buffer()));
        }
        out
    }

    /// Returns false for replies that match no outstanding probe.
    pub fn handle_reply(&mut self, reply: &ProbeReply, now: Instant) -> bool {
        let Some(probe) = self
            .probes
            .iter_mut()
            .find(|v| v.nonce == reply.nonce && !v.answered)
        else {
            return false;
        };
        probe.answered = true;
        let destination = probe.destination;
        let rtt = probe.first_sent.map(|at| now.saturating_duration_since(at));
        self.pending.remove(&PendingKey::Probe(reply.nonce));
        self.observations
            .push(Observation::new(destination, reply.mapped));
        if destination == self.proxy {
            self.latency = rtt;
            if reply.alt_port != 0 && reply.alt_port != self.proxy.port() {
                self.add_probe(SocketAddr::new(self.proxy.ip(), reply.alt_port), now);
            }
            if let Some(alt) = reply.alt_ip {
                self.add_probe(alt, now);
            }
        }
        true
    }

    pub fn is_done(&self, now: Instant) -> bool {
        now >= self.deadline || self.probes.iter().all(|v| v.answered)
    }

    pub fn finish(self) -> CheckResult {
        for probe in self.probes.iter().filter(|v| !v.answered) {
            self.pending.remove(&PendingKey::Probe(probe.nonce));
        }
        let nat_type = classify(self.local, &self.observations);
        CheckResult {
            nat_type,
            host: self.local,
            napt: self.observations.first().map(|v| v.mapped),
            latency: self.latency,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn nonce_of(packet: &BytesMut) -> u64 {
        let packet = NetPacket::new(&packet[..]).unwrap();
        assert_eq!(packet.protocol(), ProtocolType::ProbeRequest);
        ProbeRequest::decode(packet.payload()).unwrap().nonce
    }

    fn checker(now: Instant) -> (NatChecker, ExpireCache<PendingKey, Instant>) {
        let pending = ExpireCache::new(16, Duration::from_secs(10));
        let checker = NatChecker::new(
            "1.1.1.1:3000".parse().unwrap(),
            Some("192.168.1.2:5000".parse().unwrap()),
            now,
            Duration::from_secs(3),
            Duration::from_millis(500),
            pending.clone(),
        );
        (checker, pending)
    }

    #[test]
    fn follows_alternate_endpoints() {
        let now = Instant::now();
        let (mut checker, pending) = checker(now);
        let out = checker.poll_transmit(7, now);
        assert_eq!(out.len(), 1);
        assert_eq!(pending.len(), 1);
        let primary = nonce_of(&out[0].1);
        assert!(checker
            .poll_transmit(7, now + Duration::from_millis(100))
            .is_empty());

        let later = now + Duration::from_millis(40);
        let reply = ProbeReply {
            nonce: primary,
            mapped: "9.9.9.9:40000".parse().unwrap(),
            alt_ip: Some("2.2.2.2:3000".parse().unwrap()),
            alt_port: 3001,
        };
        assert!(checker.handle_reply(&reply, later));
        assert!(!checker.handle_reply(&reply, later));
        assert!(!checker.is_done(later));

        let out = checker.poll_transmit(7, later);
        assert_eq!(out.len(), 2);
        assert_eq!(pending.len(), 2);
        for (destination, packet) in out {
            let mapped = if destination.port() == 3001 {
                "9.9.9.9:40001"
            } else {
                "9.9.9.9:40002"
            };
            let reply = ProbeReply {
                nonce: nonce_of(&packet),
                mapped: mapped.parse().unwrap(),
                alt_ip: None,
                alt_port: 0,
            };
            assert!(checker.handle_reply(&reply, later));
        }
        assert!(checker.is_done(later));
        let result = checker.finish();
        assert_eq!(result.nat_type, NatType::Symmetric);
        assert_eq!(result.napt, Some("9.9.9.9:40000".parse().unwrap()));
        assert_eq!(result.latency, Some(Duration::from_millis(40)));
        assert!(pending.is_empty());
    }

    #[test]
    fn resends_then_times_out() {
        let now = Instant::now();
        let (mut checker, pending) = checker(now);
        let first = checker.poll_transmit(7, now);
        let again = checker.poll_transmit(7, now + Duration::from_millis(500));
        assert_eq!(nonce_of(&first[0].1), nonce_of(&again[0].1));
        assert!(!checker.is_done(now + Duration::from_millis(2999)));
        assert!(checker.is_done(now + Duration::from_secs(3)));
        let result = checker.finish();
        assert_eq!(result.nat_type, NatType::Unknown);
        assert_eq!(result.napt, None);
        assert_eq!(result.latency, None);
        assert!(pending.is_empty());
    }

    #[test]
    fn latency_counts_from_first_send() {
        let now = Instant::now();
        let (mut checker, _) = checker(now);
        let first = checker.poll_transmit(7, now);
        let resent = checker.poll_transmit(7, now + Duration::from_millis(600));
        assert_eq!(resent.len(), 1);
        let reply = ProbeReply {
            nonce: nonce_of(&first[0].1),
            mapped: "192.168.1.2:5000".parse().unwrap(),
            alt_ip: None,
            alt_port: 0,
        };
        assert!(checker.handle_reply(&reply, now + Duration::from_millis(650)));
        let result = checker.finish();
        assert_eq!(result.latency, Some(Duration::from_millis(650)));
        assert_eq!(result.nat_type, NatType::Host);
    }
}
