use std::collections::VecDeque;
use std::io::Write;

use bytes::{BufMut, BytesMut};

use crate::config::ArqConfig;
use crate::error::{Error, Result};
use crate::segment::{Command, Segment, HEADER_LEN};

mod rtt;

use rtt::RttEstimator;

const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;
const PROBE_INIT: u32 = 500;
const PROBE_LIMIT: u32 = 10_000;

const ASK_SEND: u8 = 1;
const ASK_TELL: u8 = 2;

#[inline]
fn timediff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// A reliable, ordered byte stream over an unreliable datagram output.
///
/// `Arq` does no I/O of its own. Inbound datagrams are passed to [`Arq::input`],
/// [`Arq::update`] must be called periodically with a monotonic millisecond
/// clock, and every datagram to transmit is handed to `O` with a single
/// `write` call.
pub struct Arq<O> {
    conv: u32,
    config: ArqConfig,
    mss: usize,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    cwnd: u32,
    incr: u32,
    rmt_wnd: u32,

    rtt: RttEstimator,
    current: u32,
    ts_flush: u32,
    updated: bool,

    probe: u8,
    ts_probe: u32,
    probe_wait: u32,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,

    dead: bool,
    waiting: bool,
    output: O,
}

impl<O: Write> Arq<O> {
    pub fn new(conv: u32, mut config: ArqConfig, output: O) -> Self {
        config.mtu = config.mtu.min(crate::config::MAX_MTU);
        let mss = config.mss();
        let rtt = RttEstimator::new(config.min_rto, config.interval);
        let rmt_wnd = config.rcv_wnd as u32;
        Self {
            conv,
            config,
            mss,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            cwnd: 1,
            incr: mss as u32,
            rmt_wnd,
            rtt,
            current: 0,
            ts_flush: 0,
            updated: false,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            dead: false,
            waiting: false,
            output,
        }
    }

    /// Queues `buf` for delivery.
    ///
    /// Returns [`Error::SendBufferFull`] without queueing anything when the send
    /// buffer already holds `send_buffer_cap` segments. Bytes are coalesced into
    /// full segments, message boundaries are not preserved.
    pub fn send(&mut self, mut buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.is_send_full() {
            self.waiting = true;
            return Err(Error::SendBufferFull);
        }
        let total = buf.len();
        if let Some(last) = self.snd_queue.back_mut() {
            let room = self.mss.saturating_sub(last.data.len());
            if room > 0 {
                let n = room.min(buf.len());
                last.data.put_slice(&buf[..n]);
                buf = &buf[n..];
            }
        }
        while !buf.is_empty() {
            let n = self.mss.min(buf.len());
            let mut data = BytesMut::with_capacity(self.mss);
            data.put_slice(&buf[..n]);
            self.snd_queue
                .push_back(Segment::new(self.conv, Command::Push, data));
            buf = &buf[n..];
        }
        if self.is_send_full() {
            self.waiting = true;
        }
        Ok(total)
    }

    /// Drains every byte that is ready, in order.
    pub fn recv(&mut self) -> Option<BytesMut> {
        if self.rcv_queue.is_empty() {
            return None;
        }
        let recover = self.rcv_queue.len() >= self.config.rcv_wnd as usize;
        let mut out = BytesMut::with_capacity(self.rcv_queue.iter().map(|v| v.data.len()).sum());
        for segment in self.rcv_queue.drain(..) {
            out.put_slice(&segment.data);
        }
        self.move_ready();
        if recover && self.rcv_queue.len() < self.config.rcv_wnd as usize {
            self.probe |= ASK_TELL;
        }
        Some(out)
    }

    /// Feeds one inbound datagram. `current` is the same clock passed to [`Arq::update`].
    pub fn input(&mut self, data: &[u8], current: u32) -> Result<()> {
        if data.len() < HEADER_LEN {
            return Err(Error::InvalidSegment);
        }
        self.current = current;
        let prev_una = self.snd_una;
        let mut max_ack: Option<(u32, u32)> = None;
        let mut buf = data;
        while buf.len() >= HEADER_LEN {
            let segment = Segment::decode(&mut buf)?;
            if segment.conv != self.conv {
                return Err(Error::ConvMismatch {
                    expected: self.conv,
                    actual: segment.conv,
                });
            }
            self.rmt_wnd = segment.wnd as u32;
            self.parse_una(segment.una);
            self.shrink_buf();
            match segment.cmd {
                Command::Ack => {
                    let rtt = timediff(self.current, segment.ts);
                    if rtt >= 0 {
                        self.rtt.update(rtt as u32);
                    }
                    self.parse_ack(segment.sn);
                    self.shrink_buf();
                    match max_ack {
                        Some((sn, _)) if timediff(segment.sn, sn) <= 0 => {}
                        _ => max_ack = Some((segment.sn, segment.ts)),
                    }
                }
                Command::Push => {
                    let window_end = self.rcv_nxt.wrapping_add(self.config.rcv_wnd as u32);
                    if timediff(segment.sn, window_end) < 0 {
                        self.acklist.push((segment.sn, segment.ts));
                        if timediff(segment.sn, self.rcv_nxt) >= 0 {
                            self.parse_data(segment);
                        }
                    }
                }
                Command::WindowAsk => self.probe |= ASK_TELL,
                Command::WindowTell => {}
            }
        }
        if let Some((sn, ts)) = max_ack {
            self.parse_fastack(sn, ts);
        }
        if timediff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            let mss = self.mss as u32;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr = self.incr.saturating_add(mss);
            } else {
                self.incr = self.incr.max(mss);
                self.incr = self
                    .incr
                    .saturating_add(mss.saturating_mul(mss) / self.incr + mss / 16);
                if (self.cwnd + 1).saturating_mul(mss) <= self.incr {
                    self.cwnd = (self.incr + mss - 1) / mss;
                }
            }
            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                self.incr = self.rmt_wnd.saturating_mul(mss);
            }
        }
        Ok(())
    }

    /// Drives timers. Flushes at most once per configured interval.
    pub fn update(&mut self, current: u32) -> Result<()> {
        self.current = current;
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }
        let mut slap = timediff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }
        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.config.interval);
            if timediff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.config.interval);
            }
            self.flush()?;
        }
        Ok(())
    }

    /// Emits pending acks, window probes and due segments now.
    pub fn flush(&mut self) -> Result<()> {
        let current = self.current;
        let wnd = self.wnd_unused();
        let mut buffer = BytesMut::with_capacity(self.config.mtu);

        let mut control = Segment::new(self.conv, Command::Ack, BytesMut::new());
        control.wnd = wnd;
        control.una = self.rcv_nxt;
        for (sn, ts) in std::mem::take(&mut self.acklist) {
            control.sn = sn;
            control.ts = ts;
            Self::emit(&mut self.output, &mut buffer, self.config.mtu, &control)?;
        }

        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if timediff(current, self.ts_probe) >= 0 {
                self.probe_wait = self.probe_wait.max(PROBE_INIT);
                self.probe_wait = (self.probe_wait + self.probe_wait / 2).min(PROBE_LIMIT);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }
        control.sn = 0;
        control.ts = 0;
        if self.probe & ASK_SEND != 0 {
            control.cmd = Command::WindowAsk;
            Self::emit(&mut self.output, &mut buffer, self.config.mtu, &control)?;
        }
        if self.probe & ASK_TELL != 0 {
            control.cmd = Command::WindowTell;
            Self::emit(&mut self.output, &mut buffer, self.config.mtu, &control)?;
        }
        self.probe = 0;

        let mut cwnd = (self.config.snd_wnd as u32).min(self.rmt_wnd);
        if !self.config.no_cwnd {
            cwnd = cwnd.min(self.cwnd);
        }
        while timediff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut segment) = self.snd_queue.pop_front() else {
                break;
            };
            segment.sn = self.snd_nxt;
            segment.una = self.rcv_nxt;
            segment.resendts = current;
            segment.rto = self.rtt.rto();
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(segment);
        }

        let resent = match self.config.fast_resend {
            0 => u32::MAX,
            n => n,
        };
        let rx_rto = self.rtt.rto();
        let mut change = false;
        let mut lost = false;
        for segment in self.snd_buf.iter_mut() {
            let mut need_send = false;
            if segment.xmit == 0 {
                need_send = true;
                segment.rto = rx_rto;
                segment.resendts = current.wrapping_add(segment.rto);
            } else if timediff(current, segment.resendts) >= 0 {
                need_send = true;
                segment.rto = (segment.rto + segment.rto.max(rx_rto) / 2).min(rtt::MAX_RTO);
                segment.resendts = current.wrapping_add(segment.rto);
                lost = true;
            } else if segment.fastack >= resent {
                need_send = true;
                segment.fastack = 0;
                segment.resendts = current.wrapping_add(segment.rto);
                change = true;
            }
            if need_send {
                segment.xmit += 1;
                segment.ts = current;
                segment.wnd = wnd;
                segment.una = self.rcv_nxt;
                Self::emit(&mut self.output, &mut buffer, self.config.mtu, segment)?;
                if segment.xmit >= self.config.dead_link && !self.dead {
                    log::debug!("conv {} dead after {} transmissions", self.conv, segment.xmit);
                    self.dead = true;
                }
            }
        }
        Self::write_out(&mut self.output, &mut buffer)?;

        let mss = self.mss as u32;
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = (inflight / 2).max(THRESH_MIN);
            self.cwnd = self.ssthresh + resent.min(self.config.snd_wnd as u32);
            self.incr = self.cwnd.saturating_mul(mss);
        }
        if lost {
            self.ssthresh = (cwnd / 2).max(THRESH_MIN);
            self.cwnd = 1;
            self.incr = mss;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = mss;
        }
        Ok(())
    }

    /// True once after the send buffer drains below capacity following a
    /// full condition.
    pub fn take_resumed(&mut self) -> bool {
        if self.waiting && !self.is_send_full() {
            self.waiting = false;
            return true;
        }
        false
    }

    pub fn is_send_full(&self) -> bool {
        self.wait_snd() >= self.config.send_buffer_cap
    }
    /// A segment was retransmitted `dead_link` times without being acknowledged.
    pub fn is_dead(&self) -> bool {
        self.dead
    }
    /// Segments queued or in flight.
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }
    pub fn conv(&self) -> u32 {
        self.conv
    }
    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }
    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }
    pub fn rx_srtt(&self) -> u32 {
        self.rtt.srtt()
    }
    pub fn nsnd_buf(&self) -> u32 {
        self.wait_snd() as u32
    }
    pub fn nrcv_buf(&self) -> u32 {
        (self.rcv_buf.len() + self.rcv_queue.len()) as u32
    }
    pub fn output(&self) -> &O {
        &self.output
    }
    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    fn wnd_unused(&self) -> u16 {
        (self.config.rcv_wnd as usize).saturating_sub(self.rcv_queue.len()) as u16
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(front) = self.snd_buf.front() {
            if timediff(una, front.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = self.snd_buf.front().map_or(self.snd_nxt, |v| v.sn);
    }

    fn parse_ack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        if let Some(index) = self.snd_buf.iter().position(|v| v.sn == sn) {
            self.snd_buf.remove(index);
        }
    }

    fn parse_fastack(&mut self, sn: u32, ts: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for segment in self.snd_buf.iter_mut() {
            if timediff(sn, segment.sn) < 0 {
                break;
            }
            if sn != segment.sn && timediff(ts, segment.ts) >= 0 {
                segment.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, segment: Segment) {
        let sn = segment.sn;
        let window_end = self.rcv_nxt.wrapping_add(self.config.rcv_wnd as u32);
        if timediff(sn, window_end) >= 0 || timediff(sn, self.rcv_nxt) < 0 {
            return;
        }
        let mut index = self.rcv_buf.len();
        for (i, v) in self.rcv_buf.iter().enumerate().rev() {
            if v.sn == sn {
                log::trace!("conv {} duplicate sn {}", self.conv, sn);
                return;
            }
            if timediff(sn, v.sn) > 0 {
                break;
            }
            index = i;
        }
        self.rcv_buf.insert(index, segment);
        self.move_ready();
    }

    fn move_ready(&mut self) {
        while let Some(front) = self.rcv_buf.front() {
            if front.sn != self.rcv_nxt || self.rcv_queue.len() >= self.config.rcv_wnd as usize {
                break;
            }
            if let Some(segment) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(segment);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    fn emit(output: &mut O, buffer: &mut BytesMut, mtu: usize, segment: &Segment) -> Result<()> {
        if !buffer.is_empty() && buffer.len() + segment.encoded_len() > mtu {
            Self::write_out(output, buffer)?;
        }
        segment.encode(buffer);
        Ok(())
    }

    fn write_out(output: &mut O, buffer: &mut BytesMut) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let n = output.write(buffer)?;
        if n != buffer.len() {
            log::debug!("short datagram write {n}/{}", buffer.len());
        }
        buffer.clear();
        Ok(())
    }
}
