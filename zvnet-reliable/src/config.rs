use crate::segment::HEADER_LEN;

pub const DEFAULT_MTU: usize = 1400;
/// Largest UDP payload over IPv4.
pub const MAX_MTU: usize = 65_507;

/// Tuning knobs of one [`Arq`](crate::Arq) instance.
#[derive(Clone, Debug)]
pub struct ArqConfig {
    /// Largest datagram the ARQ emits, header included.
    pub mtu: usize,
    /// Segments that may be in flight.
    pub snd_wnd: u16,
    /// Out-of-order segments held for reassembly.
    pub rcv_wnd: u16,
    /// Flush interval in milliseconds.
    pub interval: u32,
    /// Retransmission timeout floor in milliseconds.
    pub min_rto: u32,
    /// Duplicate acks that trigger a fast retransmit, 0 disables it.
    pub fast_resend: u32,
    /// Ignore the congestion window, only the peer window limits sending.
    pub no_cwnd: bool,
    /// Transmissions of a single segment after which the link is dead.
    pub dead_link: u32,
    /// Queued plus in-flight segments at which the send buffer counts as full.
    pub send_buffer_cap: usize,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            snd_wnd: 128,
            rcv_wnd: 128,
            interval: 10,
            min_rto: 30,
            fast_resend: 2,
            no_cwnd: false,
            dead_link: 20,
            send_buffer_cap: 10240,
        }
    }
}

impl ArqConfig {
    pub fn set_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.min(MAX_MTU);
        self
    }
    pub fn set_wndsize(mut self, snd_wnd: u16, rcv_wnd: u16) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }
    pub fn set_interval(mut self, interval: u32) -> Self {
        self.interval = interval.clamp(1, 5000);
        self
    }
    pub fn set_min_rto(mut self, min_rto: u32) -> Self {
        self.min_rto = min_rto;
        self
    }
    pub fn set_fast_resend(mut self, fast_resend: u32) -> Self {
        self.fast_resend = fast_resend;
        self
    }
    pub fn set_no_cwnd(mut self, no_cwnd: bool) -> Self {
        self.no_cwnd = no_cwnd;
        self
    }
    pub fn set_dead_link(mut self, dead_link: u32) -> Self {
        self.dead_link = dead_link.max(1);
        self
    }
    pub fn set_send_buffer_cap(mut self, send_buffer_cap: usize) -> Self {
        self.send_buffer_cap = send_buffer_cap.max(1);
        self
    }
    /// Payload bytes per segment.
    pub fn mss(&self) -> usize {
        self.mtu.min(MAX_MTU).saturating_sub(HEADER_LEN).max(1)
    }
}
