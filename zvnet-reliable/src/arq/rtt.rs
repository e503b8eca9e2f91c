pub(crate) const INITIAL_RTO: u32 = 200;
pub(crate) const MAX_RTO: u32 = 60_000;

/// Smoothed round-trip estimate feeding the retransmission timeout.
#[derive(Debug, Clone)]
pub(crate) struct RttEstimator {
    srtt: u32,
    rttval: u32,
    rto: u32,
    min_rto: u32,
    interval: u32,
}

impl RttEstimator {
    pub fn new(min_rto: u32, interval: u32) -> Self {
        Self {
            srtt: 0,
            rttval: 0,
            rto: INITIAL_RTO.max(min_rto),
            min_rto,
            interval,
        }
    }
    pub fn update(&mut self, rtt: u32) {
        if self.srtt == 0 {
            self.srtt = rtt.max(1);
            self.rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.srtt);
            self.rttval = (3 * self.rttval + delta) / 4;
            self.srtt = ((7 * self.srtt + rtt) / 8).max(1);
        }
        let rto = self
            .srtt
            .saturating_add(self.interval.max(self.rttval.saturating_mul(4)));
        self.rto = rto.clamp(self.min_rto, MAX_RTO);
    }
    pub fn srtt(&self) -> u32 {
        self.srtt
    }
    pub fn rto(&self) -> u32 {
        self.rto
    }
}
