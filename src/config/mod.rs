use std::time::Duration;

pub use zvnet_reliable::ArqConfig;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const FRESHNESS_WINDOW: Duration = Duration::from_secs(300);

/// Timers and limits of an [`Engine`](crate::Engine).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Time allowed for the whole login exchange.
    pub connect_timeout: Duration,
    pub login_resend_interval: Duration,
    /// Accepted clock skew of a peer's login timestamp.
    pub freshness_window: Duration,
    pub heartbeat_interval: Duration,
    /// Silence after which a connected session is torn down.
    pub idle_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_resend_interval: Duration,
    /// How long a NAT check result is reused for the same proxy.
    pub probe_cache_ttl: Duration,
    /// Bound of the pending-attempt cache.
    pub cache_capacity: usize,
    pub tick_interval: Duration,
    pub arq: ArqConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            login_resend_interval: Duration::from_millis(500),
            freshness_window: FRESHNESS_WINDOW,
            heartbeat_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
            probe_resend_interval: Duration::from_millis(500),
            probe_cache_ttl: Duration::from_secs(60),
            cache_capacity: 1024,
            tick_interval: Duration::from_millis(10),
            arq: ArqConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn set_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
    pub fn set_login_resend_interval(mut self, login_resend_interval: Duration) -> Self {
        self.login_resend_interval = login_resend_interval;
        self
    }
    pub fn set_freshness_window(mut self, freshness_window: Duration) -> Self {
        self.freshness_window = freshness_window;
        self
    }
    pub fn set_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }
    pub fn set_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
    pub fn set_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }
    pub fn set_probe_resend_interval(mut self, probe_resend_interval: Duration) -> Self {
        self.probe_resend_interval = probe_resend_interval;
        self
    }
    pub fn set_probe_cache_ttl(mut self, probe_cache_ttl: Duration) -> Self {
        self.probe_cache_ttl = probe_cache_ttl;
        self
    }
    pub fn set_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }
    pub fn set_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }
    pub fn set_arq_config(mut self, arq: ArqConfig) -> Self {
        self.arq = arq;
        self
    }
    pub(crate) fn check(&self) -> crate::Result<()> {
        if self.tick_interval.is_zero() {
            return Err(crate::Error::InvalidArgument(
                "tick_interval must be non-zero".into(),
            ));
        }
        if self.arq.mtu <= zvnet_reliable::HEADER_LEN + crate::protocol::HEAD_LEN
            || self.arq.mtu > zvnet_reliable::config::MAX_MTU
        {
            return Err(crate::Error::InvalidArgument(format!(
                "mtu {} is out of range",
                self.arq.mtu
            )));
        }
        if self.idle_timeout <= self.heartbeat_interval {
            return Err(crate::Error::InvalidArgument(
                "idle_timeout must exceed heartbeat_interval".into(),
            ));
        }
        Ok(())
    }
}
