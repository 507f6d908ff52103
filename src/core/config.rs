//! Runtime configuration.

use std::net::SocketAddr;
use std::time::Duration;

use super::constants::*;
use super::error::RuntimeError;

/// Configuration of one Rx runtime.
#[derive(Debug, Clone)]
pub struct RxConfig {
    /// Address the listener socket binds to.
    pub bind_addr: SocketAddr,

    /// Fixed epoch; a random one is chosen when unset.
    pub epoch: Option<u32>,

    /// Packets allocated into the pool at startup.
    pub packets: usize,

    /// Free packets reserved per class (receive, send, special).
    pub quotas: [usize; 3],

    /// Packets reserved for calls that are actively receiving.
    pub data_quota: usize,

    /// Receive window, also the transmit window ceiling.
    pub window: u32,

    /// Transmit window a new call starts with.
    pub initial_window: u32,

    /// Largest datagram this side accepts, advertised in every ack.
    pub max_receive_size: usize,

    /// Retransmit timeout used until a peer has an RTT sample.
    pub initial_timeout: Duration,

    /// Seconds without traffic before a client call is declared dead.
    pub conn_dead_time: u32,

    /// How long an unused server connection is kept.
    pub idle_connection_time: Duration,

    /// How long an unreferenced peer is kept.
    pub idle_peer_time: Duration,

    /// Interval between reaper passes.
    pub reap_interval: Duration,

    /// Interval between repeated security challenges.
    pub challenge_timeout: Duration,

    /// Delay before acknowledging the last packet of a call.
    pub last_ack_delay: Duration,

    /// Delay before acknowledging the end of a burst.
    pub soft_ack_delay: Duration,

    /// Packets a peer may receive back to back; zero disables burst control.
    pub burst_size: u32,

    /// Delay before an exhausted burst budget is restored.
    pub burst_wait: Duration,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            epoch: None,
            packets: DEFAULT_PACKETS,
            quotas: PACKET_QUOTAS,
            data_quota: MAX_QUOTA,
            window: DEFAULT_WINDOW,
            initial_window: INITIAL_WINDOW,
            max_receive_size: MAX_PACKET_SIZE,
            initial_timeout: INITIAL_TIMEOUT,
            conn_dead_time: DEFAULT_CONN_DEAD_TIME,
            idle_connection_time: IDLE_CONNECTION_TIME,
            idle_peer_time: IDLE_PEER_TIME,
            reap_interval: REAP_INTERVAL,
            challenge_timeout: CHALLENGE_TIMEOUT,
            last_ack_delay: LAST_ACK_DELAY,
            soft_ack_delay: SOFT_ACK_DELAY,
            burst_size: 0,
            burst_wait: DEFAULT_BURST_WAIT,
        }
    }
}

impl RxConfig {
    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.window == 0 || self.window as usize > MAX_ACKS {
            return Err(RuntimeError::Config(format!(
                "window must be within 1..={MAX_ACKS}, got {}",
                self.window
            )));
        }
        if self.initial_window == 0 || self.initial_window > self.window {
            return Err(RuntimeError::Config(format!(
                "initial window {} must be within 1..={}",
                self.initial_window, self.window
            )));
        }
        if !(OLD_MAX_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.max_receive_size) {
            return Err(RuntimeError::Config(format!(
                "max receive size must be within {OLD_MAX_PACKET_SIZE}..={MAX_PACKET_SIZE}, got {}",
                self.max_receive_size
            )));
        }
        let reserve = self.quotas.iter().copied().max().unwrap_or(0) + 2;
        if self.packets < reserve {
            return Err(RuntimeError::Config(format!(
                "pool of {} packets cannot cover class quotas (need {reserve})",
                self.packets
            )));
        }
        if self.conn_dead_time == 0 {
            return Err(RuntimeError::Config("connection dead time must be non-zero".into()));
        }
        Ok(())
    }

    /// Seconds between keep-alive pings for a given dead time.
    pub fn ping_interval(dead_time: u32) -> u32 {
        (dead_time / 6).max(1)
    }
}

/// Builder for [`RxConfig`].
#[derive(Debug, Default)]
pub struct RxConfigBuilder {
    config: RxConfig,
}

impl RxConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Pin the epoch instead of choosing a random one.
    pub fn epoch(mut self, epoch: u32) -> Self {
        self.config.epoch = Some(epoch);
        self
    }

    /// Set the initial packet pool size.
    pub fn packets(mut self, packets: usize) -> Self {
        self.config.packets = packets;
        self
    }

    /// Set the reserved free packets per class.
    pub fn quotas(mut self, receive: usize, send: usize, special: usize) -> Self {
        self.config.quotas = [receive, send, special];
        self
    }

    /// Set the data quota.
    pub fn data_quota(mut self, quota: usize) -> Self {
        self.config.data_quota = quota;
        self
    }

    /// Set the receive window and transmit window ceiling.
    pub fn window(mut self, window: u32) -> Self {
        self.config.window = window;
        self
    }

    /// Set the initial transmit window.
    pub fn initial_window(mut self, window: u32) -> Self {
        self.config.initial_window = window;
        self
    }

    /// Set the largest accepted datagram.
    pub fn max_receive_size(mut self, size: usize) -> Self {
        self.config.max_receive_size = size;
        self
    }

    /// Set the retransmit timeout used before any RTT sample.
    pub fn initial_timeout(mut self, timeout: Duration) -> Self {
        self.config.initial_timeout = timeout;
        self
    }

    /// Set the client connection dead time in seconds.
    pub fn conn_dead_time(mut self, seconds: u32) -> Self {
        self.config.conn_dead_time = seconds;
        self
    }

    /// Set the idle server connection lifetime.
    pub fn idle_connection_time(mut self, time: Duration) -> Self {
        self.config.idle_connection_time = time;
        self
    }

    /// Set the idle peer lifetime.
    pub fn idle_peer_time(mut self, time: Duration) -> Self {
        self.config.idle_peer_time = time;
        self
    }

    /// Set the reaper interval.
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval = interval;
        self
    }

    /// Set the challenge retry interval.
    pub fn challenge_timeout(mut self, timeout: Duration) -> Self {
        self.config.challenge_timeout = timeout;
        self
    }

    /// Set the delayed ack timers.
    pub fn ack_delays(mut self, last: Duration, soft: Duration) -> Self {
        self.config.last_ack_delay = last;
        self.config.soft_ack_delay = soft;
        self
    }

    /// Enable burst control.
    pub fn burst(mut self, size: u32, wait: Duration) -> Self {
        self.config.burst_size = size;
        self.config.burst_wait = wait;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<RxConfig, RuntimeError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RxConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_bad_window() {
        assert!(RxConfigBuilder::new().window(0).build().is_err());
        assert!(RxConfigBuilder::new().window(300).build().is_err());
        assert!(RxConfigBuilder::new().window(4).initial_window(5).build().is_err());
    }

    #[test]
    fn test_builder_rejects_small_pool() {
        let result = RxConfigBuilder::new().packets(4).build();
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = RxConfigBuilder::new()
            .epoch(42)
            .window(8)
            .initial_window(3)
            .conn_dead_time(30)
            .build()
            .unwrap();
        assert_eq!(config.epoch, Some(42));
        assert_eq!(config.window, 8);
        assert_eq!(config.initial_window, 3);
        assert_eq!(config.conn_dead_time, 30);
    }

    #[test]
    fn test_ping_interval() {
        assert_eq!(RxConfig::ping_interval(12), 2);
        assert_eq!(RxConfig::ping_interval(3), 1);
        assert_eq!(RxConfig::ping_interval(60), 10);
    }
}
