//! RTT estimation and retransmit timeout.
//!
//! Integer microsecond arithmetic:
//! - First sample: SRTT = sample, MDEV = sample / 2 (at least 1ms)
//! - Subsequent: MDEV = (3 * MDEV + |SRTT - sample|) / 4,
//!   SRTT = (7 * SRTT + sample) / 8
//! - Timeout = SRTT + 4 * MDEV + 100ms guard, never below 1ms

use std::time::Duration;

use crate::core::constants::TIMEOUT_GUARD;

/// Floor for the smoothed deviation and the timeout.
const MIN_MICROS: u64 = 1_000;

/// RTT estimator kept per peer.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT in microseconds.
    srtt: u64,
    /// Smoothed mean deviation in microseconds.
    mdev: u64,
    /// Current retransmit timeout.
    timeout: Duration,
    /// Set once the first RTT sample arrives.
    sampled: bool,
    /// Number of samples absorbed.
    samples: u64,
}

impl RttEstimator {
    /// Create an estimator that reports `initial_timeout` until its first
    /// sample.
    pub fn new(initial_timeout: Duration) -> Self {
        Self {
            srtt: 0,
            mdev: 0,
            timeout: initial_timeout,
            sampled: false,
            samples: 0,
        }
    }

    /// Absorb an RTT sample.
    pub fn update(&mut self, sample: Duration) {
        let rtt = u64::try_from(sample.as_micros()).unwrap_or(u64::MAX / 16);

        if !self.sampled {
            self.srtt = rtt;
            self.mdev = (rtt / 2).max(MIN_MICROS);
            self.sampled = true;
        } else {
            let err = self.srtt.abs_diff(rtt);
            self.mdev = (self.mdev * 3 + err) / 4;
            self.srtt = (self.srtt * 7 + rtt) / 8;
        }
        self.samples += 1;
        self.recompute();
    }

    /// Widen the deviation after a retransmission forced by timeout.
    ///
    /// Doubles MDEV, never past SRTT, and recomputes the timeout.
    pub fn dubious_timeout(&mut self) {
        if self.sampled && self.mdev < self.srtt {
            self.mdev = (self.mdev * 2).min(self.srtt);
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        let guard = u64::try_from(TIMEOUT_GUARD.as_micros()).unwrap_or(0);
        let micros = (self.srtt + 4 * self.mdev + guard).max(MIN_MICROS);
        self.timeout = Duration::from_micros(micros);
    }

    /// Packets that can round-trip within half a timeout, clamped to
    /// `1..=ceiling`. A timeout shorter than two round trips yields 1.
    pub fn window(&self, ceiling: u32) -> u32 {
        if !self.sampled {
            return ceiling.max(1);
        }
        let timeout = u64::try_from(self.timeout.as_micros()).unwrap_or(u64::MAX);
        let per_window = timeout / (2 * self.srtt.max(1));
        u32::try_from(per_window).unwrap_or(u32::MAX).clamp(1, ceiling.max(1))
    }

    /// Current retransmit timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Smoothed RTT.
    pub fn srtt(&self) -> Duration {
        Duration::from_micros(self.srtt)
    }

    /// Smoothed mean deviation.
    pub fn mdev(&self) -> Duration {
        Duration::from_micros(self.mdev)
    }

    /// True once at least one RTT sample has been taken.
    pub fn has_sample(&self) -> bool {
        self.sampled
    }

    /// Number of samples absorbed.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_timeout() {
        let rtt = RttEstimator::new(Duration::from_secs(2));
        assert!(!rtt.has_sample());
        assert_eq!(rtt.timeout(), Duration::from_secs(2));
        assert_eq!(rtt.window(15), 15);
    }

    #[test]
    fn test_first_sample() {
        let mut rtt = RttEstimator::new(Duration::from_secs(2));
        rtt.update(Duration::from_millis(40));

        assert_eq!(rtt.srtt(), Duration::from_millis(40));
        assert_eq!(rtt.mdev(), Duration::from_millis(20));
        // 40 + 4 * 20 + 100
        assert_eq!(rtt.timeout(), Duration::from_millis(220));
    }

    #[test]
    fn test_first_sample_mdev_floor() {
        let mut rtt = RttEstimator::new(Duration::from_secs(2));
        rtt.update(Duration::from_micros(100));
        assert_eq!(rtt.mdev(), Duration::from_millis(1));
        assert_eq!(rtt.timeout(), Duration::from_micros(100 + 4_000 + 100_000));
    }

    #[test]
    fn test_smoothing() {
        let mut rtt = RttEstimator::new(Duration::from_secs(2));
        rtt.update(Duration::from_millis(80));
        rtt.update(Duration::from_millis(160));

        // mdev = (3 * 40 + 80) / 4 = 50, srtt = (7 * 80 + 160) / 8 = 90
        assert_eq!(rtt.srtt(), Duration::from_millis(90));
        assert_eq!(rtt.mdev(), Duration::from_millis(50));
        assert_eq!(rtt.timeout(), Duration::from_millis(90 + 200 + 100));
        assert_eq!(rtt.samples(), 2);
    }

    #[test]
    fn test_dubious_timeout_doubles_mdev_capped() {
        let mut rtt = RttEstimator::new(Duration::from_secs(2));
        rtt.update(Duration::from_millis(100));
        assert_eq!(rtt.mdev(), Duration::from_millis(50));

        rtt.dubious_timeout();
        assert_eq!(rtt.mdev(), Duration::from_millis(100));
        assert_eq!(rtt.timeout(), Duration::from_millis(100 + 400 + 100));

        // Already at SRTT: no further growth.
        rtt.dubious_timeout();
        assert_eq!(rtt.mdev(), Duration::from_millis(100));
    }

    #[test]
    fn test_dubious_timeout_before_sample() {
        let mut rtt = RttEstimator::new(Duration::from_secs(2));
        rtt.dubious_timeout();
        assert_eq!(rtt.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_window_from_timeout() {
        let mut rtt = RttEstimator::new(Duration::from_secs(2));
        rtt.update(Duration::from_millis(10));
        // timeout = 10 + 20 + 100 = 130ms, 130 / 20 = 6
        assert_eq!(rtt.window(15), 6);
        assert_eq!(rtt.window(4), 4);

        let mut slow = RttEstimator::new(Duration::from_secs(2));
        slow.update(Duration::from_secs(1));
        // timeout = 1000 + 2000 + 100 = 3100ms, 3100 / 2000 = 1
        assert_eq!(slow.window(15), 1);
    }

    #[test]
    fn test_steady_rtt_timeout_is_srtt_plus_guard() {
        let mut rtt = RttEstimator::new(Duration::from_secs(2));
        for _ in 0..200 {
            rtt.update(Duration::from_secs(1));
        }
        assert_eq!(rtt.srtt(), Duration::from_secs(1));
        assert_eq!(rtt.mdev(), Duration::ZERO);
        assert_eq!(rtt.timeout(), Duration::from_millis(1_100));
        // 1100 / 2000 rounds down, the window never drops below one packet.
        assert_eq!(rtt.window(15), 1);
    }
}
