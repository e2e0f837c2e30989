//! Quality tiers and their upload policy.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Device sample rate in Hz
pub const SAMPLE_RATE_HZ: usize = 25;

/// Latency reported when the collector cannot be reached at all
pub const LATENCY_UNREACHABLE_MS: u64 = 9_999;

/// Upper bound (exclusive) of the Excellent tier
const EXCELLENT_BELOW_MS: u64 = 100;

/// Upper bound (exclusive) of the Good tier
const GOOD_BELOW_MS: u64 = 300;

/// Connectivity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Poor,
    Offline,
}

impl NetworkQuality {
    /// Classify a measured round-trip latency
    ///
    /// The unreachable sentinel (and anything beyond it) is Offline.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetry_uplink::network::NetworkQuality;
    ///
    /// assert_eq!(NetworkQuality::from_latency_ms(95), NetworkQuality::Excellent);
    /// assert_eq!(NetworkQuality::from_latency_ms(150), NetworkQuality::Good);
    /// assert_eq!(NetworkQuality::from_latency_ms(350), NetworkQuality::Poor);
    /// ```
    pub fn from_latency_ms(latency_ms: u64) -> Self {
        match latency_ms {
            l if l < EXCELLENT_BELOW_MS => NetworkQuality::Excellent,
            l if l < GOOD_BELOW_MS => NetworkQuality::Good,
            l if l < LATENCY_UNREACHABLE_MS => NetworkQuality::Poor,
            _ => NetworkQuality::Offline,
        }
    }

    /// Seconds between scheduled upload attempts
    pub fn interval_secs(self) -> u64 {
        match self {
            NetworkQuality::Excellent => 10,
            NetworkQuality::Good => 20,
            NetworkQuality::Poor => 40,
            NetworkQuality::Offline => 60,
        }
    }

    /// Time between scheduled upload attempts (poll interval when offline)
    pub fn upload_interval(self) -> Duration {
        Duration::from_secs(self.interval_secs())
    }

    /// Maximum rows per upload; one interval's worth of samples
    pub fn batch_size(self) -> usize {
        match self {
            NetworkQuality::Offline => 0,
            online => online.interval_secs() as usize * SAMPLE_RATE_HZ,
        }
    }

    pub fn is_online(self) -> bool {
        self != NetworkQuality::Offline
    }

    /// Stable lowercase name, as stored in upload statistics
    pub fn label(self) -> &'static str {
        match self {
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Offline => "offline",
        }
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_table() {
        let table = [
            (NetworkQuality::Excellent, 250, 10),
            (NetworkQuality::Good, 500, 20),
            (NetworkQuality::Poor, 1000, 40),
            (NetworkQuality::Offline, 0, 60),
        ];

        for (quality, batch, secs) in table {
            assert_eq!(quality.batch_size(), batch, "{}", quality);
            assert_eq!(quality.upload_interval(), Duration::from_secs(secs), "{}", quality);
        }
    }

    #[test]
    fn test_batch_covers_one_interval() {
        for quality in [NetworkQuality::Excellent, NetworkQuality::Good, NetworkQuality::Poor] {
            assert_eq!(quality.batch_size(), quality.interval_secs() as usize * SAMPLE_RATE_HZ);
        }
    }

    #[test]
    fn test_latency_boundaries() {
        assert_eq!(NetworkQuality::from_latency_ms(0), NetworkQuality::Excellent);
        assert_eq!(NetworkQuality::from_latency_ms(95), NetworkQuality::Excellent);
        assert_eq!(NetworkQuality::from_latency_ms(99), NetworkQuality::Excellent);
        assert_eq!(NetworkQuality::from_latency_ms(100), NetworkQuality::Good);
        assert_eq!(NetworkQuality::from_latency_ms(150), NetworkQuality::Good);
        assert_eq!(NetworkQuality::from_latency_ms(299), NetworkQuality::Good);
        assert_eq!(NetworkQuality::from_latency_ms(300), NetworkQuality::Poor);
        assert_eq!(NetworkQuality::from_latency_ms(350), NetworkQuality::Poor);
        assert_eq!(NetworkQuality::from_latency_ms(9_998), NetworkQuality::Poor);
    }

    #[test]
    fn test_unreachable_sentinel_is_offline() {
        assert_eq!(NetworkQuality::from_latency_ms(LATENCY_UNREACHABLE_MS), NetworkQuality::Offline);
        assert!(!NetworkQuality::Offline.is_online());
        assert!(NetworkQuality::Poor.is_online());
    }

    #[test]
    fn test_labels() {
        assert_eq!(NetworkQuality::Excellent.to_string(), "excellent");
        assert_eq!(serde_json::to_string(&NetworkQuality::Poor).unwrap(), "\"poor\"");
    }
}
