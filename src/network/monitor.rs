//! Latency probing and quality classification.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::quality::{NetworkQuality, LATENCY_UNREACHABLE_MS};

/// Default health probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Measures round-trip latency to the collector
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Elapsed milliseconds of a healthy round trip, or
    /// [`LATENCY_UNREACHABLE_MS`] on any failure. Never fails.
    async fn measure_latency(&self) -> u64;
}

/// Device-level connectivity, checked before any network round trip
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
}

impl Connectivity for watch::Receiver<bool> {
    fn is_connected(&self) -> bool {
        *self.borrow()
    }
}

/// Latency probe timing a GET against the collector health endpoint
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Create a probe
    ///
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client
    /// * `url` - Full health endpoint URL (e.g. "http://collector:8080/api/v1/health")
    /// * `timeout` - Upper bound for one probe
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LatencyProbe for HttpHealthProbe {
    async fn measure_latency(&self) -> u64 {
        let started = Instant::now();

        match self.client.get(&self.url).timeout(self.timeout).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                let elapsed = started.elapsed().as_millis() as u64;
                elapsed.min(LATENCY_UNREACHABLE_MS - 1)
            }
            Ok(response) => {
                debug!("Health probe returned {}", response.status());
                LATENCY_UNREACHABLE_MS
            }
            Err(e) => {
                debug!("Health probe failed: {}", e);
                LATENCY_UNREACHABLE_MS
            }
        }
    }
}

/// Classifies the current link quality
#[derive(Clone)]
pub struct NetworkMonitor {
    probe: Arc<dyn LatencyProbe>,
    connectivity: Arc<dyn Connectivity>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor").finish_non_exhaustive()
    }
}

impl NetworkMonitor {
    pub fn new(probe: Arc<dyn LatencyProbe>, connectivity: Arc<dyn Connectivity>) -> Self {
        Self { probe, connectivity }
    }

    /// Current quality tier
    ///
    /// Returns Offline without touching the network when the device reports no
    /// connectivity; otherwise probes latency and classifies it.
    pub async fn current_quality(&self) -> NetworkQuality {
        if !self.connectivity.is_connected() {
            debug!("No device connectivity, skipping latency probe");
            return NetworkQuality::Offline;
        }

        let latency_ms = self.probe.measure_latency().await;
        let quality = NetworkQuality::from_latency_ms(latency_ms);
        debug!("Measured {}ms latency, quality {}", latency_ms, quality);
        quality
    }
}

/// Tracks whether the collector host is reachable at the TCP level
///
/// Publishes changes on a `watch` channel; the receiver doubles as the
/// [`Connectivity`] source of a [`NetworkMonitor`] and as the scheduler's
/// connectivity-change event stream.
#[derive(Debug)]
pub struct LinkWatcher {
    addr: String,
    interval: Duration,
    connect_timeout: Duration,
    tx: watch::Sender<bool>,
}

impl LinkWatcher {
    /// Create a watcher for `addr` ("host:port"), initially reporting `initial`
    pub fn new(addr: impl Into<String>, interval: Duration, initial: bool) -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(initial);
        let watcher = Self {
            addr: addr.into(),
            interval,
            connect_timeout: Duration::from_secs(2),
            tx,
        };
        (watcher, rx)
    }

    /// Check reachability once and publish the result if it changed
    ///
    /// # Returns
    ///
    /// * `bool` - Whether the host is reachable now
    pub async fn check(&self) -> bool {
        let reachable = matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        );

        let changed = self.tx.send_if_modified(|current| {
            if *current != reachable {
                *current = reachable;
                true
            } else {
                false
            }
        });

        if changed {
            if reachable {
                info!("Collector {} reachable", self.addr);
            } else {
                warn!("Collector {} unreachable", self.addr);
            }
        }
        reachable
    }

    /// Check periodically until every receiver is gone
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.tx.is_closed() {
            ticker.tick().await;
            self.check().await;
        }
        debug!("Link watcher for {} stopped", self.addr);
    }
}
