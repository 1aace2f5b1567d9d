//! Device position tracking.
//!
//! [`LocationTracker`] wraps a [`PositionProvider`] (the platform positioning
//! capability) and owns the most recent fix. It offers a one-shot read that
//! honours the accuracy/timeout/staleness options, and a background watch
//! that publishes [`TrackerState`] updates on a `tokio::sync::watch` channel.
//! The tracker never retries on its own; callers decide what a failure means.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::*;
use crate::geo::{Coordinate, PositionSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationError {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
}

impl fmt::Display for LocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "Location access denied by user"),
            Self::PositionUnavailable => write!(f, "Location information unavailable"),
            Self::Timeout => write!(f, "Location request timed out"),
        }
    }
}

impl std::error::Error for LocationError {}

/// Options recognised by both the one-shot read and the watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    /// A cached fix younger than this is returned without asking the device.
    pub max_age_ms: u64,
    #[serde(default = "default_watch_interval")]
    pub watch_interval_ms: u64,
}

fn default_watch_interval() -> u64 {
    DEFAULT_WATCH_INTERVAL_MS
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout_ms: DEFAULT_LOCATION_TIMEOUT_MS,
            max_age_ms: DEFAULT_LOCATION_MAX_AGE_MS,
            watch_interval_ms: DEFAULT_WATCH_INTERVAL_MS,
        }
    }
}

/// The platform positioning capability.
pub trait PositionProvider: Send + Sync + 'static {
    fn read(
        &self,
        high_accuracy: bool,
    ) -> impl Future<Output = Result<PositionSample, LocationError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrackerState {
    /// No fix yet; the UI shows "locating...".
    Locating,
    Fixed { sample: PositionSample },
    Failed { error: LocationError },
}

struct Shared {
    state_tx: watch::Sender<TrackerState>,
    last_fix: Mutex<Option<PositionSample>>,
}

impl Shared {
    fn publish(&self, result: &Result<PositionSample, LocationError>) {
        match result {
            Ok(sample) => {
                if let Ok(mut last) = self.last_fix.lock() {
                    *last = Some(*sample);
                }
                self.state_tx.send_replace(TrackerState::Fixed { sample: *sample });
            }
            Err(e) => {
                self.state_tx.send_replace(TrackerState::Failed { error: *e });
            }
        }
    }

    fn last_fix(&self) -> Option<PositionSample> {
        self.last_fix.lock().ok().and_then(|guard| *guard)
    }
}

struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct LocationTracker<P> {
    provider: Arc<P>,
    shared: Arc<Shared>,
    watcher: Mutex<Option<Watcher>>,
}

impl<P: PositionProvider> LocationTracker<P> {
    pub fn new(provider: P) -> Self {
        let (state_tx, _) = watch::channel(TrackerState::Locating);
        Self {
            provider: Arc::new(provider),
            shared: Arc::new(Shared {
                state_tx,
                last_fix: Mutex::new(None),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TrackerState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerState> {
        self.shared.state_tx.subscribe()
    }

    /// The most recent successful fix, regardless of later failures.
    pub fn latest(&self) -> Option<PositionSample> {
        self.shared.last_fix()
    }

    /// Resolves once with a fix satisfying `config`, or fails.
    pub async fn get_current_position(
        &self,
        config: &LocationConfig,
    ) -> Result<PositionSample, LocationError> {
        // A max age of zero always asks the device.
        if let Some(sample) = self.latest().filter(|_| config.max_age_ms > 0) {
            if sample.age_ms(Utc::now()) <= config.max_age_ms {
                debug!("Using cached fix ({} ms old)", sample.age_ms(Utc::now()));
                return Ok(sample);
            }
        }

        let result = read_with_timeout(self.provider.as_ref(), config).await;
        self.shared.publish(&result);
        result
    }

    /// Starts continuous tracking. Calling it while already watching
    /// restarts the watch with the new `config`.
    pub fn start_watching(&self, config: LocationConfig) -> watch::Receiver<TrackerState> {
        self.stop_watching();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let provider = Arc::clone(&self.provider);
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            let period = Duration::from_millis(config.watch_interval_ms.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let result = read_with_timeout(provider.as_ref(), &config).await;
                        shared.publish(&result);
                        match result {
                            Ok(sample) => debug!("Watch fix {}", sample.coordinate),
                            Err(LocationError::PermissionDenied) => {
                                error!("Location permission denied, stopping watch");
                                break;
                            }
                            Err(e) => warn!("Watch error: {}", e),
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });

        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(Watcher { cancel, handle });
        }
        info!("Location watch started");
        self.subscribe()
    }

    /// Releases the background watch. Safe to call repeatedly.
    pub fn stop_watching(&self) {
        let watcher = self.watcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(watcher) = watcher {
            watcher.cancel.cancel();
            watcher.handle.abort();
            info!("Location watch stopped");
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|w| !w.handle.is_finished()))
            .unwrap_or(false)
    }
}

impl<P> Drop for LocationTracker<P> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.watcher.lock() {
            if let Some(watcher) = slot.take() {
                watcher.cancel.cancel();
                watcher.handle.abort();
            }
        }
    }
}

async fn read_with_timeout<P: PositionProvider>(
    provider: &P,
    config: &LocationConfig,
) -> Result<PositionSample, LocationError> {
    let limit = Duration::from_millis(config.timeout_ms);
    match tokio::time::timeout(limit, provider.read(config.high_accuracy)).await {
        Ok(result) => result,
        Err(_) => Err(LocationError::Timeout),
    }
}

/// Fixed, manually configured position.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    pub coordinate: Coordinate,
}

impl PositionProvider for StaticProvider {
    fn read(
        &self,
        _high_accuracy: bool,
    ) -> impl Future<Output = Result<PositionSample, LocationError>> + Send {
        let coordinate = self.coordinate;
        async move {
            if coordinate.is_valid() {
                Ok(PositionSample::new(coordinate, None))
            } else {
                Err(LocationError::PositionUnavailable)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    lat: Option<f64>,
    lon: Option<f64>,
}

/// Coarse position from IP geolocation (ip-api.com JSON shape).
pub struct IpApiProvider {
    client: reqwest::Client,
    url: String,
}

impl IpApiProvider {
    pub const DEFAULT_URL: &'static str = "http://ip-api.com/json";
    // City-level at best.
    const ACCURACY_M: f64 = 5_000.0;

    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl PositionProvider for IpApiProvider {
    fn read(
        &self,
        _high_accuracy: bool,
    ) -> impl Future<Output = Result<PositionSample, LocationError>> + Send {
        async move {
            let response = self.client.get(&self.url).send().await.map_err(|e| {
                warn!("IP geolocation request failed: {}", e);
                if e.is_timeout() {
                    LocationError::Timeout
                } else {
                    LocationError::PositionUnavailable
                }
            })?;

            let body: IpApiResponse = response.json().await.map_err(|e| {
                warn!("IP geolocation response unreadable: {}", e);
                LocationError::PositionUnavailable
            })?;

            match (body.status.as_str(), body.lat, body.lon) {
                ("success", Some(lat), Some(lon)) => {
                    let coordinate = Coordinate::new(lat, lon);
                    if coordinate.is_valid() {
                        Ok(PositionSample::new(coordinate, Some(Self::ACCURACY_M)))
                    } else {
                        Err(LocationError::PositionUnavailable)
                    }
                }
                _ => Err(LocationError::PositionUnavailable),
            }
        }
    }
}

/// Provider chosen from configuration for the daemon.
pub enum DeviceProvider {
    Static(StaticProvider),
    IpApi(IpApiProvider),
}

impl PositionProvider for DeviceProvider {
    fn read(
        &self,
        high_accuracy: bool,
    ) -> impl Future<Output = Result<PositionSample, LocationError>> + Send {
        async move {
            match self {
                DeviceProvider::Static(p) => p.read(high_accuracy).await,
                DeviceProvider::IpApi(p) => p.read(high_accuracy).await,
            }
        }
    }
}
