//! Periodic position and issue-list refresh.
//!
//! Two independent loops share one interval and one cancellation token. Each
//! loop awaits its job inline, so a slow job swallows the ticks that fall due
//! while it runs (skip-if-busy) instead of stacking up calls.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{ProximityData, ProximityEvent};
use crate::issues::{IssueId, IssueSource};
use crate::location::{LocationConfig, LocationError, LocationTracker, PositionProvider};
use crate::proximity::{lock_engine, NearbyStatus, RecomputeOutcome, SharedEngine};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub location: LocationConfig,
}

// State the two loops publish through.
struct Publisher {
    engine: SharedEngine,
    events: broadcast::Sender<ProximityEvent>,
    last_nearby: Mutex<Option<(NearbyStatus, Vec<IssueId>)>>,
}

impl Publisher {
    fn send(&self, event_type: &str, data: ProximityData) {
        // No subscribers is fine.
        let _ = self.events.send(ProximityEvent::new(event_type, data));
    }

    fn publish_outcome(&self, outcome: RecomputeOutcome, encountered_total: usize) {
        if !outcome.newly_encountered.is_empty() {
            self.send(
                ProximityEvent::ENCOUNTERED_ADDED,
                ProximityData {
                    encountered_ids: Some(outcome.newly_encountered),
                    encountered_total: Some(encountered_total),
                    ..Default::default()
                },
            );
        }

        // Nothing to report until a list has been fetched.
        if outcome.status == NearbyStatus::Unknown {
            return;
        }
        let current = (outcome.status, outcome.nearby_ids);
        let changed = match self.last_nearby.lock() {
            Ok(mut last) => {
                let changed = last.as_ref() != Some(&current);
                *last = Some(current.clone());
                changed
            }
            Err(_) => true,
        };
        if changed {
            let (status, nearby_ids) = current;
            self.send(
                ProximityEvent::NEARBY_CHANGED,
                ProximityData {
                    nearby_status: Some(status),
                    // While locating every issue is shown, not none of them.
                    nearby_ids: (status == NearbyStatus::Located).then_some(nearby_ids),
                    ..Default::default()
                },
            );
        }
    }

    async fn refresh_position<P: PositionProvider>(&self, tracker: &LocationTracker<P>, config: &LocationConfig) {
        match tracker.get_current_position(config).await {
            Ok(sample) => {
                let (outcome, total) = {
                    let mut engine = lock_engine(&self.engine);
                    engine.set_position(sample);
                    let outcome = engine.recompute();
                    (outcome, engine.encountered_count())
                };
                debug!("Position refreshed: {}", sample.coordinate);
                self.send(
                    ProximityEvent::POSITION_UPDATED,
                    ProximityData {
                        position: Some(sample),
                        ..Default::default()
                    },
                );
                self.publish_outcome(outcome, total);
            }
            Err(e) => {
                let cleared = if e == LocationError::PermissionDenied {
                    error!("Location permission denied, showing all issues");
                    let mut engine = lock_engine(&self.engine);
                    engine.clear_position();
                    Some((engine.recompute(), engine.encountered_count()))
                } else {
                    warn!("Location refresh failed: {}, keeping last position", e);
                    None
                };
                self.send(
                    ProximityEvent::LOCATION_ERROR,
                    ProximityData {
                        location_error: Some(e),
                        message: Some(e.to_string()),
                        ..Default::default()
                    },
                );
                if let Some((outcome, total)) = cleared {
                    self.publish_outcome(outcome, total);
                }
            }
        }
    }

    async fn refresh_issues<S: IssueSource>(&self, source: &S) {
        match source.fetch().await {
            Ok(issues) => {
                let count = issues.len();
                let (outcome, total) = {
                    let mut engine = lock_engine(&self.engine);
                    engine.set_issues(issues);
                    let outcome = engine.recompute();
                    (outcome, engine.encountered_count())
                };
                debug!("Issue list refreshed: {} issues", count);
                self.send(
                    ProximityEvent::ISSUES_UPDATED,
                    ProximityData {
                        issue_count: Some(count),
                        ..Default::default()
                    },
                );
                self.publish_outcome(outcome, total);
            }
            Err(e) => {
                warn!("Issue fetch failed, keeping previous list: {:#}", e);
                self.send(
                    ProximityEvent::FETCH_FAILED,
                    ProximityData {
                        message: Some(format!("{:#}", e)),
                        ..Default::default()
                    },
                );
            }
        }
    }
}

async fn run_every<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let started = Instant::now();
                tokio::select! {
                    _ = job() => {}
                    _ = cancel.cancelled() => break,
                }
                if started.elapsed() > period {
                    debug!("{} refresh overran the {:?} interval, skipping missed ticks", name, period);
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    debug!("{} refresh loop stopped", name);
}

pub struct RefreshScheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl RefreshScheduler {
    /// Spawns the position and issue loops. The first run of each happens
    /// immediately.
    pub fn start<P, S>(
        tracker: Arc<LocationTracker<P>>,
        source: Arc<S>,
        engine: SharedEngine,
        events: broadcast::Sender<ProximityEvent>,
        config: SchedulerConfig,
    ) -> Self
    where
        P: PositionProvider,
        S: IssueSource,
    {
        let cancel = CancellationToken::new();
        let period = config.interval.max(Duration::from_millis(1));
        let publisher = Arc::new(Publisher {
            engine,
            events,
            last_nearby: Mutex::new(None),
        });

        let location_handle = {
            let publisher = Arc::clone(&publisher);
            let location = config.location;
            tokio::spawn(run_every("position", period, cancel.clone(), move || {
                let publisher = Arc::clone(&publisher);
                let tracker = Arc::clone(&tracker);
                let location = location.clone();
                async move { publisher.refresh_position(&tracker, &location).await }
            }))
        };

        let issues_handle = tokio::spawn(run_every("issues", period, cancel.clone(), move || {
            let publisher = Arc::clone(&publisher);
            let source = Arc::clone(&source);
            async move { publisher.refresh_issues(source.as_ref()).await }
        }));

        info!("Refresh scheduler started ({:?} interval)", period);
        Self {
            cancel,
            handles: vec![location_handle, issues_handle],
        }
    }

    /// Cancels both loops and waits for them to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            handle.await.context("refresh loop failed to join")?;
        }
        info!("Refresh scheduler stopped");
        Ok(())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
