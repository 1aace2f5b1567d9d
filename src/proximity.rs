//! Nearby/encountered classification of issues around the user.
//!
//! The engine holds the latest position, the latest fetched issue list and
//! the encountered set. "Nearby" is derived on demand from position x issues;
//! "encountered" only ever grows (until [`ProximityEngine::reset_encountered`]).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

use crate::geo::{distance, PositionSample};
use crate::issues::{IssueId, IssueSummary};
use crate::persistence::{IdStore, PersistedIdSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "issues", rename_all = "snake_case")]
pub enum NearbyView {
    /// No issue list has been fetched yet.
    Unknown,
    /// Issues are known but the position is not; every issue is shown.
    Locating(Vec<IssueSummary>),
    Located(Vec<IssueSummary>),
}

/// Which of the three nearby views is current, without the issues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NearbyStatus {
    #[default]
    Unknown,
    Locating,
    Located,
}

impl NearbyView {
    pub fn status(&self) -> NearbyStatus {
        match self {
            NearbyView::Unknown => NearbyStatus::Unknown,
            NearbyView::Locating(_) => NearbyStatus::Locating,
            NearbyView::Located(_) => NearbyStatus::Located,
        }
    }

    pub fn issues(&self) -> &[IssueSummary] {
        match self {
            NearbyView::Unknown => &[],
            NearbyView::Locating(issues) | NearbyView::Located(issues) => issues,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecomputeOutcome {
    /// Matches [`ProximityEngine::nearby`]; `nearby_ids` only means
    /// something when this is `Located`.
    pub status: NearbyStatus,
    /// Ids currently within the radius (empty unless located).
    pub nearby_ids: Vec<IssueId>,
    pub newly_encountered: Vec<IssueId>,
}

/// The engine as shared between the scheduler and the HTTP handlers.
pub type SharedEngine = Arc<Mutex<ProximityEngine>>;

/// Locks the engine, recovering the state if a holder panicked.
pub fn lock_engine(engine: &Mutex<ProximityEngine>) -> MutexGuard<'_, ProximityEngine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ProximityEngine {
    radius_m: f64,
    position: Option<PositionSample>,
    issues: Option<Vec<IssueSummary>>,
    encountered_ids: PersistedIdSet,
    encountered: HashMap<IssueId, IssueSummary>,
}

impl ProximityEngine {
    pub fn new(radius_m: f64, store: Box<dyn IdStore>) -> Self {
        Self {
            radius_m,
            position: None,
            issues: None,
            encountered_ids: PersistedIdSet::load(store),
            encountered: HashMap::new(),
        }
    }

    pub fn shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    pub fn position(&self) -> Option<&PositionSample> {
        self.position.as_ref()
    }

    pub fn set_position(&mut self, sample: PositionSample) {
        self.position = Some(sample);
    }

    pub fn clear_position(&mut self) {
        self.position = None;
    }

    pub fn issues(&self) -> Option<&[IssueSummary]> {
        self.issues.as_deref()
    }

    /// Replaces the working set with a freshly fetched list.
    pub fn set_issues(&mut self, issues: Vec<IssueSummary>) {
        self.issues = Some(issues);
    }

    fn within_radius<'a>(
        &self,
        position: &PositionSample,
        issues: &'a [IssueSummary],
    ) -> impl Iterator<Item = &'a IssueSummary> + 'a {
        let origin = position.coordinate;
        let radius = self.radius_m;
        issues.iter().filter(move |issue| {
            issue
                .coordinate()
                .is_some_and(|c| distance(origin, c) <= radius)
        })
    }

    pub fn nearby(&self) -> NearbyView {
        match (&self.issues, &self.position) {
            (None, _) => NearbyView::Unknown,
            (Some(issues), None) => NearbyView::Locating(issues.clone()),
            (Some(issues), Some(position)) => {
                NearbyView::Located(self.within_radius(position, issues).cloned().collect())
            }
        }
    }

    /// Classifies the current list against the current position and folds
    /// nearby issues into the encountered set.
    pub fn recompute(&mut self) -> RecomputeOutcome {
        let (issues, position) = match (&self.issues, &self.position) {
            (Some(issues), Some(position)) => (issues, position),
            (None, _) => return RecomputeOutcome::default(),
            (Some(_), None) => {
                return RecomputeOutcome {
                    status: NearbyStatus::Locating,
                    ..Default::default()
                }
            }
        };

        let nearby: Vec<IssueSummary> = self.within_radius(position, issues).cloned().collect();

        // Keep summaries of already-encountered issues (including ids restored
        // from disk) in step with the latest fetch.
        for issue in issues {
            if self.encountered_ids.contains(&issue.id) {
                self.encountered.insert(issue.id.clone(), issue.clone());
            }
        }

        let fresh: Vec<IssueSummary> = nearby
            .iter()
            .filter(|issue| !self.encountered_ids.contains(&issue.id))
            .cloned()
            .collect();

        let mut newly_encountered = Vec::new();
        for issue in fresh {
            if self.encountered_ids.insert(issue.id.clone()) {
                newly_encountered.push(issue.id.clone());
            }
            self.encountered.insert(issue.id.clone(), issue);
        }

        if !newly_encountered.is_empty() {
            info!("Added {} new issues to encountered list", newly_encountered.len());
        }

        RecomputeOutcome {
            status: NearbyStatus::Located,
            nearby_ids: nearby.into_iter().map(|i| i.id).collect(),
            newly_encountered,
        }
    }

    /// Encountered issues in first-encounter order.
    pub fn encountered(&self) -> Vec<IssueSummary> {
        self.encountered_ids
            .ids()
            .iter()
            .filter_map(|id| self.encountered.get(id).cloned())
            .collect()
    }

    /// Encountered ids restored from storage whose summary has not been seen
    /// in a fetch yet.
    pub fn pending_encountered_ids(&self) -> Vec<IssueId> {
        self.encountered_ids
            .ids()
            .iter()
            .filter(|id| !self.encountered.contains_key(*id))
            .cloned()
            .collect()
    }

    pub fn encountered_count(&self) -> usize {
        self.encountered_ids.len()
    }

    pub fn is_encountered(&self, id: &IssueId) -> bool {
        self.encountered_ids.contains(id)
    }

    pub fn reset_encountered(&mut self) {
        self.encountered_ids.clear();
        self.encountered.clear();
        info!("Encountered issues cleared");
    }
}
