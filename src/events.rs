use serde::{Deserialize, Serialize};

use crate::geo::PositionSample;
use crate::issues::IssueId;
use crate::location::LocationError;
use crate::proximity::NearbyStatus;

// Change notifications published by the refresh scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityEvent {
    pub event_type: String,
    pub data: ProximityData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProximityData {
    pub position: Option<PositionSample>,
    pub issue_count: Option<usize>,
    /// Set on `nearby_changed`; `nearby_ids` is only present when `located`.
    pub nearby_status: Option<NearbyStatus>,
    pub nearby_ids: Option<Vec<IssueId>>,
    pub encountered_ids: Option<Vec<IssueId>>,
    pub encountered_total: Option<usize>,
    pub location_error: Option<LocationError>,
    pub message: Option<String>,
}

impl ProximityEvent {
    pub const POSITION_UPDATED: &'static str = "position_updated";
    pub const ISSUES_UPDATED: &'static str = "issues_updated";
    pub const NEARBY_CHANGED: &'static str = "nearby_changed";
    pub const ENCOUNTERED_ADDED: &'static str = "encountered_added";
    pub const ENCOUNTERED_RESET: &'static str = "encountered_reset";
    pub const LOCATION_ERROR: &'static str = "location_error";
    pub const FETCH_FAILED: &'static str = "fetch_failed";
    pub const HEARTBEAT: &'static str = "heartbeat";

    pub fn new(event_type: &str, data: ProximityData) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
        }
    }
}
