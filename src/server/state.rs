use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::capture::CapturePipeline;
use crate::events::ProximityEvent;
use crate::location::{DeviceProvider, LocationTracker};
use crate::persistence::VouchLedger;
use crate::proximity::SharedEngine;

// Everything the handlers read or mutate
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<LocationTracker<DeviceProvider>>,
    pub engine: SharedEngine,
    pub vouches: Arc<Mutex<VouchLedger>>,
    pub capture: Arc<CapturePipeline<DeviceProvider>>,
    pub event_sender: broadcast::Sender<ProximityEvent>,
}
