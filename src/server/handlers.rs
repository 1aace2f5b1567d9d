use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive},
        IntoResponse, Json, Response, Sse,
    },
};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, error, warn};

use crate::events::{ProximityData, ProximityEvent};
use crate::issues::{IssueId, IssueSummary};
use crate::location::{LocationError, TrackerState};
use crate::proximity::{lock_engine, NearbyView};

use super::state::AppState;

pub async fn get_position(State(state): State<AppState>) -> Json<TrackerState> {
    Json(state.tracker.state())
}

pub async fn get_nearby(State(state): State<AppState>) -> Json<NearbyView> {
    Json(lock_engine(&state.engine).nearby())
}

#[derive(Debug, Serialize)]
pub struct EncounteredResponse {
    pub issues: Vec<IssueSummary>,
    /// Ids remembered from earlier sessions that no fetch has described yet.
    pub pending_ids: Vec<IssueId>,
    pub total: usize,
}

pub async fn get_encountered(State(state): State<AppState>) -> Json<EncounteredResponse> {
    let engine = lock_engine(&state.engine);
    Json(EncounteredResponse {
        issues: engine.encountered(),
        pending_ids: engine.pending_encountered_ids(),
        total: engine.encountered_count(),
    })
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub cleared: usize,
}

pub async fn reset_encountered(State(state): State<AppState>) -> Json<ResetResponse> {
    let cleared = {
        let mut engine = lock_engine(&state.engine);
        let cleared = engine.encountered_count();
        engine.reset_encountered();
        cleared
    };
    let _ = state.event_sender.send(ProximityEvent::new(
        ProximityEvent::ENCOUNTERED_RESET,
        ProximityData {
            encountered_ids: Some(Vec::new()),
            encountered_total: Some(0),
            message: Some("Encountered issues reset".to_string()),
            ..Default::default()
        },
    ));
    Json(ResetResponse { cleared })
}

#[derive(Debug, Serialize)]
pub struct VouchResponse {
    pub id: IssueId,
    pub vouched: bool,
    pub newly_added: bool,
}

pub async fn vouch_issue(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<VouchResponse>, StatusCode> {
    let id = IssueId::from(id.trim());
    if id.as_str().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let newly_added = state
        .vouches
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record_vouch(id.clone());
    Ok(Json(VouchResponse {
        id,
        vouched: true,
        newly_added,
    }))
}

fn header_value(value: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Takes a raw photo body and returns the geotagged, size-bounded JPEG.
pub async fn geotag_photo(State(state): State<AppState>, body: Bytes) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "Empty image body").into_response();
    }

    let captured = match state.capture.process(body.to_vec()).await {
        Ok(captured) => captured,
        Err(e) => {
            if let Some(LocationError::PermissionDenied) = e.downcast_ref::<LocationError>() {
                warn!("Geotag refused: location permission denied");
                return (StatusCode::FORBIDDEN, LocationError::PermissionDenied.to_string()).into_response();
            }
            error!("Geotag failed: {:#}", e);
            return (StatusCode::UNPROCESSABLE_ENTITY, format!("{:#}", e)).into_response();
        }
    };

    let compression = &captured.compression;
    let mut response = Response::new(captured.bytes.clone().into());
    let headers = response.headers_mut();
    let content_type = if captured.is_geotagged() || compression.quality.is_some() {
        "image/jpeg"
    } else {
        "application/octet-stream"
    };
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        "x-compression-quality",
        header_value(
            compression
                .quality
                .map(|q| format!("{:.1}", q))
                .unwrap_or_else(|| "original".to_string()),
        ),
    );
    headers.insert("x-compression-attempts", header_value(compression.attempts));
    headers.insert("x-compression-bytes", header_value(compression.size));
    headers.insert("x-within-budget", header_value(compression.within_budget));
    headers.insert("x-geotagged", header_value(captured.is_geotagged()));
    if let Some(address) = &captured.address {
        headers.insert("x-address", header_value(&address.formatted));
    }
    debug!("Returning {} byte photo", captured.bytes.len());
    response
}

const SSE_BUFFER: usize = 100;
const HEARTBEAT_EVERY: Duration = Duration::from_secs(30);
const KEEP_ALIVE_EVERY: Duration = Duration::from_secs(15);

fn sse_event(event: &ProximityEvent) -> SseEvent {
    SseEvent::default()
        .event(event.event_type.clone())
        .json_data(event)
        .unwrap_or_else(|e| SseEvent::default().comment(format!("dropped {}: {}", event.event_type, e)))
}

/// Copies scheduler events to one SSE client until either side goes away.
/// A heartbeat event goes out when nothing else has for a while.
async fn forward_events(
    mut events: broadcast::Receiver<ProximityEvent>,
    client: mpsc::Sender<Result<SseEvent, Infallible>>,
) {
    let mut heartbeat = tokio::time::interval_at(Instant::now() + HEARTBEAT_EVERY, HEARTBEAT_EVERY);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    heartbeat.reset();
                    event
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE client lagged, {} events dropped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => ProximityEvent::new(
                ProximityEvent::HEARTBEAT,
                ProximityData {
                    message: Some("SSE connection alive".to_string()),
                    ..Default::default()
                },
            ),
            _ = client.closed() => break,
        };
        if client.send(Ok(sse_event(&event))).await.is_err() {
            break;
        }
    }
    debug!("SSE client disconnected");
}

pub async fn proximity_events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = mpsc::channel(SSE_BUFFER);
    tokio::spawn(forward_events(state.event_sender.subscribe(), tx));
    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_EVERY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn forwarder_relays_events_and_heartbeats() {
        let (events, _) = broadcast::channel(4);
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(forward_events(events.subscribe(), tx));

        events
            .send(ProximityEvent::new(ProximityEvent::ISSUES_UPDATED, ProximityData::default()))
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Ok(_))));

        let quiet_since = Instant::now();
        assert!(matches!(rx.recv().await, Some(Ok(_))));
        assert!(quiet_since.elapsed() >= HEARTBEAT_EVERY);

        drop(rx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn forwarder_stops_when_scheduler_goes_away() {
        let (events, _) = broadcast::channel::<ProximityEvent>(4);
        let (tx, _rx) = mpsc::channel(4);
        let task = tokio::spawn(forward_events(events.subscribe(), tx));
        drop(events);
        task.await.unwrap();
    }
}
