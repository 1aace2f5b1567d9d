use std::sync::{Arc, Mutex};
use std::time::Duration;

use civic_proximity::capture::{CaptureConfig, CapturePipeline};
use civic_proximity::compression::{JpegEncoder, TurboJpegEncoder};
use civic_proximity::geo::{distance, Coordinate, PositionSample};
use civic_proximity::geocoding::{NominatimProvider, ReverseGeocoder};
use civic_proximity::issues::{IssueId, IssueSummary};
use civic_proximity::location::{DeviceProvider, LocationConfig, LocationTracker, StaticProvider};
use civic_proximity::persistence::{MemoryStore, VouchLedger};
use civic_proximity::proximity::{lock_engine, NearbyView, ProximityEngine};
use civic_proximity::server::{serve, state::AppState};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const USER: Coordinate = Coordinate::new(12.9716, 77.5946);
const ISSUE: Coordinate = Coordinate::new(12.9717, 77.5947);

fn metres_north(from: Coordinate, m: f64) -> Coordinate {
    Coordinate::new(from.latitude + (m / 6_371_000.0_f64).to_degrees(), from.longitude)
}

#[test]
fn walking_away_keeps_issue_encountered() {
    assert!(distance(USER, ISSUE) < 30.0);

    let store = MemoryStore::default();
    let mut engine = ProximityEngine::new(30.0, Box::new(store.clone()));
    engine.set_issues(vec![IssueSummary::new(101u64, "Broken streetlight", Some(ISSUE))]);
    engine.set_position(PositionSample::new(USER, Some(5.0)));

    let outcome = engine.recompute();
    assert_eq!(outcome.nearby_ids, vec![IssueId::from("101")]);
    assert_eq!(outcome.newly_encountered, vec![IssueId::from("101")]);

    engine.set_position(PositionSample::new(metres_north(USER, 200.0), Some(5.0)));
    let outcome = engine.recompute();
    assert!(outcome.nearby_ids.is_empty());
    assert!(outcome.newly_encountered.is_empty());

    assert_eq!(engine.nearby(), NearbyView::Located(vec![]));
    let encountered: Vec<_> = engine.encountered().into_iter().map(|i| i.id).collect();
    assert_eq!(encountered, vec![IssueId::from("101")]);
    assert_eq!(store.snapshot(), vec![IssueId::from("101")]);
}

#[test]
fn encountered_history_survives_restart() {
    let store = MemoryStore::default();
    {
        let mut engine = ProximityEngine::new(30.0, Box::new(store.clone()));
        engine.set_issues(vec![IssueSummary::new(7u64, "Pothole", Some(ISSUE))]);
        engine.set_position(PositionSample::new(USER, None));
        engine.recompute();
    }

    let engine = ProximityEngine::new(30.0, Box::new(store));
    assert!(engine.is_encountered(&IssueId::from("7")));
    assert_eq!(engine.pending_encountered_ids(), vec![IssueId::from("7")]);
    assert_eq!(engine.nearby(), NearbyView::Unknown);
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    state: AppState,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        let provider = DeviceProvider::Static(StaticProvider { coordinate: USER });
        let tracker = Arc::new(LocationTracker::new(provider));
        let geocoder = Arc::new(
            ReverseGeocoder::new(
                vec![Box::new(NominatimProvider::new("http://127.0.0.1:9/reverse"))],
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let capture = Arc::new(CapturePipeline::new(
            Arc::clone(&tracker),
            geocoder,
            CaptureConfig {
                location: LocationConfig {
                    max_age_ms: 0,
                    ..LocationConfig::default()
                },
                ..CaptureConfig::default()
            },
        ));
        let (event_sender, _) = broadcast::channel(16);
        let state = AppState {
            tracker,
            engine: ProximityEngine::new(30.0, Box::new(MemoryStore::default())).shared(),
            vouches: Arc::new(Mutex::new(VouchLedger::load(Box::new(MemoryStore::default())))),
            capture,
            event_sender,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, state.clone(), shutdown.clone()));

        Self {
            base,
            client: reqwest::Client::new(),
            state,
            shutdown,
        }
    }

    async fn get_json(&self, path: &str) -> Value {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn nearby_endpoint_reports_each_phase() {
    let server = TestServer::start().await;

    assert_eq!(server.get_json("/api/nearby").await["status"], "unknown");

    lock_engine(&server.state.engine).set_issues(vec![
        IssueSummary::new(1u64, "here", Some(ISSUE)),
        IssueSummary::new(2u64, "far", Some(metres_north(USER, 500.0))),
    ]);
    let locating = server.get_json("/api/nearby").await;
    assert_eq!(locating["status"], "locating");
    assert_eq!(locating["issues"].as_array().unwrap().len(), 2);

    {
        let mut engine = lock_engine(&server.state.engine);
        engine.set_position(PositionSample::new(USER, None));
        engine.recompute();
    }
    let located = server.get_json("/api/nearby").await;
    assert_eq!(located["status"], "located");
    assert_eq!(located["issues"][0]["id"], "1");

    let encountered = server.get_json("/api/encountered").await;
    assert_eq!(encountered["total"], 1);
    assert_eq!(encountered["issues"][0]["title"], "here");

    let reset = server.post("/api/encountered/reset", Vec::new()).await;
    assert!(reset.status().is_success());
    assert_eq!(server.get_json("/api/encountered").await["total"], 0);
}

#[tokio::test]
async fn vouching_is_idempotent_over_http() {
    let server = TestServer::start().await;

    let first: Value = server.post("/api/issues/42/vouch", Vec::new()).await.json().await.unwrap();
    assert_eq!(first["newly_added"], true);
    let second: Value = server.post("/api/issues/42/vouch", Vec::new()).await.json().await.unwrap();
    assert_eq!(second["newly_added"], false);
    assert_eq!(second["vouched"], true);
}

#[tokio::test]
async fn geotag_endpoint_returns_annotated_jpeg() {
    let server = TestServer::start().await;
    let photo = TurboJpegEncoder
        .encode(&image::RgbImage::from_pixel(480, 360, image::Rgb([40, 120, 60])), 90)
        .unwrap();

    let response = server.post("/api/geotag", photo).await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers["content-type"], "image/jpeg");
    assert_eq!(headers["x-geotagged"], "true");
    assert_eq!(headers["x-compression-attempts"], "0");
    assert_eq!(headers["x-within-budget"], "true");
    assert_eq!(headers["x-address"], "12.9716, 77.5946");

    let body = response.bytes().await.unwrap();
    let decoded = image::load_from_memory(&body).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (480, 360));
}

#[tokio::test]
async fn geotag_rejects_empty_and_garbage_bodies() {
    let server = TestServer::start().await;
    assert_eq!(
        server.post("/api/geotag", Vec::new()).await.status(),
        reqwest::StatusCode::BAD_REQUEST
    );
    assert_eq!(
        server.post("/api/geotag", b"definitely not a photo".to_vec()).await.status(),
        reqwest::StatusCode::UNPROCESSABLE_ENTITY
    );
}

#[tokio::test]
async fn position_endpoint_follows_tracker() {
    let server = TestServer::start().await;
    assert_eq!(server.get_json("/api/position").await["state"], "locating");

    server
        .state
        .tracker
        .get_current_position(&LocationConfig::default())
        .await
        .unwrap();
    let fixed = server.get_json("/api/position").await;
    assert_eq!(fixed["state"], "fixed");
    assert_eq!(fixed["sample"]["coordinate"]["latitude"], 12.9716);
}
