use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use civic_proximity::capture::CapturePipeline;
use civic_proximity::geocoding::ReverseGeocoder;
use civic_proximity::issues::HttpIssueSource;
use civic_proximity::location::LocationTracker;
use civic_proximity::logging::init_logging;
use civic_proximity::persistence::{JsonFileStore, VouchLedger};
use civic_proximity::proximity::ProximityEngine;
use civic_proximity::scheduler::RefreshScheduler;
use civic_proximity::server::{start_server, state::AppState};
use civic_proximity::settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let (settings, load_notes) = Settings::load().context("Failed to load settings")?;
    let _log_guard = init_logging(settings.logging.log_dir.as_deref());
    for note in &load_notes {
        note.log();
    }

    info!("Starting civic_proximity v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", Settings::config_path().display());
    info!(
        "Proximity radius {} m, refresh every {} s, issues from {}",
        settings.proximity.radius_m, settings.proximity.refresh_interval_secs, settings.issues.api_url
    );

    let tracker = Arc::new(LocationTracker::new(settings.location.provider()?));
    let geocoder = Arc::new(ReverseGeocoder::from_settings(&settings.geocoding)?);
    info!("Geocoding providers: {}", geocoder.provider_names().join(" -> "));

    let source = Arc::new(HttpIssueSource::new(
        &settings.issues.api_url,
        Duration::from_secs(settings.issues.timeout_secs),
    )?);

    let encountered_store = JsonFileStore::in_app_dir("encountered");
    info!("Encountered issues stored in {}", encountered_store.path().display());
    let engine = ProximityEngine::new(settings.proximity.radius_m, Box::new(encountered_store)).shared();
    let vouches = Arc::new(Mutex::new(VouchLedger::load(Box::new(JsonFileStore::in_app_dir(
        "vouched",
    )))));

    let (event_sender, _) = broadcast::channel(100);

    let scheduler = RefreshScheduler::start(
        Arc::clone(&tracker),
        source,
        Arc::clone(&engine),
        event_sender.clone(),
        settings.scheduler_config(),
    );

    let capture = Arc::new(CapturePipeline::new(
        Arc::clone(&tracker),
        geocoder,
        settings.capture_config(),
    ));

    let state = AppState {
        tracker,
        engine,
        vouches,
        capture,
        event_sender,
    };

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(start_server(state, settings.server.port, shutdown.clone()));

    let stopped_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            None
        }
        finished = &mut server => Some(finished),
    };
    let server_result = match stopped_early {
        Some(finished) => finished,
        None => {
            info!("Shutting down");
            shutdown.cancel();
            server.await
        }
    };

    scheduler.shutdown().await?;
    match server_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Server error: {:#}", e);
            Err(e)
        }
        Err(e) => {
            error!("Server task failed: {}", e);
            Err(e.into())
        }
    }
}
