// =============================================================================
// File Ingestion Pipeline — detector + fallback + confirmation wiring
// =============================================================================

pub mod confirmation;
pub mod decoder;
pub mod detector;
pub mod fallback;
pub mod object_store;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api_tracker::ApiCallTracker;
use crate::bus::EventBus;
use crate::cities::CityRegistry;
use crate::providers::WeatherProvider;

use confirmation::{ChangeTriggers, ConfirmationManager, Tolerances};
use decoder::GribDecoder;
use detector::{DetectorSettings, FileDetector};
use fallback::{FallbackPoller, FallbackSettings};
use object_store::ObjectStore;

/// Everything the pipeline needs from the outside.
pub struct PipelineDeps {
    pub bus: Arc<EventBus>,
    pub tracker: Arc<ApiCallTracker>,
    pub cities: Arc<CityRegistry>,
    pub fallback_provider: Arc<dyn WeatherProvider>,
    pub decoder_binary: String,
    pub detector_settings: DetectorSettings,
    pub fallback_settings: FallbackSettings,
    pub tolerances: Tolerances,
    pub triggers: ChangeTriggers,
}

/// Spawn the detector, fallback poller, confirmation manager, and the GRIB
/// temp sweep. Returns the join handles plus the confirmation manager for
/// status queries.
pub fn spawn_pipeline(
    deps: PipelineDeps,
    shutdown: watch::Receiver<bool>,
) -> (Vec<JoinHandle<()>>, Arc<ConfirmationManager>) {
    let store = Arc::new(ObjectStore::new());
    let grib = Arc::new(GribDecoder::new(&deps.decoder_binary));

    let detector = Arc::new(FileDetector::new(
        store,
        grib,
        deps.cities.clone(),
        deps.bus.clone(),
        deps.detector_settings,
    ));
    let fallback = Arc::new(FallbackPoller::new(
        deps.fallback_provider,
        deps.tracker,
        deps.cities,
        deps.bus.clone(),
        deps.fallback_settings,
    ));
    let confirmation = Arc::new(ConfirmationManager::new(
        deps.bus,
        deps.tolerances,
        deps.triggers,
    ));

    let mut handles = Vec::new();
    handles.push(tokio::spawn(detector.run(shutdown.clone())));
    handles.push(tokio::spawn(fallback.run(shutdown.clone())));
    handles.push(tokio::spawn(confirmation.clone().run(shutdown.clone())));

    // Background temp sweep every 10 minutes, best-effort.
    let mut sweep_shutdown = shutdown;
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            tokio::select! {
                _ = sweep_shutdown.changed() => {
                    if *sweep_shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    detector::sweep_grib_temps().await;
                }
            }
        }
    }));

    (handles, confirmation)
}
