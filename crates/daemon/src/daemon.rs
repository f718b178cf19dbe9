//! Daemon startup and main loop for the re-encode daemon
//!
//! Wires the store, discovery, admission, dispatch, scheduler and control server
//! together and runs them until shutdown.

use crate::admission::AdmissionPolicy;
use crate::config::{Config, ConfigError};
use crate::control_server::{bind_listener, serve_control, ControlState, ServerError};
use crate::dispatch::{DispatchEngine, DispatchSettings};
use crate::encode::{Encoder, EncoderSettings, FfmpegEncoder};
use crate::events::EventBus;
use crate::media::CodecPolicy;
use crate::probe::{FfprobeProbe, MediaProbe};
use crate::scan::{Discovery, DiscoveryError, ScanSummary};
use crate::schedule::{ScheduleError, WindowScheduler};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{JobStore, SqliteJobStore, StoreError};
use crate::watch::{LibraryWatcher, WatchSettings};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Scanning, admission and watching for library roots.
pub struct Library {
    discovery: Arc<Discovery>,
    admission: Arc<AdmissionPolicy>,
    watcher: Arc<LibraryWatcher>,
}

impl Library {
    pub fn new(
        discovery: Arc<Discovery>,
        admission: Arc<AdmissionPolicy>,
        watcher: Arc<LibraryWatcher>,
    ) -> Self {
        Self {
            discovery,
            admission,
            watcher,
        }
    }

    /// Scan `root`, admit what needs encoding, then keep watching it.
    pub async fn scan(&self, root: &Path) -> Result<ScanSummary, DiscoveryError> {
        let summary = self.discovery.scan(root).await?;
        let admitted = self.admission.admit_pending().await?;
        info!(root = %root.display(), admitted, "Admission after scan");

        if let Err(e) = self.watcher.watch(root) {
            warn!(root = %root.display(), error = %e, "Could not watch library root");
        }
        Ok(summary)
    }

    pub async fn admit_pending(&self) -> Result<usize, StoreError> {
        self.admission.admit_pending().await
    }

    pub fn stop_watching(&self) {
        self.watcher.unwatch();
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    config: Config,
    events: EventBus,
    dispatch: Arc<DispatchEngine>,
    scheduler: Arc<WindowScheduler>,
    library: Arc<Library>,
}

impl Daemon {
    /// Run the startup checks, then build the daemon from `config`.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Build the daemon with the ffmpeg/ffprobe backends, skipping the startup checks.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let policy = CodecPolicy::new(&config.encoder.accepted_codecs);
        let store = Arc::new(SqliteJobStore::new(&config.database.path, policy)?);
        let probe = Arc::new(FfprobeProbe::new(config.encoder.ffprobe_path.clone()));
        let encoder = Arc::new(FfmpegEncoder::new(EncoderSettings::from_config(
            &config.encoder,
            &config.encoder_safety,
        )));
        info!(database = %config.database.path.display(), "Opened job store");
        Ok(Self::with_components(config, store, probe, encoder))
    }

    /// Build the daemon around the given store, prober and encoder.
    pub fn with_components(
        config: Config,
        store: Arc<dyn JobStore>,
        probe: Arc<dyn MediaProbe>,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        let events = EventBus::default();
        let dispatch = DispatchEngine::new(
            store.clone(),
            encoder,
            probe.clone(),
            events.clone(),
            DispatchSettings::from_config(&config),
        );
        let scheduler = WindowScheduler::new(store.clone(), dispatch.clone(), events.clone());

        let discovery = Arc::new(Discovery::new(store.clone(), probe, events.clone()));
        let admission = Arc::new(AdmissionPolicy::new(
            store,
            config.discovery.admission_batch,
            dispatch.waker(),
        ));
        let watcher = LibraryWatcher::new(
            discovery.clone(),
            admission.clone(),
            WatchSettings {
                stability_wait: Duration::from_secs(config.discovery.stability_wait_secs),
                max_checks: config.discovery.stability_max_checks,
            },
        );
        let library = Arc::new(Library::new(discovery, admission, watcher));

        Self {
            config,
            events,
            dispatch,
            scheduler,
            library,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn dispatch(&self) -> &Arc<DispatchEngine> {
        &self.dispatch
    }

    pub fn scheduler(&self) -> &Arc<WindowScheduler> {
        &self.scheduler
    }

    /// Scan a library root, admit pending media and watch the root.
    pub async fn scan(&self, root: &Path) -> Result<ScanSummary, DaemonError> {
        Ok(self.library.scan(root).await?)
    }

    fn control_state(&self) -> ControlState {
        ControlState {
            dispatch: self.dispatch.clone(),
            scheduler: self.scheduler.clone(),
            library: self.library.clone(),
        }
    }

    /// Run until `shutdown_signal` completes.
    ///
    /// Startup order: recover interrupted jobs, start the scheduler, bind the
    /// control server, start dispatch, then scan the configured library root.
    pub async fn run<F>(&self, shutdown_signal: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let recovered = self.dispatch.recover_interrupted()?;
        if recovered > 0 {
            warn!(recovered, "Recovered jobs interrupted by a previous run");
        }

        self.scheduler.start()?;
        let listener = bind_listener(&self.config.server.bind).await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let dispatch_task = tokio::spawn(self.dispatch.clone().run(shutdown_tx.subscribe()));
        let server_task = tokio::spawn(serve_control(
            listener,
            self.control_state(),
            shutdown_tx.subscribe(),
        ));

        match &self.config.library.root {
            Some(root) => {
                if let Err(e) = self.library.scan(root).await {
                    warn!(root = %root.display(), error = %e, "Initial library scan failed");
                }
            }
            None => {
                info!("No library root configured; waiting for scan requests");
                if let Err(e) = self.library.admit_pending().await {
                    warn!(error = %e, "Initial admission failed");
                }
            }
        }

        shutdown_signal.await;
        info!("Shutting down");

        let _ = shutdown_tx.send(());
        self.scheduler.shutdown();
        self.library.stop_watching();
        if let Err(e) = dispatch_task.await {
            warn!(error = %e, "Dispatch loop ended abnormally");
        }
        match server_task.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "Control server ended abnormally"),
        }
        info!("Daemon stopped");
        Ok(())
    }
}
