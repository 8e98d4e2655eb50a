//! The acquisition run loop.
//!
//! ```text
//! while processed < total:
//!     poll watcher
//!     tile available -> load, convert, verify, advance cursor, processed += 1
//!     nothing yet    -> wait poll_interval (or stop on cancellation)
//! ```
//!
//! Tiles are processed one at a time, in detection order. Loading and
//! conversion run on the blocking pool and are never interrupted;
//! cancellation is honoured at each wait and between tiles.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, InstrumentConfig, PipelineConfig, RetryPolicy};
use crate::converter::SparseThresholdConverter;
use crate::coordinates::AcquisitionGrid;
use crate::orchestrator::{ConversionError, ConversionOrchestrator, RawDisposition};
use crate::settings::{SettingsError, wait_for_settings};
use crate::store::{FileTileStore, TileStore};
use crate::tile::{DEFAULT_FRAME_SIZE, Tile, TileError};
use crate::watcher::{
    ClearscopeWatcher, PipelineState, SequentialWatcher, TileDescriptor, TileWatcher, WatchError,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("tile {path}: {source}")]
    Tile {
        path: PathBuf,
        #[source]
        source: TileError,
    },

    #[error("tile {path}: {source}")]
    Conversion {
        path: PathBuf,
        #[source]
        source: ConversionError,
    },

    #[error("tile worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("run exceeded {limit:?} after {processed} of {total} tiles")]
    DeadlineExceeded {
        limit: Duration,
        processed: usize,
        total: usize,
    },
}

impl PipelineError {
    /// Storage failures on a single tile; everything else is fatal at once.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Tile { source, .. } => source.is_io(),
            PipelineError::Conversion { source, .. } => source.is_io(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub processed: usize,
    pub total: usize,
    pub converted: usize,
    pub erased: usize,
    pub retained: usize,
    pub elapsed: Duration,
}

/// Result of processing one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileReport {
    pub descriptor: TileDescriptor,
    pub persisted: Option<PathBuf>,
    pub disposition: Option<RawDisposition>,
}

/// Drives a [`TileWatcher`] until every grid position has been processed.
pub struct Pipeline {
    watcher: Box<dyn TileWatcher>,
    orchestrator: Option<ConversionOrchestrator>,
    store: Arc<dyn TileStore>,
    frame_size: usize,
    poll_interval: Duration,
    max_run: Option<Duration>,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(watcher: Box<dyn TileWatcher>) -> Self {
        Self {
            watcher,
            orchestrator: None,
            store: Arc::new(FileTileStore),
            frame_size: DEFAULT_FRAME_SIZE,
            poll_interval: Duration::from_secs(1),
            max_run: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Build the watcher and conversion chain described by `config`.
    ///
    /// For ClearScope this waits, without timeout, for the instrument's
    /// settings file to learn the grid.
    pub async fn from_config(
        config: &PipelineConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let (watcher, acquisition_root): (Box<dyn TileWatcher>, PathBuf) = match &config.instrument
        {
            InstrumentConfig::Sequential {
                nrow,
                ncol,
                tile_type,
                extension,
                channel,
            } => {
                let mut watcher =
                    SequentialWatcher::new(&config.root, AcquisitionGrid::new(*nrow, *ncol), *tile_type)
                        .with_channel(*channel);
                if let Some(extension) = extension {
                    watcher = watcher.with_extension(extension.clone());
                }
                (Box::new(watcher), config.root.clone())
            }
            InstrumentConfig::Clearscope => {
                let dir = config.root.join(ClearscopeWatcher::ACQUISITION_SUBDIR);
                let settings = wait_for_settings(&dir, config.poll_interval(), cancel).await?;
                let grid = settings.grid()?;
                info!(nrow = grid.nrow, ncol = grid.ncol, "Acquisition grid");
                (
                    Box::new(ClearscopeWatcher::new(&dir, grid, config.n_channels)),
                    dir,
                )
            }
        };

        let store: Arc<dyn TileStore> = Arc::new(FileTileStore);
        let orchestrator = config.conversion.map(|params| {
            let orchestrator = ConversionOrchestrator::new(
                acquisition_root,
                Arc::new(SparseThresholdConverter),
                Arc::clone(&store),
                params,
            );
            match config.compression {
                Some(compression) => orchestrator.with_compression(compression),
                None => orchestrator,
            }
        });

        let mut pipeline = Pipeline::new(watcher)
            .with_store(store)
            .with_frame_size(config.frame_size)
            .with_poll_interval(config.poll_interval())
            .with_retry(config.retry);
        pipeline.orchestrator = orchestrator;
        pipeline.max_run = config.max_run();
        Ok(pipeline)
    }

    pub fn with_orchestrator(mut self, orchestrator: ConversionOrchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TileStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_run(mut self, max_run: Duration) -> Self {
        self.max_run = Some(max_run);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn grid(&self) -> AcquisitionGrid {
        self.watcher.grid()
    }

    /// Fresh state for a full run.
    pub fn initial_state(&self) -> PipelineState {
        PipelineState::new(self.watcher.total_tiles())
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary, PipelineError> {
        let mut state = self.initial_state();
        self.run_from(&mut state, cancel).await
    }

    /// Run from an arbitrary state; on return `state` reflects every tile
    /// processed so far, also when the run fails or is cancelled.
    pub async fn run_from(
        &self,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let start = Instant::now();
        let mut summary = RunSummary {
            outcome: RunOutcome::Completed,
            processed: 0,
            total: state.total,
            converted: 0,
            erased: 0,
            retained: 0,
            elapsed: Duration::ZERO,
        };
        info!(total = state.total, "Waiting for tiles");

        while !state.is_complete() {
            if cancel.is_cancelled() {
                summary.outcome = RunOutcome::Cancelled;
                break;
            }
            self.check_deadline(start, state)?;

            match self.watcher.poll_next(state)? {
                Some(descriptor) => {
                    info!(
                        path = %descriptor.path.display(),
                        row = descriptor.coords.row,
                        col = descriptor.coords.col,
                        channel = descriptor.coords.channel,
                        "New tile available"
                    );
                    let Some(report) = self
                        .process_with_retry(&descriptor, state, start, cancel)
                        .await?
                    else {
                        summary.outcome = RunOutcome::Cancelled;
                        break;
                    };
                    self.watcher.advance(state, &descriptor);
                    state.processed += 1;

                    summary.processed += 1;
                    if report.persisted.is_some() {
                        summary.converted += 1;
                    }
                    match report.disposition {
                        Some(RawDisposition::Erased) => summary.erased += 1,
                        Some(RawDisposition::Retained) => summary.retained += 1,
                        Some(RawDisposition::Verified) | None => {}
                    }
                    info!(
                        processed = state.processed,
                        remaining = state.remaining(),
                        "Tile done"
                    );
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            summary.outcome = RunOutcome::Cancelled;
                            break;
                        }
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        summary.elapsed = start.elapsed();
        match summary.outcome {
            RunOutcome::Completed => info!(processed = summary.processed, "Acquisition complete"),
            RunOutcome::Cancelled => warn!(
                processed = state.processed,
                total = state.total,
                "Run cancelled"
            ),
        }
        Ok(summary)
    }

    fn check_deadline(&self, start: Instant, state: &PipelineState) -> Result<(), PipelineError> {
        match self.max_run {
            Some(limit) if start.elapsed() >= limit => Err(PipelineError::DeadlineExceeded {
                limit,
                processed: state.processed,
                total: state.total,
            }),
            _ => Ok(()),
        }
    }

    /// Process a tile, backing off between failed attempts. `None` when
    /// cancelled during a backoff.
    async fn process_with_retry(
        &self,
        descriptor: &TileDescriptor,
        state: &PipelineState,
        start: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<TileReport>, PipelineError> {
        let mut attempt = 1;
        loop {
            match self.process(descriptor.clone()).await {
                Ok(report) => return Ok(Some(report)),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let mut delay = self.retry.backoff(attempt);
                    if let Some(limit) = self.max_run {
                        delay = delay.min(limit.saturating_sub(start.elapsed()));
                    }
                    warn!(
                        path = %descriptor.path.display(),
                        attempt,
                        ?delay,
                        error = %e,
                        "Tile failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.check_deadline(start, state)?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Load, convert and verify one tile on the blocking pool.
    async fn process(&self, descriptor: TileDescriptor) -> Result<TileReport, PipelineError> {
        let orchestrator = self.orchestrator.clone();
        let store = Arc::clone(&self.store);
        let grid = self.watcher.grid();
        let frame_size = self.frame_size;

        tokio::task::spawn_blocking(move || {
            process_tile(descriptor, grid, frame_size, store.as_ref(), orchestrator.as_ref())
        })
        .await?
    }
}

fn process_tile(
    descriptor: TileDescriptor,
    grid: AcquisitionGrid,
    frame_size: usize,
    store: &dyn TileStore,
    orchestrator: Option<&ConversionOrchestrator>,
) -> Result<TileReport, PipelineError> {
    let mut tile = Tile::new(&descriptor.path, descriptor.coords, descriptor.tile_type)
        .with_frame_size(frame_size)
        .with_grid(&grid);

    tile.load(store).map_err(|source| PipelineError::Tile {
        path: descriptor.path.clone(),
        source,
    })?;
    debug!(path = %descriptor.path.display(), dim = ?tile.data().map(|v| v.dim()), "Tile loaded");

    let Some(orchestrator) = orchestrator else {
        return Ok(TileReport {
            descriptor,
            persisted: None,
            disposition: None,
        });
    };

    let conversion_error = |source: ConversionError| PipelineError::Conversion {
        path: descriptor.path.clone(),
        source,
    };
    let persisted = orchestrator.convert(&mut tile).map_err(conversion_error)?;
    let disposition = orchestrator.verify(&mut tile).map_err(conversion_error)?;

    Ok(TileReport {
        descriptor,
        persisted: Some(persisted),
        disposition: Some(disposition),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinates::{GridPosition, TileCoordinates};
    use crate::enums::TileType;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Yields one raster-order tile every other poll.
    struct FakeWatcher {
        dir: PathBuf,
        grid: AcquisitionGrid,
        polls: AtomicUsize,
    }

    impl FakeWatcher {
        fn new(dir: &Path, grid: AcquisitionGrid) -> Self {
            Self {
                dir: dir.to_path_buf(),
                grid,
                polls: AtomicUsize::new(0),
            }
        }
    }

    impl TileWatcher for FakeWatcher {
        fn poll_next(
            &self,
            state: &mut PipelineState,
        ) -> Result<Option<TileDescriptor>, WatchError> {
            if self.polls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Ok(None);
            }
            let p = state.cursor;
            let path = self.dir.join(format!("{}_{}.raw", p.row, p.col));
            write_raw(&path, 10 * p.row as u16 + p.col as u16);
            state.current = Some(p);
            Ok(Some(TileDescriptor {
                path,
                coords: TileCoordinates::new(p.row, p.col, 0),
                tile_type: TileType::Raw,
            }))
        }

        fn decode_coordinates(&self, _: &Path) -> Option<TileCoordinates> {
            None
        }

        fn advance(&self, state: &mut PipelineState, tile: &TileDescriptor) {
            state.cursor = self.grid.next_raster(tile.coords.position());
        }

        fn grid(&self) -> AcquisitionGrid {
            self.grid
        }
    }

    /// Never finds anything.
    struct EmptyWatcher;

    impl TileWatcher for EmptyWatcher {
        fn poll_next(&self, _: &mut PipelineState) -> Result<Option<TileDescriptor>, WatchError> {
            Ok(None)
        }
        fn decode_coordinates(&self, _: &Path) -> Option<TileCoordinates> {
            None
        }
        fn advance(&self, _: &mut PipelineState, _: &TileDescriptor) {}
        fn grid(&self) -> AcquisitionGrid {
            AcquisitionGrid::new(1, 1)
        }
    }

    /// Always reports a tile whose data does not exist.
    struct GhostWatcher;

    impl TileWatcher for GhostWatcher {
        fn poll_next(&self, _: &mut PipelineState) -> Result<Option<TileDescriptor>, WatchError> {
            Ok(Some(TileDescriptor {
                path: PathBuf::from("/nonexistent/0_0.raw"),
                coords: TileCoordinates::default(),
                tile_type: TileType::Raw,
            }))
        }
        fn decode_coordinates(&self, _: &Path) -> Option<TileCoordinates> {
            None
        }
        fn advance(&self, _: &mut PipelineState, _: &TileDescriptor) {}
        fn grid(&self) -> AcquisitionGrid {
            AcquisitionGrid::new(1, 1)
        }
    }

    fn slow_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            backoff_ms: 60_000,
            multiplier: 1.0,
        }
    }

    fn write_raw(path: &Path, value: u16) {
        let samples = vec![value; 2 * 2 * 2];
        std::fs::write(path, bytemuck::cast_slice::<u16, u8>(&samples)).unwrap();
    }

    #[tokio::test]
    async fn test_terminates_after_every_grid_position() {
        let dir = tempfile::tempdir().unwrap();
        let grid = AcquisitionGrid::new(2, 3);
        let watcher = FakeWatcher::new(dir.path(), grid);
        let pipeline = Pipeline::new(Box::new(watcher))
            .with_frame_size(2)
            .with_poll_interval(Duration::from_millis(1));

        let mut state = pipeline.initial_state();
        let summary = pipeline
            .run_from(&mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.processed, 6);
        assert_eq!(state.processed, 6);
        assert_eq!(state.cursor, GridPosition::new(2, 0));
        assert_eq!(summary.converted, 0, "conversion not configured");
    }

    #[tokio::test]
    async fn test_converts_in_order_and_keeps_raw_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let grid = AcquisitionGrid::new(2, 2);
        let orchestrator = ConversionOrchestrator::new(
            dir.path(),
            Arc::new(SparseThresholdConverter),
            Arc::new(FileTileStore),
            crate::converter::ConversionParameters {
                intensity_threshold: 0,
                auto_parameters: false,
                ..Default::default()
            },
        );
        let pipeline = Pipeline::new(Box::new(FakeWatcher::new(dir.path(), grid)))
            .with_orchestrator(orchestrator)
            .with_frame_size(2)
            .with_poll_interval(Duration::from_millis(1));

        let summary = pipeline.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.converted, 4);
        assert_eq!(summary.retained, 4);
        assert_eq!(summary.erased, 0);

        for (row, col) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            let output = dir.path().join(format!("APR/ch0/{row}_{col}.apr"));
            let converted = FileTileStore.read(&output).unwrap();
            assert!(converted.values.iter().all(|&v| v == (10 * row + col) as u16));
            assert!(dir.path().join(format!("{row}_{col}.raw")).exists());
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting() {
        let pipeline =
            Pipeline::new(Box::new(EmptyWatcher)).with_poll_interval(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let summary = pipeline.run(&cancel).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn test_deadline() {
        let pipeline = Pipeline::new(Box::new(EmptyWatcher))
            .with_poll_interval(Duration::from_millis(1))
            .with_max_run(Duration::from_millis(10));
        let result = pipeline.run(&CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(PipelineError::DeadlineExceeded { processed: 0, total: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_tile_data_is_fatal_after_retries() {
        let pipeline = Pipeline::new(Box::new(GhostWatcher)).with_retry(RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
            multiplier: 1.0,
        });
        let mut state = pipeline.initial_state();
        let err = pipeline
            .run_from(&mut state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("/nonexistent/0_0.raw"));
        assert_eq!(state.processed, 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_retry_backoff() {
        let pipeline = Pipeline::new(Box::new(GhostWatcher)).with_retry(slow_retry());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let summary = pipeline.run(&cancel).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(summary.processed, 0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_deadline_bounds_retry_backoff() {
        let pipeline = Pipeline::new(Box::new(GhostWatcher))
            .with_retry(slow_retry())
            .with_max_run(Duration::from_millis(50));

        let started = Instant::now();
        let result = pipeline.run(&CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(PipelineError::DeadlineExceeded { processed: 0, .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_ambiguous_detection_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0_0.tif"), b"").unwrap();
        std::fs::write(dir.path().join("0_0.tiff"), b"").unwrap();
        let watcher = SequentialWatcher::new(dir.path(), AcquisitionGrid::new(1, 1), TileType::Tiff3d)
            .with_extension("tif*");
        let pipeline = Pipeline::new(Box::new(watcher));
        let result = pipeline.run(&CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(PipelineError::Watch(WatchError::Ambiguous { .. }))
        ));
    }
}
