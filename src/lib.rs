//! # tile-stream
//!
//! This crate converts microscope acquisition tiles into a compact sparse
//! representation while the acquisition is still running.
//!
//! Light-sheet and confocal instruments write a grid of 3D tiles, one tile
//! at a time, into a directory. A [`Pipeline`] polls that directory through
//! a [`TileWatcher`], loads every tile as soon as it is complete, converts
//! it with a [`VolumeConverter`] and persists the result through a
//! [`TileStore`] at `APR/ch{channel}/{row}_{col}.apr`. The raw source is
//! only erased when an [`IntegrityCheck`] passes, which the default check
//! never does.
//!
//! Two instrument layouts are supported:
//!  - Sequential: `{row}_{col}.tif` files (or folders) written in raster
//!    order, with the grid known in advance.
//!  - ClearScope: `{prefix}_{index:06}___{channel}c` folders in serpentine
//!    order, with the grid read from the instrument's settings file.
//!
//! Tile data can be a multi-page TIFF, a raw `u16` dump, or a folder of 2D
//! slices. Slices are decoded in parallel using rayon.
//!
//! # Examples
//!
//! ## Converting a sequential acquisition
//!
//! Watch `acquisition/` for a 4x6 grid of TIFF stacks and convert each tile
//! as it appears.
//!
//! ```no_run
//! # use tile_stream::{AcquisitionGrid, ConversionOrchestrator, ConversionParameters,
//! #     FileTileStore, Pipeline, SequentialWatcher, SparseThresholdConverter, TileType};
//! # use std::sync::Arc;
//! # use tokio_util::sync::CancellationToken;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let watcher = SequentialWatcher::new("acquisition", AcquisitionGrid::new(4, 6), TileType::Tiff3d);
//! let orchestrator = ConversionOrchestrator::new(
//!     "acquisition",
//!     Arc::new(SparseThresholdConverter),
//!     Arc::new(FileTileStore),
//!     ConversionParameters::default(),
//! );
//! let summary = Pipeline::new(Box::new(watcher))
//!     .with_orchestrator(orchestrator)
//!     .run(&CancellationToken::new())
//!     .await?;
//! println!("{} tiles converted", summary.converted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Decoding a serpentine index
//!
//! ```
//! # use tile_stream::{serpentine_position, GridPosition};
//! assert_eq!(serpentine_position(4, 3), Some(GridPosition::new(1, 2)));
//! ```

pub mod config;
pub mod converter;
pub mod coordinates;
pub mod enums;
pub mod integrity;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod settings;
pub mod store;
pub mod tile;
pub mod volume;
pub mod volume_loader;
pub mod watcher;

pub use config::{ConfigError, InstrumentConfig, PipelineConfig, RetryPolicy};
pub use converter::{
    AuxiliaryTile, ConversionParameters, ConvertError, ConvertedTile, SparseThresholdConverter,
    VolumeConverter,
};
pub use coordinates::{
    AcquisitionGrid, CoordinateDecoder, GridPosition, RasterDecoder, SerpentineDecoder,
    TileCoordinates, serpentine_position,
};
pub use enums::{TileState, TileType};
pub use integrity::{IntegrityCheck, RetainRaw};
pub use orchestrator::{ConversionError, ConversionOrchestrator, RawDisposition};
pub use pipeline::{Pipeline, PipelineError, RunOutcome, RunSummary};
pub use settings::{AcquisitionSettings, SettingValue, SettingsError};
pub use store::{CompressionSettings, FileTileStore, Segmentation, TileLayout, TileStore};
pub use tile::{Tile, TileData, TileError};
pub use volume::Volume;
pub use volume_loader::{VolumeLoader, VolumeLoaderError};
pub use watcher::{
    ClearscopeWatcher, PipelineState, SequentialWatcher, TileDescriptor, TileWatcher, WatchError,
};
