use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::converter::{AuxiliaryTile, ConvertedTile};
use crate::coordinates::{AcquisitionGrid, GridPosition, TileCoordinates};
use crate::enums::{TileState, TileType};
use crate::store::{Segmentation, StoreError, TileLayout, TileStore};
use crate::volume::Volume;
use crate::volume_loader::{VolumeLoader, VolumeLoaderError};

/// Default square sensor edge length, in pixels.
pub const DEFAULT_FRAME_SIZE: usize = 2048;

#[derive(Debug, Error)]
pub enum TileError {
    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: VolumeLoaderError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{operation} is not supported for {tile_type:?} tiles")]
    Unsupported {
        tile_type: TileType,
        operation: &'static str,
    },

    #[error("tile {path} is {actual:?}, {operation} needs {expected:?}")]
    InvalidState {
        path: PathBuf,
        operation: &'static str,
        expected: TileState,
        actual: TileState,
    },

    #[error("{0} has no converted output yet")]
    NotPersisted(PathBuf),

    #[error("{0} holds no segmentation")]
    MissingSegmentation(PathBuf),

    #[error("failed to erase {path}: {source}")]
    Erase {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TileError {
    /// Whether the failure came from storage rather than from the data or
    /// the configuration.
    pub fn is_io(&self) -> bool {
        match self {
            TileError::Load { source, .. } => source.is_io(),
            TileError::Store(e) => e.is_io(),
            TileError::Erase { .. } => true,
            _ => false,
        }
    }
}

/// Data held for a neighbor, depending on the tile type.
#[derive(Debug, Clone, PartialEq)]
pub enum TileData {
    Pixels(Volume),
    Converted(ConvertedTile),
}

/// One grid position of an acquisition and whatever has been loaded for it.
#[derive(Debug, Clone)]
pub struct Tile {
    pub path: PathBuf,
    pub row: usize,
    pub col: usize,
    pub channel: u32,
    pub tile_type: TileType,
    pub frame_size: usize,
    /// East and south neighbors.
    pub neighbors: Vec<GridPosition>,
    /// All 4-connected neighbors.
    pub neighbors_full: Vec<GridPosition>,
    /// Sources of `neighbors`, in the same order.
    pub neighbor_paths: Vec<PathBuf>,
    state: TileState,
    data: Option<Volume>,
    converted: Option<ConvertedTile>,
    persisted_path: Option<PathBuf>,
    auxiliary: Option<AuxiliaryTile>,
    segmentation: Option<Segmentation>,
    neighbors_data: Option<Vec<TileData>>,
    neighbors_segmentation: Option<Vec<Segmentation>>,
}

impl Tile {
    /// A converted tile's own path is its persisted output.
    pub fn new(path: impl Into<PathBuf>, coords: TileCoordinates, tile_type: TileType) -> Self {
        let path = path.into();
        let persisted_path = tile_type.is_converted().then(|| path.clone());
        Self {
            path,
            row: coords.row,
            col: coords.col,
            channel: coords.channel,
            tile_type,
            frame_size: DEFAULT_FRAME_SIZE,
            neighbors: Vec::new(),
            neighbors_full: Vec::new(),
            neighbor_paths: Vec::new(),
            state: TileState::Unloaded,
            data: None,
            converted: None,
            persisted_path,
            auxiliary: None,
            segmentation: None,
            neighbors_data: None,
            neighbors_segmentation: None,
        }
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Fill both neighbor sets from the grid.
    pub fn with_grid(mut self, grid: &AcquisitionGrid) -> Self {
        let position = self.position();
        self.neighbors = grid.neighbors(position);
        self.neighbors_full = grid.neighbors_full(position);
        self
    }

    /// Tile over a previously persisted output tree, with neighbor paths
    /// pointing at the converted neighbors on the same channel.
    pub fn converted(layout: &TileLayout, grid: &AcquisitionGrid, coords: TileCoordinates) -> Self {
        let path = layout.tile_path(coords);
        let mut tile = Tile::new(path, coords, TileType::Apr).with_grid(grid);
        tile.neighbor_paths = tile
            .neighbors
            .iter()
            .map(|p| layout.tile_path(TileCoordinates::new(p.row, p.col, coords.channel)))
            .collect();
        tile
    }

    pub fn coordinates(&self) -> TileCoordinates {
        TileCoordinates::new(self.row, self.col, self.channel)
    }

    pub fn position(&self) -> GridPosition {
        GridPosition::new(self.row, self.col)
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn data(&self) -> Option<&Volume> {
        self.data.as_ref()
    }

    pub fn converted_data(&self) -> Option<&ConvertedTile> {
        self.converted.as_ref()
    }

    pub fn auxiliary(&self) -> Option<&AuxiliaryTile> {
        self.auxiliary.as_ref()
    }

    pub fn segmentation(&self) -> Option<&Segmentation> {
        self.segmentation.as_ref()
    }

    pub fn neighbors_data(&self) -> Option<&[TileData]> {
        self.neighbors_data.as_deref()
    }

    pub fn neighbors_segmentation(&self) -> Option<&[Segmentation]> {
        self.neighbors_segmentation.as_deref()
    }

    /// Where the converted representation lives, once there is one.
    pub fn persisted_path(&self) -> Option<&Path> {
        self.persisted_path.as_deref()
    }

    pub fn supports_erase(&self) -> bool {
        self.tile_type.supports_erase()
    }

    /// Read the tile's data if not already loaded.
    ///
    /// Pixel types populate the pixel buffer; converted tiles are read
    /// through `store`. Calling this again is a no-op.
    pub fn load(&mut self, store: &dyn TileStore) -> Result<(), TileError> {
        if self.state != TileState::Unloaded {
            debug!(path = %self.path.display(), "Tile already loaded");
            return Ok(());
        }
        match Self::read_data(&self.path, self.tile_type, self.channel, self.frame_size, store)? {
            TileData::Pixels(volume) => self.data = Some(volume),
            TileData::Converted(converted) => self.converted = Some(converted),
        }
        self.state = TileState::Loaded;
        Ok(())
    }

    /// Load every neighbor listed in `neighbor_paths`, once.
    ///
    /// The tile's own load state is not affected.
    pub fn load_neighbors(&mut self, store: &dyn TileStore) -> Result<(), TileError> {
        if self.neighbors_data.is_some() {
            debug!(path = %self.path.display(), "Tile neighbors already loaded");
            return Ok(());
        }
        let loaded = self
            .neighbor_paths
            .iter()
            .map(|p| Self::read_data(p, self.tile_type, self.channel, self.frame_size, store))
            .collect::<Result<Vec<_>, _>>()?;
        self.neighbors_data = Some(loaded);
        Ok(())
    }

    /// Load the segmentation labels stored with the converted output.
    ///
    /// With `load_converted`, the converted representation is read as well
    /// when the tile does not already hold it.
    pub fn load_segmentation(
        &mut self,
        store: &dyn TileStore,
        load_converted: bool,
    ) -> Result<(), TileError> {
        if self.segmentation.is_some() {
            debug!(path = %self.path.display(), "Tile segmentation already loaded");
            return Ok(());
        }
        let path = self.require_persisted()?.to_path_buf();
        if load_converted && self.converted.is_none() {
            self.converted = Some(store.read(&path)?);
        }
        let segmentation = store
            .read_segmentation(&path)?
            .ok_or_else(|| TileError::MissingSegmentation(path.clone()))?;
        self.segmentation = Some(segmentation);
        Ok(())
    }

    /// Segmentation of every converted neighbor, once.
    pub fn load_neighbors_segmentation(&mut self, store: &dyn TileStore) -> Result<(), TileError> {
        if self.neighbors_segmentation.is_some() {
            return Ok(());
        }
        if !self.tile_type.is_converted() {
            return Err(TileError::Unsupported {
                tile_type: self.tile_type,
                operation: "neighbor segmentation",
            });
        }
        let loaded = self
            .neighbor_paths
            .iter()
            .map(|p| {
                store
                    .read_segmentation(p)?
                    .ok_or_else(|| TileError::MissingSegmentation(p.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.neighbors_segmentation = Some(loaded);
        Ok(())
    }

    /// Read only the coarse auxiliary summary of the converted output.
    pub fn load_auxiliary(&mut self, store: &dyn TileStore) -> Result<(), TileError> {
        if self.auxiliary.is_some() {
            return Ok(());
        }
        if self.persisted_path.is_none() {
            return Err(TileError::Unsupported {
                tile_type: self.tile_type,
                operation: "auxiliary reads",
            });
        }
        let path = self.require_persisted()?.to_path_buf();
        let auxiliary = store.read_auxiliary(&path)?.ok_or(TileError::Unsupported {
            tile_type: self.tile_type,
            operation: "auxiliary reads without a stored summary",
        })?;
        self.auxiliary = Some(auxiliary);
        Ok(())
    }

    /// Attach the converted representation produced from the pixel buffer.
    pub fn set_converted(&mut self, converted: ConvertedTile) -> Result<(), TileError> {
        self.expect_state(TileState::Loaded, "conversion")?;
        self.converted = Some(converted);
        self.state = TileState::Converted;
        Ok(())
    }

    /// Record where the converted representation was written.
    pub fn mark_persisted(&mut self, path: PathBuf) -> Result<(), TileError> {
        self.expect_state(TileState::Converted, "persisting")?;
        self.persisted_path = Some(path);
        self.state = TileState::Persisted;
        Ok(())
    }

    /// Delete the raw source once its conversion has been persisted and
    /// verified. The converted output is never touched.
    ///
    /// Returns `false` when the tile type does not allow erasing.
    pub fn erase_from_disk(&mut self) -> Result<bool, TileError> {
        self.expect_state(TileState::Persisted, "erasing")?;
        if !self.supports_erase() {
            return Ok(false);
        }
        std::fs::remove_file(&self.path).map_err(|source| TileError::Erase {
            path: self.path.clone(),
            source,
        })?;
        self.state = TileState::Erased;
        Ok(true)
    }

    fn read_data(
        path: &Path,
        tile_type: TileType,
        channel: u32,
        frame_size: usize,
        store: &dyn TileStore,
    ) -> Result<TileData, TileError> {
        if tile_type.is_converted() {
            return Ok(TileData::Converted(store.read(path)?));
        }
        VolumeLoader::load(path, tile_type, channel, frame_size)
            .map(TileData::Pixels)
            .map_err(|source| TileError::Load {
                path: path.to_path_buf(),
                source,
            })
    }

    fn require_persisted(&self) -> Result<&Path, TileError> {
        self.persisted_path
            .as_deref()
            .ok_or_else(|| TileError::NotPersisted(self.path.clone()))
    }

    fn expect_state(&self, expected: TileState, operation: &'static str) -> Result<(), TileError> {
        if self.state != expected {
            return Err(TileError::InvalidState {
                path: self.path.clone(),
                operation,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}
