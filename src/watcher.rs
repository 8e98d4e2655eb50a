//! Detection of newly acquired tiles.
//!
//! Instruments give no notification when a tile is complete, so the
//! controller polls a [`TileWatcher`]. Watchers keep no run state of their
//! own: the cursor and the discovery buffer live in [`PipelineState`],
//! which the controller owns and passes in.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::coordinates::{
    AcquisitionGrid, CoordinateDecoder, GridPosition, RasterDecoder, SerpentineDecoder,
    TileCoordinates,
};
use crate::enums::TileType;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("{pattern} matches {} entries, expected one: {matches:?}", matches.len())]
    Ambiguous {
        pattern: String,
        matches: Vec<PathBuf>,
    },

    #[error("cannot decode grid position from {0}")]
    Undecodable(PathBuf),

    #[error("{path} decodes to {coords:?}, outside the {grid:?} grid")]
    OutsideGrid {
        path: PathBuf,
        coords: TileCoordinates,
        grid: AcquisitionGrid,
    },

    #[error("invalid search pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A detected tile, ready to be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDescriptor {
    pub path: PathBuf,
    pub coords: TileCoordinates,
    pub tile_type: TileType,
}

/// Run state of the acquisition loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineState {
    /// Next expected grid position, for instruments that write in order.
    pub cursor: GridPosition,
    /// Position of the tile handed out by the last successful poll.
    pub current: Option<GridPosition>,
    /// Discovered but unprocessed tiles, in discovery order.
    pub pending: VecDeque<PathBuf>,
    /// Every path ever queued, processed or not.
    pub enqueued: HashSet<PathBuf>,
    /// Path that first claimed each decoded tile.
    pub claimed: HashMap<TileCoordinates, PathBuf>,
    pub processed: usize,
    pub total: usize,
}

impl PipelineState {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }
}

/// Instrument specific detection and decoding.
pub trait TileWatcher: Send + Sync {
    /// Look for the next tile to process without blocking.
    fn poll_next(&self, state: &mut PipelineState) -> Result<Option<TileDescriptor>, WatchError>;

    fn decode_coordinates(&self, path: &Path) -> Option<TileCoordinates>;

    /// Record that `tile`, as returned by `poll_next`, has been processed.
    fn advance(&self, state: &mut PipelineState, tile: &TileDescriptor);

    fn grid(&self) -> AcquisitionGrid;

    /// Number of tiles the run consists of.
    fn total_tiles(&self) -> usize {
        self.grid().len()
    }
}

/// Instrument writing `{row}_{col}.{ext}` files in raster order.
#[derive(Debug, Clone)]
pub struct SequentialWatcher {
    root: PathBuf,
    grid: AcquisitionGrid,
    tile_type: TileType,
    /// Glob suffix after `{row}_{col}`, e.g. `tif` or `tif*`. Empty for
    /// folder tiles.
    extension: String,
    decoder: RasterDecoder,
}

impl SequentialWatcher {
    pub fn new(root: impl Into<PathBuf>, grid: AcquisitionGrid, tile_type: TileType) -> Self {
        let extension = if tile_type.is_directory() {
            String::new()
        } else {
            "tif".to_string()
        };
        Self {
            root: root.into(),
            grid,
            tile_type,
            extension,
            decoder: RasterDecoder::default(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_channel(mut self, channel: u32) -> Self {
        self.decoder.channel = channel;
        self
    }

    fn pattern(&self, position: GridPosition) -> String {
        let root = glob::Pattern::escape(&self.root.to_string_lossy());
        if self.extension.is_empty() {
            format!("{root}/{}_{}", position.row, position.col)
        } else {
            format!("{root}/{}_{}.{}", position.row, position.col, self.extension)
        }
    }
}

impl TileWatcher for SequentialWatcher {
    fn poll_next(&self, state: &mut PipelineState) -> Result<Option<TileDescriptor>, WatchError> {
        if !self.grid.contains(state.cursor) {
            return Ok(None);
        }
        let pattern = self.pattern(state.cursor);
        let mut matches: Vec<PathBuf> = glob::glob(&pattern)?.filter_map(Result::ok).collect();

        match matches.len() {
            0 => {
                debug!(%pattern, "Tile not available yet");
                Ok(None)
            }
            1 => {
                let path = matches.remove(0);
                let coords = self
                    .decode_coordinates(&path)
                    .ok_or_else(|| WatchError::Undecodable(path.clone()))?;
                state.current = Some(state.cursor);
                Ok(Some(TileDescriptor {
                    path,
                    coords,
                    tile_type: self.tile_type,
                }))
            }
            _ => {
                matches.sort();
                Err(WatchError::Ambiguous { pattern, matches })
            }
        }
    }

    fn decode_coordinates(&self, path: &Path) -> Option<TileCoordinates> {
        self.decoder.decode_path(path)
    }

    fn advance(&self, state: &mut PipelineState, _tile: &TileDescriptor) {
        let current = state.current.take().unwrap_or(state.cursor);
        state.cursor = self.grid.next_raster(current);
    }

    fn grid(&self) -> AcquisitionGrid {
        self.grid
    }
}

/// ClearScope instrument: one directory per grid position and channel,
/// possibly several appearing between two polls.
#[derive(Debug, Clone)]
pub struct ClearscopeWatcher {
    acquisition_dir: PathBuf,
    grid: AcquisitionGrid,
    n_channels: u32,
    decoder: SerpentineDecoder,
}

impl ClearscopeWatcher {
    /// Subdirectory of the acquisition root the instrument writes into.
    pub const ACQUISITION_SUBDIR: &'static str = "0001";

    pub fn new(acquisition_dir: impl Into<PathBuf>, grid: AcquisitionGrid, n_channels: u32) -> Self {
        Self {
            acquisition_dir: acquisition_dir.into(),
            grid,
            n_channels: n_channels.max(1),
            decoder: SerpentineDecoder { ncol: grid.ncol },
        }
    }

    /// Tile directories currently present, sorted by index then channel.
    fn scan(&self) -> Result<Vec<PathBuf>, WatchError> {
        let pattern = format!(
            "{}/*___*c",
            glob::Pattern::escape(&self.acquisition_dir.to_string_lossy())
        );
        let mut found: Vec<PathBuf> = glob::glob(&pattern)?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(SerpentineDecoder::is_tile_name)
            })
            .collect();
        found.sort();
        Ok(found)
    }
}

impl TileWatcher for ClearscopeWatcher {
    fn poll_next(&self, state: &mut PipelineState) -> Result<Option<TileDescriptor>, WatchError> {
        let found = self.scan()?;
        let mut discovered = 0;
        for path in found {
            if state.enqueued.contains(&path) {
                continue;
            }
            if let Some(coords) = self.decode_coordinates(&path) {
                if let Some(existing) = state.claimed.get(&coords) {
                    let mut matches = vec![existing.clone(), path];
                    matches.sort();
                    return Err(WatchError::Ambiguous {
                        pattern: format!(
                            "tile ({}, {}) channel {}",
                            coords.row, coords.col, coords.channel
                        ),
                        matches,
                    });
                }
                state.claimed.insert(coords, path.clone());
            }
            state.enqueued.insert(path.clone());
            state.pending.push_back(path);
            discovered += 1;
        }
        if discovered > 0 {
            debug!(discovered, pending = state.pending.len(), "New tile directories");
        }

        let Some(path) = state.pending.front().cloned() else {
            return Ok(None);
        };
        let coords = self
            .decode_coordinates(&path)
            .ok_or_else(|| WatchError::Undecodable(path.clone()))?;
        if !self.grid.contains(coords.position()) || coords.channel >= self.n_channels {
            return Err(WatchError::OutsideGrid {
                path,
                coords,
                grid: self.grid,
            });
        }
        state.current = Some(coords.position());
        Ok(Some(TileDescriptor {
            path,
            coords,
            tile_type: TileType::Clearscope,
        }))
    }

    fn decode_coordinates(&self, path: &Path) -> Option<TileCoordinates> {
        self.decoder.decode_path(path)
    }

    fn advance(&self, state: &mut PipelineState, tile: &TileDescriptor) {
        if state.pending.front() == Some(&tile.path) {
            state.pending.pop_front();
        }
        state.current = None;
    }

    fn grid(&self) -> AcquisitionGrid {
        self.grid
    }

    fn total_tiles(&self) -> usize {
        self.grid.len() * self.n_channels as usize
    }
}
