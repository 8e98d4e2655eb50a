//! Conversion of a loaded tile, persistence under the channel-scoped layout,
//! and the post-conversion integrity decision.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::converter::{ConversionParameters, ConvertError, VolumeConverter};
use crate::enums::{TileState, TileType};
use crate::integrity::{IntegrityCheck, RetainRaw};
use crate::store::{CompressionSettings, StoreError, TileLayout, TileStore};
use crate::tile::{Tile, TileError};

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("{tile_type:?} tiles cannot be converted")]
    UnsupportedType { tile_type: TileType },

    #[error("tile {0} has no pixel data loaded")]
    NotLoaded(PathBuf),

    #[error("conversion of {path} failed: {source}")]
    Convert {
        path: PathBuf,
        #[source]
        source: ConvertError,
    },

    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tile(#[from] TileError),
}

impl ConversionError {
    pub fn is_io(&self) -> bool {
        match self {
            ConversionError::CreateDir { .. } => true,
            ConversionError::Store(e) => e.is_io(),
            ConversionError::Tile(e) => e.is_io(),
            _ => false,
        }
    }
}

/// What happened to the raw source after the integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawDisposition {
    /// Check failed or is not configured; raw data kept.
    Retained,
    /// Check passed but the tile type does not allow erasing.
    Verified,
    /// Check passed and the raw source was deleted.
    Erased,
}

/// Wraps the external converter and store with the run's settings.
#[derive(Clone)]
pub struct ConversionOrchestrator {
    converter: Arc<dyn VolumeConverter>,
    store: Arc<dyn TileStore>,
    integrity: Arc<dyn IntegrityCheck>,
    parameters: ConversionParameters,
    compression: Option<CompressionSettings>,
    layout: TileLayout,
}

impl ConversionOrchestrator {
    pub fn new(
        root: impl Into<PathBuf>,
        converter: Arc<dyn VolumeConverter>,
        store: Arc<dyn TileStore>,
        parameters: ConversionParameters,
    ) -> Self {
        let layout = TileLayout::new(root, store.extension());
        Self {
            converter,
            store,
            integrity: Arc::new(RetainRaw),
            parameters,
            compression: None,
            layout,
        }
    }

    pub fn with_compression(mut self, compression: CompressionSettings) -> Self {
        self.compression = compression.enabled.then_some(compression);
        self
    }

    pub fn without_compression(mut self) -> Self {
        self.compression = None;
        self
    }

    pub fn with_integrity_check(mut self, integrity: Arc<dyn IntegrityCheck>) -> Self {
        self.integrity = integrity;
        self
    }

    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    pub fn store(&self) -> &dyn TileStore {
        self.store.as_ref()
    }

    pub fn parameters(&self) -> &ConversionParameters {
        &self.parameters
    }

    pub fn compression(&self) -> Option<&CompressionSettings> {
        self.compression.as_ref()
    }

    /// Convert a loaded tile and persist it at
    /// `{root}/APR/ch{channel}/{row}_{col}.{ext}`.
    ///
    /// On success the tile holds the uncompressed converted representation
    /// and is in the `Persisted` state.
    pub fn convert(&self, tile: &mut Tile) -> Result<PathBuf, ConversionError> {
        if tile.tile_type.is_converted() {
            return Err(ConversionError::UnsupportedType {
                tile_type: tile.tile_type,
            });
        }
        let volume = tile
            .data()
            .ok_or_else(|| ConversionError::NotLoaded(tile.path.clone()))?;

        let converted = self
            .converter
            .convert(volume, &self.parameters)
            .map_err(|source| ConversionError::Convert {
                path: tile.path.clone(),
                source,
            })?;
        let auxiliary = self
            .parameters
            .auxiliary
            .then(|| self.converter.derive_auxiliary(&converted));

        let path = self.layout.tile_path(tile.coordinates());
        let channel_dir = self.layout.channel_dir(tile.channel);
        std::fs::create_dir_all(&channel_dir).map_err(|source| ConversionError::CreateDir {
            path: channel_dir,
            source,
        })?;

        self.store.write(
            &path,
            &converted,
            auxiliary.as_ref(),
            self.compression.as_ref(),
        )?;
        info!(
            path = %path.display(),
            particles = converted.len(),
            compressed = self.compression.is_some(),
            "Tile converted"
        );

        tile.set_converted(converted)?;
        tile.mark_persisted(path.clone())?;
        Ok(path)
    }

    /// Run the integrity check and erase the raw source only if it passes.
    pub fn verify(&self, tile: &mut Tile) -> Result<RawDisposition, ConversionError> {
        if tile.state() != TileState::Persisted {
            return Err(TileError::InvalidState {
                path: tile.path.clone(),
                operation: "integrity check",
                expected: TileState::Persisted,
                actual: tile.state(),
            }
            .into());
        }
        let passed = {
            let tile: &Tile = tile;
            tile.converted_data()
                .is_some_and(|converted| self.integrity.verify(tile, converted))
        };

        if !passed {
            warn!(path = %tile.path.display(), "Integrity check did not pass, keeping raw data");
            return Ok(RawDisposition::Retained);
        }
        if tile.erase_from_disk()? {
            info!(path = %tile.path.display(), "Raw data erased");
            Ok(RawDisposition::Erased)
        } else {
            Ok(RawDisposition::Verified)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{AuxiliaryTile, ConvertedTile, SparseThresholdConverter};
    use crate::coordinates::TileCoordinates;
    use crate::store::{FileTileStore, Segmentation};
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(PathBuf, Vec<u16>, bool, Option<CompressionSettings>)>>,
    }

    impl TileStore for RecordingStore {
        fn extension(&self) -> &str {
            "apr"
        }
        fn write(
            &self,
            path: &Path,
            converted: &ConvertedTile,
            auxiliary: Option<&AuxiliaryTile>,
            compression: Option<&CompressionSettings>,
        ) -> Result<(), StoreError> {
            self.writes.lock().unwrap().push((
                path.to_path_buf(),
                converted.values.clone(),
                auxiliary.is_some(),
                compression.copied(),
            ));
            Ok(())
        }
        fn read(&self, path: &Path) -> Result<ConvertedTile, StoreError> {
            FileTileStore.read(path)
        }
        fn read_auxiliary(&self, _: &Path) -> Result<Option<AuxiliaryTile>, StoreError> {
            Ok(None)
        }
        fn read_segmentation(&self, _: &Path) -> Result<Option<Segmentation>, StoreError> {
            Ok(None)
        }
        fn write_segmentation(&self, _: &Path, _: &Segmentation) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn raw_tile(dir: &Path, value: u16) -> Tile {
        let path = dir.join("1_2.raw");
        let samples = vec![value; 2 * 2 * 2];
        std::fs::write(&path, bytemuck::cast_slice::<u16, u8>(&samples)).unwrap();
        let mut tile =
            Tile::new(path, TileCoordinates::new(1, 2, 3), TileType::Raw).with_frame_size(2);
        tile.load(&FileTileStore).unwrap();
        tile
    }

    fn params(auxiliary: bool) -> ConversionParameters {
        ConversionParameters {
            intensity_threshold: 0,
            auto_parameters: false,
            auxiliary,
            ..Default::default()
        }
    }

    #[test]
    fn test_convert_persists_under_channel_layout() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ConversionOrchestrator::new(
            dir.path(),
            Arc::new(SparseThresholdConverter),
            Arc::new(FileTileStore),
            params(true),
        );
        let mut tile = raw_tile(dir.path(), 500);
        let path = orchestrator.convert(&mut tile).unwrap();

        assert_eq!(path, dir.path().join("APR/ch3/1_2.apr"));
        assert!(path.exists());
        assert_eq!(tile.state(), TileState::Persisted);
        assert_eq!(tile.persisted_path(), Some(path.as_path()));
        assert!(FileTileStore.read_auxiliary(&path).unwrap().is_some());
    }

    #[test]
    fn test_compression_is_handed_to_write_and_not_applied_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let compression = CompressionSettings {
            enabled: true,
            quantization_factor: 50,
            background: 600,
        };
        let orchestrator = ConversionOrchestrator::new(
            dir.path(),
            Arc::new(SparseThresholdConverter),
            store.clone(),
            params(false),
        )
        .with_compression(compression);

        let mut tile = raw_tile(dir.path(), 500);
        orchestrator.convert(&mut tile).unwrap();

        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].3, Some(compression));
        assert!(!writes[0].2, "auxiliary disabled");
        assert!(tile.converted_data().unwrap().values.iter().all(|&v| v == 500));
    }

    #[test]
    fn test_disabled_compression_is_not_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let orchestrator = ConversionOrchestrator::new(
            dir.path(),
            Arc::new(SparseThresholdConverter),
            store.clone(),
            params(false),
        )
        .with_compression(CompressionSettings {
            enabled: false,
            ..Default::default()
        });
        assert!(orchestrator.compression().is_none());
        let mut tile = raw_tile(dir.path(), 1);
        orchestrator.convert(&mut tile).unwrap();
        assert_eq!(store.writes.lock().unwrap()[0].3, None);
    }

    #[test]
    fn test_default_check_retains_raw() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ConversionOrchestrator::new(
            dir.path(),
            Arc::new(SparseThresholdConverter),
            Arc::new(FileTileStore),
            params(false),
        );
        let mut tile = raw_tile(dir.path(), 5);
        orchestrator.convert(&mut tile).unwrap();
        assert_eq!(orchestrator.verify(&mut tile).unwrap(), RawDisposition::Retained);
        assert!(tile.path.exists());
    }

    #[test]
    fn test_passing_check_erases_raw_but_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let check = |tile: &Tile, converted: &ConvertedTile| {
            tile.data().map(|v| v.data.len()) == Some(converted.len())
        };
        let orchestrator = ConversionOrchestrator::new(
            dir.path(),
            Arc::new(SparseThresholdConverter),
            Arc::new(FileTileStore),
            params(false),
        )
        .with_integrity_check(Arc::new(check));
        let mut tile = raw_tile(dir.path(), 5);
        let output = orchestrator.convert(&mut tile).unwrap();
        assert_eq!(orchestrator.verify(&mut tile).unwrap(), RawDisposition::Erased);
        assert!(!tile.path.exists());
        assert!(output.exists());
    }

    #[test]
    fn test_verify_before_convert_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ConversionOrchestrator::new(
            dir.path(),
            Arc::new(SparseThresholdConverter),
            Arc::new(FileTileStore),
            params(false),
        )
        .with_integrity_check(Arc::new(|_: &Tile, _: &ConvertedTile| true));
        let mut tile = raw_tile(dir.path(), 5);
        assert!(orchestrator.verify(&mut tile).is_err());
        assert!(tile.path.exists());
    }

    struct FailingConverter;

    impl VolumeConverter for FailingConverter {
        fn convert(
            &self,
            _: &crate::volume::Volume,
            _: &ConversionParameters,
        ) -> Result<ConvertedTile, ConvertError> {
            Err(ConvertError::EmptyVolume)
        }
        fn derive_auxiliary(&self, _: &ConvertedTile) -> AuxiliaryTile {
            unreachable!("no conversion result to summarize")
        }
    }

    #[test]
    fn test_converter_failure_leaves_tile_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let orchestrator = ConversionOrchestrator::new(
            dir.path(),
            Arc::new(FailingConverter),
            store.clone(),
            params(true),
        );
        let mut tile = raw_tile(dir.path(), 5);
        let err = orchestrator.convert(&mut tile).unwrap_err();
        assert!(matches!(err, ConversionError::Convert { .. }));
        assert!(!err.is_io());
        assert_eq!(tile.state(), TileState::Loaded);
        assert!(store.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_converted_tiles_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ConversionOrchestrator::new(
            dir.path(),
            Arc::new(SparseThresholdConverter),
            Arc::new(FileTileStore),
            params(false),
        );
        let mut tile = Tile::new("x.apr", TileCoordinates::default(), TileType::Apr);
        assert!(matches!(
            orchestrator.convert(&mut tile),
            Err(ConversionError::UnsupportedType { .. })
        ));
    }
}
