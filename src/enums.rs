use serde::{Deserialize, Serialize};

/// On-disk convention a tile was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileType {
    /// Folder of 2D TIFF slices, one `*CHN0{channel}_*tif` series per channel.
    Colm,
    /// Folder of 2D slices, every file belongs to the tile.
    Clearscope,
    /// Single multi-page TIFF.
    #[default]
    Tiff3d,
    /// Tile that was already converted and persisted by a previous run.
    Apr,
    /// Headerless native-endian `u16` dump, reshaped with the frame size.
    Raw,
}

impl TileType {
    /// Whether the raw source may be deleted once its conversion is verified.
    ///
    /// Formats opt in here explicitly; folder based formats and converted
    /// tiles are never erased.
    pub fn supports_erase(self) -> bool {
        matches!(self, TileType::Tiff3d | TileType::Raw)
    }

    /// Whether the tile source is a directory rather than a single file.
    pub fn is_directory(self) -> bool {
        matches!(self, TileType::Colm | TileType::Clearscope)
    }

    pub fn is_converted(self) -> bool {
        matches!(self, TileType::Apr)
    }
}

/// Lifecycle of a tile inside one pipeline iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileState {
    #[default]
    Unloaded,
    Loaded,
    Converted,
    Persisted,
    Erased,
}
