//! Grid addressing and the per-instrument decoding of tile names.
//!
//! Two instrument conventions are supported:
//!
//! - **Raster**: the row and column are spelled out in the name,
//!   `{row}_{col}.{ext}`, and tiles arrive row-major.
//! - **Serpentine**: the instrument writes one directory per grid position
//!   named `{6 digits}_{6 digit index}___{channel}c`. The index is 1-based
//!   and follows a boustrophedon scan, so odd rows run right to left.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static RASTER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)_(\d+)(?:\.[^.]+)*$").expect("raster pattern is valid")
});

static SERPENTINE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{6}_(\d{6})___(\d)c$").expect("serpentine pattern is valid")
});

/// `(row, col)` cell of the acquisition mosaic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GridPosition {
    pub row: usize,
    pub col: usize,
}

impl GridPosition {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

/// Full address of a tile: grid cell plus channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileCoordinates {
    pub row: usize,
    pub col: usize,
    pub channel: u32,
}

impl TileCoordinates {
    pub const fn new(row: usize, col: usize, channel: u32) -> Self {
        Self { row, col, channel }
    }

    pub fn position(&self) -> GridPosition {
        GridPosition::new(self.row, self.col)
    }
}

/// Dimensions of the scanned mosaic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionGrid {
    pub nrow: usize,
    pub ncol: usize,
}

impl AcquisitionGrid {
    pub const fn new(nrow: usize, ncol: usize) -> Self {
        Self { nrow, ncol }
    }

    /// Number of grid positions.
    pub fn len(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, position: GridPosition) -> bool {
        position.row < self.nrow && position.col < self.ncol
    }

    /// Raster successor of `current`: next column, wrapping to the start of
    /// the following row after the last column.
    pub fn next_raster(&self, current: GridPosition) -> GridPosition {
        if current.col + 1 >= self.ncol {
            GridPosition::new(current.row + 1, 0)
        } else {
            GridPosition::new(current.row, current.col + 1)
        }
    }

    /// East and south neighbors only.
    ///
    /// Pairwise overlap work iterates every tile's reduced set, so each
    /// adjacency is visited once.
    pub fn neighbors(&self, position: GridPosition) -> Vec<GridPosition> {
        let candidates = [
            GridPosition::new(position.row, position.col + 1),
            GridPosition::new(position.row + 1, position.col),
        ];
        candidates
            .into_iter()
            .filter(|p| self.contains(*p))
            .collect()
    }

    /// All 4-connected neighbors, ordered north, west, east, south.
    pub fn neighbors_full(&self, position: GridPosition) -> Vec<GridPosition> {
        let mut out = Vec::with_capacity(4);
        if position.row > 0 {
            out.push(GridPosition::new(position.row - 1, position.col));
        }
        if position.col > 0 {
            out.push(GridPosition::new(position.row, position.col - 1));
        }
        out.extend(self.neighbors(position));
        out
    }
}

/// Invert a 1-based serpentine acquisition index into its grid cell.
///
/// Rows advance every `ncol` indices. Even rows (0-based) run left to
/// right and odd rows run right to left. Returns `None` for index 0 or an
/// empty row length.
pub fn serpentine_position(index: usize, ncol: usize) -> Option<GridPosition> {
    if index == 0 || ncol == 0 {
        return None;
    }
    let n = index as i64;
    let width = ncol as i64;

    // Folding (n - ncol - 1) mod 2*ncol around ncol mirrors every other row.
    let folded = (n - width - 1).rem_euclid(2 * width) - width;
    let col = if folded >= 0 { folded } else { -folded - 1 };
    let row = (index - 1) / ncol;

    Some(GridPosition::new(row, col as usize))
}

/// Instrument specific mapping from a tile name to its address.
pub trait CoordinateDecoder: Send + Sync {
    /// Decode a file or directory name. Names that do not follow the
    /// convention yield `None`; they are skipped, never treated as errors.
    fn decode(&self, name: &str) -> Option<TileCoordinates>;

    fn decode_path(&self, path: &Path) -> Option<TileCoordinates> {
        let name = path.file_name()?.to_str()?;
        self.decode(name)
    }
}

/// `{row}_{col}.{ext}` names. Every tile is on a single configured channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterDecoder {
    pub channel: u32,
}

impl CoordinateDecoder for RasterDecoder {
    fn decode(&self, name: &str) -> Option<TileCoordinates> {
        let caps = RASTER_NAME.captures(name)?;
        let row = caps[1].parse().ok()?;
        let col = caps[2].parse().ok()?;
        Some(TileCoordinates::new(row, col, self.channel))
    }
}

/// ClearScope directory names carrying a serpentine index and a channel.
#[derive(Debug, Clone, Copy)]
pub struct SerpentineDecoder {
    pub ncol: usize,
}

impl SerpentineDecoder {
    /// Raw acquisition index embedded in a directory name.
    pub fn index(name: &str) -> Option<usize> {
        SERPENTINE_NAME.captures(name)?[1].parse().ok()
    }

    pub fn is_tile_name(name: &str) -> bool {
        SERPENTINE_NAME.is_match(name)
    }
}

impl CoordinateDecoder for SerpentineDecoder {
    fn decode(&self, name: &str) -> Option<TileCoordinates> {
        let caps = SERPENTINE_NAME.captures(name)?;
        let index: usize = caps[1].parse().ok()?;
        let channel: u32 = caps[2].parse().ok()?;
        let position = serpentine_position(index, self.ncol)?;
        Some(TileCoordinates::new(position.row, position.col, channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_serpentine_reference_points() {
        let at = |n| serpentine_position(n, 10).unwrap();
        assert_eq!(at(1), GridPosition::new(0, 0));
        assert_eq!(at(10), GridPosition::new(0, 9));
        assert_eq!(at(11), GridPosition::new(1, 9), "second row runs backwards");
        assert_eq!(at(20), GridPosition::new(1, 0));
        assert_eq!(at(21), GridPosition::new(2, 0));
    }

    #[test]
    fn test_serpentine_is_bijective_for_even_and_odd_widths() {
        for (nrow, ncol) in [(4, 10), (5, 7), (3, 1), (1, 6), (17, 13)] {
            let grid = AcquisitionGrid::new(nrow, ncol);
            let mut seen = HashSet::new();
            for n in 1..=grid.len() {
                let position = serpentine_position(n, ncol).unwrap();
                assert!(grid.contains(position), "{n} -> {position:?} outside {grid:?}");
                assert!(seen.insert(position), "{n} revisits {position:?}");
            }
            assert_eq!(seen.len(), grid.len());
        }
    }

    #[test]
    fn test_serpentine_consecutive_indices_are_adjacent() {
        let ncol = 7;
        for n in 1..(5 * ncol) {
            let a = serpentine_position(n, ncol).unwrap();
            let b = serpentine_position(n + 1, ncol).unwrap();
            let distance = a.row.abs_diff(b.row) + a.col.abs_diff(b.col);
            assert_eq!(distance, 1, "{n} -> {a:?}, {} -> {b:?}", n + 1);
        }
    }

    #[test]
    fn test_serpentine_rejects_zero() {
        assert_eq!(serpentine_position(0, 10), None);
        assert_eq!(serpentine_position(3, 0), None);
    }

    #[test]
    fn test_raster_cursor_advance() {
        let grid = AcquisitionGrid::new(3, 4);
        assert_eq!(grid.next_raster(GridPosition::new(0, 2)), GridPosition::new(0, 3));
        assert_eq!(grid.next_raster(GridPosition::new(0, 3)), GridPosition::new(1, 0));
        assert_eq!(grid.next_raster(GridPosition::new(2, 3)), GridPosition::new(3, 0));
    }

    #[test]
    fn test_neighbors() {
        let grid = AcquisitionGrid::new(4, 4);
        let p = GridPosition::new(0, 1);
        assert_eq!(
            grid.neighbors(p),
            vec![GridPosition::new(0, 2), GridPosition::new(1, 1)]
        );
        assert_eq!(
            grid.neighbors_full(p),
            vec![
                GridPosition::new(0, 0),
                GridPosition::new(0, 2),
                GridPosition::new(1, 1)
            ]
        );
        assert!(grid.neighbors(GridPosition::new(3, 3)).is_empty());
        assert_eq!(grid.neighbors_full(GridPosition::new(2, 2)).len(), 4);
    }

    #[test]
    fn test_raster_decoder() {
        let decoder = RasterDecoder { channel: 2 };
        assert_eq!(decoder.decode("3_12.tif"), Some(TileCoordinates::new(3, 12, 2)));
        assert_eq!(decoder.decode("0_0"), Some(TileCoordinates::new(0, 0, 2)));
        assert_eq!(decoder.decode("a_0.tif"), None);
        assert_eq!(decoder.decode("3_12_x.tif"), None);
    }

    #[test]
    fn test_serpentine_decoder() {
        let decoder = SerpentineDecoder { ncol: 10 };
        assert_eq!(
            decoder.decode("000000_000011___1c"),
            Some(TileCoordinates::new(1, 9, 1))
        );
        assert_eq!(
            decoder.decode_path(Path::new("/acq/0001/000000_000001___0c")),
            Some(TileCoordinates::new(0, 0, 0))
        );
        assert_eq!(decoder.decode("000000_000011___1c.tmp"), None);
        assert_eq!(decoder.decode("000000_11___1c"), None);
        assert_eq!(SerpentineDecoder::index("123456_000042___3c"), Some(42));
    }
}
