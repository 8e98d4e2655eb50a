//! Decision whether a tile's raw source may be discarded after conversion.

use crate::converter::ConvertedTile;
use crate::tile::Tile;

/// Compares a loaded tile against its (uncompressed) conversion.
///
/// Returning `true` allows the raw source to be erased. Implementations
/// must not assume anything about the on-disk encoding of `converted`.
pub trait IntegrityCheck: Send + Sync {
    fn verify(&self, tile: &Tile, converted: &ConvertedTile) -> bool;
}

/// Keeps every raw source. Used until a real fidelity metric is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetainRaw;

impl IntegrityCheck for RetainRaw {
    fn verify(&self, _tile: &Tile, _converted: &ConvertedTile) -> bool {
        false
    }
}

impl<F> IntegrityCheck for F
where
    F: Fn(&Tile, &ConvertedTile) -> bool + Send + Sync,
{
    fn verify(&self, tile: &Tile, converted: &ConvertedTile) -> bool {
        self(tile, converted)
    }
}
