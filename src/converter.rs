//! Conversion of dense tiles into a sparse representation.
//!
//! The production converter is an external library; [`VolumeConverter`] is
//! the seam it plugs into. [`SparseThresholdConverter`] is a self-contained
//! implementation used by the binary and the tests.

use ndarray::{Array3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::volume::Volume;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("cannot convert an empty volume")]
    EmptyVolume,

    #[error("invalid conversion parameter: {0}")]
    InvalidParameter(String),

    #[error("converted tile holds {coords} coordinates but {values} values")]
    Mismatch { coords: usize, values: usize },
}

/// Numeric parameter set handed to the converter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionParameters {
    /// Intensities below this are treated as background.
    pub intensity_threshold: u16,
    /// Relative error bound, in `[0, 1)`.
    pub rel_error: f32,
    /// Gradient smoothing, 0 for none.
    pub gradient_smoothing: f32,
    pub dx: f32,
    pub dy: f32,
    pub dz: f32,
    /// Let the converter estimate parameters from the data.
    pub auto_parameters: bool,
    /// Derive the auxiliary summary before persisting. Costs about 1/7
    /// extra storage and enables fast low resolution reads.
    pub auxiliary: bool,
}

impl Default for ConversionParameters {
    fn default() -> Self {
        Self {
            intensity_threshold: 108,
            rel_error: 0.2,
            gradient_smoothing: 2.0,
            dx: 1.0,
            dy: 1.0,
            dz: 1.0,
            auto_parameters: true,
            auxiliary: true,
        }
    }
}

impl ConversionParameters {
    pub fn validate(&self) -> Result<(), ConvertError> {
        if !(0.0..1.0).contains(&self.rel_error) {
            return Err(ConvertError::InvalidParameter(format!(
                "rel_error must be in [0, 1), got {}",
                self.rel_error
            )));
        }
        if !(self.gradient_smoothing >= 0.0) {
            return Err(ConvertError::InvalidParameter(format!(
                "gradient_smoothing must be >= 0, got {}",
                self.gradient_smoothing
            )));
        }
        for (axis, size) in [("dx", self.dx), ("dy", self.dy), ("dz", self.dz)] {
            if !(size > 0.0) {
                return Err(ConvertError::InvalidParameter(format!(
                    "{axis} must be > 0, got {size}"
                )));
            }
        }
        Ok(())
    }
}

/// Sparse converted tile: one particle per retained voxel.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedTile {
    /// Shape of the source volume (depth, height, width).
    pub shape: [usize; 3],
    /// Particle locations as `[z, y, x]`.
    pub coords: Vec<[u32; 3]>,
    pub values: Vec<u16>,
    /// Parameters the tile was produced with, after auto estimation.
    pub parameters: ConversionParameters,
}

impl ConvertedTile {
    pub fn new(
        shape: [usize; 3],
        coords: Vec<[u32; 3]>,
        values: Vec<u16>,
        parameters: ConversionParameters,
    ) -> Result<Self, ConvertError> {
        if coords.len() != values.len() {
            return Err(ConvertError::Mismatch {
                coords: coords.len(),
                values: values.len(),
            });
        }
        Ok(Self {
            shape,
            coords,
            values,
            parameters,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Dense reconstruction with `fill` wherever no particle exists.
    pub fn reconstruct(&self, fill: u16) -> Array3<u16> {
        let [d, h, w] = self.shape;
        let mut out = Array3::from_elem((d, h, w), fill);
        for (&[z, y, x], &v) in self.coords.iter().zip(&self.values) {
            out[[z as usize, y as usize, x as usize]] = v;
        }
        out
    }
}

/// Coarse companion of a converted tile, one value per 2x2x2 block.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxiliaryTile {
    pub values: Array3<u16>,
}

impl AuxiliaryTile {
    pub fn dim(&self) -> (usize, usize, usize) {
        self.values.dim()
    }
}

/// Capability provided by the conversion library.
pub trait VolumeConverter: Send + Sync {
    fn convert(
        &self,
        volume: &Volume,
        params: &ConversionParameters,
    ) -> Result<ConvertedTile, ConvertError>;

    fn derive_auxiliary(&self, converted: &ConvertedTile) -> AuxiliaryTile;
}

/// Keeps every voxel at or above the intensity threshold.
///
/// With `auto_parameters` the threshold is raised to the median intensity
/// of the tile, which is dominated by background in cleared tissue.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseThresholdConverter;

impl SparseThresholdConverter {
    fn effective_threshold(volume: &Volume, params: &ConversionParameters) -> u16 {
        if params.auto_parameters {
            params.intensity_threshold.max(volume.quantile(0.5))
        } else {
            params.intensity_threshold
        }
    }
}

impl VolumeConverter for SparseThresholdConverter {
    fn convert(
        &self,
        volume: &Volume,
        params: &ConversionParameters,
    ) -> Result<ConvertedTile, ConvertError> {
        params.validate()?;
        if volume.is_empty() {
            return Err(ConvertError::EmptyVolume);
        }

        let threshold = Self::effective_threshold(volume, params);
        let (depth, height, width) = volume.dim();

        let planes: Vec<(Vec<[u32; 3]>, Vec<u16>)> = volume
            .data()
            .axis_iter(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(z, plane)| {
                let mut coords = Vec::new();
                let mut values = Vec::new();
                for ((y, x), &v) in plane.indexed_iter() {
                    if v >= threshold {
                        coords.push([z as u32, y as u32, x as u32]);
                        values.push(v);
                    }
                }
                (coords, values)
            })
            .collect();

        let (coords, values): (Vec<_>, Vec<_>) = planes.into_iter().unzip();
        let parameters = ConversionParameters {
            intensity_threshold: threshold,
            ..*params
        };
        ConvertedTile::new(
            [depth, height, width],
            coords.concat(),
            values.concat(),
            parameters,
        )
    }

    fn derive_auxiliary(&self, converted: &ConvertedTile) -> AuxiliaryTile {
        let [d, h, w] = converted.shape;
        let shape = (d.div_ceil(2), h.div_ceil(2), w.div_ceil(2));
        let mut sums = Array3::<u64>::zeros(shape);
        let mut counts = Array3::<u32>::zeros(shape);
        for (&[z, y, x], &v) in converted.coords.iter().zip(&converted.values) {
            let idx = [z as usize / 2, y as usize / 2, x as usize / 2];
            sums[idx] += u64::from(v);
            counts[idx] += 1;
        }
        let values = ndarray::Zip::from(&sums)
            .and(&counts)
            .map_collect(|&s, &c| if c == 0 { 0 } else { (s / u64::from(c)) as u16 });
        AuxiliaryTile { values }
    }
}
