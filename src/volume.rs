use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;

/// Dense pixel data of one tile, ordered (depth, height, width).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Volume {
    pub data: Array3<u16>,
}

impl Volume {
    /// Voxel sizes are carried by the conversion parameters, not the buffer.
    pub fn from_data(data: Array3<u16>) -> Self {
        Self { data }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    pub fn plane(&self, index: usize) -> Option<ArrayView2<'_, u16>> {
        (index < self.data.dim().0).then(|| self.data.slice(s![index, .., ..]))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Intensity below which `fraction` of the voxels fall.
    ///
    /// Computed from a 16-bit histogram so it stays linear in the voxel count.
    pub fn quantile(&self, fraction: f64) -> u16 {
        let total = self.data.len();
        if total == 0 {
            return 0;
        }
        let histogram = self
            .data
            .as_slice_memory_order()
            .map(|values| {
                values
                    .par_chunks(1 << 16)
                    .map(Self::histogram)
                    .reduce(|| vec![0u64; 1 << 16], Self::merge_histograms)
            })
            .unwrap_or_else(|| {
                let mut h = vec![0u64; 1 << 16];
                self.data.iter().for_each(|&v| h[v as usize] += 1);
                h
            });

        let target = ((total as f64) * fraction.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (value, count) in histogram.iter().enumerate() {
            seen += count;
            if seen >= target {
                return value as u16;
            }
        }
        u16::MAX
    }

    fn histogram(values: &[u16]) -> Vec<u64> {
        let mut h = vec![0u64; 1 << 16];
        values.iter().for_each(|&v| h[v as usize] += 1);
        h
    }

    fn merge_histograms(mut a: Vec<u64>, b: Vec<u64>) -> Vec<u64> {
        a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile() {
        let data = Array3::from_shape_fn((1, 10, 10), |(_, y, x)| (y * 10 + x) as u16);
        let volume = Volume::from_data(data);
        assert_eq!(volume.quantile(0.0), 0);
        assert_eq!(volume.quantile(0.5), 49);
        assert_eq!(volume.quantile(1.0), 99);
        assert_eq!(Volume::default().quantile(0.5), 0);
    }

    #[test]
    fn test_plane_bounds() {
        let volume = Volume::from_data(Array3::zeros((2, 3, 4)));
        assert_eq!(volume.plane(1).map(|p| p.dim()), Some((3, 4)));
        assert!(volume.plane(2).is_none());
    }
}
