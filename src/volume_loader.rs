use crate::{enums::TileType, volume::Volume};

use image::ImageReader;
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::{
    fs,
    io::BufReader,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tiff::decoder::{Decoder, DecodingResult, Limits};

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No image slices found in {0}")]
    NoValidImages(PathBuf),

    #[error("Inconsistent image dimensions in {0}")]
    InconsistentDimensions(PathBuf),

    #[error("Raw file {path} holds {len} samples, not a multiple of {frame_size}x{frame_size}")]
    RawSize {
        path: PathBuf,
        len: usize,
        frame_size: usize,
    },

    #[error("Unsupported sample format in {0}")]
    UnsupportedSampleFormat(PathBuf),

    #[error("Tile type {0:?} does not hold pixel data")]
    NotPixelData(TileType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Glob error: {0}")]
    Glob(#[from] glob::PatternError),
}

impl VolumeLoaderError {
    /// Storage failures that may succeed when tried again, as opposed to
    /// data that will never decode.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            VolumeLoaderError::Io(_)
                | VolumeLoaderError::Image(image::ImageError::IoError(_))
                | VolumeLoaderError::Tiff(tiff::TiffError::IoError(_))
        )
    }
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load the pixel data of a tile according to its source convention
    ///
    /// # Arguments
    ///
    /// * `path` - Tile file, or folder for slice based types
    /// * `tile_type` - Source convention
    /// * `channel` - Channel used to filter COLM slices
    /// * `frame_size` - Sensor edge length used to reshape raw dumps
    ///
    /// # Errors
    ///
    /// Returns [`VolumeLoaderError::NotPixelData`] for converted tiles, which
    /// are read through a store instead.
    pub fn load(
        path: &Path,
        tile_type: TileType,
        channel: u32,
        frame_size: usize,
    ) -> Result<Volume, VolumeLoaderError> {
        match tile_type {
            TileType::Colm => Self::load_colm(path, channel),
            TileType::Clearscope => Self::load_from_directory(path),
            TileType::Tiff3d => Self::load_tiff_stack(path),
            TileType::Raw => Self::load_raw(path, frame_size),
            TileType::Apr => Err(VolumeLoaderError::NotPixelData(tile_type)),
        }
    }

    /// Load a volume from every slice file in a directory, sorted by name
    pub fn load_from_directory(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        let mut paths: Vec<_> = fs::read_dir(path)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        Self::load_from_file_paths(path, &paths)
    }

    /// Load the `*CHN0{channel}_*tif` series of a COLM tile folder
    pub fn load_colm(path: impl AsRef<Path>, channel: u32) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        let pattern = format!(
            "{}/*CHN0{}_*tif",
            glob::Pattern::escape(&path.to_string_lossy()),
            channel
        );
        let mut paths: Vec<PathBuf> = glob::glob(&pattern)?.filter_map(Result::ok).collect();
        paths.sort();

        Self::load_from_file_paths(path, &paths)
    }

    /// Load a volume from 2D slice files, in the given order
    ///
    /// Slices are decoded in parallel.
    pub fn load_from_file_paths(
        origin: &Path,
        paths: &[impl AsRef<Path> + Sync],
    ) -> Result<Volume, VolumeLoaderError> {
        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages(origin.to_path_buf()));
        }

        let images = paths
            .par_iter()
            .map(|p| Self::decode_slice(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Self::validate_dimensions(origin, &images)?;

        Ok(Volume::from_data(Self::build_volume_array(&images)))
    }

    /// Load every page of a multi-page TIFF as one plane
    pub fn load_tiff_stack(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());

        let mut images = Vec::new();
        loop {
            let (width, height) = decoder.dimensions()?;
            let samples = Self::samples_to_u16(path, decoder.read_image()?)?;
            let image = Array2::from_shape_vec((height as usize, width as usize), samples)
                .map_err(|_| VolumeLoaderError::InconsistentDimensions(path.to_path_buf()))?;
            images.push(image);

            if !decoder.more_images() {
                break;
            }
            decoder.next_image()?;
        }

        Self::validate_dimensions(path, &images)?;
        Ok(Volume::from_data(Self::build_volume_array(&images)))
    }

    /// Load a headerless `u16` dump shaped `(-1, frame_size, frame_size)`
    pub fn load_raw(path: impl AsRef<Path>, frame_size: usize) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let frame = frame_size * frame_size;
        if bytes.len() % 2 != 0 || frame == 0 || (bytes.len() / 2) % frame != 0 {
            return Err(VolumeLoaderError::RawSize {
                path: path.to_path_buf(),
                len: bytes.len() / 2,
                frame_size,
            });
        }

        let samples: Vec<u16> = bytemuck::pod_collect_to_vec(&bytes);
        let depth = samples.len() / frame;
        let data = Array3::from_shape_vec((depth, frame_size, frame_size), samples)
            .map_err(|_| VolumeLoaderError::InconsistentDimensions(path.to_path_buf()))?;
        Ok(Volume::from_data(data))
    }

    fn decode_slice(path: &Path) -> Result<Array2<u16>, VolumeLoaderError> {
        let image = ImageReader::open(path)?
            .with_guessed_format()?
            .decode()?
            .into_luma16();
        let (width, height) = image.dimensions();
        Array2::from_shape_vec((height as usize, width as usize), image.into_raw())
            .map_err(|_| VolumeLoaderError::InconsistentDimensions(path.to_path_buf()))
    }

    fn samples_to_u16(path: &Path, result: DecodingResult) -> Result<Vec<u16>, VolumeLoaderError> {
        match result {
            DecodingResult::U16(data) => Ok(data),
            DecodingResult::U8(data) => Ok(data.into_iter().map(u16::from).collect()),
            _ => Err(VolumeLoaderError::UnsupportedSampleFormat(path.to_path_buf())),
        }
    }

    fn validate_dimensions(origin: &Path, images: &[Array2<u16>]) -> Result<(), VolumeLoaderError> {
        let first_dim = images[0].dim();
        if images.iter().any(|img| img.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions(origin.to_path_buf()));
        }
        Ok(())
    }

    fn build_volume_array(images: &[Array2<u16>]) -> Array3<u16> {
        let (height, width) = images[0].dim();
        let depth = images.len();
        let mut volume = Array3::<u16>::zeros((depth, height, width));

        for (i, image) in images.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(image);
        }

        volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use tiff::encoder::{TiffEncoder, colortype};

    fn write_slice(path: &Path, width: u32, height: u32, value: u16) {
        let pixels = vec![value; (width * height) as usize];
        let image: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_raw(width, height, pixels).unwrap();
        image.save(path).unwrap();
    }

    #[test]
    fn test_load_colm_filters_channel_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write_slice(&dir.path().join("LOC000_CHN00_PLN0001.tif"), 4, 3, 20);
        write_slice(&dir.path().join("LOC000_CHN00_PLN0000.tif"), 4, 3, 10);
        write_slice(&dir.path().join("LOC000_CHN01_PLN0000.tif"), 4, 3, 99);

        let volume = VolumeLoader::load_colm(dir.path(), 0).unwrap();
        assert_eq!(volume.dim(), (2, 3, 4));
        assert_eq!(volume.data[[0, 0, 0]], 10);
        assert_eq!(volume.data[[1, 2, 3]], 20);

        let other = VolumeLoader::load_colm(dir.path(), 1).unwrap();
        assert_eq!(other.dim(), (1, 3, 4));
    }

    #[test]
    fn test_load_directory_rejects_mixed_sizes() {
        let dir = tempfile::tempdir().unwrap();
        write_slice(&dir.path().join("a.tif"), 4, 3, 1);
        write_slice(&dir.path().join("b.tif"), 5, 3, 1);
        assert!(matches!(
            VolumeLoader::load_from_directory(dir.path()),
            Err(VolumeLoaderError::InconsistentDimensions(_))
        ));
    }

    #[test]
    fn test_load_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            VolumeLoader::load_from_directory(dir.path()),
            Err(VolumeLoaderError::NoValidImages(_))
        ));
    }

    #[test]
    fn test_load_tiff_stack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0_0.tif");
        let file = fs::File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        for plane in 0..3u16 {
            let data: Vec<u16> = (0..6).map(|i| plane * 100 + i).collect();
            encoder.write_image::<colortype::Gray16>(3, 2, &data).unwrap();
        }
        drop(encoder);

        let volume = VolumeLoader::load(&path, TileType::Tiff3d, 0, 2048).unwrap();
        assert_eq!(volume.dim(), (3, 2, 3));
        assert_eq!(volume.data[[2, 1, 2]], 205);
        assert_eq!(volume.plane(1).unwrap()[[0, 1]], 101);
    }

    #[test]
    fn test_load_raw_reshapes_by_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.raw");
        let samples: Vec<u16> = (0..(2 * 4 * 4)).collect();
        fs::write(&path, bytemuck::cast_slice::<u16, u8>(&samples)).unwrap();

        let volume = VolumeLoader::load_raw(&path, 4).unwrap();
        assert_eq!(volume.dim(), (2, 4, 4));
        assert_eq!(volume.data[[1, 0, 0]], 16);

        assert!(matches!(
            VolumeLoader::load_raw(&path, 3),
            Err(VolumeLoaderError::RawSize { .. })
        ));
    }

    #[test]
    fn test_converted_type_has_no_pixels() {
        assert!(matches!(
            VolumeLoader::load(Path::new("x.apr"), TileType::Apr, 0, 2048),
            Err(VolumeLoaderError::NotPixelData(TileType::Apr))
        ));
    }

    #[test]
    fn test_storage_failures_are_io() {
        let missing = VolumeLoader::load_tiff_stack("/nonexistent/0_0.tif").unwrap_err();
        assert!(missing.is_io());

        let truncated = VolumeLoaderError::Tiff(tiff::TiffError::IoError(
            std::io::ErrorKind::UnexpectedEof.into(),
        ));
        assert!(truncated.is_io());

        let empty = tempfile::tempdir().unwrap();
        assert!(!VolumeLoader::load_from_directory(empty.path()).unwrap_err().is_io());
    }
}
