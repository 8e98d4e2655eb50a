//! Persistence of converted tiles.
//!
//! [`TileStore`] is the read/write seam; [`FileTileStore`] writes a small
//! little-endian container:
//!
//! ```text
//! magic "TSTL" | version u8 | flags u8
//! shape 3 x u64
//! parameters (threshold u16, rel_error f32, smoothing f32, dx dy dz f32, auto u8, aux u8)
//! quantization u16 | background u16
//! count u64 | coords count x 3 x u32 | values count x u16
//! [auxiliary: shape 3 x u64, values]          if FLAG_AUXILIARY
//! [segmentation: count x u32]                 if FLAG_SEGMENTATION
//! ```
//!
//! Files are written next to their destination and renamed into place, so a
//! reader never observes a partial tile.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::converter::{AuxiliaryTile, ConversionParameters, ConvertedTile};
use crate::coordinates::TileCoordinates;

const MAGIC: &[u8; 4] = b"TSTL";
const VERSION: u8 = 1;
const FLAG_AUXILIARY: u8 = 1;
const FLAG_COMPRESSED: u8 = 1 << 1;
const FLAG_SEGMENTATION: u8 = 1 << 2;
/// Three `u32` coordinates and one `u16` value.
const PARTICLE_BYTES: u64 = 3 * 4 + 2;

/// Name of the output tree below the acquisition root.
pub const OUTPUT_DIR: &str = "APR";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{path} is not a converted tile file")]
    BadMagic { path: PathBuf },

    #[error("{path} uses unsupported format version {version}")]
    UnsupportedVersion { path: PathBuf, version: u8 },

    #[error("{path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("segmentation for {path} has {labels} labels for {particles} particles")]
    SegmentationSize {
        path: PathBuf,
        labels: usize,
        particles: usize,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_io(&self) -> bool {
        matches!(self, StoreError::Io { .. })
    }
}

/// Lossy encoding applied to values on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// Quantization step, at least 1. Higher is more compact and more lossy.
    pub quantization_factor: u16,
    /// Values below this are stored as this value.
    pub background: u16,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            quantization_factor: 1,
            background: 108,
        }
    }
}

impl CompressionSettings {
    pub fn encode(&self, value: u16) -> u16 {
        let q = f32::from(self.quantization_factor.max(1));
        let above = value.saturating_sub(self.background);
        (f32::from(above) / q).round() as u16
    }

    pub fn decode(&self, stored: u16) -> u16 {
        let q = u32::from(self.quantization_factor.max(1));
        (u32::from(self.background) + u32::from(stored) * q).min(u32::from(u16::MAX)) as u16
    }
}

/// Connected component label of every particle of a converted tile.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Segmentation {
    pub labels: Vec<u32>,
}

/// Deterministic location of converted tiles below an acquisition root:
/// `{root}/APR/ch{channel}/{row}_{col}.{extension}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    pub root: PathBuf,
    pub extension: String,
}

impl TileLayout {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn channel_dir(&self, channel: u32) -> PathBuf {
        self.output_dir().join(format!("ch{channel}"))
    }

    pub fn tile_path(&self, coords: TileCoordinates) -> PathBuf {
        self.channel_dir(coords.channel)
            .join(format!("{}_{}.{}", coords.row, coords.col, self.extension))
    }
}

/// Read/write primitives of the converted format.
pub trait TileStore: Send + Sync {
    /// File extension of persisted tiles.
    fn extension(&self) -> &str;

    /// Persist a converted tile. Compression only affects what is written;
    /// `converted` itself is left untouched.
    fn write(
        &self,
        path: &Path,
        converted: &ConvertedTile,
        auxiliary: Option<&AuxiliaryTile>,
        compression: Option<&CompressionSettings>,
    ) -> Result<(), StoreError>;

    fn read(&self, path: &Path) -> Result<ConvertedTile, StoreError>;

    /// Auxiliary summary only, without decoding the particles.
    fn read_auxiliary(&self, path: &Path) -> Result<Option<AuxiliaryTile>, StoreError>;

    fn read_segmentation(&self, path: &Path) -> Result<Option<Segmentation>, StoreError>;

    fn write_segmentation(&self, path: &Path, segmentation: &Segmentation)
    -> Result<(), StoreError>;
}

/// Container as laid out on disk, values still in their stored encoding.
struct Encoded {
    shape: [usize; 3],
    parameters: ConversionParameters,
    compression: Option<CompressionSettings>,
    coords: Vec<[u32; 3]>,
    stored: Vec<u16>,
    auxiliary: Option<AuxiliaryTile>,
    segmentation: Option<Segmentation>,
}

impl Encoded {
    fn tile(&self) -> ConvertedTile {
        let values = match &self.compression {
            Some(c) => self.stored.iter().map(|&v| c.decode(v)).collect(),
            None => self.stored.clone(),
        };
        ConvertedTile {
            shape: self.shape,
            coords: self.coords.clone(),
            values,
            parameters: self.parameters,
        }
    }
}

struct Header {
    flags: u8,
    shape: [usize; 3],
    parameters: ConversionParameters,
    compression: Option<CompressionSettings>,
    count: usize,
    /// Bytes of particle data following the header.
    particle_bytes: u64,
    file_len: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileTileStore;

impl FileTileStore {
    pub const EXTENSION: &'static str = "apr";

    fn write_encoded(path: &Path, encoded: &Encoded) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::io(parent))?;
        }
        let staging = path.with_extension("partial");
        let result = Self::write_to(&staging, encoded)
            .and_then(|()| fs::rename(&staging, path))
            .map_err(StoreError::io(path));
        if result.is_err() {
            let _ = fs::remove_file(&staging);
        }
        result
    }

    fn write_to(path: &Path, e: &Encoded) -> io::Result<()> {
        let mut w = BufWriter::new(fs::File::create(path)?);
        let mut flags = 0;
        if e.auxiliary.is_some() {
            flags |= FLAG_AUXILIARY;
        }
        if e.compression.is_some() {
            flags |= FLAG_COMPRESSED;
        }
        if e.segmentation.is_some() {
            flags |= FLAG_SEGMENTATION;
        }

        w.write_all(MAGIC)?;
        w.write_u8(VERSION)?;
        w.write_u8(flags)?;
        write_shape(&mut w, e.shape)?;

        let p = &e.parameters;
        w.write_u16::<LittleEndian>(p.intensity_threshold)?;
        for v in [p.rel_error, p.gradient_smoothing, p.dx, p.dy, p.dz] {
            w.write_f32::<LittleEndian>(v)?;
        }
        w.write_u8(u8::from(p.auto_parameters))?;
        w.write_u8(u8::from(p.auxiliary))?;

        let (q, bg) = e
            .compression
            .map_or((0, 0), |c| (c.quantization_factor, c.background));
        w.write_u16::<LittleEndian>(q)?;
        w.write_u16::<LittleEndian>(bg)?;

        w.write_u64::<LittleEndian>(e.coords.len() as u64)?;
        for c in &e.coords {
            for v in c {
                w.write_u32::<LittleEndian>(*v)?;
            }
        }
        for v in &e.stored {
            w.write_u16::<LittleEndian>(*v)?;
        }

        if let Some(aux) = &e.auxiliary {
            let (d, h, wd) = aux.dim();
            write_shape(&mut w, [d, h, wd])?;
            for v in aux.values.iter() {
                w.write_u16::<LittleEndian>(*v)?;
            }
        }
        if let Some(seg) = &e.segmentation {
            for v in &seg.labels {
                w.write_u32::<LittleEndian>(*v)?;
            }
        }
        w.flush()
    }

    /// Open a tile and check that the particle count fits the file.
    fn open(path: &Path) -> Result<(BufReader<fs::File>, Header), StoreError> {
        let file = fs::File::open(path).map_err(StoreError::io(path))?;
        let file_len = file.metadata().map_err(StoreError::io(path))?.len();
        let mut r = BufReader::new(file);
        let mut header = Self::read_header(path, &mut r)?;
        let offset = r.stream_position().map_err(StoreError::io(path))?;

        let particle_bytes = (header.count as u64)
            .checked_mul(PARTICLE_BYTES)
            .filter(|&bytes| offset.checked_add(bytes).is_some_and(|end| end <= file_len))
            .ok_or_else(|| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: format!(
                    "{} particles do not fit in {file_len} bytes",
                    header.count
                ),
            })?;
        header.particle_bytes = particle_bytes;
        header.file_len = file_len;
        Ok((r, header))
    }

    fn read_header(path: &Path, r: &mut impl Read) -> Result<Header, StoreError> {
        let corrupt = |e: io::Error| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(corrupt)?;
        if &magic != MAGIC {
            return Err(StoreError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let version = r.read_u8().map_err(corrupt)?;
        if version != VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: path.to_path_buf(),
                version,
            });
        }

        let parse = |r: &mut dyn Read| -> io::Result<Header> {
            let flags = r.read_u8()?;
            let shape = read_shape(r)?;
            let intensity_threshold = r.read_u16::<LittleEndian>()?;
            let mut floats = [0f32; 5];
            for f in &mut floats {
                *f = r.read_f32::<LittleEndian>()?;
            }
            let auto_parameters = r.read_u8()? != 0;
            let auxiliary = r.read_u8()? != 0;
            let quantization_factor = r.read_u16::<LittleEndian>()?;
            let background = r.read_u16::<LittleEndian>()?;
            let count = usize::try_from(r.read_u64::<LittleEndian>()?).unwrap_or(usize::MAX);
            let [rel_error, gradient_smoothing, dx, dy, dz] = floats;
            Ok(Header {
                flags,
                shape,
                parameters: ConversionParameters {
                    intensity_threshold,
                    rel_error,
                    gradient_smoothing,
                    dx,
                    dy,
                    dz,
                    auto_parameters,
                    auxiliary,
                },
                compression: (flags & FLAG_COMPRESSED != 0).then_some(CompressionSettings {
                    enabled: true,
                    quantization_factor,
                    background,
                }),
                count,
                particle_bytes: 0,
                file_len: 0,
            })
        };
        parse(r).map_err(corrupt)
    }

    fn read_encoded(path: &Path) -> Result<Encoded, StoreError> {
        let (mut r, header) = Self::open(path)?;
        let corrupt = |e: io::Error| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let mut coords = Vec::with_capacity(header.count);
        for _ in 0..header.count {
            let mut c = [0u32; 3];
            r.read_u32_into::<LittleEndian>(&mut c).map_err(corrupt)?;
            coords.push(c);
        }
        let mut stored = vec![0u16; header.count];
        r.read_u16_into::<LittleEndian>(&mut stored)
            .map_err(corrupt)?;

        let auxiliary = if header.flags & FLAG_AUXILIARY != 0 {
            Some(read_auxiliary_block(path, &mut r, header.file_len)?)
        } else {
            None
        };
        let segmentation = if header.flags & FLAG_SEGMENTATION != 0 {
            let mut labels = vec![0u32; header.count];
            r.read_u32_into::<LittleEndian>(&mut labels)
                .map_err(corrupt)?;
            Some(Segmentation { labels })
        } else {
            None
        };

        Ok(Encoded {
            shape: header.shape,
            parameters: header.parameters,
            compression: header.compression,
            coords,
            stored,
            auxiliary,
            segmentation,
        })
    }

    fn skip_particles(
        path: &Path,
        r: &mut BufReader<fs::File>,
        header: &Header,
    ) -> Result<(), StoreError> {
        r.seek(SeekFrom::Current(header.particle_bytes as i64))
            .map_err(StoreError::io(path))?;
        Ok(())
    }
}

impl TileStore for FileTileStore {
    fn extension(&self) -> &str {
        Self::EXTENSION
    }

    fn write(
        &self,
        path: &Path,
        converted: &ConvertedTile,
        auxiliary: Option<&AuxiliaryTile>,
        compression: Option<&CompressionSettings>,
    ) -> Result<(), StoreError> {
        let compression = compression.filter(|c| c.enabled).copied();
        let stored = match &compression {
            Some(c) => converted.values.iter().map(|&v| c.encode(v)).collect(),
            None => converted.values.clone(),
        };
        let encoded = Encoded {
            shape: converted.shape,
            parameters: converted.parameters,
            compression,
            coords: converted.coords.clone(),
            stored,
            auxiliary: auxiliary.cloned(),
            segmentation: None,
        };
        Self::write_encoded(path, &encoded)
    }

    fn read(&self, path: &Path) -> Result<ConvertedTile, StoreError> {
        Ok(Self::read_encoded(path)?.tile())
    }

    fn read_auxiliary(&self, path: &Path) -> Result<Option<AuxiliaryTile>, StoreError> {
        let (mut r, header) = Self::open(path)?;
        if header.flags & FLAG_AUXILIARY == 0 {
            return Ok(None);
        }
        Self::skip_particles(path, &mut r, &header)?;
        read_auxiliary_block(path, &mut r, header.file_len).map(Some)
    }

    fn read_segmentation(&self, path: &Path) -> Result<Option<Segmentation>, StoreError> {
        Ok(Self::read_encoded(path)?.segmentation)
    }

    fn write_segmentation(
        &self,
        path: &Path,
        segmentation: &Segmentation,
    ) -> Result<(), StoreError> {
        let mut encoded = Self::read_encoded(path)?;
        if segmentation.labels.len() != encoded.coords.len() {
            return Err(StoreError::SegmentationSize {
                path: path.to_path_buf(),
                labels: segmentation.labels.len(),
                particles: encoded.coords.len(),
            });
        }
        encoded.segmentation = Some(segmentation.clone());
        Self::write_encoded(path, &encoded)
    }
}

fn write_shape(w: &mut impl Write, shape: [usize; 3]) -> io::Result<()> {
    for v in shape {
        w.write_u64::<LittleEndian>(v as u64)?;
    }
    Ok(())
}

fn read_shape(r: &mut (impl Read + ?Sized)) -> io::Result<[usize; 3]> {
    let mut shape = [0usize; 3];
    for v in &mut shape {
        *v = r.read_u64::<LittleEndian>()? as usize;
    }
    Ok(shape)
}

fn read_auxiliary_block(
    path: &Path,
    r: &mut BufReader<fs::File>,
    file_len: u64,
) -> Result<AuxiliaryTile, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let [d, h, w] = read_shape(r).map_err(|e| corrupt(e.to_string()))?;
    let offset = r.stream_position().map_err(StoreError::io(path))?;
    let len = d
        .checked_mul(h)
        .and_then(|n| n.checked_mul(w))
        .filter(|&n| {
            (n as u64)
                .checked_mul(2)
                .and_then(|bytes| offset.checked_add(bytes))
                .is_some_and(|end| end <= file_len)
        })
        .ok_or_else(|| corrupt(format!("auxiliary shape {d}x{h}x{w} does not fit the file")))?;
    let mut values = vec![0u16; len];
    r.read_u16_into::<LittleEndian>(&mut values)
        .map_err(|e| corrupt(e.to_string()))?;
    let values = Array3::from_shape_vec((d, h, w), values).map_err(|e| corrupt(e.to_string()))?;
    Ok(AuxiliaryTile { values })
}
