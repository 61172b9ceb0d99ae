//! Checkpoint format for [`AddResBlk`] weights.
//!
//! Layout (little endian): a 32 byte header carrying the block
//! configuration, then one record per parameter in
//! [`Parameters::named_parameters`] order:
//! `name_len u32 | name | ndim u32 | dims u32 * ndim | data f32 * prod(dims)`.

use addnet::{AddResBlk, BlendSharing, BlockConfig, LayerError, Parameters};
use bytemuck::{cast_slice, Pod, Zeroable};
use memmap2::MmapOptions;
use ndarray::ArrayViewD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub const MAGIC: [u8; 4] = *b"ADDB";
pub const VERSION: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Header {
    magic: [u8; 4],
    version: u32,
    c_in: u32,
    c_out: u32,
    c_att: u32,
    c_id: u32,
    sharing: u32,
    n_params: u32,
}

pub const HEADER_LEN: usize = std::mem::size_of::<Header>();

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not a block checkpoint (magic {0:?})")]
    BadMagic([u8; 4]),
    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown blend sharing tag {0}")]
    UnknownSharing(u32),
    #[error("checkpoint truncated at byte {0}")]
    Truncated(usize),
    #[error("parameter mismatch: expected {expected}, found {found}")]
    ParameterMismatch { expected: String, found: String },
    #[error("unexpected data after the last parameter (offset {offset}, length {len})")]
    TrailingBytes { offset: usize, len: usize },
    #[error("value {0} does not fit the checkpoint format")]
    TooLarge(usize),
    #[error(transparent)]
    Layer(#[from] LayerError),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

fn to_u32(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| CheckpointError::TooLarge(v))
}

fn write_tensor<W: Write>(w: &mut W, t: &ArrayViewD<f32>) -> std::io::Result<()> {
    match t.as_slice() {
        Some(data) if cfg!(target_endian = "little") => w.write_all(cast_slice(data)),
        _ => {
            for v in t.iter() {
                w.write_all(&v.to_le_bytes())?;
            }
            Ok(())
        }
    }
}

/// Bounds-checked cursor over a checkpoint buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(CheckpointError::Truncated(self.pos))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

pub struct Checkpoint;

impl Checkpoint {
    pub fn save<P: AsRef<Path>>(block: &AddResBlk, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut f = BufWriter::new(File::create(path)?);
        Self::write(block, &mut f)?;
        f.flush()?;
        debug!(path = %path.display(), params = block.num_parameters(), "saved checkpoint");
        Ok(())
    }

    pub fn to_bytes(block: &AddResBlk) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        Self::write(block, &mut buf)?;
        Ok(buf)
    }

    pub fn write<W: Write>(block: &AddResBlk, w: &mut W) -> Result<()> {
        let config = block.config();
        let params = block.named_parameters();
        let header = Header {
            magic: MAGIC,
            version: VERSION.to_le(),
            c_in: to_u32(config.c_in)?.to_le(),
            c_out: to_u32(config.c_out)?.to_le(),
            c_att: to_u32(config.c_att)?.to_le(),
            c_id: to_u32(config.c_id)?.to_le(),
            sharing: config.sharing.as_u32().to_le(),
            n_params: to_u32(params.len())?.to_le(),
        };
        w.write_all(bytemuck::bytes_of(&header))?;

        for (name, t) in &params {
            w.write_all(&to_u32(name.len())?.to_le_bytes())?;
            w.write_all(name.as_bytes())?;
            w.write_all(&to_u32(t.ndim())?.to_le_bytes())?;
            for &d in t.shape() {
                w.write_all(&to_u32(d)?.to_le_bytes())?;
            }
            write_tensor(w, t)?;
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<AddResBlk> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        debug!(path = %path.display(), len = bytes.len(), "loading checkpoint");
        Self::from_bytes(&bytes)
    }

    pub fn load_mmap<P: AsRef<Path>>(path: P) -> Result<AddResBlk> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the map is only read while parsing and dropped before returning.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        debug!(path = %path.display(), len = mmap.len(), "mapping checkpoint");
        Self::from_bytes(&mmap)
    }

    /// Rebuild a block from its config header and overwrite every parameter.
    pub fn from_bytes(bytes: &[u8]) -> Result<AddResBlk> {
        let mut r = Reader::new(bytes);
        let header: Header = bytemuck::pod_read_unaligned(r.take(HEADER_LEN)?);
        if header.magic != MAGIC {
            return Err(CheckpointError::BadMagic(header.magic));
        }
        let version = u32::from_le(header.version);
        if version != VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }
        let sharing_tag = u32::from_le(header.sharing);
        let sharing = BlendSharing::from_u32(sharing_tag).ok_or(CheckpointError::UnknownSharing(sharing_tag))?;
        let config = BlockConfig {
            c_in: u32::from_le(header.c_in) as usize,
            c_out: u32::from_le(header.c_out) as usize,
            c_att: u32::from_le(header.c_att) as usize,
            c_id: u32::from_le(header.c_id) as usize,
            sharing,
        };

        let n_params = u32::from_le(header.n_params) as usize;
        if n_params != config.tensor_count() {
            return Err(CheckpointError::ParameterMismatch {
                expected: format!("{} tensors", config.tensor_count()),
                found: format!("{n_params} tensors"),
            });
        }

        // reject a header whose tensors cannot fit in the buffer before allocating them
        let widest = config.c_in.max(config.c_out).max(config.c_att).max(config.c_id);
        let data_len = config
            .parameter_count()
            .and_then(|n| n.checked_mul(4))
            .ok_or(CheckpointError::TooLarge(widest))?;
        if data_len > bytes.len() - HEADER_LEN {
            return Err(CheckpointError::Truncated(HEADER_LEN));
        }

        // initial values are all overwritten below
        let mut block = AddResBlk::with_rng(config, &mut StdRng::seed_from_u64(0))?;
        {
            let mut params = block.named_parameters_mut();
            for (name, dest) in params.iter_mut() {
                let name_len = r.u32()? as usize;
                let found = String::from_utf8_lossy(r.take(name_len)?);
                if found != name.as_str() {
                    return Err(CheckpointError::ParameterMismatch {
                        expected: name.clone(),
                        found: found.into_owned(),
                    });
                }

                let ndim = r.u32()? as usize;
                let dims = (0..ndim).map(|_| r.u32().map(|d| d as usize)).collect::<Result<Vec<_>>>()?;
                if dims.as_slice() != dest.shape() {
                    return Err(CheckpointError::ParameterMismatch {
                        expected: format!("{name} {:?}", dest.shape()),
                        found: format!("{name} {dims:?}"),
                    });
                }

                let data = r.take(dest.len() * 4)?;
                for (d, c) in dest.iter_mut().zip(data.chunks_exact(4)) {
                    *d = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                }
            }
        }
        if r.pos != bytes.len() {
            return Err(CheckpointError::TrailingBytes { offset: r.pos, len: bytes.len() });
        }
        debug!(?config, "restored block");
        Ok(block)
    }
}
