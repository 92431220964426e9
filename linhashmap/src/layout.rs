use std::mem::size_of;
use std::ops::Range;

use crate::bucket::{Bucket, Metadata, REGION_MAGIC, REGION_VERSION};
use crate::error::{LinHashError, Result};

pub const META_SIZE: usize = size_of::<Metadata>();
pub const BUCKET_SIZE: usize = size_of::<Bucket>();

/// Creation-time configuration. The geometry is recorded in the region
/// header, so options only matter while the region file does not exist yet;
/// a reopened region keeps whatever it was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Total region length in bytes. The first half holds the header and
    /// the primary bucket array, the second half the overflow arena.
    pub region_size: usize,
    /// Primary bucket count at level 0.
    pub base_buckets: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            region_size: 16 * 1024 * 1024,
            base_buckets: 16,
        }
    }
}

/// Byte-level shape of a region: where the header, the primary bucket array
/// and the overflow arena live. Every bucket access goes through a checked
/// range computed here, so a corrupt index or stored offset surfaces as an
/// error instead of a wild read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    region_size: usize,
    base_buckets: u64,
    max_primary: u64,
    max_overflow: u64,
}

impl Geometry {
    pub fn from_options(options: &Options) -> Result<Self> {
        Self::derive(options.region_size, options.base_buckets)
    }

    /// Rebuilds the geometry recorded in a region header, verifying the
    /// header against the mapped length and the growth invariant.
    pub fn from_metadata(meta: &Metadata, mapped_len: usize) -> Result<Self> {
        if meta.magic != REGION_MAGIC {
            return Err(LinHashError::InvalidLayout(format!(
                "bad magic {:#018x}",
                meta.magic
            )));
        }
        if meta.version != REGION_VERSION {
            return Err(LinHashError::InvalidLayout(format!(
                "unsupported format version {}",
                meta.version
            )));
        }
        if meta.region_size != mapped_len as u64 {
            return Err(LinHashError::InvalidLayout(format!(
                "header says {} bytes but {} are mapped",
                meta.region_size, mapped_len
            )));
        }
        let geometry =
            Self::derive(mapped_len, meta.base_buckets).map_err(|_| {
                LinHashError::InvalidLayout(format!(
                    "header geometry ({} base buckets in {} bytes) is impossible",
                    meta.base_buckets, meta.region_size
                ))
            })?;

        // spans as u128 so a corrupt level cannot overflow the check
        let low_span = (meta.base_buckets as u128) << meta.level.min(64);
        if (meta.next as u128) >= low_span
            || (meta.size as u128) != low_span + meta.next as u128
        {
            return Err(LinHashError::InvalidLayout(format!(
                "growth counters disagree: level={} next={} size={}",
                meta.level, meta.next, meta.size
            )));
        }
        if meta.size > geometry.max_primary {
            return Err(LinHashError::InvalidLayout(format!(
                "{} primary buckets recorded, region holds {}",
                meta.size, geometry.max_primary
            )));
        }
        if meta.overflow_count > geometry.max_overflow {
            return Err(LinHashError::InvalidLayout(format!(
                "{} overflow buckets recorded, arena holds {}",
                meta.overflow_count, geometry.max_overflow
            )));
        }
        Ok(geometry)
    }

    fn derive(region_size: usize, base_buckets: u64) -> Result<Self> {
        if base_buckets == 0 {
            return Err(LinHashError::InvalidInput(
                "base bucket count must be at least 1".into(),
            ));
        }
        let half = region_size / 2;
        if half < META_SIZE + BUCKET_SIZE {
            return Err(LinHashError::InvalidInput(format!(
                "region of {region_size} bytes is too small for one bucket"
            )));
        }
        let max_primary = ((half - META_SIZE) / BUCKET_SIZE) as u64;
        let max_overflow = (half / BUCKET_SIZE) as u64;
        if base_buckets > max_primary {
            return Err(LinHashError::InvalidInput(format!(
                "{base_buckets} base buckets do not fit a {region_size} byte region"
            )));
        }
        Ok(Self {
            region_size,
            base_buckets,
            max_primary,
            max_overflow,
        })
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn base_buckets(&self) -> u64 {
        self.base_buckets
    }

    /// Primary bucket slots in the first half.
    pub fn max_primary(&self) -> u64 {
        self.max_primary
    }

    /// Overflow bucket slots in the arena half.
    pub fn max_overflow(&self) -> u64 {
        self.max_overflow
    }

    pub fn meta_range(&self) -> Range<usize> {
        0..META_SIZE
    }

    /// Byte range of primary bucket `index`.
    pub fn primary_range(&self, index: u64) -> Result<Range<usize>> {
        if index >= self.max_primary {
            return Err(LinHashError::InvalidLayout(format!(
                "primary bucket {index} out of range ({} allocated slots)",
                self.max_primary
            )));
        }
        let start = META_SIZE + index as usize * BUCKET_SIZE;
        Ok(start..start + BUCKET_SIZE)
    }

    fn arena_start(&self) -> usize {
        self.region_size / 2
    }

    /// Byte offset of overflow bucket `ordinal`, the form stored in bucket
    /// overflow pointers.
    pub fn overflow_offset(&self, ordinal: u64) -> u64 {
        (self.arena_start() + ordinal as usize * BUCKET_SIZE) as u64
    }

    /// Byte range of the overflow bucket at `offset`. Offsets come from
    /// `overflow_offset`, so anything outside the arena or off the bucket
    /// grid is a corrupt pointer.
    pub fn overflow_range(&self, offset: u64) -> Result<Range<usize>> {
        let start = offset as usize;
        let arena = self.arena_start();
        if start < arena
            || start + BUCKET_SIZE > self.region_size
            || (start - arena) % BUCKET_SIZE != 0
        {
            return Err(LinHashError::InvalidLayout(format!(
                "corrupt overflow offset {offset}"
            )));
        }
        Ok(start..start + BUCKET_SIZE)
    }
}
