use std::ops::Range;

use bytemuck::{bytes_of, pod_read_unaligned};

use crate::bucket::{Bucket, Metadata};
use crate::byte_store::ByteStore;
use crate::error::{LinHashError, Result};
use crate::layout::{Geometry, META_SIZE};

/// Typed bucket arena over a byte store. Access is by checked index or
/// validated offset only; bucket images are copied in and out whole, and
/// every write persists exactly the range it touched.
///
/// The header is mirrored in memory and written through, so reads never
/// touch the region and a reopened store starts from whatever the mirror
/// last persisted.
pub struct BucketStore<S> {
    store: S,
    geometry: Geometry,
    meta: Metadata,
}

impl<S: ByteStore> BucketStore<S> {
    /// Initializes a region over a zero-filled store: writes and persists
    /// the header. The zeroed bucket arrays already are their empty state.
    pub fn create(store: S, geometry: Geometry) -> Result<Self> {
        if store.as_ref().len() != geometry.region_size() {
            return Err(LinHashError::InvalidInput(format!(
                "store is {} bytes, geometry wants {}",
                store.as_ref().len(),
                geometry.region_size()
            )));
        }
        let meta = Metadata::new(geometry.region_size() as u64, geometry.base_buckets());
        let mut this = Self {
            store,
            geometry,
            meta,
        };
        this.write_meta()?;
        Ok(this)
    }

    /// Attaches to a store holding a previously created region. The header
    /// is validated against the mapped length; the persisted state is
    /// otherwise trusted.
    pub fn open(store: S) -> Result<Self> {
        let len = store.as_ref().len();
        if len < META_SIZE {
            return Err(LinHashError::InvalidLayout(format!(
                "{len} bytes is shorter than the region header"
            )));
        }
        let meta: Metadata = pod_read_unaligned(&store.as_ref()[..META_SIZE]);
        let geometry = Geometry::from_metadata(&meta, len)?;
        Ok(Self {
            store,
            geometry,
            meta,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    /// Applies `f` to the header mirror, then writes and persists the
    /// header block.
    pub fn update_meta(&mut self, f: impl FnOnce(&mut Metadata)) -> Result<()> {
        f(&mut self.meta);
        self.write_meta()
    }

    pub fn read_primary(&self, index: u64) -> Result<Bucket> {
        let range = self.geometry.primary_range(index)?;
        Ok(pod_read_unaligned(&self.store.as_ref()[range]))
    }

    pub fn write_primary(&mut self, index: u64, bucket: &Bucket) -> Result<()> {
        let range = self.geometry.primary_range(index)?;
        self.write_range(range, bytes_of(bucket))
    }

    pub fn read_overflow_at(&self, offset: u64) -> Result<Bucket> {
        let range = self.geometry.overflow_range(offset)?;
        Ok(pod_read_unaligned(&self.store.as_ref()[range]))
    }

    pub fn write_overflow_at(&mut self, offset: u64, bucket: &Bucket) -> Result<()> {
        let range = self.geometry.overflow_range(offset)?;
        self.write_range(range, bytes_of(bucket))
    }

    /// Bump-allocates the next overflow bucket: zeroes its slot, bumps the
    /// allocation count, persists both, and returns the slot's byte offset.
    /// Slots are handed out once and never reclaimed.
    pub fn append_overflow(&mut self) -> Result<u64> {
        let ordinal = self.meta.overflow_count;
        if ordinal >= self.geometry.max_overflow() {
            return Err(LinHashError::CapacityExceeded);
        }
        let offset = self.geometry.overflow_offset(ordinal);
        let range = self.geometry.overflow_range(offset)?;
        self.store.as_mut()[range.clone()].fill(0);
        self.persist(range)?;
        self.update_meta(|meta| meta.overflow_count += 1)?;
        log::trace!("allocated overflow bucket {ordinal} at offset {offset}");
        Ok(offset)
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    fn write_meta(&mut self) -> Result<()> {
        let range = self.geometry.meta_range();
        let bytes = bytes_of(&self.meta);
        self.store.as_mut()[range.clone()].copy_from_slice(bytes);
        self.persist(range)
    }

    fn write_range(&mut self, range: Range<usize>, bytes: &[u8]) -> Result<()> {
        self.store.as_mut()[range.clone()].copy_from_slice(bytes);
        self.persist(range)
    }

    fn persist(&mut self, range: Range<usize>) -> Result<()> {
        self.store.persist(range).map_err(LinHashError::Durability)
    }
}
