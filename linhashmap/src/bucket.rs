use bytemuck::{Pod, Zeroable};

/// Key/value slots per bucket, primary and overflow alike.
pub const TABLE_SIZE: usize = 4;

pub const REGION_MAGIC: u64 = u64::from_le_bytes(*b"LINHMAP1");
pub const REGION_VERSION: u64 = 1;

/// A single key/value slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Pair {
    pub key: u64,
    pub value: u64,
}

/// Region header. The geometry fields are fixed at creation and verified on
/// every open; the growth fields change under the split engine and are
/// persisted after every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Metadata {
    pub magic: u64,
    pub version: u64,
    pub region_size: u64,
    pub base_buckets: u64,
    /// Completed doubling rounds.
    pub level: u64,
    /// Next primary bucket to split; always below the low span.
    pub next: u64,
    /// Addressable primary buckets; equals `low_span + next`.
    pub size: u64,
    /// Overflow buckets ever allocated. Never decremented.
    pub overflow_count: u64,
}

impl Metadata {
    pub fn new(region_size: u64, base_buckets: u64) -> Self {
        Self {
            magic: REGION_MAGIC,
            version: REGION_VERSION,
            region_size,
            base_buckets,
            level: 0,
            next: 0,
            size: base_buckets,
            overflow_count: 0,
        }
    }

    /// Buckets addressed by the modulo of the current round.
    pub fn low_span(&self) -> u64 {
        self.base_buckets << self.level
    }

    /// Buckets addressed once the current round completes.
    pub fn high_span(&self) -> u64 {
        self.base_buckets << (self.level + 1)
    }
}

/// One bucket image: a fixed pair array, the live count, and the byte
/// offset of the attached overflow bucket. Offset 0 means none; it is
/// unambiguous because offset 0 holds the region header. Slots at or past
/// `fill` are dead and may carry stale bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Bucket {
    pairs: [Pair; TABLE_SIZE],
    fill: u64,
    next_offset: u64,
}

impl Bucket {
    /// Builds a bucket image holding `pairs` and no overflow pointer.
    pub fn from_pairs(pairs: &[Pair]) -> Self {
        debug_assert!(pairs.len() <= TABLE_SIZE);
        let mut bucket = Self::zeroed();
        for &pair in pairs {
            bucket.push(pair);
        }
        bucket
    }

    pub fn fill(&self) -> usize {
        self.fill as usize
    }

    pub fn is_full(&self) -> bool {
        self.fill() >= TABLE_SIZE
    }

    /// The live pairs, in insertion order.
    pub fn live(&self) -> &[Pair] {
        &self.pairs[..self.fill().min(TABLE_SIZE)]
    }

    /// Appends a pair. The caller checks `is_full` first.
    pub fn push(&mut self, pair: Pair) {
        debug_assert!(!self.is_full());
        self.pairs[self.fill as usize] = pair;
        self.fill += 1;
    }

    /// Slot index of the first live pair holding `key`.
    pub fn position(&self, key: u64) -> Option<usize> {
        self.live().iter().position(|pair| pair.key == key)
    }

    pub fn get(&self, slot: usize) -> Pair {
        self.pairs[slot]
    }

    pub fn set_value(&mut self, slot: usize, value: u64) {
        self.pairs[slot].value = value;
    }

    /// Shifts live pairs left past every pair holding `key` and returns the
    /// survivor count. `fill` is left untouched so the caller can tell
    /// whether anything was dropped before committing the new count.
    pub fn compact_without(&mut self, key: u64) -> usize {
        let mut kept = 0;
        for slot in 0..self.fill().min(TABLE_SIZE) {
            if self.pairs[slot].key != key {
                self.pairs[kept] = self.pairs[slot];
                kept += 1;
            }
        }
        kept
    }

    pub fn set_fill(&mut self, fill: usize) {
        self.fill = fill as u64;
    }

    /// Removes and returns the first live pair, shifting the rest left.
    /// The caller checks `fill` first.
    pub fn take_front(&mut self) -> Pair {
        debug_assert!(self.fill > 0);
        let front = self.pairs[0];
        for slot in 1..self.fill().min(TABLE_SIZE) {
            self.pairs[slot - 1] = self.pairs[slot];
        }
        self.fill -= 1;
        front
    }

    /// Byte offset of the attached overflow bucket, if any.
    pub fn overflow(&self) -> Option<u64> {
        (self.next_offset != 0).then_some(self.next_offset)
    }

    pub fn set_overflow(&mut self, offset: u64) {
        self.next_offset = offset;
    }

    pub fn clear_overflow(&mut self) {
        self.next_offset = 0;
    }
}
