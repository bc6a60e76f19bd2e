//! Endpoint lookup.
//!
//! `ChainLookup` is the contract the break finder probes. `ChainIndex` is the in-memory
//! implementation; `crate::sqlite::SqliteChainStore` serves tables too large for memory.

use std::time;

use tracing::info;

use crate::error::{ChainError, Result};
use crate::table::{drain_records, ChainEntry, MalformedPolicy};

pub const DEFAULT_BUCKET_BITS: u32 = 22;

/// Smallest capacity handed to a bucket on its first insert.
const MIN_BUCKET_CAPACITY: u32 = 4;

/// Records parsed per `extend` call during a bulk load.
const LOAD_CHUNK: usize = 1 << 20;

const EMPTY_SLOT: ChainEntry = ChainEntry {
    seed: 0,
    endpoint: 0,
};

/// Maps a chain endpoint back to every table seed whose chain ends there.
///
/// Lookups compare full 64-bit endpoints: no returned seed ever has a different endpoint, and
/// every stored seed with that endpoint is returned. Implementations are read concurrently by
/// scanner threads, so lookups take `&self`.
pub trait ChainLookup: Send + Sync {
    /// Appends the matching seeds to `out`.
    fn lookup_into(&self, key: u64, out: &mut Vec<u64>) -> Result<()>;

    fn lookup(&self, key: u64) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        self.lookup_into(key, &mut out)?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    offset: u64,
    len: u32,
    capacity: u32,
}

impl Bucket {
    fn range(&self) -> std::ops::Range<usize> {
        let start = self.offset as usize;
        start..start + self.len as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub loaded: u64,
    pub skipped: u64,
}

/// In-memory endpoint index bucketed on the low `bits` bits of the endpoint
///
/// All entries live in a single arena; each bucket owns one contiguous `(offset, len)` range of
/// it. A full bucket is moved to the end of the arena with double the capacity, leaving its old
/// slots dead until `compact`. Entries are never removed.
#[derive(Debug, Clone)]
pub struct ChainIndex {
    bits: u32,
    mask: u64,
    buckets: Vec<Bucket>,
    arena: Vec<ChainEntry>,
    len: u64,
}

impl ChainIndex {
    pub fn new(bits: u32) -> Result<Self> {
        ChainIndex::with_capacity(bits, 0)
    }

    pub fn with_capacity(bits: u32, entries: usize) -> Result<Self> {
        if bits == 0 || bits > 32 {
            return Err(ChainError::Config(format!(
                "index bucket bits must be within 1..=32, got {}",
                bits
            )));
        }
        Ok(ChainIndex {
            bits,
            mask: (1u64 << bits) - 1,
            buckets: vec![Bucket::default(); 1usize << bits],
            arena: Vec::with_capacity(entries),
            len: 0,
        })
    }

    pub fn from_entries(bits: u32, entries: &[ChainEntry]) -> Result<Self> {
        let mut index = ChainIndex::with_capacity(bits, entries.len())?;
        index.extend(entries)?;
        Ok(index)
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn average_occupancy(&self) -> f64 {
        self.len as f64 / self.buckets.len() as f64
    }

    /// Arena slots not holding a live entry.
    pub fn slack(&self) -> usize {
        self.arena.len() - self.len as usize
    }

    #[inline]
    fn bucket_of(&self, endpoint: u64) -> usize {
        (endpoint & self.mask) as usize
    }

    pub fn insert(&mut self, entry: ChainEntry) -> Result<()> {
        let b = self.bucket_of(entry.endpoint);
        let bucket = self.buckets[b];
        if bucket.len == bucket.capacity {
            let grown = bucket
                .capacity
                .checked_mul(2)
                .ok_or_else(|| bucket_overflow(b))?
                .max(MIN_BUCKET_CAPACITY);
            self.relocate(b, grown);
        }
        self.place(b, entry);
        Ok(())
    }

    /// Inserts a batch of entries, growing each affected bucket at most once.
    pub fn extend(&mut self, entries: &[ChainEntry]) -> Result<()> {
        let mut incoming: Vec<(usize, u32)> = Vec::new();
        {
            let mut counts = std::collections::HashMap::<usize, u64>::new();
            for entry in entries {
                *counts.entry(self.bucket_of(entry.endpoint)).or_insert(0) += 1;
            }
            for (b, extra) in counts {
                let bucket = self.buckets[b];
                let needed = bucket.len as u64 + extra;
                if needed > u32::MAX as u64 {
                    return Err(bucket_overflow(b));
                }
                if needed > bucket.capacity as u64 {
                    let doubled = (bucket.capacity as u64 * 2).min(u32::MAX as u64);
                    let grown = needed.max(doubled).max(MIN_BUCKET_CAPACITY as u64);
                    incoming.push((b, grown as u32));
                }
            }
        }

        let extra_slots: u64 = incoming.iter().map(|&(_, cap)| cap as u64).sum();
        self.arena.reserve(extra_slots as usize);
        incoming.sort_unstable();
        for (b, capacity) in incoming {
            self.relocate(b, capacity);
        }
        for entry in entries {
            let b = self.bucket_of(entry.endpoint);
            self.place(b, *entry);
        }
        Ok(())
    }

    /// Inserts every record from `records`, reporting how many were loaded and skipped.
    ///
    /// Malformed records are skipped or abort the load according to `policy`; any other error
    /// always aborts.
    pub fn bulk_load<I>(&mut self, records: I, policy: MalformedPolicy) -> Result<LoadStats>
    where
        I: IntoIterator<Item = Result<ChainEntry>>,
    {
        let start = time::Instant::now();
        let mut loaded = 0u64;
        let mut chunk: Vec<ChainEntry> = Vec::with_capacity(LOAD_CHUNK);

        let skipped = drain_records(records, policy, |entry| {
            chunk.push(entry);
            if chunk.len() == LOAD_CHUNK {
                self.extend(&chunk)?;
                loaded += chunk.len() as u64;
                chunk.clear();
            }
            Ok(())
        })?;
        self.extend(&chunk)?;
        loaded += chunk.len() as u64;

        let stats = LoadStats { loaded, skipped };
        info!(
            loaded = stats.loaded,
            skipped = stats.skipped,
            occupancy = self.average_occupancy(),
            secs = start.elapsed().as_secs_f32(),
            "table load complete"
        );
        Ok(stats)
    }

    /// Rebuilds the arena with every bucket packed to its exact length.
    pub fn compact(&mut self) {
        let mut arena = Vec::with_capacity(self.len as usize);
        for bucket in self.buckets.iter_mut() {
            let range = bucket.range();
            bucket.offset = arena.len() as u64;
            bucket.capacity = bucket.len;
            arena.extend_from_slice(&self.arena[range]);
        }
        self.arena = arena;
    }

    fn relocate(&mut self, b: usize, capacity: u32) {
        let bucket = self.buckets[b];
        let offset = self.arena.len();
        self.arena.extend_from_within(bucket.range());
        self.arena.resize(offset + capacity as usize, EMPTY_SLOT);
        self.buckets[b] = Bucket {
            offset: offset as u64,
            len: bucket.len,
            capacity,
        };
    }

    fn place(&mut self, b: usize, entry: ChainEntry) {
        let bucket = &mut self.buckets[b];
        debug_assert!(bucket.len < bucket.capacity);
        self.arena[bucket.offset as usize + bucket.len as usize] = entry;
        bucket.len += 1;
        self.len += 1;
    }
}

fn bucket_overflow(b: usize) -> ChainError {
    ChainError::Config(format!("index bucket {:#x} exceeds {} entries", b, u32::MAX))
}

impl ChainLookup for ChainIndex {
    fn lookup_into(&self, key: u64, out: &mut Vec<u64>) -> Result<()> {
        let b = self.bucket_of(key);
        for entry in &self.arena[self.buckets[b].range()] {
            if entry.endpoint == key {
                out.push(entry.seed);
            } else if self.bucket_of(entry.endpoint) != b {
                return Err(ChainError::LookupInconsistency {
                    key,
                    found: entry.endpoint,
                });
            }
        }
        Ok(())
    }
}
