//! Result batching over a single pre-registered memory region. Batch
//! slots are single-writer locally and consumed remotely; there is no
//! local reader of a posted batch.

use crate::config::params::{BATCH_DURATION, MAX_BATCHES, MAX_ENTRIES};
use crate::dgram::ResultDgram;
use crate::transport::fabric::{Region, TransportError};
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Slot alignment inside a batch; cache-line granularity.
const SLOT_ALIGN: usize = 64;

const ALLOC_SPIN_BUDGET: usize = 100_000;

/// One batch under accumulation or in flight: an index into the region,
/// the pulse id that opened it, and the bytes appended so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    index: usize,
    id: u64,
    extent: usize,
    entries: usize,
}

impl Batch {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Pulse id of the first entry.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// True once `pid` falls outside this batch's duration window.
    pub fn expired(&self, pid: u64) -> bool {
        pid / BATCH_DURATION != self.id / BATCH_DURATION
    }
}

/// Owns the batch region and its freelist. Exactly one batch accumulates
/// at a time; posted batches return through `release`.
pub struct BatchManager {
    region: Region,
    slot_size: usize,
    max_batch_size: usize,
    freelist: ArrayQueue<usize>,
    current: Option<Batch>,
    alloc_cnt: Arc<AtomicU64>,
    free_cnt: Arc<AtomicU64>,
    waiting: Arc<AtomicU64>,
}

impl BatchManager {
    pub fn new(max_result_size: usize) -> Result<Self, TransportError> {
        let slot_size = max_result_size.div_ceil(SLOT_ALIGN) * SLOT_ALIGN;
        let max_batch_size = slot_size * MAX_ENTRIES;
        let region = Region::new(max_batch_size * MAX_BATCHES)?;
        let freelist = ArrayQueue::new(MAX_BATCHES);
        for index in 0..MAX_BATCHES {
            let _ = freelist.push(index);
        }
        Ok(Self {
            region,
            slot_size,
            max_batch_size,
            freelist,
            current: None,
            alloc_cnt: Arc::new(AtomicU64::new(0)),
            free_cnt: Arc::new(AtomicU64::new(0)),
            waiting: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Region shared with poster links at prepare time.
    pub fn batch_region(&self) -> &Region {
        &self.region
    }

    pub fn batch_region_size(&self) -> usize {
        self.region.size()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Currently accumulating batch, if any.
    pub fn current(&self) -> Option<&Batch> {
        self.current.as_ref()
    }

    /// Claims the next free batch for `pid`. Spins briefly when the pool
    /// is empty, surfacing the wait through the waiting gauge, and gives
    /// up with None once the budget is spent.
    pub fn allocate(&mut self, pid: u64) -> Option<&Batch> {
        let mut index = self.freelist.pop();
        if index.is_none() {
            self.waiting.fetch_add(1, Ordering::Relaxed);
            for _ in 0..ALLOC_SPIN_BUDGET {
                index = self.freelist.pop();
                if index.is_some() {
                    break;
                }
                std::thread::yield_now();
            }
            self.waiting.fetch_sub(1, Ordering::Relaxed);
        }
        let index = index?;
        self.alloc_cnt.fetch_add(1, Ordering::Relaxed);
        self.current = Some(Batch {
            index,
            id: pid,
            extent: 0,
            entries: 0,
        });
        self.current.as_ref()
    }

    /// Appends a result datagram to the current batch, returning the
    /// entry's byte offset within the region. None when the batch is full
    /// or absent.
    pub fn append(&mut self, result: &ResultDgram) -> Option<usize> {
        let slot_size = self.slot_size;
        let max_batch = self.max_batch_size;
        let batch = self.current.as_mut()?;
        if batch.entries >= MAX_ENTRIES {
            return None;
        }
        let offset = batch.index * max_batch + batch.extent;
        let bytes = result.encode();
        self.region.write(offset, &bytes).ok()?;
        let batch = self.current.as_mut()?;
        batch.extent += slot_size;
        batch.entries += 1;
        Some(offset)
    }

    /// Flushes the current batch: no more appends; the caller posts it.
    pub fn take_current(&mut self) -> Option<Batch> {
        self.current.take()
    }

    /// Copies a batch's accumulated bytes out of the region for posting.
    pub fn batch_bytes(&self, batch: &Batch) -> Vec<u8> {
        self.region
            .read(batch.index * self.max_batch_size, batch.extent)
    }

    /// Returns a posted batch to the freelist. Intentionally precedes the
    /// remote-write completion; the pool depth keeps the freelist loop
    /// time ahead of the longest in-flight transmit.
    pub fn release(&mut self, batch: Batch) {
        let _ = self.freelist.push(batch.index);
        self.free_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn free_batches(&self) -> usize {
        self.freelist.len()
    }

    pub fn batch_alloc_cnt(&self) -> Arc<AtomicU64> {
        self.alloc_cnt.clone()
    }

    pub fn batch_free_cnt(&self) -> Arc<AtomicU64> {
        self.free_cnt.clone()
    }

    pub fn batch_waiting(&self) -> Arc<AtomicU64> {
        self.waiting.clone()
    }

    /// Logs pool occupancy at shutdown.
    pub fn dump(&self) {
        eprintln!(
            "BatchManager: {} of {} batches free, current {:?}",
            self.free_batches(),
            MAX_BATCHES,
            self.current.as_ref().map(|b| b.index)
        );
    }

    /// Tears the region down. Safe only once every batch is free.
    pub fn shutdown(&mut self) {
        self.current = None;
    }
}
