//! Sorts arriving contributions by pulse id, aggregates them by event,
//! and releases completed events strictly in pulse-id order.

use crate::config::params::{BATCH_DURATION, MAX_BATCHES, MAX_ENTRIES, MAX_LATENCY, NUM_READOUT_GROUPS};
use crate::dgram::Dgram;
use crate::eb::event::EbEvent;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bounded epoch pool depth.
pub const EPOCH_POOL_DEPTH: usize = MAX_BATCHES;
/// Bounded event pool depth.
pub const EVENT_POOL_DEPTH: usize = MAX_BATCHES * MAX_ENTRIES;

const EPOCH_MASK: u64 = !(BATCH_DURATION - 1);

#[derive(Default)]
struct Epoch {
    events: BTreeMap<u64, EbEvent>,
}

/// Ordered collection of in-flight events keyed by pulse id, bucketed by
/// epoch. Completed events flush as a contiguous prefix; an incomplete
/// head is promoted once the newest pulse runs far enough ahead.
pub struct EventBuilder {
    epochs: BTreeMap<u64, Epoch>,
    ready: VecDeque<EbEvent>,
    contributors: u64,
    contractors: [u64; NUM_READOUT_GROUPS],
    receivers: [u64; NUM_READOUT_GROUPS],
    last_flushed: Option<u64>,
    newest: u64,
    timeout_pulses: u64,
    live_events: usize,
    verbose: u32,
    epoch_alloc: Arc<AtomicU64>,
    epoch_free: Arc<AtomicU64>,
    event_alloc: Arc<AtomicU64>,
    event_free: Arc<AtomicU64>,
    duplicates: u64,
    out_of_order: u64,
}

impl EventBuilder {
    pub fn new(verbose: u32) -> Self {
        Self {
            epochs: BTreeMap::new(),
            ready: VecDeque::new(),
            contributors: 0,
            contractors: [0; NUM_READOUT_GROUPS],
            receivers: [0; NUM_READOUT_GROUPS],
            last_flushed: None,
            newest: 0,
            timeout_pulses: MAX_LATENCY,
            live_events: 0,
            verbose,
            epoch_alloc: Arc::new(AtomicU64::new(0)),
            epoch_free: Arc::new(AtomicU64::new(0)),
            event_alloc: Arc::new(AtomicU64::new(0)),
            event_free: Arc::new(AtomicU64::new(0)),
            duplicates: 0,
            out_of_order: 0,
        }
    }

    /// Overrides the stale-promotion distance, in pulse units.
    pub fn with_timeout(mut self, pulses: u64) -> Self {
        self.timeout_pulses = pulses;
        self
    }

    /// Installs the per-group contract and receiver masks for the run.
    pub fn configure(
        &mut self,
        contributors: u64,
        contractors: [u64; NUM_READOUT_GROUPS],
        receivers: [u64; NUM_READOUT_GROUPS],
    ) {
        self.contributors = contributors;
        self.contractors = contractors;
        self.receivers = receivers;
        self.last_flushed = None;
        self.newest = 0;
    }

    /// Folds one arriving contribution into the table and flushes any
    /// newly releasable prefix.
    pub fn deliver(&mut self, src: u32, imm: u64, dg: Dgram) {
        let pid = dg.pulse_id.value();
        if let Some(last) = self.last_flushed {
            if pid <= last {
                self.out_of_order += 1;
                if self.verbose > 0 {
                    eprintln!("EventBuilder: dropped out-of-order contribution, pid {pid:014x} <= {last:014x}");
                }
                return;
            }
        }
        if pid > self.newest {
            self.newest = pid;
        }

        let epoch_key = pid & EPOCH_MASK;
        if !self.epochs.contains_key(&epoch_key) {
            if self.epochs.len() >= EPOCH_POOL_DEPTH {
                eprintln!(
                    "EventBuilder: epoch pool exhausted at {} epochs",
                    self.epochs.len()
                );
                std::process::abort();
            }
            self.epochs.insert(epoch_key, Epoch::default());
            self.epoch_alloc.fetch_add(1, Ordering::Relaxed);
        }
        let epoch = self.epochs.get_mut(&epoch_key).unwrap();

        match epoch.events.get_mut(&pid) {
            Some(event) => {
                if !event.add(src, dg) {
                    self.duplicates += 1;
                }
            }
            None => {
                if self.live_events >= EVENT_POOL_DEPTH {
                    eprintln!(
                        "EventBuilder: event pool exhausted at {} events",
                        self.live_events
                    );
                    std::process::abort();
                }
                let is_event = dg.pulse_id.is_event();
                let group = dg.pulse_id.readout_group() as usize;
                // Transitions complete against the full contributor set.
                let (contract, receivers) = if is_event {
                    (self.contractors[group], self.receivers[group])
                } else {
                    (self.contributors, self.contributors)
                };
                let event = EbEvent::new(dg, imm, contract, receivers, src);
                epoch.events.insert(pid, event);
                self.live_events += 1;
                self.event_alloc.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.flush();
    }

    /// Next completed event, in pulse-id order.
    pub fn pop_ready(&mut self) -> Option<EbEvent> {
        self.ready.pop_front()
    }

    fn flush(&mut self) {
        loop {
            let Some((&epoch_key, epoch)) = self.epochs.iter_mut().next() else {
                return;
            };
            let Some((&pid, head)) = epoch.events.iter().next() else {
                self.epochs.remove(&epoch_key);
                self.epoch_free.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let complete = head.is_complete();
            let stale = !complete && self.newest.saturating_sub(pid) > self.timeout_pulses;
            if !complete && !stale {
                return;
            }
            let mut event = epoch.events.remove(&pid).unwrap();
            if stale {
                event.promote_stale();
                if self.verbose > 0 {
                    eprintln!(
                        "EventBuilder: promoted stale event, pid {pid:014x}, missing {:016x}",
                        event.missing()
                    );
                }
            }
            if epoch.events.is_empty() {
                self.epochs.remove(&epoch_key);
                self.epoch_free.fetch_add(1, Ordering::Relaxed);
            }
            self.last_flushed = Some(pid);
            self.live_events -= 1;
            self.event_free.fetch_add(1, Ordering::Relaxed);
            self.ready.push_back(event);
        }
    }

    /// Shutdown path: release every remaining complete event and discard
    /// the incomplete ones holding the line.
    pub fn drain(&mut self) {
        self.flush();
        let epochs = std::mem::take(&mut self.epochs);
        for (_, epoch) in epochs {
            for (pid, event) in epoch.events {
                self.live_events -= 1;
                self.event_free.fetch_add(1, Ordering::Relaxed);
                if event.is_complete() {
                    self.last_flushed = Some(pid);
                    self.ready.push_back(event);
                }
            }
            self.epoch_free.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn epoch_alloc_cnt(&self) -> Arc<AtomicU64> {
        self.epoch_alloc.clone()
    }

    pub fn epoch_free_cnt(&self) -> Arc<AtomicU64> {
        self.epoch_free.clone()
    }

    pub fn event_alloc_cnt(&self) -> Arc<AtomicU64> {
        self.event_alloc.clone()
    }

    pub fn event_free_cnt(&self) -> Arc<AtomicU64> {
        self.event_free.clone()
    }

    /// Contributions rejected as duplicates.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Contributions rejected as older than the flushed horizon.
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }
}
