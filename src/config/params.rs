//! Partition-wide constants and the immutable per-run parameter snapshot.

use crate::dgram::{Dgram, Xtc, INPUT_EXTENT, RESULT_EXTENT};

pub const MAX_DRPS: usize = 64;
pub const MAX_TEBS: usize = 16;
pub const MAX_MEBS: usize = 16;

pub const TEB_PORT_BASE: u32 = 32768;
pub const DRP_PORT_BASE: u32 = TEB_PORT_BASE + MAX_TEBS as u32;
pub const MRQ_PORT_BASE: u32 = DRP_PORT_BASE + MAX_DRPS as u32;

/// Ports consumed per partition across all roles.
pub const NUM_PORTS: u32 = (MAX_DRPS + 2 * MAX_TEBS + MAX_MEBS) as u32;

/// Batch pulse-id window in microseconds. Must be a power of two.
pub const BATCH_DURATION: u64 = 1 << 14;
/// Maximum result datagrams per batch.
pub const MAX_ENTRIES: usize = 64;
/// Deepest tolerated in-flight pulse window in microseconds.
pub const MAX_LATENCY: u64 = 1 << 24;
/// Batches in the pre-registered pool; the freelist loop time must exceed
/// the maximum in-flight transmit time.
pub const MAX_BATCHES: usize = (MAX_LATENCY / BATCH_DURATION) as usize;

pub const NUM_READOUT_GROUPS: usize = 16;

/// Receive slots per contributor input link.
pub const MAX_INPUT_BUFFERS: usize = 1024;

/// Default connection handshake timeout in milliseconds.
pub const CONNECT_TMO_MS: u64 = 120_000;
/// Receive pend timeout used by the run loop, in milliseconds.
pub const EB_TMO_MS: u64 = 100;

pub const MAX_CONTRIB_SIZE: usize = Dgram::HEADER_SIZE + Xtc::HEADER_SIZE + INPUT_EXTENT * 4;
pub const MAX_RESULT_SIZE: usize = Dgram::HEADER_SIZE + Xtc::HEADER_SIZE + RESULT_EXTENT * 4;

pub fn teb_port(partition: u32, id: u32) -> u16 {
    (TEB_PORT_BASE + NUM_PORTS * partition + id) as u16
}

pub fn drp_port(partition: u32, id: u32) -> u16 {
    (DRP_PORT_BASE + NUM_PORTS * partition + id) as u16
}

pub fn mrq_port(partition: u32, id: u32) -> u16 {
    (MRQ_PORT_BASE + NUM_PORTS * partition + id) as u16
}

/// Immutable configuration snapshot for one run. Populated from the
/// command line and the orchestrator's connect topology; fixed between
/// configure and unconfigure.
#[derive(Debug, Clone)]
pub struct EbParams {
    pub if_addr: String,
    pub eb_port: u16,
    pub mrq_port: u16,
    pub partition: u32,
    pub alias: String,
    pub id: u32,
    /// Bit list of contributing DRPs.
    pub contributors: u64,
    /// Result destination addresses served by contributors, indexed in
    /// arrival order of the topology.
    pub addrs: Vec<String>,
    pub ports: Vec<u16>,
    pub max_tr_size: usize,
    pub max_result_size: usize,
    pub num_mrqs: u32,
    pub core: [usize; 2],
    pub verbose: u32,
    /// Contributors whose input is required, per readout group.
    pub contractors: [u64; NUM_READOUT_GROUPS],
    /// Peers receiving results, per readout group.
    pub receivers: [u64; NUM_READOUT_GROUPS],
}

impl Default for EbParams {
    fn default() -> Self {
        Self {
            if_addr: String::new(),
            eb_port: 0,
            mrq_port: 0,
            partition: u32::MAX,
            alias: String::new(),
            id: u32::MAX,
            contributors: 0,
            addrs: Vec::new(),
            ports: Vec::new(),
            max_tr_size: MAX_CONTRIB_SIZE,
            max_result_size: MAX_RESULT_SIZE,
            num_mrqs: 0,
            core: [10, 11],
            verbose: 0,
            contractors: [0; NUM_READOUT_GROUPS],
            receivers: [0; NUM_READOUT_GROUPS],
        }
    }
}
