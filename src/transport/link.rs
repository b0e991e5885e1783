//! One logical point-to-point channel to a peer. A link is prepared as
//! either a poster (initiates remote writes into the peer's region) or a
//! pender (owns the region writes land in, plus the credits gating them).

use crate::transport::fabric::{
    CompletionQueue, Conn, CqEntry, PenderInfo, PosterInfo, Region, TransportError,
    POST_RETRY_BUDGET,
};
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct EbLink {
    conn: Arc<Conn>,
    peer_id: u32,
    /// Peer's half after a poster-side exchange.
    remote: Option<PenderInfo>,
    /// Own half after a pender-side exchange.
    local: Option<PenderInfo>,
    /// Server receive queue assigned at accept time (pender role).
    cq: Option<CompletionQueue>,
    /// Transmit-pending gauge shared with the owning client.
    tx_pending: Option<Arc<AtomicU64>>,
}

impl EbLink {
    pub(crate) fn poster(conn: Arc<Conn>, tx_pending: Arc<AtomicU64>) -> Self {
        Self {
            conn,
            peer_id: u32::MAX,
            remote: None,
            local: None,
            cq: None,
            tx_pending: Some(tx_pending),
        }
    }

    pub(crate) fn pender(conn: Arc<Conn>, cq: CompletionQueue) -> Self {
        Self {
            conn,
            peer_id: u32::MAX,
            remote: None,
            local: None,
            cq: Some(cq),
            tx_pending: None,
        }
    }

    /// Peer id as negotiated during the descriptor exchange.
    pub fn id(&self) -> u32 {
        self.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Poster-side exchange: publish this side's id, then record the
    /// peer's landing region, credits, and completion queue. `region` is
    /// the registered source the subsequent posts read from.
    pub fn prepare_poster(
        &mut self,
        local_id: u32,
        region: &Region,
        tmo_ms: u64,
    ) -> Result<(), TransportError> {
        if region.size() == 0 {
            return Err(TransportError::RegionRefused("empty source region".into()));
        }
        self.conn.publish_poster(PosterInfo { id: local_id });
        let remote = self.conn.wait_pender(tmo_ms)?;
        self.peer_id = remote.id;
        self.remote = Some(remote);
        Ok(())
    }

    /// Pender-side exchange: allocate the landing region and its receive
    /// credits, publish them with this side's id, and learn the peer id.
    pub fn prepare_pender(
        &mut self,
        local_id: u32,
        region_size: usize,
        num_buffers: usize,
        tmo_ms: u64,
    ) -> Result<(), TransportError> {
        let cq = self.cq.clone().ok_or(TransportError::Handshake)?;
        let region = Region::new(region_size)?;
        let credits = Arc::new(ArrayQueue::new(num_buffers.max(1)));
        let info = PenderInfo {
            id: local_id,
            region,
            credits,
            cq,
        };
        self.conn.publish_pender(info.clone());
        let poster = self.conn.wait_poster(tmo_ms)?;
        self.peer_id = poster.id;
        self.local = Some(info);
        Ok(())
    }

    /// Issues a remote write of `buf` into the peer's region at
    /// `base + offset`, delivering `imm` through the peer's completion
    /// queue. Non-blocking; fails with `QueueFull` only once the internal
    /// retry budget is exhausted.
    pub fn post(&self, buf: &[u8], offset: usize, imm: u64) -> Result<(), TransportError> {
        if !self.conn.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let remote = self.remote.as_ref().ok_or(TransportError::Handshake)?;

        let mut acquired = false;
        for _ in 0..POST_RETRY_BUDGET {
            if remote.credits.pop().is_some() {
                acquired = true;
                break;
            }
            std::thread::yield_now();
        }
        if !acquired {
            return Err(TransportError::QueueFull);
        }

        if let Some(gauge) = &self.tx_pending {
            gauge.fetch_add(1, Ordering::Relaxed);
        }
        let result = remote
            .region
            .write(offset, buf)
            .and_then(|_| remote.cq.push(CqEntry { data: imm }));
        if let Some(gauge) = &self.tx_pending {
            gauge.fetch_sub(1, Ordering::Relaxed);
        }
        if result.is_err() {
            // Return the consumed credit so the peer's window stays whole.
            let _ = remote.credits.push(());
        }
        result
    }

    /// Reposts one receive credit so the peer may post again.
    pub fn post_comp_recv(&self) -> Result<(), TransportError> {
        let local = self.local.as_ref().ok_or(TransportError::Handshake)?;
        local.credits.push(()).map_err(|_| TransportError::QueueFull)
    }

    /// Remote address a post at `offset` would land on, for logging.
    pub fn rmt_adx(&self, offset: usize) -> u64 {
        self.remote
            .as_ref()
            .map(|r| r.region.base() + offset as u64)
            .unwrap_or(0)
    }

    /// Landing region owned by this side (pender role).
    pub fn local_region(&self) -> Option<&Region> {
        self.local.as_ref().map(|l| &l.region)
    }

    pub fn shutdown(&self) {
        self.conn.shutdown();
    }
}
