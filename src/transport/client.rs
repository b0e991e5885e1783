//! Poster-side multiplexer: initiates connections and owns the links that
//! post remote writes into peer regions.

use crate::transport::fabric::{Fabric, TransportError};
use crate::transport::link::EbLink;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub struct EbClient {
    verbose: u32,
    tx_pending: Arc<AtomicU64>,
    links: Vec<EbLink>,
}

impl EbClient {
    pub fn new(verbose: u32) -> Self {
        Self {
            verbose,
            tx_pending: Arc::new(AtomicU64::new(0)),
            links: Vec::new(),
        }
    }

    /// Connects to a peer's listener, honoring the handshake timeout.
    /// Returns the new link's index; the link still needs
    /// `prepare_poster` before it is usable.
    pub fn connect(
        &mut self,
        fabric: &Fabric,
        addr: &str,
        port: u16,
        tmo_ms: u64,
    ) -> Result<usize, TransportError> {
        let conn = fabric.connect(addr, port, tmo_ms)?;
        self.links
            .push(EbLink::poster(conn, self.tx_pending.clone()));
        if self.verbose > 1 {
            eprintln!("EbClient connected to {addr}:{port}");
        }
        Ok(self.links.len() - 1)
    }

    pub fn link(&self, index: usize) -> &EbLink {
        &self.links[index]
    }

    pub fn link_mut(&mut self, index: usize) -> &mut EbLink {
        &mut self.links[index]
    }

    pub fn num_links(&self) -> usize {
        self.links.len()
    }

    /// Gauge handle exported as the transmit-pending metric.
    pub fn pending(&self) -> Arc<AtomicU64> {
        self.tx_pending.clone()
    }

    pub fn shutdown(&mut self) {
        for link in &self.links {
            link.shutdown();
        }
        self.links.clear();
    }
}
