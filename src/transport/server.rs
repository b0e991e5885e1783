//! Pender-side multiplexer: owns a set of links and the one receive
//! completion queue their posts signal.

use crate::transport::fabric::{CompletionQueue, Fabric, Listener, TransportError, CQ_DEPTH};
use crate::transport::link::EbLink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PEND_SLEEP: Duration = Duration::from_micros(100);

pub struct EbServer {
    verbose: u32,
    cq: CompletionQueue,
    /// Current wait budget; zero selects poll mode.
    tmo: u64,
    rx_pending: Arc<AtomicU64>,
    listener: Option<Listener>,
    links: Vec<EbLink>,
    shut: bool,
}

impl EbServer {
    pub fn new(verbose: u32) -> Self {
        Self {
            verbose,
            cq: CompletionQueue::new(CQ_DEPTH),
            tmo: 0,
            rx_pending: Arc::new(AtomicU64::new(0)),
            listener: None,
            links: Vec::new(),
            shut: false,
        }
    }

    /// Binds the listening endpoint peers will connect to.
    pub fn initialize(
        &mut self,
        fabric: &Fabric,
        addr: &str,
        port: u16,
        nlinks: usize,
    ) -> Result<(), TransportError> {
        let listener = fabric.listen(addr, port)?;
        self.listener = Some(listener);
        self.links.reserve(nlinks);
        self.shut = false;
        Ok(())
    }

    /// Accepts one inbound connection and returns the new link's index.
    /// The link still needs `prepare_pender` before it is usable.
    pub fn connect_link(&mut self, tmo_ms: u64) -> Result<usize, TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::NotConnected)?;
        let conn = listener.accept(tmo_ms)?;
        self.links.push(EbLink::pender(conn, self.cq.clone()));
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

    /// Waits up to `ms_tmo` for the next completion. Polling favors
    /// latency, waiting favors throughput: a successful completion while
    /// waiting switches the next call to poll mode, and an empty poll
    /// re-arms the wait.
    pub fn pend(&mut self, ms_tmo: u64) -> Result<u64, TransportError> {
        if self.tmo == 0 {
            match self.cq.try_pop() {
                Some(entry) => return Ok(entry.data),
                None => {
                    self.tmo = ms_tmo;
                    return Err(TransportError::Timeout(0));
                }
            }
        }

        self.rx_pending.store(1, Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_millis(self.tmo);
        let out = loop {
            if let Some(entry) = self.cq.try_pop() {
                self.tmo = 0;
                break Ok(entry.data);
            }
            if Instant::now() >= deadline {
                break Err(TransportError::Timeout(ms_tmo));
            }
            std::thread::sleep(PEND_SLEEP);
        };
        self.rx_pending.store(0, Ordering::Relaxed);
        out
    }

    /// Non-blocking completion check.
    pub fn poll(&mut self) -> Option<u64> {
        self.cq.try_pop().map(|entry| entry.data)
    }

    /// Probes the event queue. Reports `NotConnected` once the server is
    /// shut down or every accepted link has disconnected.
    pub fn check_eq(&self) -> Result<(), TransportError> {
        if self.shut {
            return Err(TransportError::NotConnected);
        }
        if !self.links.is_empty() && self.links.iter().all(|l| !l.is_connected()) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    /// Gauge handle exported as the receive-pending metric.
    pub fn pending(&self) -> Arc<AtomicU64> {
        self.rx_pending.clone()
    }

    pub fn shutdown(&mut self) {
        for link in &self.links {
            link.shutdown();
        }
        self.links.clear();
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        self.shut = true;
        if self.verbose > 1 {
            eprintln!("EbServer shut down");
        }
    }
}
