//! Input side of the builder: accepts contributor links, decodes arriving
//! contribution datagrams off the receive completion queue, and hands
//! completed events to the application sink.

use crate::config::params::{EbParams, CONNECT_TMO_MS, MAX_DRPS, MAX_INPUT_BUFFERS};
use crate::dgram::Dgram;
use crate::eb::builder::EventBuilder;
use crate::eb::event::EbEvent;
use crate::transport::fabric::{Fabric, TransportError};
use crate::transport::imm::ImmData;
use crate::transport::server::EbServer;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Consumer of completed events, called strictly in pulse-id order.
pub trait EventSink {
    fn process(&mut self, event: &EbEvent);
}

pub struct EbAppBase {
    server: EbServer,
    link_for_src: [Option<usize>; MAX_DRPS],
    builder: EventBuilder,
    max_buffers: usize,
    max_tr_size: usize,
    verbose: u32,
}

impl EbAppBase {
    pub fn new(prms: &EbParams) -> Self {
        Self {
            server: EbServer::new(prms.verbose),
            link_for_src: [None; MAX_DRPS],
            builder: EventBuilder::new(prms.verbose),
            max_buffers: MAX_INPUT_BUFFERS,
            max_tr_size: prms.max_tr_size,
            verbose: prms.verbose,
        }
    }

    /// Overrides the builder's stale-promotion distance.
    pub fn with_timeout(mut self, pulses: u64) -> Self {
        self.builder = self.builder.with_timeout(pulses);
        self
    }

    /// Accepts one link per contributor, sizes each landing region for the
    /// receive window, and posts the initial credits.
    pub fn connect(&mut self, fabric: &Fabric, prms: &EbParams) -> Result<(), TransportError> {
        let nctrbs = prms.contributors.count_ones() as usize;
        self.server
            .initialize(fabric, &prms.if_addr, prms.eb_port, nctrbs)?;

        for _ in 0..nctrbs {
            let index = self.server.connect_link(CONNECT_TMO_MS)?;
            let link = self.server.link_mut(index);
            link.prepare_pender(
                prms.id,
                self.max_buffers * self.max_tr_size,
                self.max_buffers,
                CONNECT_TMO_MS,
            )?;
            for _ in 0..self.max_buffers {
                link.post_comp_recv()?;
            }
            let src = link.id() as usize;
            if src >= MAX_DRPS {
                return Err(TransportError::Handshake);
            }
            self.link_for_src[src] = Some(index);
            if self.verbose > 0 {
                eprintln!("Inbound link with Ctrb ID {src} connected");
            }
        }

        self.builder
            .configure(prms.contributors, prms.contractors, prms.receivers);
        Ok(())
    }

    /// One hot-loop iteration: pend on the receive queue, decode the
    /// contribution the completion points at, repost the credit, and
    /// deliver any newly completed events.
    pub fn process(
        &mut self,
        sink: &mut dyn EventSink,
        tmo_ms: u64,
    ) -> Result<(), TransportError> {
        let imm = self.server.pend(tmo_ms)?;
        let src = ImmData::src(imm) as usize;
        let idx = ImmData::idx(imm) as usize;

        let Some(link_index) = self.link_for_src.get(src).copied().flatten() else {
            if self.verbose > 0 {
                eprintln!("EbAppBase: completion from unknown contributor {src}");
            }
            return Ok(());
        };
        if idx >= self.max_buffers {
            if self.verbose > 0 {
                eprintln!("EbAppBase: buffer index {idx} out of range");
            }
            return Ok(());
        }

        let link = self.server.link(link_index);
        let bytes = link
            .local_region()
            .ok_or(TransportError::Handshake)?
            .read(idx * self.max_tr_size, self.max_tr_size);
        link.post_comp_recv()?;

        match Dgram::decode(&bytes) {
            Ok(dg) => self.builder.deliver(src as u32, imm, dg),
            Err(err) => {
                eprintln!("EbAppBase: dropped undecodable contribution from {src}: {err}");
            }
        }

        while let Some(event) = self.builder.pop_ready() {
            sink.process(&event);
        }
        Ok(())
    }

    /// Shutdown path: release what the builder can still complete.
    pub fn drain(&mut self, sink: &mut dyn EventSink) {
        self.builder.drain();
        while let Some(event) = self.builder.pop_ready() {
            sink.process(&event);
        }
    }

    pub fn check_eq(&self) -> Result<(), TransportError> {
        self.server.check_eq()
    }

    pub fn shutdown(&mut self) {
        self.server.shutdown();
    }

    pub fn rx_pending(&self) -> Arc<AtomicU64> {
        self.server.pending()
    }

    pub fn epoch_alloc_cnt(&self) -> Arc<AtomicU64> {
        self.builder.epoch_alloc_cnt()
    }

    pub fn epoch_free_cnt(&self) -> Arc<AtomicU64> {
        self.builder.epoch_free_cnt()
    }

    pub fn event_alloc_cnt(&self) -> Arc<AtomicU64> {
        self.builder.event_alloc_cnt()
    }

    pub fn event_free_cnt(&self) -> Arc<AtomicU64> {
        self.builder.event_free_cnt()
    }
}
