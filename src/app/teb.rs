//! Trigger event builder core: pulls completed events off the event
//! builder, runs the decision policy, accumulates results into batches,
//! and fans finished batches out to every receiver, interleaving monitor
//! tokens granted by the MRQ clients.

use crate::app::decide::{DecideHandle, DecideSlot};
use crate::batch::manager::{Batch, BatchManager};
use crate::config::params::{EbParams, CONNECT_TMO_MS, EB_TMO_MS, MAX_DRPS, MAX_MEBS};
use crate::dgram::{Damage, Dgram, ResultDgram, TransitionId, MON_IDX, WRT_IDX};
use crate::eb::app::{EbAppBase, EventSink};
use crate::eb::event::EbEvent;
use crate::observability::logging::{JsonLineLogger, LogContext, LogLevel};
use crate::observability::stats::{
    MetricKind, StatsMonitor, TEB_BAT_CT, TEB_BT_AL_CT, TEB_BT_FR_CT, TEB_BT_WTG, TEB_EP_AL_CT,
    TEB_EP_FR_CT, TEB_EVT_CT, TEB_EVT_RT, TEB_EV_AL_CT, TEB_EV_FR_CT, TEB_RX_PDG, TEB_TX_PDG,
};
use crate::runtime::affinity::pin_thread;
use crate::runtime::signals::RunFlag;
use crate::transport::client::EbClient;
use crate::transport::fabric::{Fabric, TransportError};
use crate::transport::imm::ImmData;
use crate::transport::server::EbServer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receive window granted to each MRQ client.
const MRQ_REGION_SIZE: usize = 8;
const MRQ_NUM_BUFFERS: usize = 64;

/// Decision-side state driven by the event builder's sink callback.
pub struct TebCore {
    l3: EbClient,
    l3_links: [Option<usize>; MAX_DRPS],
    mrq: EbServer,
    mrq_links: [Option<usize>; MAX_MEBS],
    batman: BatchManager,
    id: u32,
    verbose: u32,
    receivers: u64,
    decide: Option<DecideHandle>,
    decide_slot: DecideSlot,
    event_count: Arc<AtomicU64>,
    batch_count: Arc<AtomicU64>,
    missed_receivers: Arc<AtomicU64>,
    logger: JsonLineLogger,
}

impl TebCore {
    fn connect(&mut self, fabric: &Fabric, prms: &EbParams) -> Result<(), TransportError> {
        self.id = prms.id;

        for (addr, port) in prms.addrs.iter().zip(prms.ports.iter()) {
            let index = self.l3.connect(fabric, addr, *port, CONNECT_TMO_MS)?;
            let link = self.l3.link_mut(index);
            link.prepare_poster(prms.id, self.batman.batch_region(), CONNECT_TMO_MS)?;
            let peer = link.id() as usize;
            if peer >= MAX_DRPS {
                return Err(TransportError::Handshake);
            }
            self.l3_links[peer] = Some(index);
            let _ = self.logger.log(
                LogLevel::Info,
                "teb",
                LogContext::default().link(peer as u32),
                "outbound link with Ctrb connected",
            );
        }

        self.mrq
            .initialize(fabric, &prms.if_addr, prms.mrq_port, prms.num_mrqs as usize)?;
        for _ in 0..prms.num_mrqs {
            let index = self.mrq.connect_link(CONNECT_TMO_MS)?;
            let link = self.mrq.link_mut(index);
            link.prepare_pender(prms.id, MRQ_REGION_SIZE, MRQ_NUM_BUFFERS, CONNECT_TMO_MS)?;
            link.post_comp_recv()?;
            let peer = link.id() as usize;
            if peer >= MAX_MEBS {
                return Err(TransportError::Handshake);
            }
            self.mrq_links[peer] = Some(index);
            let _ = self.logger.log(
                LogLevel::Info,
                "teb",
                LogContext::default().link(peer as u32),
                "inbound link with MonReq connected",
            );
        }

        Ok(())
    }

    /// Configure transitions pick up the freshly staged decide object;
    /// every other event call uses the cached one. With no object at all
    /// the builder keeps running but damages everything it emits.
    fn configure_transition(&mut self, dg: &Dgram) -> Damage {
        if let Some(next) = self.decide_slot.take() {
            self.decide = Some(next);
        }
        match self.decide.as_mut() {
            Some(decide) => decide.configure(dg),
            None => {
                let _ = self.logger.log(
                    LogLevel::Error,
                    "teb",
                    LogContext::default().pulse(dg.pulse_id.value()),
                    "no Decide object found at Configure",
                );
                let mut damage = Damage::none();
                damage.increase(Damage::USER_DEFINED);
                damage
            }
        }
    }

    /// Appends into the current batch, rolling to a fresh one if the
    /// entry budget is exhausted mid-window.
    fn append_result(&mut self, pid: u64, rdg: &ResultDgram) {
        if self.batman.append(rdg).is_some() {
            return;
        }
        if let Some(batch) = self.batman.take_current() {
            self.post(batch);
        }
        if self.batman.allocate(pid).is_none() {
            eprintln!("Teb: batch pool exhausted");
            std::process::abort();
        }
        if self.batman.append(rdg).is_none() {
            eprintln!("Teb: result does not fit a fresh batch");
            std::process::abort();
        }
    }

    /// Fans the batch out to every accumulated receiver, then releases it.
    /// A destination that fails is counted and skipped; the rest still
    /// receive the batch.
    fn post(&mut self, batch: Batch) {
        let index = batch.index();
        let data = ImmData::value(ImmData::BUFFER, self.id, index as u32);
        let offset = index * self.batman.max_batch_size();
        let buffer = self.batman.batch_bytes(&batch);

        let mut destns = self.receivers;
        while destns != 0 {
            let dst = destns.trailing_zeros() as usize;
            destns &= destns - 1;

            let Some(link_index) = self.l3_links[dst] else {
                self.missed_receivers.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let link = self.l3.link(link_index);
            if self.verbose > 0 {
                let _ = self.logger.log(
                    LogLevel::Debug,
                    "teb",
                    LogContext::default()
                        .pulse(batch.id())
                        .batch(index)
                        .link(dst as u32),
                    &format!(
                        "posts result batch, sz {} @ {:#x}",
                        batch.extent(),
                        link.rmt_adx(offset)
                    ),
                );
            }
            if let Err(err) = link.post(&buffer, offset, data) {
                self.missed_receivers.fetch_add(1, Ordering::Relaxed);
                let _ = self.logger.log(
                    LogLevel::Warn,
                    "teb",
                    LogContext::default()
                        .pulse(batch.id())
                        .batch(index)
                        .link(dst as u32),
                    &format!("result batch post failed: {err}"),
                );
            }
        }

        self.receivers = 0;
        self.batch_count.fetch_add(1, Ordering::Relaxed);

        // Releasing before the remote completion is deliberate: with one
        // batch active at a time and a deep pool, the freelist loop time
        // exceeds the longest in-flight transmit.
        self.batman.release(batch);
    }
}

impl EventSink for TebCore {
    fn process(&mut self, event: &EbEvent) {
        self.event_count.fetch_add(1, Ordering::Relaxed);

        let dg = event.creator().clone();
        let mut damage = Damage::none();
        if dg.service == TransitionId::Configure {
            damage.increase(self.configure_transition(&dg).value());
        }

        if ImmData::rsp(ImmData::flg(event.parameter())) {
            let pid = dg.pulse_id.value();
            let expired = match self.batman.current() {
                None => true,
                Some(batch) => batch.expired(pid),
            };
            if expired {
                if let Some(batch) = self.batman.take_current() {
                    self.post(batch);
                }
                if self.batman.allocate(pid).is_none() {
                    eprintln!("Teb: batch pool exhausted");
                    std::process::abort();
                }
            }

            let mut rdg = ResultDgram::new(&dg, self.id);
            match self.decide.as_mut() {
                Some(decide) => {
                    for (_, ctrb) in event.contributions() {
                        let dmg = rdg.with_result_words(|words| decide.event(ctrb, Some(words)));
                        damage.increase(dmg.value());
                    }
                }
                None => damage.increase(Damage::USER_DEFINED),
            }
            damage.increase(event.damage().value());
            rdg.increase_damage(damage.value());

            // Accumulate this event's receivers; cleared after posting.
            self.receivers |= event.receivers();

            if rdg.is_event() {
                if rdg.result()[MON_IDX] != 0 {
                    match self.mrq.poll() {
                        Some(token) => {
                            rdg.set_result(MON_IDX, token as u32);
                            let src = ImmData::src(token) as usize;
                            if let Some(link_index) = self.mrq_links.get(src).copied().flatten() {
                                if let Err(err) = self.mrq.link(link_index).post_comp_recv() {
                                    let _ = self.logger.log(
                                        LogLevel::Warn,
                                        "teb",
                                        LogContext::default().pulse(pid).link(src as u32),
                                        &format!("failed to repost MRQ credit: {err}"),
                                    );
                                }
                            }
                        }
                        None => rdg.set_result(MON_IDX, 0),
                    }
                }
                self.append_result(pid, &rdg);
            } else {
                // Transitions are always written out and always monitored,
                // and they close the batch immediately.
                rdg.set_result(WRT_IDX, 1);
                rdg.set_result(MON_IDX, 1);
                self.append_result(pid, &rdg);
                if let Some(batch) = self.batman.take_current() {
                    self.post(batch);
                }
            }

            if self.verbose > 2 {
                let result = rdg.result();
                let _ = self.logger.log(
                    LogLevel::Trace,
                    "teb",
                    LogContext::default().pulse(pid),
                    &format!(
                        "processed result, res [{:08x}, {:08x}] dmg {:08x}",
                        result[0],
                        result[1],
                        rdg.damage().value()
                    ),
                );
            }
        } else {
            if let Some(decide) = self.decide.as_mut() {
                for (_, ctrb) in event.contributions() {
                    let _ = decide.event(ctrb, None);
                }
            }
            // No response is emitted, but a transition still flushes any
            // in-progress batch.
            if !dg.is_event() {
                if let Some(batch) = self.batman.take_current() {
                    self.post(batch);
                }
            }
        }
    }
}

/// The assembled trigger event builder: input side plus decision core.
pub struct Teb {
    app: EbAppBase,
    core: TebCore,
    running: RunFlag,
    prms: EbParams,
}

impl Teb {
    pub fn new(
        prms: &EbParams,
        smon: &StatsMonitor,
        decide_slot: DecideSlot,
        running: RunFlag,
    ) -> Result<Self, TransportError> {
        let app = EbAppBase::new(prms);
        let batman = BatchManager::new(prms.max_result_size)?;
        let core = TebCore {
            l3: EbClient::new(prms.verbose),
            l3_links: [None; MAX_DRPS],
            mrq: EbServer::new(prms.verbose),
            mrq_links: [None; MAX_MEBS],
            batman,
            id: prms.id,
            verbose: prms.verbose,
            receivers: 0,
            decide: None,
            decide_slot,
            event_count: Arc::new(AtomicU64::new(0)),
            batch_count: Arc::new(AtomicU64::new(0)),
            missed_receivers: Arc::new(AtomicU64::new(0)),
            logger: JsonLineLogger::with_verbose(prms.verbose),
        };

        smon.metric(TEB_EVT_RT, MetricKind::Rate, core.event_count.clone());
        smon.metric(TEB_EVT_CT, MetricKind::Scalar, core.event_count.clone());
        smon.metric(TEB_BAT_CT, MetricKind::Scalar, core.batch_count.clone());
        smon.metric(TEB_BT_AL_CT, MetricKind::Scalar, core.batman.batch_alloc_cnt());
        smon.metric(TEB_BT_FR_CT, MetricKind::Scalar, core.batman.batch_free_cnt());
        smon.metric(TEB_BT_WTG, MetricKind::Scalar, core.batman.batch_waiting());
        smon.metric(TEB_EP_AL_CT, MetricKind::Scalar, app.epoch_alloc_cnt());
        smon.metric(TEB_EP_FR_CT, MetricKind::Scalar, app.epoch_free_cnt());
        smon.metric(TEB_EV_AL_CT, MetricKind::Scalar, app.event_alloc_cnt());
        smon.metric(TEB_EV_FR_CT, MetricKind::Scalar, app.event_free_cnt());
        smon.metric(TEB_TX_PDG, MetricKind::Scalar, core.l3.pending());
        smon.metric(TEB_RX_PDG, MetricKind::Scalar, app.rx_pending());

        Ok(Self {
            app,
            core,
            running,
            prms: prms.clone(),
        })
    }

    /// Overrides the event builder's stale-promotion distance.
    pub fn with_timeout(mut self, pulses: u64) -> Self {
        self.app = self.app.with_timeout(pulses);
        self
    }

    /// Completed-event counter handle.
    pub fn event_count(&self) -> Arc<AtomicU64> {
        self.core.event_count.clone()
    }

    /// Posted-batch counter handle.
    pub fn batch_count(&self) -> Arc<AtomicU64> {
        self.core.batch_count.clone()
    }

    /// Establishes every link of the run: contributor input links, result
    /// poster links sharing the batch region, and MRQ pender links with
    /// their initial credit.
    pub fn connect(&mut self, fabric: &Fabric, prms: &EbParams) -> Result<(), TransportError> {
        self.app.connect(fabric, prms)?;
        self.core.connect(fabric, prms)?;
        self.prms = prms.clone();
        Ok(())
    }

    /// Hot loop, pinned to the app core. Exits once the run flag clears
    /// or the event queue reports a disconnect; drains what the builder
    /// can still complete and posts the residual batch before teardown.
    pub fn run(&mut self) {
        let report = pin_thread(self.prms.core[0]);
        if self.prms.verbose > 0 && !report.applied {
            eprintln!("Teb: could not pin run thread to core {}", report.core);
        }

        self.core.receivers = 0;
        self.core.event_count.store(0, Ordering::Relaxed);
        self.core.batch_count.store(0, Ordering::Relaxed);

        loop {
            if !self.running.is_running() && self.app.check_eq().is_err() {
                break;
            }
            match self.app.process(&mut self.core, EB_TMO_MS) {
                Ok(()) => {}
                Err(_) => {
                    if self.app.check_eq().is_err() {
                        break;
                    }
                }
            }
        }

        self.app.drain(&mut self.core);
        if let Some(batch) = self.core.batman.take_current() {
            self.core.post(batch);
        }

        self.core.mrq.shutdown();
        self.core.l3.shutdown();
        self.app.shutdown();
        self.core.batman.dump();
        self.core.batman.shutdown();
    }
}
