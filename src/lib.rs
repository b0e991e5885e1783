//! Trigger event builder: a latency-sensitive coordinator that assembles
//! time-ordered events from concurrent data-acquisition contributors,
//! runs a pluggable trigger decision over each completed event, and fans
//! the resulting batches out to downstream receivers.

pub mod dgram;

pub mod transport {
    pub mod client;
    pub mod fabric;
    pub mod imm;
    pub mod link;
    pub mod server;

    pub use client::*;
    pub use fabric::*;
    pub use imm::*;
    pub use link::*;
    pub use server::*;
}

pub mod eb {
    pub mod app;
    pub mod builder;
    pub mod event;

    pub use app::*;
    pub use builder::*;
    pub use event::*;
}

pub mod batch {
    pub mod manager;

    pub use manager::*;
}

pub mod app {
    pub mod cli;
    pub mod collection;
    pub mod decide;
    pub mod teb;

    pub use cli::*;
    pub use collection::*;
    pub use decide::*;
    pub use teb::*;
}

pub mod config {
    pub mod db;
    pub mod params;

    pub use db::*;
    pub use params::*;
}

pub mod observability {
    pub mod logging;
    pub mod stats;

    pub use logging::*;
    pub use stats::*;
}

pub mod runtime {
    pub mod affinity;
    pub mod signals;

    pub use affinity::*;
    pub use signals::*;
}

pub use app::collection::{
    create_msg, parse_connection_params, CollectionError, CollectionTransport,
    HttpCollectionTransport, LoopbackBus, LoopbackHandle, TebApp,
};
pub use app::decide::{
    Decide, DecideError, DecideFactory, DecideHandle, DecideLoader, DecideRegistry, DecideSlot,
    LibCounters, StandardDecide, STANDARD_SONAME,
};
pub use app::teb::Teb;
pub use batch::manager::{Batch, BatchManager};
pub use config::db::{ConfigDb, ConfigDbError, HttpConfigDb, MemConfigDb};
pub use config::params::{
    drp_port, mrq_port, teb_port, EbParams, BATCH_DURATION, CONNECT_TMO_MS, DRP_PORT_BASE,
    MAX_BATCHES, MAX_CONTRIB_SIZE, MAX_DRPS, MAX_ENTRIES, MAX_INPUT_BUFFERS, MAX_LATENCY,
    MAX_MEBS, MAX_RESULT_SIZE, MAX_TEBS, MRQ_PORT_BASE, NUM_PORTS, NUM_READOUT_GROUPS,
    TEB_PORT_BASE,
};
pub use dgram::{
    Damage, Dgram, DgramError, Level, PulseId, ResultDgram, Src, TransitionId, TypeId, Xtc,
    INPUT_EXTENT, MON_IDX, RESULT_EXTENT, WRT_IDX,
};
pub use eb::app::{EbAppBase, EventSink};
pub use eb::builder::{EventBuilder, EPOCH_POOL_DEPTH, EVENT_POOL_DEPTH};
pub use eb::event::EbEvent;
pub use observability::logging::{
    JsonLineLogger, LogContext, LogLevel, LogSegment, LoggingError, RotationPolicy,
};
pub use observability::stats::{
    CaptureSink, HttpStatsSink, MetricKind, MetricSample, MetricsSnapshot, StatsError, StatsMonitor,
    StatsSink, TEB_METRICS,
};
pub use runtime::affinity::{pin_thread, PinReport};
pub use runtime::signals::{install_sigint, RunFlag};
pub use transport::client::EbClient;
pub use transport::fabric::{
    CompletionQueue, Conn, CqEntry, Fabric, Listener, Region, TransportError,
};
pub use transport::imm::ImmData;
pub use transport::link::EbLink;
pub use transport::server::EbServer;
