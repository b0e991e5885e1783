//! Coordinator client: drives the connect/configure/disconnect lifecycle
//! from the orchestration bus and owns the hand-off points the run thread
//! shares (the decide slot and the run flag).

use crate::app::decide::{DecideLoader, DecideRegistry, DecideSlot};
use crate::app::teb::Teb;
use crate::config::db::{string_key, ConfigDb};
use crate::config::params::{
    drp_port, mrq_port, teb_port, EbParams, MAX_DRPS, MAX_TEBS, NUM_READOUT_GROUPS,
};
use crate::observability::stats::StatsMonitor;
use crate::runtime::signals::RunFlag;
use crate::transport::fabric::Fabric;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Document naming the decide library in the configuration database.
const TRIGGER_DOCUMENT: &str = "tmoteb";

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("collection transport failed: {0}")]
    Transport(String),
    #[error("collection bus closed")]
    Closed,
    #[error("malformed collection message: {0}")]
    BadMessage(String),
}

/// Message bus to the orchestrator. Implementations deliver inbound JSON
/// messages and carry replies back.
pub trait CollectionTransport: Send {
    /// Next inbound message, or None when the timeout expires.
    fn recv(&mut self, tmo_ms: u64) -> Result<Option<Value>, CollectionError>;
    fn send(&mut self, msg: &Value) -> Result<(), CollectionError>;
}

/// Long-polling HTTP rendition of the orchestration bus.
pub struct HttpCollectionTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    role: String,
    id: u64,
}

impl HttpCollectionTransport {
    pub fn new(endpoint: impl Into<String>, role: &str, id: u64) -> Result<Self, CollectionError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(CollectionError::Transport(
                "collection endpoint must not be empty".into(),
            ));
        }
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|err| CollectionError::Transport(format!("http client build failed: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            role: role.to_string(),
            id,
        })
    }

    fn poll_url(&self, tmo_ms: u64) -> String {
        format!(
            "{}/poll/{}/{}?tmo={}",
            self.endpoint.trim_end_matches('/'),
            self.role,
            self.id,
            tmo_ms
        )
    }

    fn push_url(&self) -> String {
        format!("{}/push", self.endpoint.trim_end_matches('/'))
    }
}

impl CollectionTransport for HttpCollectionTransport {
    fn recv(&mut self, tmo_ms: u64) -> Result<Option<Value>, CollectionError> {
        let response = self
            .client
            .get(self.poll_url(tmo_ms))
            .timeout(Duration::from_millis(tmo_ms + 1000))
            .send()
            .map_err(|err| CollectionError::Transport(format!("poll rpc failed: {err}")))?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CollectionError::Transport(format!(
                "poll rpc returned status {}",
                response.status()
            )));
        }
        response
            .json()
            .map(Some)
            .map_err(|err| CollectionError::Transport(format!("poll decode failed: {err}")))
    }

    fn send(&mut self, msg: &Value) -> Result<(), CollectionError> {
        let response = self
            .client
            .post(self.push_url())
            .json(msg)
            .send()
            .map_err(|err| CollectionError::Transport(format!("push rpc failed: {err}")))?;
        if !response.status().is_success() {
            return Err(CollectionError::Transport(format!(
                "push rpc returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

struct LoopbackShared {
    inbox: Mutex<VecDeque<Value>>,
    cv: Condvar,
    replies: Mutex<Vec<Value>>,
    closed: AtomicBool,
}

/// In-process bus used by tests and standalone bring-up.
pub struct LoopbackBus {
    shared: Arc<LoopbackShared>,
}

/// Control handle for the loopback bus.
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<LoopbackShared>,
}

impl LoopbackBus {
    pub fn new() -> (Self, LoopbackHandle) {
        let shared = Arc::new(LoopbackShared {
            inbox: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            replies: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (
            Self {
                shared: shared.clone(),
            },
            LoopbackHandle { shared },
        )
    }
}

impl LoopbackHandle {
    pub fn push(&self, msg: Value) {
        self.shared.inbox.lock().unwrap().push_back(msg);
        self.shared.cv.notify_one();
    }

    pub fn replies(&self) -> Vec<Value> {
        self.shared.replies.lock().unwrap().clone()
    }

    /// Blocks until at least `count` replies have arrived.
    pub fn wait_replies(&self, count: usize, tmo_ms: u64) -> Vec<Value> {
        let deadline = Instant::now() + Duration::from_millis(tmo_ms);
        loop {
            let replies = self.replies();
            if replies.len() >= count || Instant::now() >= deadline {
                return replies;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.cv.notify_all();
    }
}

impl CollectionTransport for LoopbackBus {
    fn recv(&mut self, tmo_ms: u64) -> Result<Option<Value>, CollectionError> {
        let deadline = Instant::now() + Duration::from_millis(tmo_ms);
        let mut inbox = self.shared.inbox.lock().unwrap();
        loop {
            if let Some(msg) = inbox.pop_front() {
                return Ok(Some(msg));
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(CollectionError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (next, _) = self.shared.cv.wait_timeout(inbox, deadline - now).unwrap();
            inbox = next;
        }
    }

    fn send(&mut self, msg: &Value) -> Result<(), CollectionError> {
        self.shared.replies.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

/// Builds a bus message in the shared header/body schema.
pub fn create_msg(key: &str, msg_id: Value, sender_id: u64, body: Value) -> Value {
    json!({
        "header": {
            "key": key,
            "msg_id": msg_id,
            "sender_id": sender_id,
        },
        "body": body,
    })
}

/// The coordinator-side application: dispatches bus messages, owns the
/// run thread, and stages decide objects for it.
pub struct TebApp {
    transport: Box<dyn CollectionTransport>,
    fabric: Fabric,
    smon: StatsMonitor,
    configdb: Box<dyn ConfigDb>,
    loader: DecideLoader,
    decide_slot: DecideSlot,
    running: RunFlag,
    teb: Arc<Mutex<Teb>>,
    app_thread: Option<JoinHandle<()>>,
    prms: EbParams,
    id: u64,
}

impl TebApp {
    pub fn new(
        transport: Box<dyn CollectionTransport>,
        fabric: Fabric,
        smon: StatsMonitor,
        registry: Arc<DecideRegistry>,
        configdb: Box<dyn ConfigDb>,
        prms: EbParams,
    ) -> Result<Self, CollectionError> {
        let running = RunFlag::new();
        let decide_slot = DecideSlot::new();
        let teb = Teb::new(&prms, &smon, decide_slot.clone(), running.clone())
            .map_err(|err| CollectionError::Transport(err.to_string()))?;
        Ok(Self {
            transport,
            fabric,
            smon,
            configdb,
            loader: DecideLoader::new(registry),
            decide_slot,
            running,
            teb: Arc::new(Mutex::new(teb)),
            app_thread: None,
            id: std::process::id() as u64,
            prms,
        })
    }

    /// Flag cleared by SIGINT and `disconnect`.
    pub fn running(&self) -> RunFlag {
        self.running.clone()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Decide create/destroy counters of the open library, for
    /// diagnostics.
    pub fn loader(&self) -> &DecideLoader {
        &self.loader
    }

    fn nic_ip(&self) -> String {
        if self.prms.if_addr.is_empty() {
            "127.0.0.1".to_string()
        } else {
            self.prms.if_addr.clone()
        }
    }

    /// Dispatch loop; returns once the bus closes.
    pub fn run(&mut self) -> Result<(), CollectionError> {
        loop {
            let msg = match self.transport.recv(1000) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(CollectionError::Closed) => break,
                Err(err) => return Err(err),
            };
            self.dispatch(msg)?;
        }
        // A closed bus means the orchestrator is gone; stop the run
        // thread the same way a disconnect would.
        self.stop_run_thread();
        Ok(())
    }

    fn dispatch(&mut self, msg: Value) -> Result<(), CollectionError> {
        let key = msg["header"]["key"]
            .as_str()
            .ok_or_else(|| CollectionError::BadMessage("missing header.key".into()))?
            .to_string();
        match key.as_str() {
            "plat" => self.handle_plat(&msg),
            "alloc" => self.handle_alloc(&msg),
            "connect" => self.handle_connect(&msg),
            "configure" => self.handle_phase1(&msg),
            "disconnect" => self.handle_disconnect(&msg),
            "reset" => {
                self.handle_reset();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn reply(&mut self, key: &str, msg: &Value, body: Value) -> Result<(), CollectionError> {
        let msg_id = msg["header"]["msg_id"].clone();
        let reply = create_msg(key, msg_id, self.id, body);
        self.transport.send(&reply)
    }

    fn handle_plat(&mut self, msg: &Value) -> Result<(), CollectionError> {
        let body = json!({
            "role": "teb",
            "proc_info": {
                "alias": self.prms.alias,
                "pid": self.id,
            },
            "connect_info": {
                "nic_ip": self.nic_ip(),
            },
        });
        self.reply("plat", msg, body)
    }

    fn handle_alloc(&mut self, msg: &Value) -> Result<(), CollectionError> {
        // Topology arrives with connect; nothing to persist here.
        self.reply("alloc", msg, json!({}))
    }

    fn handle_connect(&mut self, msg: &Value) -> Result<(), CollectionError> {
        let rc = self.connect_inner(msg);
        let body = match rc {
            Ok(()) => json!({}),
            Err(err) => {
                eprintln!("TebApp: {err}");
                json!({"error": "Connect error"})
            }
        };
        self.reply("connect", msg, body)
    }

    fn connect_inner(&mut self, msg: &Value) -> Result<(), String> {
        parse_connection_params(&msg["body"], self.id, &mut self.prms)?;
        {
            let mut teb = self.teb.lock().unwrap();
            teb.connect(&self.fabric, &self.prms)
                .map_err(|err| format!("connect failed: {err}"))?;
        }
        self.smon.enable();
        self.running.set();

        let teb = self.teb.clone();
        let handle = std::thread::Builder::new()
            .name("teb_app".into())
            .spawn(move || teb.lock().unwrap().run())
            .map_err(|err| format!("app thread spawn failed: {err}"))?;
        self.app_thread = Some(handle);
        Ok(())
    }

    fn handle_phase1(&mut self, msg: &Value) -> Result<(), CollectionError> {
        let rc = self.configure_inner(msg);
        let body = match rc {
            Ok(()) => json!({}),
            Err(err) => {
                eprintln!("TebApp: {err}");
                json!({"error": "Phase 1 failed"})
            }
        };
        self.reply("configure", msg, body)
    }

    fn configure_inner(&mut self, msg: &Value) -> Result<(), String> {
        let document = self
            .configdb
            .fetch(TRIGGER_DOCUMENT)
            .map_err(|err| err.to_string())?;
        let soname = string_key(TRIGGER_DOCUMENT, &document, "soname")
            .map_err(|err| err.to_string())?;

        // The previous library stays open across unconfigure; it closes
        // here, just before the replacement opens.
        self.loader.open(&soname).map_err(|err| err.to_string())?;
        let mut handle = self.loader.create().map_err(|err| err.to_string())?;
        handle.configure_msg(msg).map_err(|err| err.to_string())?;

        // Any staged-but-unclaimed object is destroyed by the store.
        self.decide_slot.store(handle);
        Ok(())
    }

    fn stop_run_thread(&mut self) {
        self.running.clear();
        if let Some(handle) = self.app_thread.take() {
            let _ = handle.join();
        }
    }

    fn handle_disconnect(&mut self, msg: &Value) -> Result<(), CollectionError> {
        self.stop_run_thread();
        self.smon.disable();
        self.reply("disconnect", msg, json!({}))
    }

    fn handle_reset(&mut self) {
        self.stop_run_thread();
        self.smon.disable();
    }
}

/// Parses the connect topology into the parameter snapshot, applying the
/// port arithmetic and the contract/receiver validations.
pub fn parse_connection_params(
    body: &Value,
    sender_id: u64,
    prms: &mut EbParams,
) -> Result<(), String> {
    let id_key = sender_id.to_string();
    let teb_entry = &body["teb"][&id_key];
    let teb_id = teb_entry["teb_id"]
        .as_u64()
        .ok_or_else(|| format!("missing teb.{id_key}.teb_id in connect body"))?;
    if teb_id >= MAX_TEBS as u64 {
        return Err(format!(
            "TEB ID {teb_id} is out of range 0 - {}",
            MAX_TEBS - 1
        ));
    }
    prms.id = teb_id as u32;
    if let Some(nic) = teb_entry["connect_info"]["nic_ip"].as_str() {
        prms.if_addr = nic.to_string();
    }
    prms.eb_port = teb_port(prms.partition, prms.id);
    prms.mrq_port = mrq_port(prms.partition, prms.id);

    prms.contributors = 0;
    prms.addrs.clear();
    prms.ports.clear();

    let mut groups: u16 = 0;
    if let Some(drps) = body["drp"].as_object() {
        for (name, drp) in drps {
            let drp_id = drp["drp_id"]
                .as_u64()
                .ok_or_else(|| format!("missing drp_id for contributor {name}"))?;
            if drp_id >= MAX_DRPS as u64 {
                return Err(format!(
                    "DRP ID {drp_id} is out of range 0 - {}",
                    MAX_DRPS - 1
                ));
            }
            let address = drp["connect_info"]["nic_ip"]
                .as_str()
                .ok_or_else(|| format!("missing nic_ip for contributor {name}"))?;
            prms.contributors |= 1u64 << drp_id;
            prms.addrs.push(address.to_string());
            prms.ports.push(drp_port(prms.partition, drp_id as u32));

            let readout = drp["det_info"]["readout"]
                .as_u64()
                .ok_or_else(|| format!("missing readout group for contributor {name}"))?;
            if readout >= NUM_READOUT_GROUPS as u64 {
                return Err(format!("readout group {readout} is out of range"));
            }
            groups |= 1 << readout;
        }
    }
    if prms.addrs.is_empty() {
        return Err("Missing required DRP address(es)".to_string());
    }

    prms.contractors = [0; NUM_READOUT_GROUPS];
    prms.receivers = [0; NUM_READOUT_GROUPS];

    let mut remaining = groups;
    while remaining != 0 {
        let group = remaining.trailing_zeros() as usize;
        remaining &= remaining - 1;

        let contractors = prms.contributors;
        let receivers = prms.contributors;

        if contractors == 0 {
            return Err(format!(
                "No trigger input data contractors found for readout group {group}"
            ));
        }
        if receivers == 0 {
            return Err(format!(
                "No trigger result receivers found for readout group {group}"
            ));
        }
        if contractors & receivers != contractors {
            return Err(format!(
                "Readout group {group}'s receivers ({receivers:016x}) must contain its contractors ({contractors:016x})"
            ));
        }

        prms.contractors[group] = contractors;
        prms.receivers[group] = receivers;
    }

    prms.num_mrqs = body["meb"]
        .as_object()
        .map(|mebs| mebs.len() as u32)
        .unwrap_or(0);

    eprintln!("Parameters of TEB ID {}:", prms.id);
    eprintln!("  Thread core numbers:      {}, {}", prms.core[0], prms.core[1]);
    eprintln!("  Partition:                {}", prms.partition);
    eprintln!(
        "  Bit list of contributors: {:#018x}, cnt: {}",
        prms.contributors,
        prms.contributors.count_ones()
    );
    eprintln!("  Number of MEB requestors: {}", prms.num_mrqs);
    eprintln!("  Max result Dgram size:    {}", prms.max_result_size);

    Ok(())
}
