//! In-process fabric: named listeners, registered memory regions, and
//! completion queues with immediate data. Remote writes copy into the
//! peer's registered region and deliver the immediate through the peer's
//! receive completion queue, consuming one receive credit.

use crossbeam_queue::ArrayQueue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Spin budget before a full completion queue fails a post.
pub const POST_RETRY_BUDGET: usize = 1024;

/// Completion-queue depth per server or client.
pub const CQ_DEPTH: usize = 65_536;

/// Errors surfaced by the fabric and the link layer above it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer is not connected")]
    NotConnected,
    #[error("operation timed out after {0} ms")]
    Timeout(u64),
    #[error("completion queue full after retry budget")]
    QueueFull,
    #[error("no listener bound at {0}")]
    NoListener(String),
    #[error("address {0} is already bound")]
    AlreadyBound(String),
    #[error("memory registration refused: {0}")]
    RegionRefused(String),
    #[error("peer descriptor exchange incomplete")]
    Handshake,
    #[error("write of {extent} bytes at offset {offset} exceeds region of {size} bytes")]
    OutOfRegion {
        offset: usize,
        extent: usize,
        size: usize,
    },
}

/// Entry delivered on a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub data: u64,
}

/// Lock-free receive completion queue shared by the links of one peer.
#[derive(Clone)]
pub struct CompletionQueue {
    queue: Arc<ArrayQueue<CqEntry>>,
}

impl CompletionQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(depth)),
        }
    }

    pub fn push(&self, entry: CqEntry) -> Result<(), TransportError> {
        self.queue.push(entry).map_err(|_| TransportError::QueueFull)
    }

    pub fn try_pop(&self) -> Option<CqEntry> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Registered memory region. Single local writer; remote peers write
/// through `write` during post and never read back.
#[derive(Clone)]
pub struct Region {
    inner: Arc<RegionInner>,
}

struct RegionInner {
    bytes: Mutex<Box<[u8]>>,
}

impl Region {
    /// Registers a region of the given size. Zero-size registration is
    /// refused, mirroring a fabric MR failure.
    pub fn new(size: usize) -> Result<Self, TransportError> {
        if size == 0 {
            return Err(TransportError::RegionRefused("zero-length region".into()));
        }
        Ok(Self {
            inner: Arc::new(RegionInner {
                bytes: Mutex::new(vec![0u8; size].into_boxed_slice()),
            }),
        })
    }

    /// Synthetic base address used for logging remote targets.
    pub fn base(&self) -> u64 {
        Arc::as_ptr(&self.inner) as u64
    }

    pub fn size(&self) -> usize {
        self.inner.bytes.lock().unwrap().len()
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), TransportError> {
        let mut bytes = self.inner.bytes.lock().unwrap();
        let size = bytes.len();
        if offset + data.len() > size {
            return Err(TransportError::OutOfRegion {
                offset,
                extent: data.len(),
                size,
            });
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let bytes = self.inner.bytes.lock().unwrap();
        if offset >= bytes.len() {
            return Vec::new();
        }
        let end = (offset + len).min(bytes.len());
        bytes[offset..end].to_vec()
    }
}

/// Pender-side half published during the descriptor exchange: where posts
/// land, which queue signals them, and the credits gating them.
#[derive(Clone)]
pub struct PenderInfo {
    pub id: u32,
    pub region: Region,
    pub credits: Arc<ArrayQueue<()>>,
    pub cq: CompletionQueue,
}

/// Poster-side half of the descriptor exchange.
#[derive(Clone, Copy)]
pub struct PosterInfo {
    pub id: u32,
}

struct ConnState {
    pender: Option<PenderInfo>,
    poster: Option<PosterInfo>,
}

/// One accepted connection; both link endpoints share it.
pub struct Conn {
    state: Mutex<ConnState>,
    cv: Condvar,
    connected: AtomicBool,
}

impl Conn {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnState {
                pender: None,
                poster: None,
            }),
            cv: Condvar::new(),
            connected: AtomicBool::new(true),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn publish_pender(&self, info: PenderInfo) {
        let mut state = self.state.lock().unwrap();
        state.pender = Some(info);
        self.cv.notify_all();
    }

    pub fn publish_poster(&self, info: PosterInfo) {
        let mut state = self.state.lock().unwrap();
        state.poster = Some(info);
        self.cv.notify_all();
    }

    pub fn wait_pender(&self, tmo_ms: u64) -> Result<PenderInfo, TransportError> {
        let deadline = Instant::now() + Duration::from_millis(tmo_ms);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(info) = state.pender.clone() {
                return Ok(info);
            }
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(tmo_ms));
            }
            let (next, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    pub fn wait_poster(&self, tmo_ms: u64) -> Result<PosterInfo, TransportError> {
        let deadline = Instant::now() + Duration::from_millis(tmo_ms);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(info) = state.poster {
                return Ok(info);
            }
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(tmo_ms));
            }
            let (next, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }
}

struct ListenerInner {
    pending: Mutex<VecDeque<Arc<Conn>>>,
    cv: Condvar,
    closed: AtomicBool,
}

/// Accept side of a bound address.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn accept(&self, tmo_ms: u64) -> Result<Arc<Conn>, TransportError> {
        let deadline = Instant::now() + Duration::from_millis(tmo_ms);
        let mut pending = self.inner.pending.lock().unwrap();
        loop {
            if let Some(conn) = pending.pop_front() {
                return Ok(conn);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(TransportError::NotConnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(tmo_ms));
            }
            let (next, _) = self.inner.cv.wait_timeout(pending, deadline - now).unwrap();
            pending = next;
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.cv.notify_all();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Process-local fabric. Binds listeners by `addr:port` and brokers
/// connections between peers running in the same process.
#[derive(Clone, Default)]
pub struct Fabric {
    listeners: Arc<Mutex<HashMap<String, Arc<ListenerInner>>>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(addr: &str, port: u16) -> String {
        format!("{addr}:{port}")
    }

    pub fn listen(&self, addr: &str, port: u16) -> Result<Listener, TransportError> {
        let key = Self::key(addr, port);
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(existing) = listeners.get(&key) {
            if !existing.closed.load(Ordering::Acquire) {
                return Err(TransportError::AlreadyBound(key));
            }
        }
        let inner = Arc::new(ListenerInner {
            pending: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        listeners.insert(key, inner.clone());
        Ok(Listener { inner })
    }

    /// Connects to a bound address, waiting up to the timeout for the
    /// listener to appear.
    pub fn connect(&self, addr: &str, port: u16, tmo_ms: u64) -> Result<Arc<Conn>, TransportError> {
        let key = Self::key(addr, port);
        let deadline = Instant::now() + Duration::from_millis(tmo_ms);
        loop {
            let listener = {
                let listeners = self.listeners.lock().unwrap();
                listeners.get(&key).cloned()
            };
            if let Some(listener) = listener {
                if listener.closed.load(Ordering::Acquire) {
                    return Err(TransportError::NotConnected);
                }
                let conn = Conn::new();
                let mut pending = listener.pending.lock().unwrap();
                pending.push_back(conn.clone());
                listener.cv.notify_one();
                return Ok(conn);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::NoListener(key));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
