//! Trigger decision policy: a late-bound object created at configure time
//! from a registry of factories keyed by the configured library name. The
//! open library survives unconfigure and is closed only when the next
//! configure names a different one.

use crate::dgram::{Damage, Dgram, MON_IDX, RESULT_EXTENT, WRT_IDX};
use serde_json::Value;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecideError {
    #[error("no decide library registered under '{0}'")]
    UnknownLibrary(String),
    #[error("no decide library is open")]
    NotOpen,
    #[error("decide configure rejected the document: {0}")]
    ConfigureRejected(String),
}

/// Decision policy over completed events. `event` runs once per
/// contribution; result words are absent on the no-response path.
pub trait Decide: Send {
    /// Called with the configure datagram on each Configure transition.
    fn configure(&mut self, dg: &Dgram) -> Damage {
        let _ = dg;
        Damage::none()
    }

    /// Called with the phase-1 document at load time.
    fn configure_msg(&mut self, msg: &Value) -> Result<(), DecideError> {
        let _ = msg;
        Ok(())
    }

    fn event(&mut self, ctrb: &Dgram, result: Option<&mut [u32; RESULT_EXTENT]>) -> Damage;
}

/// Entry point pair a decide library exports.
pub trait DecideFactory: Send + Sync {
    fn create(&self) -> Box<dyn Decide>;
}

impl<F> DecideFactory for F
where
    F: Fn() -> Box<dyn Decide> + Send + Sync,
{
    fn create(&self) -> Box<dyn Decide> {
        self()
    }
}

/// Create/destroy accounting for one open library.
#[derive(Debug, Default)]
pub struct LibCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl LibCounters {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }
}

/// Live decide object; destruction is recorded against the library that
/// created it, even if the library has since been closed.
pub struct DecideHandle {
    inner: Box<dyn Decide>,
    counters: Arc<LibCounters>,
}

impl Deref for DecideHandle {
    type Target = dyn Decide;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for DecideHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for DecideHandle {
    fn drop(&mut self) {
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Registry of loadable decision libraries, keyed by library name.
#[derive(Default)]
pub struct DecideRegistry {
    factories: Mutex<HashMap<String, Arc<dyn DecideFactory>>>,
}

impl DecideRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the standard timing trigger.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self::new();
        registry.register(STANDARD_SONAME, Arc::new(|| {
            Box::new(StandardDecide::default()) as Box<dyn Decide>
        }));
        Arc::new(registry)
    }

    pub fn register(&self, soname: &str, factory: Arc<dyn DecideFactory>) {
        self.factories
            .lock()
            .unwrap()
            .insert(soname.to_string(), factory);
    }

    fn lookup(&self, soname: &str) -> Option<Arc<dyn DecideFactory>> {
        self.factories.lock().unwrap().get(soname).cloned()
    }
}

struct OpenLib {
    soname: String,
    factory: Arc<dyn DecideFactory>,
    counters: Arc<LibCounters>,
}

/// Loads decide libraries from the registry, holding the open library
/// across unconfigure and closing it only on the next open.
pub struct DecideLoader {
    registry: Arc<DecideRegistry>,
    open: Option<OpenLib>,
}

impl DecideLoader {
    pub fn new(registry: Arc<DecideRegistry>) -> Self {
        Self {
            registry,
            open: None,
        }
    }

    /// Opens `soname`, closing any previously open library first. Opening
    /// the library already open keeps its counters.
    pub fn open(&mut self, soname: &str) -> Result<(), DecideError> {
        if let Some(open) = &self.open {
            if open.soname == soname {
                return Ok(());
            }
        }
        let factory = self
            .registry
            .lookup(soname)
            .ok_or_else(|| DecideError::UnknownLibrary(soname.to_string()))?;
        self.open = Some(OpenLib {
            soname: soname.to_string(),
            factory,
            counters: Arc::new(LibCounters::default()),
        });
        Ok(())
    }

    /// Creates a decide object from the open library.
    pub fn create(&self) -> Result<DecideHandle, DecideError> {
        let open = self.open.as_ref().ok_or(DecideError::NotOpen)?;
        open.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(DecideHandle {
            inner: open.factory.create(),
            counters: open.counters.clone(),
        })
    }

    pub fn soname(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.soname.as_str())
    }

    pub fn counters(&self) -> Option<Arc<LibCounters>> {
        self.open.as_ref().map(|o| o.counters.clone())
    }
}

/// Cross-thread hand-off slot: the coordinator stores freshly configured
/// decide objects, the run thread takes them on Configure transitions.
/// Non-configure event calls use the run thread's cached object only.
#[derive(Clone, Default)]
pub struct DecideSlot {
    inner: Arc<Mutex<Option<DecideHandle>>>,
}

impl DecideSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new object, dropping (and thereby destroying) any
    /// object that was never picked up.
    pub fn store(&self, handle: DecideHandle) {
        *self.inner.lock().unwrap() = Some(handle);
    }

    pub fn take(&self) -> Option<DecideHandle> {
        self.inner.lock().unwrap().take()
    }
}

/// Library name of the built-in timing trigger.
pub const STANDARD_SONAME: &str = "libtmo_teb.so";

/// Standard timing trigger: ORs each contribution's two input words into
/// the result, so any contributor can request write-through or a monitor
/// token.
#[derive(Default)]
pub struct StandardDecide;

impl Decide for StandardDecide {
    fn event(&mut self, ctrb: &Dgram, result: Option<&mut [u32; RESULT_EXTENT]>) -> Damage {
        if let Some(result) = result {
            let words = ctrb.payload_words();
            if words.len() >= RESULT_EXTENT {
                result[WRT_IDX] |= words[WRT_IDX];
                result[MON_IDX] |= words[MON_IDX];
            }
        }
        Damage::none()
    }
}
