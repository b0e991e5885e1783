//! Run-time metrics: counters registered once at construction and
//! published periodically to the monitoring sink.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How a published value is derived from its counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Delta per second since the previous publication.
    Rate,
    /// Raw counter value.
    Scalar,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Rate => "rate",
            MetricKind::Scalar => "scalar",
        }
    }
}

include!(concat!(env!("OUT_DIR"), "/teb_metrics.rs"));

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("metrics publish failed: {0}")]
    Publish(String),
}

/// One published value.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub name: &'static str,
    pub kind: &'static str,
    pub value: f64,
}

/// Point-in-time view of every registered metric.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub samples: Vec<MetricSample>,
}

/// Destination for periodic snapshots.
pub trait StatsSink: Send {
    fn publish(&mut self, snapshot: &MetricsSnapshot) -> Result<(), StatsError>;
}

/// Pushes snapshots to the run-time monitoring server as JSON.
pub struct HttpStatsSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpStatsSink {
    pub fn new(host: &str, port: u16) -> Result<Self, StatsError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|err| StatsError::Publish(format!("http client build failed: {err}")))?;
        Ok(Self {
            client,
            url: format!("http://{host}:{port}/metrics"),
        })
    }
}

impl StatsSink for HttpStatsSink {
    fn publish(&mut self, snapshot: &MetricsSnapshot) -> Result<(), StatsError> {
        let response = self
            .client
            .post(&self.url)
            .json(snapshot)
            .send()
            .map_err(|err| StatsError::Publish(format!("metrics rpc failed: {err}")))?;
        if !response.status().is_success() {
            return Err(StatsError::Publish(format!(
                "metrics rpc returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Sink that retains snapshots in memory for assertions.
#[derive(Clone, Default)]
pub struct CaptureSink {
    published: Arc<Mutex<Vec<MetricsSnapshot>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<MetricsSnapshot> {
        self.published.lock().unwrap().clone()
    }
}

impl StatsSink for CaptureSink {
    fn publish(&mut self, snapshot: &MetricsSnapshot) -> Result<(), StatsError> {
        self.published.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

struct Metric {
    name: &'static str,
    kind: MetricKind,
    handle: Arc<AtomicU64>,
    last_value: u64,
    last_at: Instant,
}

struct MonitorState {
    metrics: Vec<Metric>,
    sink: Box<dyn StatsSink>,
    publisher: Option<JoinHandle<()>>,
}

struct MonitorInner {
    state: Mutex<MonitorState>,
    enabled: AtomicBool,
    stopping: AtomicBool,
    period: Duration,
}

/// Registry and periodic publisher for the counters the trigger builder
/// exports. Disabled between runs; `enable` gates publication only, never
/// registration.
#[derive(Clone)]
pub struct StatsMonitor {
    inner: Arc<MonitorInner>,
}

impl StatsMonitor {
    pub fn new(period_s: u64, sink: Box<dyn StatsSink>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                state: Mutex::new(MonitorState {
                    metrics: Vec::new(),
                    sink,
                    publisher: None,
                }),
                enabled: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                period: Duration::from_secs(period_s.max(1)),
            }),
        }
    }

    /// Registers a counter under a name from the metric registry.
    pub fn metric(&self, name: &'static str, kind: MetricKind, handle: Arc<AtomicU64>) {
        let mut state = self.inner.state.lock().unwrap();
        state.metrics.push(Metric {
            name,
            kind,
            handle,
            last_value: 0,
            last_at: Instant::now(),
        });
    }

    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Samples every metric, folding rate counters against their previous
    /// publication.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.state.lock().unwrap();
        let now = Instant::now();
        let samples = state
            .metrics
            .iter_mut()
            .map(|metric| {
                let value = metric.handle.load(Ordering::Relaxed);
                let sample = match metric.kind {
                    MetricKind::Scalar => value as f64,
                    MetricKind::Rate => {
                        let dt = now.duration_since(metric.last_at).as_secs_f64();
                        if dt > 0.0 {
                            value.saturating_sub(metric.last_value) as f64 / dt
                        } else {
                            0.0
                        }
                    }
                };
                metric.last_value = value;
                metric.last_at = now;
                MetricSample {
                    name: metric.name,
                    kind: metric.kind.as_str(),
                    value: sample,
                }
            })
            .collect();
        MetricsSnapshot { samples }
    }

    /// Prometheus-style exposition of the current snapshot.
    pub fn render_metrics(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        for sample in &snapshot.samples {
            out.push_str(&format!(
                "{}{{kind=\"{}\"}} {}\n",
                sample.name, sample.kind, sample.value
            ));
        }
        out
    }

    /// Publishes one snapshot if enabled.
    pub fn publish(&self) -> Result<(), StatsError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let snapshot = self.snapshot();
        let mut state = self.inner.state.lock().unwrap();
        state.sink.publish(&snapshot)
    }

    /// Starts the periodic publisher thread.
    pub fn startup(&self) {
        let monitor = self.clone();
        let handle = std::thread::spawn(move || {
            while !monitor.inner.stopping.load(Ordering::Relaxed) {
                std::thread::sleep(monitor.inner.period);
                if let Err(err) = monitor.publish() {
                    eprintln!("StatsMonitor: {err}");
                }
            }
        });
        self.inner.state.lock().unwrap().publisher = Some(handle);
    }

    /// Stops and joins the publisher thread.
    pub fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::Relaxed);
        let handle = self.inner.state.lock().unwrap().publisher.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
