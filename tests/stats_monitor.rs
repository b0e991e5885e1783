use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use teb::{
    CaptureSink, MetricKind, StatsMonitor, StatsSink, TEB_METRICS,
};

#[test]
fn registry_carries_the_published_metric_set() {
    let names: Vec<&str> = TEB_METRICS.iter().map(|(name, _)| *name).collect();
    assert_eq!(
        names,
        vec![
            "TEB_EvtRt", "TEB_EvtCt", "TEB_BatCt", "TEB_BtAlCt", "TEB_BtFrCt", "TEB_BtWtg",
            "TEB_EpAlCt", "TEB_EpFrCt", "TEB_EvAlCt", "TEB_EvFrCt", "TEB_TxPdg", "TEB_RxPdg",
        ]
    );
    let rates: Vec<&str> = TEB_METRICS
        .iter()
        .filter(|(_, kind)| *kind == MetricKind::Rate)
        .map(|(name, _)| *name)
        .collect();
    assert_eq!(rates, vec!["TEB_EvtRt"]);
}

#[test]
fn snapshots_reflect_registered_counters() {
    let smon = StatsMonitor::new(1, Box::new(CaptureSink::new()));
    let events = Arc::new(AtomicU64::new(0));
    smon.metric("TEB_EvtCt", MetricKind::Scalar, events.clone());

    events.store(41, Ordering::Relaxed);
    let snapshot = smon.snapshot();
    assert_eq!(snapshot.samples.len(), 1);
    assert_eq!(snapshot.samples[0].name, "TEB_EvtCt");
    assert_eq!(snapshot.samples[0].kind, "scalar");
    assert_eq!(snapshot.samples[0].value, 41.0);
}

#[test]
fn publish_is_gated_by_enable() {
    let sink = CaptureSink::new();
    let smon = StatsMonitor::new(1, Box::new(sink.clone()));
    let counter = Arc::new(AtomicU64::new(7));
    smon.metric("TEB_BatCt", MetricKind::Scalar, counter);

    smon.publish().expect("disabled publish is a no-op");
    assert!(sink.snapshots().is_empty());

    smon.enable();
    smon.publish().expect("publish");
    let published = sink.snapshots();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].samples[0].value, 7.0);

    smon.disable();
    smon.publish().expect("disabled again");
    assert_eq!(sink.snapshots().len(), 1);
}

#[test]
fn rate_metrics_report_deltas_not_totals() {
    let smon = StatsMonitor::new(1, Box::new(CaptureSink::new()));
    let events = Arc::new(AtomicU64::new(0));
    smon.metric("TEB_EvtRt", MetricKind::Rate, events.clone());

    // Baseline sample pins the delta origin.
    let _ = smon.snapshot();
    events.store(1_000, Ordering::Relaxed);
    std::thread::sleep(std::time::Duration::from_millis(50));
    let snapshot = smon.snapshot();
    let rate = snapshot.samples[0].value;
    assert!(rate > 0.0, "rate should be positive, got {rate}");
    assert!(
        rate <= 1_000.0 / 0.05 * 1.5,
        "rate should reflect the elapsed window, got {rate}"
    );

    // No further increments: the next delta is zero.
    std::thread::sleep(std::time::Duration::from_millis(20));
    let snapshot = smon.snapshot();
    assert_eq!(snapshot.samples[0].value, 0.0);
}

#[test]
fn render_metrics_emits_one_line_per_counter() {
    let smon = StatsMonitor::new(1, Box::new(CaptureSink::new()));
    let a = Arc::new(AtomicU64::new(3));
    let b = Arc::new(AtomicU64::new(9));
    smon.metric("TEB_EvtCt", MetricKind::Scalar, a);
    smon.metric("TEB_BatCt", MetricKind::Scalar, b);

    let rendered = smon.render_metrics();
    assert!(rendered.contains("TEB_EvtCt{kind=\"scalar\"} 3"));
    assert!(rendered.contains("TEB_BatCt{kind=\"scalar\"} 9"));
}

#[test]
fn failing_sink_surfaces_the_error() {
    struct FailingSink;
    impl StatsSink for FailingSink {
        fn publish(
            &mut self,
            _snapshot: &teb::MetricsSnapshot,
        ) -> Result<(), teb::StatsError> {
            Err(teb::StatsError::Publish("sink offline".into()))
        }
    }

    let smon = StatsMonitor::new(1, Box::new(FailingSink));
    smon.enable();
    let err = smon.publish().expect_err("sink failure");
    assert!(err.to_string().contains("sink offline"));
}
