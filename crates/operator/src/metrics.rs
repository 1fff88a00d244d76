use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref RECONCILE_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "trainjob_reconcile_total",
        "Reconcile passes by result.",
        &["result"],
        REGISTRY
    )
    .unwrap();

    pub static ref RECONCILE_DURATION_SECONDS: HistogramVec = register_histogram_vec_with_registry!(
        "trainjob_reconcile_duration_seconds",
        "Wall time of a reconcile pass.",
        &["result"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        REGISTRY
    )
    .unwrap();

    pub static ref POD_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "trainjob_pod_operations_total",
        "Pod create and delete calls issued by the controller.",
        &["operation"],
        REGISTRY
    )
    .unwrap();

    pub static ref STATUS_CONFLICTS_TOTAL: IntCounter = register_int_counter_with_registry!(
        "trainjob_status_conflicts_total",
        "Status writes rejected because of a stale resource version.",
        REGISTRY
    )
    .unwrap();

    pub static ref GC_DELETIONS_TOTAL: IntCounter = register_int_counter_with_registry!(
        "trainjob_gc_pod_deletions_total",
        "Pods removed by the garbage collector.",
        REGISTRY
    )
    .unwrap();

    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge_with_registry!(
        "trainjob_work_queue_depth",
        "Job keys waiting to be reconciled.",
        REGISTRY
    )
    .unwrap();
}

pub fn record_reconcile(result: &str, seconds: f64) {
    RECONCILE_TOTAL.with_label_values(&[result]).inc();
    RECONCILE_DURATION_SECONDS
        .with_label_values(&[result])
        .observe(seconds);
}

pub fn record_pod_operation(operation: &str) {
    POD_OPERATIONS_TOTAL.with_label_values(&[operation]).inc();
}

// Text exposition of everything in REGISTRY.
pub fn gather_metrics() -> crate::Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::Error::Internal(format!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::Error::Internal(format!("metrics are not UTF-8: {}", e)))
}
