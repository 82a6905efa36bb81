use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, TextEncoder, opts, register_histogram, register_int_counter,
};

pub static MESSAGES_ENQUEUED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_messages_enqueued_total",
        "Total number of messages accepted into the queue"
    ))
    .unwrap()
});

pub static MESSAGES_DUPLICATE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_messages_duplicate_total",
        "Total number of enqueues suppressed by client-id deduplication"
    ))
    .unwrap()
});

pub static DELIVERIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_deliveries_total",
        "Total number of delivery records pushed successfully"
    ))
    .unwrap()
});

pub static DELIVERY_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_delivery_failures_total",
        "Total number of failed delivery attempts"
    ))
    .unwrap()
});

pub static RECORDS_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_records_dropped_total",
        "Total number of delivery records that reached DROPPED"
    ))
    .unwrap()
});

pub static RATE_LIMITED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_rate_limited_total",
        "Total number of submissions rejected by the rate limiter"
    ))
    .unwrap()
});

pub static REROUTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_reroutes_total",
        "Total number of messages admitted through a failover region"
    ))
    .unwrap()
});

pub static SYNC_PAGES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_sync_pages_total",
        "Total number of sync pages served"
    ))
    .unwrap()
});

pub static DELIVERY_ATTEMPT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "courier_delivery_attempt_seconds",
        "Histogram of delivery attempt durations"
    )
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
