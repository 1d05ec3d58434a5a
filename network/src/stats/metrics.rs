use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};
use std::sync::LazyLock;

fn try_create_int_counter(name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    prometheus::register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn try_create_int_counter_vec(
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    prometheus::register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn try_create_int_gauge(name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    prometheus::register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

pub(crate) static MESSAGES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "sdn_network_messages_received_total",
        "Messages observed on joined substrate topics.",
    )
    .unwrap()
});

pub(crate) static MESSAGES_DELIVERED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "sdn_network_messages_delivered_total",
        "Messages handed to the subscription engine.",
    )
    .unwrap()
});

pub(crate) static MESSAGES_FORWARDED: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "sdn_network_messages_forwarded_total",
        "Messages re-published with a decremented TTL.",
    )
    .unwrap()
});

pub(crate) static MESSAGES_DROPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    try_create_int_counter_vec(
        "sdn_network_messages_dropped_total",
        "Messages dropped before delivery, by reason.",
        &["reason"],
    )
    .unwrap()
});

pub(crate) static ACTIVE_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    try_create_int_gauge(
        "sdn_network_active_streaming_sessions",
        "Currently active streaming sessions.",
    )
    .unwrap()
});

pub(crate) static SESSION_BYTES_SENT: LazyLock<IntCounter> = LazyLock::new(|| {
    try_create_int_counter(
        "sdn_network_session_bytes_sent_total",
        "Bytes sent to streaming subscribers.",
    )
    .unwrap()
});
