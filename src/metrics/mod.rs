use std::time::Instant;

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

static FRONT_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("shoal_front_connection", "open client connections"))
        .expect("front connections gauge registration must succeed")
});

static FRONT_CONNECTION_INCR: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "shoal_front_connection_incr",
        "client connections accepted since start"
    ))
    .expect("front connections counter registration must succeed")
});

static GLOBAL_ERROR: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!("shoal_global_error", "global error counter"))
        .expect("global error counter registration must succeed")
});

static BACKEND_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("shoal_backend_error_total", "backend transport errors"),
        &["backend"]
    )
    .expect("backend error counter registration must succeed")
});

static OP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("shoal_op_total", "commands handled by opcode"),
        &["op"]
    )
    .expect("op counter registration must succeed")
});

static REMOTE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "shoal_remote_duration_seconds",
        "round trip time from dispatch to backend reply",
        &["op"]
    )
    .expect("remote histogram registration must succeed")
});

pub fn front_conn_open() {
    FRONT_CONNECTIONS.inc();
    FRONT_CONNECTION_INCR.inc();
}

pub fn front_conn_close() {
    FRONT_CONNECTIONS.dec();
}

pub fn global_error_incr() {
    GLOBAL_ERROR.inc();
}

pub fn backend_error_incr(backend: &str) {
    BACKEND_ERRORS.with_label_values(&[backend]).inc();
}

pub fn op_incr(op: &str) {
    OP_TOTAL.with_label_values(&[op]).inc();
}

pub fn remote_observe(op: &str, start: Instant) {
    REMOTE_SECONDS
        .with_label_values(&[op])
        .observe(start.elapsed().as_secs_f64());
}

/// Guard that keeps the connection gauges honest across every session
/// exit path.
pub struct FrontConnGuard;

impl FrontConnGuard {
    pub fn new() -> Self {
        front_conn_open();
        Self
    }
}

impl Default for FrontConnGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrontConnGuard {
    fn drop(&mut self) {
        front_conn_close();
    }
}
