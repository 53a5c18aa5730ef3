//! Logging and Prometheus wiring for a node, plus gauges sampled from its
//! shared transaction state.

use std::net::SocketAddr;

use meridian_txn::distrib_cache::CacheStats;
use meridian_txn::{RedoStats, SharedState};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "info,meridian_txn=debug";

/// `RUST_LOG` wins over `directives`, which win over [`DEFAULT_LOG_FILTER`].
fn env_filter(directives: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives.unwrap_or(DEFAULT_LOG_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber. Returns false when one was already set,
/// which leaves the existing one in place.
pub fn init_tracing(directives: Option<&str>) -> bool {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(env_filter(directives))
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

/// Serve `/metrics` on `addr` from a background exporter thread.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics exporter listening on {}", addr);
    Ok(())
}

/// Sample node-wide gauges from the shared state.
pub fn record_node_metrics(shared: &SharedState) {
    metrics::gauge!("meridian_proc_array_members").set(shared.proc_array.member_count() as f64);
    metrics::gauge!("meridian_prepared_transactions").set(shared.twophase.list().len() as f64);
    metrics::gauge!("meridian_shared_snapshot_slots").set(shared.snapshots.num_slots() as f64);
    metrics::gauge!("meridian_known_assigned_xids").set(shared.known_assigned.len() as f64);
    metrics::gauge!("meridian_next_xid").set(f64::from(shared.xids.next_xid().0));
    metrics::gauge!("meridian_xlog_flushed_lsn").set(shared.xlog.flushed_lsn().0 as f64);
    metrics::gauge!("meridian_node_needs_restart").set(if shared.needs_restart() { 1.0 } else { 0.0 });
}

/// Publish a backend's distributed-xid cache counters, labeled by `context`.
pub fn record_distrib_cache_stats(context: &str, stats: CacheStats) {
    let ctx = context.to_string();
    metrics::gauge!("meridian_distrib_cache_adds", "context" => ctx.clone()).set(stats.adds as f64);
    metrics::gauge!("meridian_distrib_cache_evictions", "context" => ctx.clone())
        .set(stats.evictions as f64);
    let lookups = stats.hits + stats.misses;
    let ratio = if lookups == 0 {
        0.0
    } else {
        stats.hits as f64 / lookups as f64
    };
    metrics::gauge!("meridian_distrib_cache_hit_ratio", "context" => ctx).set(ratio);
}

/// Summarize a finished recovery run.
pub fn record_redo_stats(stats: &RedoStats) {
    metrics::gauge!("meridian_redo_last_records").set(stats.records as f64);
    metrics::gauge!("meridian_redo_last_commits").set(stats.commits as f64);
    metrics::gauge!("meridian_redo_last_aborts").set(stats.aborts as f64);
    metrics::gauge!("meridian_redo_last_prepares").set(stats.prepares as f64);
    metrics::gauge!("meridian_redo_end_lsn").set(stats.end_lsn.0 as f64);
}
