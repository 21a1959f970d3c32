//! Prometheus metrics for the agent's own health
//!
//! These count what the agent did, not what the instrumented services did:
//! span data itself leaves through the export pipeline.

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Probe Attachment Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Kernel attachments created (one per link or socket).
    ///
    /// Labels:
    /// - kind: "uprobe", "kprobe" or "socket_filter"
    pub static ref PROBES_ATTACHED: IntCounterVec = register_int_counter_vec!(
        "autoprobe_probes_attached_total",
        "Kernel probe attachments created",
        &["kind"]
    ).expect("failed to register PROBES_ATTACHED metric");

    /// Probe definitions that failed to attach.
    pub static ref ATTACH_FAILURES: IntCounterVec = register_int_counter_vec!(
        "autoprobe_attach_failures_total",
        "Probe definitions that failed to attach",
        &["kind"]
    ).expect("failed to register ATTACH_FAILURES metric");

    pub static ref HANDLES_RELEASED: IntCounterVec = register_int_counter_vec!(
        "autoprobe_handles_released_total",
        "Kernel probe attachments released",
        &["kind"]
    ).expect("failed to register HANDLES_RELEASED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Span Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Inbound traceparent values that failed validation.
    ///
    /// Labels:
    /// - reason: which grammar rule was violated
    pub static ref TRACEPARENT_REJECTED: IntCounterVec = register_int_counter_vec!(
        "autoprobe_traceparent_rejected_total",
        "Inbound traceparent headers rejected by validation",
        &["reason"]
    ).expect("failed to register TRACEPARENT_REJECTED metric");

    /// Span trees handed to the export side, by request kind.
    pub static ref SPANS_ASSEMBLED: IntCounterVec = register_int_counter_vec!(
        "autoprobe_spans_assembled_total",
        "Span trees assembled for export",
        &["event_type"]
    ).expect("failed to register SPANS_ASSEMBLED metric");

    /// Requests that produced no span tree.
    ///
    /// Labels:
    /// - reason: "not_sampled", "incomplete" or "ordering_violation"
    pub static ref SPANS_DROPPED: IntCounterVec = register_int_counter_vec!(
        "autoprobe_spans_dropped_total",
        "Requests dropped instead of exported",
        &["reason"]
    ).expect("failed to register SPANS_DROPPED metric");
}
