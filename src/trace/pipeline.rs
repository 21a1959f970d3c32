//! Async span pipeline
//!
//! Sits between the event transport and the export side:
//!
//! ```text
//! ring buffer ──► Span ──► [mpsc] ──► run_span_pipeline ──► [mpsc] ──► exporter
//!                                        SpanAssembler
//! ```
//!
//! Requests arrive in any order; each one carries all of its own timestamps
//! so no cross-request state is kept.

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::assembler::{SpanAssembler, SpanTree};
use super::span::Span;

/// Counters for one pipeline run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub assembled: u64,
    pub not_sampled: u64,
    pub dropped: u64,
}

/// Assemble every span from `rx` and forward the trees to `tx`.
///
/// Returns when the input channel closes or the export side hangs up.
pub async fn run_span_pipeline(
    mut rx: mpsc::Receiver<Span>,
    tx: mpsc::Sender<SpanTree>,
    assembler: SpanAssembler,
) -> PipelineStats {
    let mut stats = PipelineStats::default();

    while let Some(span) = rx.recv().await {
        match assembler.assemble(&span) {
            Ok(Some(tree)) => {
                stats.assembled += 1;
                if tx.send(tree).await.is_err() {
                    debug!("span export channel closed, stopping pipeline");
                    break;
                }
            }
            Ok(None) => stats.not_sampled += 1,
            // already logged and counted by the assembler
            Err(_) => stats.dropped += 1,
        }
    }

    info!(
        assembled = stats.assembled,
        not_sampled = stats.not_sampled,
        dropped = stats.dropped,
        "span pipeline stopped"
    );
    stats
}
