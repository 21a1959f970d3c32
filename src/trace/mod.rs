//! Span timing, trace-context propagation and span assembly
//!
//! ## Architecture
//!
//! ```text
//! RawRequestEvent (ring buffer bytes)
//!      │ Span::from_raw
//!      ▼
//! Span { request_start, start, end: monotonic ns, traceparent }
//!      │
//!      ├─► context::resolve(traceparent) ─► Propagated / NotSampled / Synthesized
//!      ├─► SpanTimer::timings()          ─► calendar times
//!      ▼
//! SpanAssembler ─► SpanTree { parent, "in queue", "processing" }
//!      │
//!      ▼
//! export pipeline (external)
//! ```

pub mod assembler;
pub mod context;
pub mod event;
pub mod pipeline;
pub mod span;
pub mod timing;

pub use assembler::{AssemblyError, SpanAssembler, SpanTree, TraceSpan, PROCESSING_SPAN_NAME, QUEUE_SPAN_NAME};
pub use context::{resolve, Propagation, SpanId, TraceContext, TraceId, TraceparentError};
pub use event::{EventError, RawRequestEvent};
pub use pipeline::{run_span_pipeline, PipelineStats};
pub use span::{EventType, ServiceId, Span};
pub use timing::{Clocks, Interval, SpanTimer, SystemClocks, Timings};
