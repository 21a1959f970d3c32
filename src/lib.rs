//! autoprobe - eBPF auto-instrumentation agent
//!
//! This library attaches eBPF probes to already-running, unmodified
//! binaries and turns the events they emit into W3C-compatible trace spans.
//!
//! # Modules
//!
//! - `ebpf` - Probe catalog, attachment (uprobes, kprobes, socket filters) and handle ownership
//! - `trace` - Trace-context codec, span timing, span assembly and the span pipeline
//! - `config` - Agent configuration
//! - `metrics` - Prometheus metrics for the agent itself
//! - `telemetry` - Logging and self-tracing setup
//!
//! # Quick Start
//!
//! ```ignore
//! use autoprobe::ebpf::{HandleArena, ProbeAttacher, ProbeTarget};
//!
//! let arena = HandleArena::new();
//! let mut attacher = ProbeAttacher::new(backend, ProbeTarget::new(exe, Some(pid)), arena.clone());
//! let report = attacher.attach_all(&catalog, &offsets);
//!
//! let assembler = SpanAssembler::default();
//! if let Some(tree) = assembler.assemble(&span)? {
//!     export(tree);
//! }
//! ```

pub mod config;
pub mod ebpf;
pub mod metrics;
pub mod telemetry;
pub mod trace;

// Re-export commonly used types at crate root for convenience
pub use config::{AgentConfig, ConfigError};
pub use ebpf::{AttachPolicy, HandleArena, ProbeAttacher, ProbeCatalog, OffsetTable};
pub use trace::{SpanAssembler, SpanTree, TraceContext};
