//! eBPF probe attachment for autoprobe
//!
//! This module attaches the probes of a declarative catalog to a running,
//! unmodified target and owns the resulting kernel resources:
//!
//! - **User probes**: uprobes at function entry and at every return site
//! - **Kernel probes**: kprobes / kretprobes
//! - **Socket filters**: raw `AF_PACKET` sockets with a filter program
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Inputs (external)                                          │
//! │                                                             │
//! │  ProbeCatalog  ── which program goes on which function      │
//! │  OffsetTable   ── where each function starts / returns      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ProbeAttacher (one per target)                             │
//! │                                                             │
//! │  attach_user_probes()    → backend.attach_uprobe() × N      │
//! │  attach_kernel_probes()  → backend.attach_k(ret)probe()     │
//! │  attach_socket_filters() → backend.attach_socket_filter()   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HandleArena (shared with the process lifecycle manager)    │
//! │                                                             │
//! │  register()     ← every live link / socket                  │
//! │  release_all()  → idempotent, best-effort sweep             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Requirements
//!
//! - Linux kernel 5.8+ with CONFIG_BPF_SYSCALL=y
//! - CAP_BPF, CAP_PERFMON and CAP_NET_RAW capabilities (or root)
//! - Compiled with `--features ebpf` for the aya backend

pub mod attach;
pub mod handles;
#[cfg(feature = "ebpf")]
mod loader;
pub mod probes;
pub mod socket;

pub use attach::{AttachError, AttachPolicy, AttachReport, ProbeAttacher, ProbeBackend, ProbeTarget};
pub use handles::{AttachedProbe, Closer, HandleArena, ProbeInfo, ProbeSite, ReleaseError, ReleaseReport};
#[cfg(feature = "ebpf")]
pub use loader::AyaBackend;
pub use probes::{
    FunctionOffsets, FunctionPrograms, OffsetTable, ProbeCatalog, ProbeDefinition, ProbeKind, ProgramRef,
};
