//! Probe attachment manager
//!
//! Turns a [`ProbeCatalog`] into live kernel attachments for one target and
//! registers every resulting handle in the target's [`HandleArena`].
//!
//! ## Return probes
//!
//! End programs are never attached as a single uretprobe. Runtimes that
//! manage their own stacks (Go grows and moves goroutine stacks) break when
//! the kernel rewrites the return address on the stack, so one plain uprobe
//! is attached at every return address from the offset table instead:
//!
//! ```text
//! func handler:  0x4a1f20 ◄── uprobe(start)
//!                ...
//!                0x4a2001 ret ◄── uprobe(end)
//!                ...
//!                0x4a20c7 ret ◄── uprobe(end)
//! ```
//!
//! Kernel functions don't have that problem and use kprobe/kretprobe.
//!
//! Attachment is best-effort: one failing probe is reported and the rest of
//! the batch carries on.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::handles::{release_unregistered, AttachedProbe, Closer, HandleArena, ProbeInfo, ProbeSite, ReleaseReport};
use super::probes::{FunctionPrograms, OffsetTable, ProbeCatalog, ProbeDefinition, ProbeKind, ProgramRef};
use crate::metrics::{ATTACH_FAILURES, PROBES_ATTACHED};

/// Error type for attach operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// The program is not part of the loaded eBPF object
    ProgramNotFound(String),
    /// The kernel rejected a uprobe/kprobe attach
    AttachFailure { probe: String, reason: String },
    /// Opening the raw socket or attaching the filter to it failed
    SocketFailure { program: String, reason: String },
    /// Several failures from one batch
    Aggregate(Vec<AttachError>),
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::ProgramNotFound(name) => write!(f, "program {} not found", name),
            AttachError::AttachFailure { probe, reason } => {
                write!(f, "attaching probe {}: {}", probe, reason)
            }
            AttachError::SocketFailure { program, reason } => {
                write!(f, "attaching socket filter {}: {}", program, reason)
            }
            AttachError::Aggregate(errors) => {
                write!(f, "{} probes failed to attach", errors.len())?;
                for e in errors {
                    write!(f, "; {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for AttachError {}

/// The kernel side of attachment.
///
/// Each call attaches one program at one site and hands back an owned
/// handle that detaches it when closed.
pub trait ProbeBackend {
    fn attach_uprobe(
        &mut self,
        program: &ProgramRef,
        target: &Path,
        pid: Option<i32>,
        address: u64,
    ) -> Result<Box<dyn Closer>, AttachError>;

    fn attach_kprobe(
        &mut self,
        program: &ProgramRef,
        function: &str,
    ) -> Result<Box<dyn Closer>, AttachError>;

    fn attach_kretprobe(
        &mut self,
        program: &ProgramRef,
        function: &str,
    ) -> Result<Box<dyn Closer>, AttachError>;

    fn attach_socket_filter(&mut self, program: &ProgramRef) -> Result<Box<dyn Closer>, AttachError>;
}

/// How a caller turns a partially successful batch into a result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPolicy {
    /// Always succeed; failures are only reported
    #[default]
    BestEffort,
    /// Fail only when every attempted probe failed
    RequireAny,
    /// Fail on any error
    Strict,
}

/// Outcome of an attach batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttachReport {
    /// Handles registered in the arena
    pub attached: usize,
    /// Probes not attempted because the function is absent from the target
    /// or has no return sites
    pub skipped: usize,
    /// Probes that were attempted and failed (one entry per probe)
    pub errors: Vec<AttachError>,
    attempted: usize,
}

impl AttachReport {
    pub fn merge(&mut self, other: AttachReport) {
        self.attached += other.attached;
        self.skipped += other.skipped;
        self.attempted += other.attempted;
        self.errors.extend(other.errors);
    }

    /// Number of probes whose attachment was attempted
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self, policy: AttachPolicy) -> Result<AttachReport, AttachError> {
        let all_failed = self.attempted > 0 && self.errors.len() == self.attempted;
        let fail = match policy {
            AttachPolicy::BestEffort => false,
            AttachPolicy::RequireAny => all_failed,
            AttachPolicy::Strict => !self.errors.is_empty(),
        };
        if fail {
            Err(AttachError::Aggregate(self.errors))
        } else {
            Ok(self)
        }
    }
}

/// The process or executable probes are attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Executable that user probes are attached to
    pub executable: PathBuf,
    /// Restrict user probes to this process (None = every process running it)
    pub pid: Option<i32>,
}

impl ProbeTarget {
    pub fn new(executable: impl Into<PathBuf>, pid: Option<i32>) -> Self {
        Self {
            executable: executable.into(),
            pid,
        }
    }
}

/// Attaches probes for one target and owns them through its arena.
///
/// # Example
///
/// ```ignore
/// let arena = HandleArena::new();
/// let mut attacher = ProbeAttacher::new(backend, ProbeTarget::new("/usr/bin/app", Some(pid)), arena.clone());
/// let report = attacher.attach_all(&catalog, &offsets);
///
/// // on process exit
/// arena.release_all();
/// ```
pub struct ProbeAttacher<B: ProbeBackend> {
    backend: B,
    target: ProbeTarget,
    arena: HandleArena,
}

impl<B: ProbeBackend> ProbeAttacher<B> {
    pub fn new(backend: B, target: ProbeTarget, arena: HandleArena) -> Self {
        Self {
            backend,
            target,
            arena,
        }
    }

    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    pub fn arena(&self) -> &HandleArena {
        &self.arena
    }

    /// Attach every user-space probe whose function exists in `offsets`.
    pub fn attach_user_probes(&mut self, catalog: &ProbeCatalog, offsets: &OffsetTable) -> AttachReport {
        let mut report = AttachReport::default();
        for def in catalog.user_definitions() {
            self.attach(def, Some(offsets), &mut report);
        }
        report
    }

    pub fn attach_kernel_probes(&mut self, catalog: &ProbeCatalog) -> AttachReport {
        let mut report = AttachReport::default();
        for def in catalog.kernel_definitions() {
            self.attach(def, None, &mut report);
        }
        report
    }

    pub fn attach_socket_filters(&mut self, catalog: &ProbeCatalog) -> AttachReport {
        let mut report = AttachReport::default();
        for def in catalog.socket_filter_definitions() {
            self.attach(def, None, &mut report);
        }
        report
    }

    /// User probes, then kernel probes, then socket filters.
    pub fn attach_all(&mut self, catalog: &ProbeCatalog, offsets: &OffsetTable) -> AttachReport {
        let mut report = self.attach_user_probes(catalog, offsets);
        report.merge(self.attach_kernel_probes(catalog));
        report.merge(self.attach_socket_filters(catalog));

        info!(
            executable = %self.target.executable.display(),
            attached = report.attached,
            skipped = report.skipped,
            failed = report.errors.len(),
            "probe attachment finished"
        );
        report
    }

    pub fn release_all(&self) -> ReleaseReport {
        self.arena.release_all()
    }

    fn attach(&mut self, def: ProbeDefinition<'_>, offsets: Option<&OffsetTable>, report: &mut AttachReport) {
        let kind = def.kind();
        let result = match def {
            ProbeDefinition::UserProbe { function, programs } => {
                let Some(offs) = offsets.and_then(|o| o.get(function)) else {
                    debug!(function, "function not present in target, not instrumenting");
                    report.skipped += 1;
                    return;
                };
                debug!(function, start = offs.start, returns = ?offs.returns, "instrumenting function");
                self.user_probe(function, programs, offs.start, &offs.returns, report)
            }
            ProbeDefinition::KernelProbe { function, programs } => {
                debug!(function, "adding kprobe");
                self.kernel_probe(function, programs)
            }
            ProbeDefinition::SocketFilter { program } => self.socket_filter(program),
        };

        match result {
            Ok(probes) if probes.is_empty() => {}
            Ok(probes) => {
                report.attempted += 1;
                report.attached += probes.len();
                PROBES_ATTACHED
                    .with_label_values(&[kind.as_str()])
                    .inc_by(probes.len() as u64);
                self.arena.register_all(probes);
            }
            Err(e) => {
                report.attempted += 1;
                warn!(probe = def.label(), kind = kind.as_str(), error = %e, "failed to attach probe");
                ATTACH_FAILURES.with_label_values(&[kind.as_str()]).inc();
                report.errors.push(e);
            }
        }
    }

    /// Start uprobe at the entry address, end uprobe at every return address.
    /// On failure the handles already created for this function are released.
    fn user_probe(
        &mut self,
        function: &str,
        programs: &FunctionPrograms,
        start: u64,
        returns: &[u64],
        report: &mut AttachReport,
    ) -> Result<Vec<AttachedProbe>, AttachError> {
        let mut sites: Vec<(&ProgramRef, ProbeSite, u64)> = Vec::with_capacity(1 + returns.len());
        if let Some(program) = &programs.start {
            sites.push((program, ProbeSite::Entry, start));
        }
        if let Some(program) = &programs.end {
            if returns.is_empty() {
                debug!(function, "no return addresses known, skipping end probe");
                report.skipped += 1;
            }
            sites.extend(returns.iter().map(|&ret| (program, ProbeSite::Return, ret)));
        }

        let mut attached = Vec::with_capacity(sites.len());
        for (program, site, address) in sites {
            let closer = match self.backend.attach_uprobe(
                program,
                &self.target.executable,
                self.target.pid,
                address,
            ) {
                Ok(closer) => closer,
                Err(e) => {
                    release_unregistered(attached);
                    return Err(probe_failure(function, e));
                }
            };
            attached.push(AttachedProbe::new(
                ProbeInfo {
                    kind: ProbeKind::UserFunction,
                    site,
                    label: function.to_string(),
                    address: Some(address),
                },
                closer,
            ));
        }
        Ok(attached)
    }

    fn kernel_probe(&mut self, function: &str, programs: &FunctionPrograms) -> Result<Vec<AttachedProbe>, AttachError> {
        let mut attached = Vec::with_capacity(2);

        if let Some(program) = &programs.start {
            let closer = self
                .backend
                .attach_kprobe(program, function)
                .map_err(|e| probe_failure(function, e))?;
            attached.push(kernel_handle(function, ProbeSite::Entry, closer));
        }

        if let Some(program) = &programs.end {
            match self.backend.attach_kretprobe(program, function) {
                Ok(closer) => attached.push(kernel_handle(function, ProbeSite::Return, closer)),
                Err(e) => {
                    release_unregistered(attached);
                    return Err(probe_failure(function, e));
                }
            }
        }

        Ok(attached)
    }

    fn socket_filter(&mut self, program: &ProgramRef) -> Result<Vec<AttachedProbe>, AttachError> {
        let closer = self.backend.attach_socket_filter(program)?;
        Ok(vec![AttachedProbe::new(
            ProbeInfo {
                kind: ProbeKind::SocketFilter,
                site: ProbeSite::Socket,
                label: program.name().to_string(),
                address: None,
            },
            closer,
        )])
    }
}

fn kernel_handle(function: &str, site: ProbeSite, closer: Box<dyn Closer>) -> AttachedProbe {
    AttachedProbe::new(
        ProbeInfo {
            kind: ProbeKind::KernelFunction,
            site,
            label: function.to_string(),
            address: None,
        },
        closer,
    )
}

/// Name the function in backend errors that only know the program.
fn probe_failure(function: &str, err: AttachError) -> AttachError {
    match err {
        AttachError::AttachFailure { reason, .. } => AttachError::AttachFailure {
            probe: function.to_string(),
            reason,
        },
        AttachError::ProgramNotFound(program) => AttachError::AttachFailure {
            probe: function.to_string(),
            reason: format!("program {} not found", program),
        },
        other => other,
    }
}
