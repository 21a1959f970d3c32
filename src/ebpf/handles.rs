//! Ownership of live kernel attachments
//!
//! Every link or socket the attacher creates is registered in a
//! [`HandleArena`]. The arena is the only owner: the process lifecycle
//! manager keeps a clone and sweeps it with [`HandleArena::release_all`]
//! when the target exits.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use super::probes::ProbeKind;
use crate::metrics::HANDLES_RELEASED;

/// A kernel resource that can be released.
pub trait Closer: Send {
    fn close(&mut self) -> Result<(), ReleaseError>;
}

/// Where a handle sits inside its probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSite {
    /// Function entry (uprobe at entry address or kprobe)
    Entry,
    /// One return site (uprobe at a return address or kretprobe)
    Return,
    /// Socket descriptor carrying a filter program
    Socket,
}

/// Error releasing a single handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseError {
    pub label: String,
    pub reason: String,
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "releasing {}: {}", self.label, self.reason)
    }
}

impl std::error::Error for ReleaseError {}

/// Read-only description of an attached handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub kind: ProbeKind,
    pub site: ProbeSite,
    /// Function name, or program name for socket filters
    pub label: String,
    pub address: Option<u64>,
}

/// One live attachment. Releasing it twice is a no-op.
pub struct AttachedProbe {
    info: ProbeInfo,
    closer: Option<Box<dyn Closer>>,
}

impl AttachedProbe {
    pub fn new(info: ProbeInfo, closer: Box<dyn Closer>) -> Self {
        Self {
            info,
            closer: Some(closer),
        }
    }

    pub fn info(&self) -> &ProbeInfo {
        &self.info
    }

    pub fn is_released(&self) -> bool {
        self.closer.is_none()
    }

    pub fn release(&mut self) -> Result<(), ReleaseError> {
        match self.closer.take() {
            Some(mut closer) => closer.close().map_err(|mut e| {
                if e.label.is_empty() {
                    e.label = self.info.label.clone();
                }
                e
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for AttachedProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedProbe")
            .field("info", &self.info)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Outcome of a release sweep
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub released: usize,
    pub failures: Vec<ReleaseError>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
struct ArenaState {
    handles: Vec<AttachedProbe>,
    /// Set by the first sweep; the arena accepts no handles afterwards
    released: bool,
}

/// Per-target arena of closable handles.
///
/// Clones share the same handles. Once [`HandleArena::release_all`] has run
/// the arena is closed: handles registered later (by an attach that was
/// still in flight during the sweep) are released on arrival.
#[derive(Clone, Default)]
pub struct HandleArena {
    state: Arc<Mutex<ArenaState>>,
}

impl HandleArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ArenaState> {
        // A panic while holding the lock cannot leave a handle half-released.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, probe: AttachedProbe) {
        self.register_all(std::iter::once(probe));
    }

    pub fn register_all(&self, probes: impl IntoIterator<Item = AttachedProbe>) {
        let late: Vec<AttachedProbe> = {
            let mut state = self.lock();
            if !state.released {
                state.handles.extend(probes);
                return;
            }
            probes.into_iter().collect()
        };

        debug!(handles = late.len(), "arena already released, closing late handles");
        release_batch(late);
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().handles.is_empty()
    }

    /// True once a release sweep has run
    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    pub fn snapshot(&self) -> Vec<ProbeInfo> {
        self.lock().handles.iter().map(|p| p.info.clone()).collect()
    }

    /// Release every registered handle and close the arena.
    ///
    /// The arena is drained and closed under one lock, so a handle from a
    /// concurrent attach is either part of this sweep or released when it
    /// is registered. A failed release is recorded and does not stop the
    /// sweep.
    pub fn release_all(&self) -> ReleaseReport {
        let drained: Vec<AttachedProbe> = {
            let mut state = self.lock();
            state.released = true;
            std::mem::take(&mut state.handles)
        };
        let report = release_batch(drained);

        debug!(
            released = report.released,
            failed = report.failures.len(),
            "released probe handles"
        );
        report
    }
}

fn release_batch(probes: Vec<AttachedProbe>) -> ReleaseReport {
    let mut report = ReleaseReport::default();
    for mut probe in probes {
        match probe.release() {
            Ok(()) => {
                report.released += 1;
                HANDLES_RELEASED
                    .with_label_values(&[probe.info.kind.as_str()])
                    .inc();
            }
            Err(e) => {
                warn!(probe = %probe.info.label, error = %e, "failed to release probe handle");
                report.failures.push(e);
            }
        }
    }
    report
}

impl fmt::Debug for HandleArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleArena").field("handles", &self.len()).finish()
    }
}

/// Releases a batch that was never registered, e.g. the handles of a probe
/// whose later attach step failed.
pub(crate) fn release_unregistered(probes: Vec<AttachedProbe>) {
    for mut probe in probes {
        if let Err(e) = probe.release() {
            warn!(probe = %probe.info.label, error = %e, "failed to roll back probe handle");
        }
    }
}
