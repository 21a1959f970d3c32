//! Declarative probe catalog and offset table
//!
//! Both inputs come from outside the agent: the catalog names which compiled
//! eBPF programs belong to which function, and the offset table (produced by
//! binary analysis of the target executable) says where those functions live.
//!
//! ```text
//! ProbeCatalog                      OffsetTable
//! ─────────────────────────         ───────────────────────────────
//! user:   "net/http.serverHandler"  "net/http.serverHandler"
//!           start: uprobe_start       start:   0x4a1f20
//!           end:   uprobe_end         returns: [0x4a2001, 0x4a20c7]
//! kernel: "sys_accept4"
//!           end:   kretprobe_accept
//! socket_filters: [socket_http]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Opaque reference to a compiled program inside the loaded eBPF object.
///
/// The agent never inspects program bytes; it only asks the backend to
/// attach or detach the program with this name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramRef(String);

impl ProgramRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgramRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Start and end programs for one instrumented function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionPrograms {
    #[serde(default)]
    pub start: Option<ProgramRef>,
    #[serde(default)]
    pub end: Option<ProgramRef>,
}

impl FunctionPrograms {
    pub fn start(program: impl Into<String>) -> Self {
        Self {
            start: Some(ProgramRef::new(program)),
            end: None,
        }
    }

    pub fn start_end(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(ProgramRef::new(start)),
            end: Some(ProgramRef::new(end)),
        }
    }

    pub fn end(program: impl Into<String>) -> Self {
        Self {
            start: None,
            end: Some(ProgramRef::new(program)),
        }
    }
}

/// What a probe hooks into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    /// Function inside a user-space executable (uprobe)
    UserFunction,
    /// Kernel function (kprobe / kretprobe)
    KernelFunction,
    /// Classic raw packet socket filter
    SocketFilter,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::UserFunction => "uprobe",
            ProbeKind::KernelFunction => "kprobe",
            ProbeKind::SocketFilter => "socket_filter",
        }
    }
}

/// A single logical instrumentation point borrowed from a [`ProbeCatalog`].
#[derive(Debug, Clone, Copy)]
pub enum ProbeDefinition<'a> {
    UserProbe {
        function: &'a str,
        programs: &'a FunctionPrograms,
    },
    KernelProbe {
        function: &'a str,
        programs: &'a FunctionPrograms,
    },
    SocketFilter {
        program: &'a ProgramRef,
    },
}

impl ProbeDefinition<'_> {
    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbeDefinition::UserProbe { .. } => ProbeKind::UserFunction,
            ProbeDefinition::KernelProbe { .. } => ProbeKind::KernelFunction,
            ProbeDefinition::SocketFilter { .. } => ProbeKind::SocketFilter,
        }
    }

    /// Function name, or program name for socket filters
    pub fn label(&self) -> &str {
        match self {
            ProbeDefinition::UserProbe { function, .. } => function,
            ProbeDefinition::KernelProbe { function, .. } => function,
            ProbeDefinition::SocketFilter { program } => program.name(),
        }
    }
}

/// The full set of probes an instrumenter wants attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCatalog {
    /// User-space function name -> programs
    #[serde(default)]
    pub user: BTreeMap<String, FunctionPrograms>,
    /// Kernel function name -> programs
    #[serde(default)]
    pub kernel: BTreeMap<String, FunctionPrograms>,
    #[serde(default)]
    pub socket_filters: Vec<ProgramRef>,
}

impl ProbeCatalog {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }

    pub fn user_definitions(&self) -> impl Iterator<Item = ProbeDefinition<'_>> {
        self.user
            .iter()
            .map(|(function, programs)| ProbeDefinition::UserProbe { function, programs })
    }

    pub fn kernel_definitions(&self) -> impl Iterator<Item = ProbeDefinition<'_>> {
        self.kernel
            .iter()
            .map(|(function, programs)| ProbeDefinition::KernelProbe { function, programs })
    }

    pub fn socket_filter_definitions(&self) -> impl Iterator<Item = ProbeDefinition<'_>> {
        self.socket_filters
            .iter()
            .map(|program| ProbeDefinition::SocketFilter { program })
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.kernel.is_empty() && self.socket_filters.is_empty()
    }
}

/// Entry and return addresses of one function in the target executable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionOffsets {
    pub start: u64,
    /// Every address at which the function may return. Order is preserved.
    #[serde(default)]
    pub returns: Vec<u64>,
}

/// Function name -> offsets for one executable.
///
/// A missing key means the binary does not contain that function and it is
/// simply not instrumented.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetTable {
    #[serde(default)]
    pub funcs: BTreeMap<String, FunctionOffsets>,
}

impl OffsetTable {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }

    pub fn get(&self, function: &str) -> Option<&FunctionOffsets> {
        self.funcs.get(function)
    }

    pub fn insert(&mut self, function: impl Into<String>, start: u64, returns: Vec<u64>) {
        self.funcs
            .insert(function.into(), FunctionOffsets { start, returns });
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
