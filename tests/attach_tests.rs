//! Integration tests for probe attachment
//!
//! The kernel side is replaced by a recording backend so these run
//! unprivileged.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use autoprobe::ebpf::{
    AttachError, AttachPolicy, Closer, FunctionPrograms, HandleArena, OffsetTable, ProbeAttacher, ProbeBackend,
    ProbeCatalog, ProbeKind, ProbeSite, ProbeTarget, ProgramRef, ReleaseError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Uprobe {
        program: String,
        target: PathBuf,
        pid: Option<i32>,
        address: u64,
    },
    Kprobe(String),
    Kretprobe(String),
    Socket(String),
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Call>>,
    closed: Mutex<Vec<String>>,
}

impl Recorder {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

struct FakeHandle {
    name: String,
    recorder: Arc<Recorder>,
}

impl Closer for FakeHandle {
    fn close(&mut self) -> Result<(), ReleaseError> {
        self.recorder.closed.lock().unwrap().push(self.name.clone());
        Ok(())
    }
}

/// Backend that succeeds unless a uprobe address, kernel function or socket
/// program is listed as failing.
#[derive(Default)]
struct FakeBackend {
    recorder: Arc<Recorder>,
    failing_addresses: HashSet<u64>,
    failing_functions: HashSet<String>,
    failing_programs: HashSet<String>,
}

impl FakeBackend {
    fn handle(&self, name: String) -> Box<dyn Closer> {
        Box::new(FakeHandle {
            name,
            recorder: Arc::clone(&self.recorder),
        })
    }
}

impl ProbeBackend for FakeBackend {
    fn attach_uprobe(
        &mut self,
        program: &ProgramRef,
        target: &Path,
        pid: Option<i32>,
        address: u64,
    ) -> Result<Box<dyn Closer>, AttachError> {
        self.recorder.calls.lock().unwrap().push(Call::Uprobe {
            program: program.name().to_string(),
            target: target.to_path_buf(),
            pid,
            address,
        });
        if self.failing_addresses.contains(&address) {
            return Err(AttachError::AttachFailure {
                probe: program.name().to_string(),
                reason: "EINVAL".into(),
            });
        }
        Ok(self.handle(format!("{}@{:#x}", program, address)))
    }

    fn attach_kprobe(&mut self, program: &ProgramRef, function: &str) -> Result<Box<dyn Closer>, AttachError> {
        self.recorder
            .calls
            .lock()
            .unwrap()
            .push(Call::Kprobe(function.to_string()));
        if self.failing_functions.contains(function) {
            return Err(AttachError::AttachFailure {
                probe: program.name().to_string(),
                reason: "ENOENT".into(),
            });
        }
        Ok(self.handle(format!("kprobe:{}", function)))
    }

    fn attach_kretprobe(&mut self, program: &ProgramRef, function: &str) -> Result<Box<dyn Closer>, AttachError> {
        self.recorder
            .calls
            .lock()
            .unwrap()
            .push(Call::Kretprobe(function.to_string()));
        if self.failing_functions.contains(function) {
            return Err(AttachError::AttachFailure {
                probe: program.name().to_string(),
                reason: "ENOENT".into(),
            });
        }
        Ok(self.handle(format!("kretprobe:{}", function)))
    }

    fn attach_socket_filter(&mut self, program: &ProgramRef) -> Result<Box<dyn Closer>, AttachError> {
        self.recorder
            .calls
            .lock()
            .unwrap()
            .push(Call::Socket(program.name().to_string()));
        if self.failing_programs.contains(program.name()) {
            return Err(AttachError::SocketFailure {
                program: program.name().to_string(),
                reason: "EPERM".into(),
            });
        }
        Ok(self.handle(format!("socket:{}", program)))
    }
}

fn attacher(backend: FakeBackend) -> (ProbeAttacher<FakeBackend>, HandleArena) {
    let arena = HandleArena::new();
    let target = ProbeTarget::new("/usr/local/bin/app", Some(4242));
    (ProbeAttacher::new(backend, target, arena.clone()), arena)
}

fn handler_catalog() -> ProbeCatalog {
    let mut catalog = ProbeCatalog::default();
    catalog
        .user
        .insert("main.handler".into(), FunctionPrograms::start_end("uprobe_start", "uprobe_end"));
    catalog
}

/// One start uprobe plus one end uprobe per return address, never a uretprobe
#[test]
fn test_user_probe_attaches_at_every_return() {
    let backend = FakeBackend::default();
    let recorder = Arc::clone(&backend.recorder);
    let (mut attacher, arena) = attacher(backend);

    let mut offsets = OffsetTable::default();
    offsets.insert("main.handler", 0x1000, vec![0x1040, 0x1080]);

    let report = attacher.attach_user_probes(&handler_catalog(), &offsets);
    assert_eq!(report.attached, 3);
    assert!(report.is_complete());

    let calls = recorder.calls();
    assert_eq!(
        calls,
        vec![
            Call::Uprobe {
                program: "uprobe_start".into(),
                target: PathBuf::from("/usr/local/bin/app"),
                pid: Some(4242),
                address: 0x1000
            },
            Call::Uprobe {
                program: "uprobe_end".into(),
                target: PathBuf::from("/usr/local/bin/app"),
                pid: Some(4242),
                address: 0x1040
            },
            Call::Uprobe {
                program: "uprobe_end".into(),
                target: PathBuf::from("/usr/local/bin/app"),
                pid: Some(4242),
                address: 0x1080
            },
        ]
    );

    let snapshot = arena.snapshot();
    let starts = snapshot.iter().filter(|p| p.site == ProbeSite::Entry).count();
    let ends: Vec<_> = snapshot
        .iter()
        .filter(|p| p.site == ProbeSite::Return)
        .map(|p| p.address)
        .collect();
    assert_eq!(starts, 1);
    assert_eq!(ends, vec![Some(0x1040), Some(0x1080)]);
    assert!(snapshot.iter().all(|p| p.kind == ProbeKind::UserFunction));
}

#[test]
fn test_absent_function_is_skipped_silently() {
    let backend = FakeBackend::default();
    let recorder = Arc::clone(&backend.recorder);
    let (mut attacher, arena) = attacher(backend);

    let report = attacher.attach_user_probes(&handler_catalog(), &OffsetTable::default());
    assert_eq!(report.attached, 0);
    assert_eq!(report.skipped, 1);
    assert!(report.errors.is_empty());
    assert_eq!(report.attempted(), 0);
    assert!(recorder.calls().is_empty());
    assert!(arena.is_empty());
}

#[test]
fn test_no_return_addresses_attaches_start_only() {
    let backend = FakeBackend::default();
    let (mut attacher, arena) = attacher(backend);

    let mut offsets = OffsetTable::default();
    offsets.insert("main.handler", 0x1000, vec![]);

    let report = attacher.attach_user_probes(&handler_catalog(), &offsets);
    assert_eq!(report.attached, 1);
    assert_eq!(report.skipped, 1);
    assert!(report.is_complete());
    assert_eq!(arena.snapshot()[0].site, ProbeSite::Entry);
}

#[test]
fn test_failed_return_site_rolls_back_function() {
    let mut backend = FakeBackend::default();
    backend.failing_addresses.insert(0x1080);
    let recorder = Arc::clone(&backend.recorder);
    let (mut attacher, arena) = attacher(backend);

    let mut catalog = handler_catalog();
    catalog.user.insert("main.other".into(), FunctionPrograms::start("uprobe_start"));

    let mut offsets = OffsetTable::default();
    offsets.insert("main.handler", 0x1000, vec![0x1040, 0x1080]);
    offsets.insert("main.other", 0x2000, vec![]);

    let report = attacher.attach_user_probes(&catalog, &offsets);
    assert_eq!(report.attached, 1);
    assert_eq!(
        report.errors,
        vec![AttachError::AttachFailure {
            probe: "main.handler".into(),
            reason: "EINVAL".into()
        }]
    );

    // the handler's entry and first return were undone, main.other survives
    assert_eq!(recorder.closed(), vec!["uprobe_start@0x1000", "uprobe_end@0x1040"]);
    let snapshot = arena.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].label, "main.other");
}

#[test]
fn test_missing_kernel_function_does_not_stop_batch() {
    let mut backend = FakeBackend::default();
    backend.failing_functions.insert("does_not_exist".into());
    let (mut attacher, arena) = attacher(backend);

    let mut catalog = ProbeCatalog::default();
    catalog
        .kernel
        .insert("does_not_exist".into(), FunctionPrograms::start("kprobe_x"));
    catalog
        .kernel
        .insert("tcp_connect".into(), FunctionPrograms::start_end("kprobe_connect", "kretprobe_connect"));

    let report = attacher.attach_kernel_probes(&catalog);
    assert_eq!(report.attached, 2);
    assert_eq!(report.attempted(), 2);
    assert_eq!(report.errors.len(), 1);
    match &report.errors[0] {
        AttachError::AttachFailure { probe, .. } => assert_eq!(probe, "does_not_exist"),
        other => panic!("expected attach failure, got {:?}", other),
    }

    let sites: Vec<_> = arena.snapshot().into_iter().map(|p| (p.label, p.site)).collect();
    assert_eq!(
        sites,
        vec![
            ("tcp_connect".to_string(), ProbeSite::Entry),
            ("tcp_connect".to_string(), ProbeSite::Return),
        ]
    );
}

#[test]
fn test_kretprobe_only_definition() {
    let backend = FakeBackend::default();
    let recorder = Arc::clone(&backend.recorder);
    let (mut attacher, _arena) = attacher(backend);

    let mut catalog = ProbeCatalog::default();
    catalog
        .kernel
        .insert("sys_accept4".into(), FunctionPrograms::end("kretprobe_accept4"));

    let report = attacher.attach_kernel_probes(&catalog);
    assert_eq!(report.attached, 1);
    assert_eq!(recorder.calls(), vec![Call::Kretprobe("sys_accept4".into())]);
}

#[test]
fn test_socket_filter_failure_is_isolated() {
    let mut backend = FakeBackend::default();
    backend.failing_programs.insert("filter_a".into());
    let (mut attacher, arena) = attacher(backend);

    let mut catalog = ProbeCatalog::default();
    catalog.socket_filters.push(ProgramRef::new("filter_a"));
    catalog.socket_filters.push(ProgramRef::new("filter_b"));

    let report = attacher.attach_socket_filters(&catalog);
    assert_eq!(report.attached, 1);
    assert!(matches!(
        report.errors.as_slice(),
        [AttachError::SocketFailure { program, .. }] if program == "filter_a"
    ));

    let snapshot = arena.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].label, "filter_b");
    assert_eq!(snapshot[0].kind, ProbeKind::SocketFilter);
}

#[test]
fn test_attach_all_and_policies() {
    let mut backend = FakeBackend::default();
    backend.failing_programs.insert("filter_a".into());
    let (mut attacher, _arena) = attacher(backend);

    let mut catalog = handler_catalog();
    catalog
        .kernel
        .insert("tcp_connect".into(), FunctionPrograms::start("kprobe_connect"));
    catalog.socket_filters.push(ProgramRef::new("filter_a"));

    let mut offsets = OffsetTable::default();
    offsets.insert("main.handler", 0x1000, vec![0x1040]);

    let report = attacher.attach_all(&catalog, &offsets);
    assert_eq!(report.attached, 3);
    assert_eq!(report.attempted(), 3);
    assert_eq!(report.errors.len(), 1);

    assert!(report.clone().into_result(AttachPolicy::BestEffort).is_ok());
    assert!(report.clone().into_result(AttachPolicy::RequireAny).is_ok());
    assert!(matches!(
        report.into_result(AttachPolicy::Strict),
        Err(AttachError::Aggregate(errors)) if errors.len() == 1
    ));
}

#[test]
fn test_release_all_is_idempotent() {
    let backend = FakeBackend::default();
    let recorder = Arc::clone(&backend.recorder);
    let (mut attacher, arena) = attacher(backend);

    let mut offsets = OffsetTable::default();
    offsets.insert("main.handler", 0x1000, vec![0x1040, 0x1080]);
    attacher.attach_user_probes(&handler_catalog(), &offsets);

    let lifecycle = arena.clone();
    let first = lifecycle.release_all();
    assert_eq!(first.released, 3);
    assert!(first.is_clean());

    let second = attacher.release_all();
    assert_eq!(second.released, 0);
    assert!(second.is_clean());
    assert_eq!(recorder.closed().len(), 3);
    assert!(arena.is_empty());
}

/// Blocks inside the first uprobe attach until released by the test.
struct GatedBackend {
    inner: FakeBackend,
    entered: mpsc::Sender<()>,
    proceed: mpsc::Receiver<()>,
    gated: bool,
}

impl ProbeBackend for GatedBackend {
    fn attach_uprobe(
        &mut self,
        program: &ProgramRef,
        target: &Path,
        pid: Option<i32>,
        address: u64,
    ) -> Result<Box<dyn Closer>, AttachError> {
        if !self.gated {
            self.gated = true;
            self.entered.send(()).unwrap();
            self.proceed.recv().unwrap();
        }
        self.inner.attach_uprobe(program, target, pid, address)
    }

    fn attach_kprobe(&mut self, program: &ProgramRef, function: &str) -> Result<Box<dyn Closer>, AttachError> {
        self.inner.attach_kprobe(program, function)
    }

    fn attach_kretprobe(&mut self, program: &ProgramRef, function: &str) -> Result<Box<dyn Closer>, AttachError> {
        self.inner.attach_kretprobe(program, function)
    }

    fn attach_socket_filter(&mut self, program: &ProgramRef) -> Result<Box<dyn Closer>, AttachError> {
        self.inner.attach_socket_filter(program)
    }
}

/// Handles created by an attach that overlaps a release sweep must not
/// outlive the sweep.
#[test]
fn test_release_during_inflight_attach_leaves_nothing_live() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    let inner = FakeBackend::default();
    let recorder = Arc::clone(&inner.recorder);
    let backend = GatedBackend {
        inner,
        entered: entered_tx,
        proceed: proceed_rx,
        gated: false,
    };

    let arena = HandleArena::new();
    let lifecycle = arena.clone();
    let mut attacher = ProbeAttacher::new(backend, ProbeTarget::new("/usr/local/bin/app", None), arena.clone());

    let mut offsets = OffsetTable::default();
    offsets.insert("main.handler", 0x1000, vec![0x1040, 0x1080]);
    let catalog = handler_catalog();

    let attach = thread::spawn(move || attacher.attach_user_probes(&catalog, &offsets));

    entered_rx.recv().unwrap();
    let sweep = lifecycle.release_all();
    assert_eq!(sweep.released, 0);
    proceed_tx.send(()).unwrap();

    let report = attach.join().unwrap();
    assert_eq!(report.attached, 3);

    assert!(arena.is_released());
    assert!(arena.is_empty());
    assert_eq!(recorder.closed().len(), 3, "every handle created after the sweep is closed");
}
