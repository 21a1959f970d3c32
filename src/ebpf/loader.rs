//! aya-backed probe attachment
//!
//! Programs are looked up by name in an already loaded [`Bpf`] object, loaded
//! into the kernel on first use, and attached. Every link is taken out of the
//! program (`take_link`) so the returned handle owns it and detaches it when
//! closed or dropped. Socket filters are attached to a raw packet socket
//! opened by [`socket`], and the handle owns both the link and the socket.

use std::path::Path;

use aya::programs::links::Link;
use aya::programs::socket_filter::SocketFilterLink;
use aya::programs::{KProbe, ProgramError, SocketFilter, UProbe};
use aya::Bpf;
use tracing::debug;

use super::attach::{AttachError, ProbeBackend};
use super::handles::{Closer, ReleaseError};
use super::probes::ProgramRef;
use super::socket::{self, SocketFilterHandle};

/// Owns one aya link until it is closed.
struct LinkCloser<L: Link + Send> {
    label: String,
    link: Option<L>,
}

impl<L: Link + Send> Closer for LinkCloser<L> {
    fn close(&mut self) -> Result<(), ReleaseError> {
        match self.link.take() {
            Some(link) => link.detach().map_err(|e| ReleaseError {
                label: self.label.clone(),
                reason: e.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Attaches programs from a loaded eBPF object.
pub struct AyaBackend<'a> {
    bpf: &'a mut Bpf,
}

impl<'a> AyaBackend<'a> {
    pub fn new(bpf: &'a mut Bpf) -> Self {
        Self { bpf }
    }

    fn program_mut<'p, P>(&'p mut self, program: &ProgramRef) -> Result<&'p mut P, AttachError>
    where
        &'p mut P: TryFrom<&'p mut aya::programs::Program, Error = ProgramError>,
    {
        let prog = self
            .bpf
            .program_mut(program.name())
            .ok_or_else(|| AttachError::ProgramNotFound(program.name().to_string()))?;
        prog.try_into().map_err(|e: ProgramError| attach_failure(program, e))
    }
}

fn attach_failure(program: &ProgramRef, err: ProgramError) -> AttachError {
    AttachError::AttachFailure {
        probe: program.name().to_string(),
        reason: err.to_string(),
    }
}

/// `load()` fails with AlreadyLoaded on the second call, so only load once.
macro_rules! ensure_loaded {
    ($prog:expr, $program:expr) => {
        if $prog.fd().is_err() {
            debug!(program = $program.name(), "loading program");
            $prog.load().map_err(|e| attach_failure($program, e))?;
        }
    };
}

impl ProbeBackend for AyaBackend<'_> {
    fn attach_uprobe(
        &mut self,
        program: &ProgramRef,
        target: &Path,
        pid: Option<i32>,
        address: u64,
    ) -> Result<Box<dyn Closer>, AttachError> {
        let prog: &mut UProbe = self.program_mut(program)?;
        ensure_loaded!(prog, program);
        let link_id = prog
            .attach(None, address, target, pid)
            .map_err(|e| attach_failure(program, e))?;
        let link = prog.take_link(link_id).map_err(|e| attach_failure(program, e))?;
        Ok(Box::new(LinkCloser {
            label: format!("{}@{:#x}", program, address),
            link: Some(link),
        }))
    }

    fn attach_kprobe(&mut self, program: &ProgramRef, function: &str) -> Result<Box<dyn Closer>, AttachError> {
        let prog: &mut KProbe = self.program_mut(program)?;
        ensure_loaded!(prog, program);
        let link_id = prog.attach(function, 0).map_err(|e| attach_failure(program, e))?;
        let link = prog.take_link(link_id).map_err(|e| attach_failure(program, e))?;
        Ok(Box::new(LinkCloser {
            label: format!("{}:{}", program, function),
            link: Some(link),
        }))
    }

    fn attach_kretprobe(&mut self, program: &ProgramRef, function: &str) -> Result<Box<dyn Closer>, AttachError> {
        // The probe kind (entry or return) comes from the program's ELF
        // section, so a kretprobe is attached through the same KProbe type.
        self.attach_kprobe(program, function)
    }

    fn attach_socket_filter(&mut self, program: &ProgramRef) -> Result<Box<dyn Closer>, AttachError> {
        let prog: &mut SocketFilter = self.program_mut(program)?;
        ensure_loaded!(prog, program);

        // dropping `socket` on an error path closes it
        let socket = SocketFilterHandle::new(program.name(), socket::open_packet_socket(program.name())?);
        let fd = socket.socket().ok_or_else(|| socket_failure(program, "socket already closed"))?;
        let link_id = prog.attach(fd).map_err(|e| socket_failure(program, e))?;
        let link = prog.take_link(link_id).map_err(|e| socket_failure(program, e))?;

        Ok(Box::new(FilterCloser {
            link: Some(link),
            socket,
        }))
    }
}

fn socket_failure(program: &ProgramRef, reason: impl std::fmt::Display) -> AttachError {
    AttachError::SocketFailure {
        program: program.name().to_string(),
        reason: reason.to_string(),
    }
}

/// Filter link plus the socket it sits on. The filter is detached before
/// the socket is closed.
struct FilterCloser {
    link: Option<SocketFilterLink>,
    socket: SocketFilterHandle,
}

impl Closer for FilterCloser {
    fn close(&mut self) -> Result<(), ReleaseError> {
        let detached = match self.link.take() {
            Some(link) => link.detach().map_err(|e| ReleaseError {
                label: String::new(),
                reason: e.to_string(),
            }),
            None => Ok(()),
        };
        // close the socket even when detaching failed
        self.socket.close()?;
        detached
    }
}
