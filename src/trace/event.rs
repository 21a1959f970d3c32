//! Decoding of raw request events read from the probes' ring buffer
//!
//! The layout must match the struct the eBPF programs write.

use std::fmt;
use std::mem::size_of;

use super::context::TRACEPARENT_LEN;
use super::span::{EventType, ServiceId, Span};

pub const METHOD_LEN: usize = 8;
pub const PATH_LEN: usize = 100;
pub const ADDR_LEN: usize = 48;

/// Request event as written by the probes (must match kernel struct layout)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawRequestEvent {
    pub event_type: u8,
    pub _pad: [u8; 7],
    pub id: u64,
    pub request_start_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub content_length: i64,
    pub status: i32,
    pub host_port: u16,
    pub _pad2: [u8; 2],
    pub method: [u8; METHOD_LEN],
    pub path: [u8; PATH_LEN],
    pub peer: [u8; ADDR_LEN],
    pub host: [u8; ADDR_LEN],
    pub traceparent: [u8; TRACEPARENT_LEN],
    pub _pad3: [u8; 5],
}

impl RawRequestEvent {
    /// All-zero event
    pub fn zeroed() -> Self {
        Self {
            event_type: 0,
            _pad: [0; 7],
            id: 0,
            request_start_ns: 0,
            start_ns: 0,
            end_ns: 0,
            content_length: 0,
            status: 0,
            host_port: 0,
            _pad2: [0; 2],
            method: [0; METHOD_LEN],
            path: [0; PATH_LEN],
            peer: [0; ADDR_LEN],
            host: [0; ADDR_LEN],
            traceparent: [0; TRACEPARENT_LEN],
            _pad3: [0; 5],
        }
    }

    /// Read an event from the start of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, EventError> {
        if buf.len() < size_of::<Self>() {
            return Err(EventError::Truncated {
                expected: size_of::<Self>(),
                got: buf.len(),
            });
        }
        // SAFETY: the buffer is long enough and every field is plain data,
        // so any bit pattern is a valid value.
        Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const Self) })
    }

    pub fn event_type(&self) -> Option<EventType> {
        EventType::from_u8(self.event_type)
    }

    pub fn method_str(&self) -> String {
        c_str(&self.method)
    }

    pub fn path_str(&self) -> String {
        c_str(&self.path)
    }
}

/// Error type for event decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    Truncated { expected: usize, got: usize },
    UnknownType(u8),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Truncated { expected, got } => {
                write!(f, "event truncated: expected {} bytes, got {}", expected, got)
            }
            EventError::UnknownType(t) => write!(f, "unknown event type {}", t),
        }
    }
}

impl std::error::Error for EventError {}

/// NUL-terminated (or full-length) byte field to string
fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

impl Span {
    /// Build a span from a decoded event for `service`.
    pub fn from_raw(event: &RawRequestEvent, service: ServiceId) -> Result<Span, EventError> {
        let event_type = event
            .event_type()
            .ok_or(EventError::UnknownType(event.event_type))?;

        let path = event.path_str();
        // the route is the path without its query string
        let route = path.split('?').next().unwrap_or_default().to_string();
        let traceparent = c_str(&event.traceparent);

        Ok(Span {
            event_type,
            id: event.id,
            method: event.method_str(),
            path,
            route,
            peer: c_str(&event.peer),
            host: c_str(&event.host),
            host_port: event.host_port,
            status: event.status,
            content_length: event.content_length,
            request_start: event.request_start_ns,
            start: event.start_ns,
            end: event.end_ns,
            service,
            metadata: Default::default(),
            traceparent: (!traceparent.is_empty()).then_some(traceparent),
        })
    }
}
