//! Raw request spans as reported by the probes
//!
//! Timestamps are nanoseconds of the kernel monotonic clock
//! (`bpf_ktime_get_ns`), not calendar time; see [`super::timing`].

use std::collections::BTreeMap;
use std::fmt;

/// Kind of request a span describes.
///
/// Discriminants match the event type byte written by the probes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    HttpServer = 1,
    GrpcServer = 2,
    HttpClient = 3,
    GrpcClient = 4,
    SqlClient = 5,
}

impl EventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(EventType::HttpServer),
            2 => Some(EventType::GrpcServer),
            3 => Some(EventType::HttpClient),
            4 => Some(EventType::GrpcClient),
            5 => Some(EventType::SqlClient),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::HttpServer => "http",
            EventType::GrpcServer => "grpc",
            EventType::HttpClient => "http_client",
            EventType::GrpcClient => "grpc_client",
            EventType::SqlClient => "sql_client",
        }
    }

    /// Server requests are assembled into parent + "in queue" + "processing"
    pub fn is_server(&self) -> bool {
        matches!(self, EventType::HttpServer | EventType::GrpcServer)
    }
}

/// Identity of the instrumented service
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub name: String,
    pub namespace: Option<String>,
}

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One completed request observed by the probes
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub event_type: EventType,
    pub id: u64,
    pub method: String,
    pub path: String,
    pub route: String,
    pub peer: String,
    pub host: String,
    pub host_port: u16,
    pub status: i32,
    pub content_length: i64,
    /// Request received (e.g. connection accepted / goroutine started)
    pub request_start: u64,
    /// Handler started processing
    pub start: u64,
    /// Response written
    pub end: u64,
    pub service: ServiceId,
    pub metadata: BTreeMap<String, String>,
    /// Inbound traceparent header, unvalidated
    pub traceparent: Option<String>,
}

impl Span {
    pub fn new(event_type: EventType, service: ServiceId) -> Self {
        Self {
            event_type,
            id: 0,
            method: String::new(),
            path: String::new(),
            route: String::new(),
            peer: String::new(),
            host: String::new(),
            host_port: 0,
            status: 0,
            content_length: 0,
            request_start: 0,
            start: 0,
            end: 0,
            service,
            metadata: BTreeMap::new(),
            traceparent: None,
        }
    }

    /// Containment: this span started processing no earlier than `parent`
    /// received its request, and finished no later than `parent` did.
    pub fn inside(&self, parent: &Span) -> bool {
        self.start >= parent.request_start && self.end <= parent.end
    }

    /// request_start ≤ start ≤ end
    pub fn is_ordered(&self) -> bool {
        self.request_start <= self.start && self.start <= self.end
    }
}
