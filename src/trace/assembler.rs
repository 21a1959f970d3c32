//! Span hierarchy assembly
//!
//! Each server request becomes three spans:
//!
//! ```text
//! GET /users  (server)  request_start ─────────────────────────── end
//!   in queue  (internal) request_start ──── start
//!   processing(internal)                    start ─────────────── end
//! ```
//!
//! The parent continues the caller's trace when a valid, sampled traceparent
//! came with the request; otherwise a new trace is started. Client requests
//! become a single client span.
//!
//! A tree whose timestamps are out of order is dropped: exporting it would
//! draw children outside their parent in every trace viewer.

use std::fmt;
use std::time::SystemTime;

use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::context::{resolve, Propagation, SpanId, TraceContext, TraceId};
use super::span::{EventType, ServiceId, Span};
use super::timing::{Interval, SpanTimer};
use crate::metrics::{SPANS_ASSEMBLED, SPANS_DROPPED};

pub const QUEUE_SPAN_NAME: &str = "in queue";
pub const PROCESSING_SPAN_NAME: &str = "processing";

/// Error type for span assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// A timestamp the request kind needs is missing (zero)
    Incomplete { field: &'static str },
    /// Timestamps or converted intervals violate the nesting rules
    OrderingViolation(String),
}

impl AssemblyError {
    pub fn reason(&self) -> &'static str {
        match self {
            AssemblyError::Incomplete { .. } => "incomplete",
            AssemblyError::OrderingViolation(_) => "ordering_violation",
        }
    }
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyError::Incomplete { field } => write!(f, "span is missing {}", field),
            AssemblyError::OrderingViolation(msg) => write!(f, "span ordering violation: {}", msg),
        }
    }
}

impl std::error::Error for AssemblyError {}

/// A finished span ready for the export pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSpan {
    pub name: String,
    pub kind: SpanKind,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub start: SystemTime,
    pub end: SystemTime,
    pub status: Status,
    pub attributes: Vec<KeyValue>,
    pub service: ServiceId,
}

impl TraceSpan {
    pub fn interval(&self) -> Interval {
        Interval::new(self.start, self.end)
    }

    pub fn attribute(&self, key: &str) -> Option<&opentelemetry::Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }
}

/// Parent span plus its internal children
#[derive(Debug, Clone, PartialEq)]
pub struct SpanTree {
    pub parent: TraceSpan,
    pub children: Vec<TraceSpan>,
    /// The trace continues a caller's traceparent
    pub propagated: bool,
}

impl SpanTree {
    pub fn queue(&self) -> Option<&TraceSpan> {
        self.child(QUEUE_SPAN_NAME)
    }

    pub fn processing(&self) -> Option<&TraceSpan> {
        self.child(PROCESSING_SPAN_NAME)
    }

    fn child(&self, name: &str) -> Option<&TraceSpan> {
        self.children.iter().find(|s| s.name == name)
    }

    /// Parent first, then children
    pub fn spans(&self) -> impl Iterator<Item = &TraceSpan> {
        std::iter::once(&self.parent).chain(self.children.iter())
    }

    /// Containment checks on the converted calendar intervals.
    pub fn check_ordering(&self) -> Result<(), AssemblyError> {
        let parent = self.parent.interval();
        if parent.end < parent.start {
            return Err(AssemblyError::OrderingViolation("parent ends before it starts".into()));
        }
        if let Some(queue) = self.queue() {
            if !parent.contains(&queue.interval()) {
                return Err(AssemblyError::OrderingViolation("in queue span outside parent".into()));
            }
            if let Some(processing) = self.processing() {
                if processing.start < queue.end {
                    return Err(AssemblyError::OrderingViolation(
                        "processing starts before queueing ended".into(),
                    ));
                }
            }
        }
        if let Some(processing) = self.processing() {
            if !parent.contains(&processing.interval()) {
                return Err(AssemblyError::OrderingViolation("processing span outside parent".into()));
            }
        }
        Ok(())
    }
}

/// Builds [`SpanTree`]s from raw spans.
#[derive(Debug, Clone, Default)]
pub struct SpanAssembler {
    timer: SpanTimer,
}

impl SpanAssembler {
    pub fn new(timer: SpanTimer) -> Self {
        Self { timer }
    }

    /// Assemble one request.
    ///
    /// `Ok(None)` means the caller's trace is not sampled and nothing should
    /// be exported. Errors mean the request was dropped.
    pub fn assemble(&self, span: &Span) -> Result<Option<SpanTree>, AssemblyError> {
        let result = self.try_assemble(span);
        match &result {
            Ok(Some(_)) => SPANS_ASSEMBLED
                .with_label_values(&[span.event_type.as_str()])
                .inc(),
            Ok(None) => SPANS_DROPPED.with_label_values(&["not_sampled"]).inc(),
            Err(e) => {
                warn!(span_id = span.id, event_type = span.event_type.as_str(), error = %e, "dropping span");
                SPANS_DROPPED.with_label_values(&[e.reason()]).inc();
            }
        }
        result
    }

    fn try_assemble(&self, span: &Span) -> Result<Option<SpanTree>, AssemblyError> {
        let server = span.event_type.is_server();
        if server && span.request_start == 0 {
            return Err(AssemblyError::Incomplete { field: "request_start" });
        }
        if span.start == 0 {
            return Err(AssemblyError::Incomplete { field: "start" });
        }
        if span.end == 0 {
            return Err(AssemblyError::Incomplete { field: "end" });
        }
        // client kinds carry no request_start, only start and end are ordered
        let ordered = if server { span.is_ordered() } else { span.start <= span.end };
        if !ordered {
            return Err(AssemblyError::OrderingViolation(format!(
                "timestamps out of order: request_start={} start={} end={}",
                span.request_start, span.start, span.end
            )));
        }

        let propagation = resolve(span.traceparent.as_deref());
        let (ctx, propagated) = match propagation {
            Propagation::Propagated(ctx) => (ctx, true),
            Propagation::Synthesized(ctx) => (ctx, false),
            Propagation::NotSampled => {
                debug!(span_id = span.id, "request trace not sampled, skipping");
                return Ok(None);
            }
        };

        let timings = self.timer.timings(span);
        let tree = if server {
            let parent = self.parent_span(span, &ctx, timings.request_start, timings.end);
            let queue = internal_span(QUEUE_SPAN_NAME, &parent, timings.request_start, timings.start);
            let processing = internal_span(PROCESSING_SPAN_NAME, &parent, timings.start, timings.end);
            SpanTree {
                parent,
                children: vec![queue, processing],
                propagated,
            }
        } else {
            SpanTree {
                parent: self.parent_span(span, &ctx, timings.start, timings.end),
                children: Vec::new(),
                propagated,
            }
        };

        tree.check_ordering()?;
        Ok(Some(tree))
    }

    fn parent_span(&self, span: &Span, ctx: &TraceContext, start: SystemTime, end: SystemTime) -> TraceSpan {
        TraceSpan {
            name: span_name(span),
            kind: span_kind(span.event_type),
            trace_id: ctx.trace_id,
            span_id: SpanId::random(),
            parent_span_id: ctx.parent_id,
            start,
            end,
            status: span_status(span),
            attributes: span_attributes(span),
            service: span.service.clone(),
        }
    }
}

fn internal_span(name: &str, parent: &TraceSpan, start: SystemTime, end: SystemTime) -> TraceSpan {
    TraceSpan {
        name: name.to_string(),
        kind: SpanKind::Internal,
        trace_id: parent.trace_id,
        span_id: SpanId::random(),
        parent_span_id: Some(parent.span_id),
        start,
        end,
        status: Status::Unset,
        attributes: Vec::new(),
        service: parent.service.clone(),
    }
}

fn span_name(span: &Span) -> String {
    match span.event_type {
        EventType::HttpServer => {
            let target = if span.route.is_empty() { &span.path } else { &span.route };
            format!("{} {}", span.method, target)
        }
        EventType::HttpClient | EventType::SqlClient => span.method.clone(),
        EventType::GrpcServer | EventType::GrpcClient => span.path.clone(),
    }
}

fn span_kind(event_type: EventType) -> SpanKind {
    match event_type {
        EventType::HttpServer | EventType::GrpcServer => SpanKind::Server,
        EventType::HttpClient | EventType::GrpcClient | EventType::SqlClient => SpanKind::Client,
    }
}

fn span_status(span: &Span) -> Status {
    let error = match span.event_type {
        EventType::HttpServer => span.status >= 500,
        EventType::HttpClient => span.status >= 400,
        EventType::GrpcServer | EventType::GrpcClient => span.status != 0,
        EventType::SqlClient => false,
    };
    if error {
        Status::error(format!("status {}", span.status))
    } else {
        Status::Unset
    }
}

fn span_attributes(span: &Span) -> Vec<KeyValue> {
    let mut attrs = Vec::with_capacity(8 + span.metadata.len());
    match span.event_type {
        EventType::HttpServer | EventType::HttpClient => {
            attrs.push(KeyValue::new("http.method", span.method.clone()));
            attrs.push(KeyValue::new("http.status_code", i64::from(span.status)));
            attrs.push(KeyValue::new("http.target", span.path.clone()));
            if !span.route.is_empty() {
                attrs.push(KeyValue::new("http.route", span.route.clone()));
            }
            if span.content_length > 0 {
                attrs.push(KeyValue::new("http.request_content_length", span.content_length));
            }
        }
        EventType::GrpcServer | EventType::GrpcClient => {
            attrs.push(KeyValue::new("rpc.system", "grpc"));
            attrs.push(KeyValue::new("rpc.method", span.path.clone()));
            attrs.push(KeyValue::new("rpc.grpc.status_code", i64::from(span.status)));
        }
        EventType::SqlClient => {
            attrs.push(KeyValue::new("db.operation", span.method.clone()));
            if !span.path.is_empty() {
                attrs.push(KeyValue::new("db.statement", span.path.clone()));
            }
        }
    }
    if !span.peer.is_empty() {
        attrs.push(KeyValue::new("net.sock.peer.addr", span.peer.clone()));
    }
    if !span.host.is_empty() {
        attrs.push(KeyValue::new("net.host.name", span.host.clone()));
    }
    if span.host_port != 0 {
        attrs.push(KeyValue::new("net.host.port", i64::from(span.host_port)));
    }
    attrs.extend(
        span.metadata
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
    );
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::timing::Clocks;
    use opentelemetry::Value;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    struct FixedClocks;

    impl Clocks for FixedClocks {
        fn now(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        }

        fn monotonic(&self) -> Duration {
            Duration::from_secs(1_000)
        }
    }

    fn assembler() -> SpanAssembler {
        SpanAssembler::new(SpanTimer::new(Arc::new(FixedClocks)))
    }

    fn http_span() -> Span {
        let mut span = Span::new(EventType::HttpServer, ServiceId::new("testserver"));
        span.id = 7;
        span.method = "GET".into();
        span.path = "/create-trace?delay=10ms".into();
        span.route = "/create-trace".into();
        span.host_port = 8080;
        span.status = 200;
        span.request_start = 999_000_000_000;
        span.start = 999_002_000_000;
        span.end = 999_015_000_000;
        span
    }

    #[test]
    fn test_server_span_triple() {
        let tree = assembler().assemble(&http_span()).unwrap().unwrap();
        assert_eq!(tree.parent.name, "GET /create-trace");
        assert_eq!(tree.parent.kind, SpanKind::Server);
        assert!(!tree.propagated);
        assert!(tree.parent.parent_span_id.is_none());

        let queue = tree.queue().unwrap();
        let processing = tree.processing().unwrap();
        assert_eq!(queue.kind, SpanKind::Internal);
        assert_eq!(queue.parent_span_id, Some(tree.parent.span_id));
        assert_eq!(processing.parent_span_id, Some(tree.parent.span_id));
        assert!(tree.spans().all(|s| s.trace_id == tree.parent.trace_id));
        assert!(tree.spans().all(|s| s.service.name == "testserver"));

        assert!(tree.parent.interval().contains(&queue.interval()));
        assert!(processing.start >= queue.end);
        assert!(processing.end <= tree.parent.end);
        assert_eq!(tree.parent.interval().duration(), Duration::from_millis(15));
    }

    #[test]
    fn test_attributes_and_status() {
        let mut span = http_span();
        span.status = 500;
        let tree = assembler().assemble(&span).unwrap().unwrap();
        assert_eq!(tree.parent.attribute("http.route"), Some(&Value::from("/create-trace")));
        assert_eq!(tree.parent.attribute("net.host.port"), Some(&Value::I64(8080)));
        assert_eq!(tree.parent.attribute("http.status_code"), Some(&Value::I64(500)));
        assert!(matches!(tree.parent.status, Status::Error { .. }));
    }

    #[test]
    fn test_route_falls_back_to_path() {
        let mut span = http_span();
        span.route.clear();
        span.path = "/bye".into();
        let tree = assembler().assemble(&span).unwrap().unwrap();
        assert_eq!(tree.parent.name, "GET /bye");
    }

    #[test]
    fn test_grpc_span() {
        let mut span = http_span();
        span.event_type = EventType::GrpcServer;
        span.path = "/routeguide.RouteGuide/Debug".into();
        span.status = 2;
        let tree = assembler().assemble(&span).unwrap().unwrap();
        assert_eq!(tree.parent.name, "/routeguide.RouteGuide/Debug");
        assert_eq!(tree.parent.attribute("rpc.system"), Some(&Value::from("grpc")));
        assert_eq!(tree.parent.attribute("rpc.grpc.status_code"), Some(&Value::I64(2)));
        assert!(matches!(tree.parent.status, Status::Error { .. }));
        assert_eq!(tree.children.len(), 2);
    }

    #[test]
    fn test_client_span_has_no_children() {
        let mut span = http_span();
        span.event_type = EventType::HttpClient;
        span.request_start = 0;
        let tree = assembler().assemble(&span).unwrap().unwrap();
        assert_eq!(tree.parent.kind, SpanKind::Client);
        assert_eq!(tree.parent.name, "GET");
        assert!(tree.children.is_empty());
    }

    #[test]
    fn test_propagated_context() {
        let mut span = http_span();
        span.traceparent = Some("00-5fe865607da112abd799ea8108c38bcb-4c59e9a913c480a3-01".into());
        let tree = assembler().assemble(&span).unwrap().unwrap();
        assert!(tree.propagated);
        assert_eq!(tree.parent.trace_id.to_string(), "5fe865607da112abd799ea8108c38bcb");
        assert_eq!(
            tree.parent.parent_span_id.map(|p| p.to_string()).as_deref(),
            Some("4c59e9a913c480a3")
        );
        // internal spans hang off the parent span, not the caller
        for child in &tree.children {
            assert_eq!(child.parent_span_id, Some(tree.parent.span_id));
        }
    }

    #[test]
    fn test_not_sampled_is_not_exported() {
        let mut span = http_span();
        span.traceparent = Some("00-48ebacb3fe3ebaa5df61f611dda9a094-c1c831f7da1a9309-00".into());
        assert_eq!(assembler().assemble(&span), Ok(None));
    }

    #[test]
    fn test_out_of_order_is_dropped() {
        let mut span = http_span();
        span.start = span.end + 1;
        assert!(matches!(
            assembler().assemble(&span),
            Err(AssemblyError::OrderingViolation(_))
        ));

        let mut span = http_span();
        span.request_start = span.start + 1;
        assert!(matches!(
            assembler().assemble(&span),
            Err(AssemblyError::OrderingViolation(_))
        ));
    }

    #[test]
    fn test_client_ignores_request_start_ordering() {
        let mut span = http_span();
        span.event_type = EventType::SqlClient;
        span.request_start = span.end + 1;
        assert!(assembler().assemble(&span).unwrap().is_some());

        span.start = span.end + 1;
        assert!(matches!(
            assembler().assemble(&span),
            Err(AssemblyError::OrderingViolation(_))
        ));
    }

    #[test]
    fn test_missing_timestamp_is_incomplete() {
        let mut span = http_span();
        span.request_start = 0;
        assert_eq!(
            assembler().assemble(&span),
            Err(AssemblyError::Incomplete { field: "request_start" })
        );
    }

    #[test]
    fn test_check_ordering_detects_escaped_child() {
        let mut tree = assembler().assemble(&http_span()).unwrap().unwrap();
        tree.children[1].end = tree.parent.end + Duration::from_millis(1);
        assert!(tree.check_ordering().is_err());
    }
}
