//! W3C trace-context (`traceparent`) codec
//!
//! ```text
//! 00-5fe865607da112abd799ea8108c38bcb-4c59e9a913c480a3-01
//! ── ──────────────────────────────── ──────────────── ──
//! version        trace-id (16B)       parent-id (8B)  flags
//! ```
//!
//! The header arrives from the network and is untrusted. A value is accepted
//! only as a whole: exact length, hyphens at fixed positions, lowercase hex
//! everywhere, non-zero trace and parent ids. Anything else is replaced by a
//! freshly synthesized context so a malformed header can never pass for a
//! propagated trace.

use std::fmt;

use opentelemetry::trace as otel;
use tracing::debug;
use uuid::Uuid;

use crate::metrics::TRACEPARENT_REJECTED;

/// Length of a version-00 traceparent
pub const TRACEPARENT_LEN: usize = 55;

/// Flag bit marking the trace as sampled
pub const FLAG_SAMPLED: u8 = 0x01;

const SEPARATORS: [usize; 3] = [2, 35, 52];

/// 128-bit trace identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Fresh identifier from a UUIDv7 (time-sortable, never all zeros)
    pub fn random() -> Self {
        Self(Uuid::now_v7().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 64-bit span identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Fresh identifier taken from a UUIDv4.
    ///
    /// The first 8 bytes of a v4 UUID include the version nibble, so the
    /// result is never all zeros.
    pub fn random() -> Self {
        let uuid = Uuid::new_v4().into_bytes();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&uuid[..8]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// One of the four traceparent fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Version,
    TraceId,
    ParentId,
    Flags,
}

impl Field {
    fn as_str(&self) -> &'static str {
        match self {
            Field::Version => "version",
            Field::TraceId => "trace_id",
            Field::ParentId => "parent_id",
            Field::Flags => "flags",
        }
    }
}

/// Why a traceparent was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceparentError {
    /// Not exactly 55 bytes
    Length(usize),
    /// Expected a hyphen at this byte position
    Separator(usize),
    /// Field contains something other than `0-9a-f`
    NotLowerHex(Field),
    ZeroTraceId,
    ZeroParentId,
}

impl TraceparentError {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            TraceparentError::Length(_) => "length",
            TraceparentError::Separator(_) => "separator",
            TraceparentError::NotLowerHex(Field::Version) => "version_not_hex",
            TraceparentError::NotLowerHex(Field::TraceId) => "trace_id_not_hex",
            TraceparentError::NotLowerHex(Field::ParentId) => "parent_id_not_hex",
            TraceparentError::NotLowerHex(Field::Flags) => "flags_not_hex",
            TraceparentError::ZeroTraceId => "zero_trace_id",
            TraceparentError::ZeroParentId => "zero_parent_id",
        }
    }
}

impl fmt::Display for TraceparentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceparentError::Length(len) => {
                write!(f, "traceparent must be {} bytes, got {}", TRACEPARENT_LEN, len)
            }
            TraceparentError::Separator(pos) => write!(f, "expected '-' at position {}", pos),
            TraceparentError::NotLowerHex(field) => {
                write!(f, "{} is not lowercase hex", field.as_str())
            }
            TraceparentError::ZeroTraceId => write!(f, "trace-id is all zeros"),
            TraceparentError::ZeroParentId => write!(f, "parent-id is all zeros"),
        }
    }
}

impl std::error::Error for TraceparentError {}

/// A validated trace context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub version: u8,
    pub trace_id: TraceId,
    /// Span id of the caller; `None` for a context started here
    pub parent_id: Option<SpanId>,
    pub flags: u8,
}

impl TraceContext {
    /// Parse and validate a traceparent value. No allocation.
    pub fn parse(raw: &str) -> Result<Self, TraceparentError> {
        let bytes = raw.as_bytes();
        if bytes.len() != TRACEPARENT_LEN {
            return Err(TraceparentError::Length(bytes.len()));
        }
        if let Some(&pos) = SEPARATORS.iter().find(|&&pos| bytes[pos] != b'-') {
            return Err(TraceparentError::Separator(pos));
        }

        let [version] = decode_field::<1>(&bytes[0..2], Field::Version)?;
        let trace_id = TraceId(decode_field::<16>(&bytes[3..35], Field::TraceId)?);
        let parent_id = SpanId(decode_field::<8>(&bytes[36..52], Field::ParentId)?);
        let [flags] = decode_field::<1>(&bytes[53..55], Field::Flags)?;

        if trace_id.is_zero() {
            return Err(TraceparentError::ZeroTraceId);
        }
        if parent_id.is_zero() {
            return Err(TraceparentError::ZeroParentId);
        }

        Ok(Self {
            version,
            trace_id,
            parent_id: Some(parent_id),
            flags,
        })
    }

    /// A new root context: random trace id, no parent, sampled.
    pub fn synthesize() -> Self {
        Self {
            version: 0,
            trace_id: TraceId::random(),
            parent_id: None,
            flags: FLAG_SAMPLED,
        }
    }

    pub fn is_sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED != 0
    }

    /// Same trace, with `span_id` as the parent for the next hop.
    pub fn with_parent(&self, span_id: SpanId) -> Self {
        Self {
            parent_id: Some(span_id),
            ..*self
        }
    }

    /// Canonical 55-character form. `None` when there is no parent id to
    /// render, since an all-zero parent is not a valid traceparent.
    pub fn to_traceparent(&self) -> Option<String> {
        let parent = self.parent_id?;
        Some(format!(
            "{:02x}-{}-{}-{:02x}",
            self.version, self.trace_id, parent, self.flags
        ))
    }

    /// OpenTelemetry span context for `span_id` within this trace.
    pub fn span_context(&self, span_id: SpanId, is_remote: bool) -> otel::SpanContext {
        otel::SpanContext::new(
            otel::TraceId::from_bytes(*self.trace_id.as_bytes()),
            otel::SpanId::from_bytes(*span_id.as_bytes()),
            otel::TraceFlags::new(self.flags),
            is_remote,
            otel::TraceState::default(),
        )
    }

    /// The caller's span as a remote OpenTelemetry span context.
    pub fn remote_parent(&self) -> Option<otel::SpanContext> {
        self.parent_id.map(|parent| self.span_context(parent, true))
    }
}

fn decode_field<const N: usize>(src: &[u8], field: Field) -> Result<[u8; N], TraceparentError> {
    // hex::decode_to_slice accepts uppercase too, so check the alphabet first
    if !src.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(TraceparentError::NotLowerHex(field));
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(src, &mut out).map_err(|_| TraceparentError::NotLowerHex(field))?;
    Ok(out)
}

/// How an inbound header resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Valid and sampled: the request continues the caller's trace
    Propagated(TraceContext),
    /// Valid but the sampled flag is not set: do not export
    NotSampled,
    /// Header absent or malformed: a new trace was started
    Synthesized(TraceContext),
}

impl Propagation {
    /// Context to build spans with, `None` when the request is not exported
    pub fn context(&self) -> Option<&TraceContext> {
        match self {
            Propagation::Propagated(ctx) | Propagation::Synthesized(ctx) => Some(ctx),
            Propagation::NotSampled => None,
        }
    }
}

/// Resolve an optional inbound traceparent. Never fails.
pub fn resolve(raw: Option<&str>) -> Propagation {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return Propagation::Synthesized(TraceContext::synthesize());
    };

    match TraceContext::parse(raw) {
        Ok(ctx) if ctx.is_sampled() => Propagation::Propagated(ctx),
        Ok(ctx) => {
            debug!(trace_id = %ctx.trace_id, flags = ctx.flags, "traceparent not sampled");
            Propagation::NotSampled
        }
        Err(e) => {
            debug!(traceparent = raw, error = %e, "rejecting malformed traceparent");
            TRACEPARENT_REJECTED.with_label_values(&[e.reason()]).inc();
            Propagation::Synthesized(TraceContext::synthesize())
        }
    }
}
