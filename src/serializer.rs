use std::fmt::Debug;

use opentelemetry_sdk::trace::SpanData;
use opentelemetry_sdk::Resource;

use crate::error::Error;
use crate::transform::TraceEnvelope;

/// The role of an emitted record relative to the span lifecycle.
///
/// A `Heartbeat` carries the latest snapshot of a span that is still in
/// flight; a `Stop` carries the final snapshot of a span whose end has been
/// observed. For a given span, heartbeats never follow a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Periodic snapshot of an in-flight span.
    Heartbeat,
    /// Final snapshot of an ended span.
    Stop,
}

impl Signal {
    /// Stable string form, used for the `partial.event` record attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Heartbeat => "heartbeat",
            Signal::Stop => "stop",
        }
    }
}

/// Encodes one span snapshot into a self-contained record body.
///
/// The processor treats the result as an opaque string; it neither inspects
/// nor post-processes it. The resource is passed explicitly because the SDK's
/// [`SpanData`] does not embed one, keeping the encoding a pure function of
/// its arguments.
pub trait SpanSerializer: Send + Sync + Debug {
    /// Serialize `span` for the given signal.
    ///
    /// Stop serializations include the span's end time; heartbeat
    /// serializations must not, since the span has not ended.
    fn serialize(
        &self,
        span: &SpanData,
        resource: &Resource,
        signal: Signal,
    ) -> Result<String, Error>;

    /// Value of the `partial.body.type` attribute for bodies produced by
    /// this serializer.
    fn body_type(&self) -> &'static str {
        "json/v1"
    }
}

/// The default serializer, producing a single-span `json/v1` traces envelope
/// with snake_case keys matching the OpenTelemetry traces protocol schema.
#[derive(Debug, Default)]
pub struct JsonV1Serializer;

impl SpanSerializer for JsonV1Serializer {
    fn serialize(
        &self,
        span: &SpanData,
        resource: &Resource,
        signal: Signal,
    ) -> Result<String, Error> {
        let envelope = TraceEnvelope::build(span, resource, signal);
        serde_json::to_string(&envelope).map_err(Error::from)
    }
}
