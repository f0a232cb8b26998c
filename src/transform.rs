//! Mapping from the SDK span type into the wire-compatible traces envelope.
//!
//! The envelope wraps a single span inside a singleton scope-and-resource
//! tree matching the OpenTelemetry traces protocol: snake_case field names,
//! hex-encoded ids, kind and status code as the protocol's integer enums, and
//! times as unsigned 64-bit nanoseconds since the Unix epoch. The end time is
//! only present on stop serializations; a heartbeat describes a span that has
//! not ended.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

use opentelemetry::trace::SpanId;
use opentelemetry_sdk::trace::SpanData;
use serde::Serialize;

use crate::serializer::Signal;

/// Single-span traces envelope: one resource entry wrapping one scope entry
/// wrapping one span.
#[derive(Debug, Serialize)]
pub(crate) struct TraceEnvelope {
    resource_spans: Vec<ResourceSpans>,
}

impl TraceEnvelope {
    pub(crate) fn build(
        span: &SpanData,
        resource: &opentelemetry_sdk::Resource,
        signal: Signal,
    ) -> Self {
        TraceEnvelope {
            resource_spans: vec![ResourceSpans {
                resource: ResourceAttributes {
                    attributes: resource
                        .iter()
                        .map(|(key, value)| KeyValue {
                            key: key.as_str().to_owned(),
                            value: value.clone().into(),
                        })
                        .collect(),
                },
                scope_spans: vec![ScopeSpans {
                    scope: Scope {
                        name: span.instrumentation_scope.name().to_owned(),
                        version: span.instrumentation_scope.version().map(str::to_owned),
                    },
                    spans: vec![Span::build(span, signal)],
                }],
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct ResourceSpans {
    resource: ResourceAttributes,
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Serialize)]
struct ResourceAttributes {
    attributes: Vec<KeyValue>,
}

#[derive(Debug, Serialize)]
struct ScopeSpans {
    scope: Scope,
    spans: Vec<Span>,
}

#[derive(Debug, Serialize)]
struct Scope {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Debug, Serialize)]
struct Span {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_state: Option<String>,
    parent_span_id: String,
    flags: u32,
    name: Cow<'static, str>,
    kind: SpanKind,
    start_time_unix_nano: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time_unix_nano: Option<u64>,
    attributes: Vec<KeyValue>,
    dropped_attributes_count: u32,
    events: Vec<Event>,
    dropped_events_count: u32,
    links: Vec<Link>,
    dropped_links_count: u32,
    status: Status,
}

impl Span {
    fn build(span: &SpanData, signal: Signal) -> Self {
        Span {
            trace_id: span.span_context.trace_id().to_string(),
            span_id: span.span_context.span_id().to_string(),
            trace_state: Some(span.span_context.trace_state().header())
                .filter(|header| !header.is_empty()),
            parent_span_id: Some(span.parent_span_id)
                .filter(|id| *id != SpanId::INVALID)
                .map(|id| id.to_string())
                .unwrap_or_default(),
            flags: span.span_context.trace_flags().to_u8() as u32,
            name: span.name.clone(),
            kind: (&span.span_kind).into(),
            start_time_unix_nano: unix_nanos(span.start_time),
            end_time_unix_nano: match signal {
                Signal::Stop => Some(unix_nanos(span.end_time)),
                Signal::Heartbeat => None,
            },
            attributes: span.attributes.iter().map(Into::into).collect(),
            dropped_attributes_count: span.dropped_attributes_count,
            events: span.events.iter().map(Into::into).collect(),
            dropped_events_count: span.events.dropped_count,
            links: span.links.iter().map(Into::into).collect(),
            dropped_links_count: span.links.dropped_count,
            status: (&span.status).into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SpanKind {
    #[allow(dead_code)]
    Unspecified = 0,
    Internal = 1,
    Server = 2,
    Client = 3,
    Producer = 4,
    Consumer = 5,
}

impl Serialize for SpanKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(*self as u32)
    }
}

impl From<&opentelemetry::trace::SpanKind> for SpanKind {
    fn from(value: &opentelemetry::trace::SpanKind) -> Self {
        match value {
            opentelemetry::trace::SpanKind::Internal => SpanKind::Internal,
            opentelemetry::trace::SpanKind::Server => SpanKind::Server,
            opentelemetry::trace::SpanKind::Client => SpanKind::Client,
            opentelemetry::trace::SpanKind::Producer => SpanKind::Producer,
            opentelemetry::trace::SpanKind::Consumer => SpanKind::Consumer,
        }
    }
}

#[derive(Debug, Serialize)]
struct Event {
    time_unix_nano: u64,
    name: Cow<'static, str>,
    attributes: Vec<KeyValue>,
    dropped_attributes_count: u32,
}

impl From<&opentelemetry::trace::Event> for Event {
    fn from(value: &opentelemetry::trace::Event) -> Self {
        Event {
            time_unix_nano: unix_nanos(value.timestamp),
            name: value.name.clone(),
            attributes: value.attributes.iter().map(Into::into).collect(),
            dropped_attributes_count: value.dropped_attributes_count,
        }
    }
}

#[derive(Debug, Serialize)]
struct Link {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_state: Option<String>,
    attributes: Vec<KeyValue>,
    dropped_attributes_count: u32,
}

impl From<&opentelemetry::trace::Link> for Link {
    fn from(value: &opentelemetry::trace::Link) -> Self {
        Link {
            trace_id: value.span_context.trace_id().to_string(),
            span_id: value.span_context.span_id().to_string(),
            trace_state: Some(value.span_context.trace_state().header())
                .filter(|header| !header.is_empty()),
            attributes: value.attributes.iter().map(Into::into).collect(),
            dropped_attributes_count: value.dropped_attributes_count,
        }
    }
}

#[derive(Debug, Serialize)]
struct Status {
    code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<&opentelemetry::trace::Status> for Status {
    fn from(value: &opentelemetry::trace::Status) -> Self {
        match value {
            opentelemetry::trace::Status::Unset => Status {
                code: 0,
                message: None,
            },
            opentelemetry::trace::Status::Ok => Status {
                code: 1,
                message: None,
            },
            opentelemetry::trace::Status::Error { description } => Status {
                code: 2,
                message: Some(description.to_string()).filter(|message| !message.is_empty()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct KeyValue {
    key: String,
    value: Value,
}

impl From<&opentelemetry::KeyValue> for KeyValue {
    fn from(value: &opentelemetry::KeyValue) -> Self {
        KeyValue {
            key: value.key.as_str().to_owned(),
            value: value.value.clone().into(),
        }
    }
}

#[derive(Debug, Serialize)]
enum Value {
    #[serde(rename = "string_value")]
    String(String),
    #[serde(rename = "bool_value")]
    Bool(bool),
    #[serde(rename = "int_value")]
    Int(i64),
    #[serde(rename = "double_value")]
    Double(f64),
    #[serde(rename = "array_value")]
    Array(ArrayValue),
}

#[derive(Debug, Serialize)]
struct ArrayValue {
    values: Vec<Value>,
}

impl From<opentelemetry::Value> for Value {
    fn from(value: opentelemetry::Value) -> Self {
        match value {
            opentelemetry::Value::Bool(b) => Value::Bool(b),
            opentelemetry::Value::I64(i) => Value::Int(i),
            opentelemetry::Value::F64(f) => Value::Double(f),
            opentelemetry::Value::String(s) => Value::String(s.into()),
            opentelemetry::Value::Array(array) => Value::Array(ArrayValue {
                values: match array {
                    opentelemetry::Array::Bool(b) => b.into_iter().map(Value::Bool).collect(),
                    opentelemetry::Array::I64(i) => i.into_iter().map(Value::Int).collect(),
                    opentelemetry::Array::F64(f) => f.into_iter().map(Value::Double).collect(),
                    opentelemetry::Array::String(s) => {
                        s.into_iter().map(|s| Value::String(s.into())).collect()
                    }
                    _ => Vec::new(),
                },
            }),
            other => Value::String(other.as_str().into_owned()),
        }
    }
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::unix_nanos;
    use crate::serializer::{JsonV1Serializer, Signal, SpanSerializer};
    use opentelemetry::trace::{Span as _, SpanKind, Status, Tracer, TracerProvider as _};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
    use opentelemetry_sdk::Resource;

    fn finished_span(configure: impl FnOnce(&mut opentelemetry_sdk::trace::Span)) -> SpanData {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("envelope-tests");
        let mut span = tracer
            .span_builder("test-span")
            .with_kind(SpanKind::Client)
            .start(&tracer);
        configure(&mut span);
        span.end();
        provider.force_flush().expect("flush spans");
        exporter
            .get_finished_spans()
            .expect("finished spans")
            .pop()
            .expect("one finished span")
    }

    fn envelope_json(span: &SpanData, signal: Signal) -> serde_json::Value {
        let body = JsonV1Serializer
            .serialize(span, &Resource::builder_empty().build(), signal)
            .expect("serializable span");
        serde_json::from_str(&body).expect("valid json body")
    }

    fn only_span(envelope: &serde_json::Value) -> &serde_json::Value {
        let resource_spans = envelope["resource_spans"].as_array().unwrap();
        assert_eq!(resource_spans.len(), 1);
        let scope_spans = resource_spans[0]["scope_spans"].as_array().unwrap();
        assert_eq!(scope_spans.len(), 1);
        let spans = scope_spans[0]["spans"].as_array().unwrap();
        assert_eq!(spans.len(), 1);
        &spans[0]
    }

    #[test]
    fn heartbeat_omits_end_time_stop_carries_it() {
        let span = finished_span(|_| {});

        let heartbeat = envelope_json(&span, Signal::Heartbeat);
        assert!(only_span(&heartbeat).get("end_time_unix_nano").is_none());

        let stop = envelope_json(&span, Signal::Stop);
        let end = only_span(&stop)["end_time_unix_nano"].as_u64().unwrap();
        assert_eq!(end, unix_nanos(span.end_time));
        assert!(end >= only_span(&stop)["start_time_unix_nano"].as_u64().unwrap());
    }

    #[test]
    fn ids_are_hex_encoded() {
        let span = finished_span(|_| {});
        let envelope = envelope_json(&span, Signal::Heartbeat);
        let entry = only_span(&envelope);
        assert_eq!(
            entry["trace_id"].as_str().unwrap(),
            span.span_context.trace_id().to_string()
        );
        assert_eq!(
            entry["span_id"].as_str().unwrap(),
            span.span_context.span_id().to_string()
        );
        // Root span: the parent id field is present but empty.
        assert_eq!(entry["parent_span_id"].as_str().unwrap(), "");
    }

    #[test]
    fn kind_maps_to_protocol_integer() {
        let span = finished_span(|_| {});
        let envelope = envelope_json(&span, Signal::Heartbeat);
        assert_eq!(only_span(&envelope)["kind"].as_u64().unwrap(), 3); // client
    }

    #[test]
    fn status_codes_follow_protocol_enum() {
        let unset = finished_span(|_| {});
        let envelope = envelope_json(&unset, Signal::Stop);
        assert_eq!(only_span(&envelope)["status"]["code"].as_u64().unwrap(), 0);
        assert!(only_span(&envelope)["status"].get("message").is_none());

        let errored = finished_span(|span| {
            span.set_status(Status::error("boom"));
        });
        let envelope = envelope_json(&errored, Signal::Stop);
        assert_eq!(only_span(&envelope)["status"]["code"].as_u64().unwrap(), 2);
        assert_eq!(
            only_span(&envelope)["status"]["message"].as_str().unwrap(),
            "boom"
        );
    }

    #[test]
    fn attributes_and_events_are_protocol_shaped() {
        let span = finished_span(|span| {
            span.set_attribute(KeyValue::new("retries", 3_i64));
            span.set_attribute(KeyValue::new("queue", "ingest"));
            span.add_event("flushed", vec![KeyValue::new("batch.size", 12_i64)]);
        });
        let envelope = envelope_json(&span, Signal::Heartbeat);
        let entry = only_span(&envelope);

        let attributes = entry["attributes"].as_array().unwrap();
        let retries = attributes
            .iter()
            .find(|kv| kv["key"] == "retries")
            .expect("retries attribute");
        assert_eq!(retries["value"]["int_value"].as_i64().unwrap(), 3);
        let queue = attributes
            .iter()
            .find(|kv| kv["key"] == "queue")
            .expect("queue attribute");
        assert_eq!(queue["value"]["string_value"].as_str().unwrap(), "ingest");

        let events = entry["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["name"].as_str().unwrap(), "flushed");
        assert!(events[0]["time_unix_nano"].as_u64().unwrap() > 0);
    }

    #[test]
    fn resource_attributes_land_in_envelope() {
        let span = finished_span(|_| {});
        let resource = Resource::builder_empty()
            .with_service_name("checkout")
            .build();
        let body = JsonV1Serializer
            .serialize(&span, &resource, Signal::Heartbeat)
            .unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&body).unwrap();
        let attributes = envelope["resource_spans"][0]["resource"]["attributes"]
            .as_array()
            .unwrap();
        let service = attributes
            .iter()
            .find(|kv| kv["key"] == "service.name")
            .expect("service.name attribute");
        assert_eq!(
            service["value"]["string_value"].as_str().unwrap(),
            "checkout"
        );
    }

    #[test]
    fn scope_carries_tracer_identity() {
        let span = finished_span(|_| {});
        let envelope = envelope_json(&span, Signal::Heartbeat);
        assert_eq!(
            envelope["resource_spans"][0]["scope_spans"][0]["scope"]["name"]
                .as_str()
                .unwrap(),
            "envelope-tests"
        );
    }
}
