//! # OpenTelemetry Partial Span Processor
//!
//! A [`SpanProcessor`] that keeps in-flight spans visible to a collector even
//! when they never end (process crash, unbounded work, orphaned operation).
//! Exporters built on `on_end` emit a span exactly once; if the process dies
//! first, the whole trace is lost. This processor instead emits periodic
//! *heartbeat* log records for every active span, each carrying a full
//! serialized snapshot of the span, and a final *stop* record when the span
//! ends. An upstream collector reconstructs partial traces from heartbeats
//! and reconciles them with stop records.
//!
//! ## Diagram
//!
//! ```ascii
//!   +-----+--------------+   +------------------------+   +------------------+
//!   |     | Span start   +---> PartialSpanProcessor   |   |                  |
//!   | SDK |              |   |  (heartbeat scheduler) +--->   LogExporter    |
//!   |     | Span end     +--->                        |   |  (OTLP, ...)     |
//!   +-----+--------------+   +------------------------+   +------------------+
//! ```
//!
//! Each span observed at `on_start` first sits out a configurable grace
//! period (`initial_heartbeat_delay`), so short-lived spans emit nothing at
//! all. Once the delay elapses, a dedicated scheduler thread emits one
//! heartbeat per span every `heartbeat_interval`. A span that ends after its
//! first heartbeat was due additionally produces a stop record carrying its
//! final snapshot; a span that ends inside the grace period was never
//! disclosed to the collector and produces no stop either.
//!
//! Records are routed through the SDK logs pipeline: the processor lazily
//! binds a logger over the provided [`LogExporter`], carrying the host tracer
//! provider's `Resource` so the collector can correlate logs and spans. Every
//! record carries the `partial.event` attribute (`"heartbeat"` or `"stop"`)
//! and a `json/v1` traces envelope as its body; heartbeats also carry
//! `partial.frequency`. Delivery is best effort: export failures are logged
//! and ignored, and reconciliation of duplicates or gaps is the collector's
//! job.
//!
//! ## Example
//!
//! ```no_run
//! use opentelemetry_partial_span_processor::PartialSpanProcessor;
//! use opentelemetry_sdk::logs::InMemoryLogExporter;
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//! use std::time::Duration;
//!
//! // Replace with an actual exporter, e.g. opentelemetry-otlp's LogExporter.
//! let exporter = InMemoryLogExporter::default();
//!
//! let processor = PartialSpanProcessor::builder(exporter)
//!     .with_heartbeat_interval(Duration::from_secs(5))
//!     .with_initial_heartbeat_delay(Duration::from_secs(5))
//!     .build()
//!     .expect("valid processor configuration");
//!
//! let provider = SdkTracerProvider::builder()
//!     .with_span_processor(processor)
//!     .build();
//! ```
//!
//! [`SpanProcessor`]: opentelemetry_sdk::trace::SpanProcessor
//! [`LogExporter`]: opentelemetry_sdk::logs::LogExporter
#![warn(missing_debug_implementations, missing_docs)]

mod error;
mod processor;
mod serializer;
mod transform;

pub use error::Error;
pub use processor::{PartialSpanProcessor, PartialSpanProcessorBuilder};
pub use serializer::{JsonV1Serializer, Signal, SpanSerializer};
