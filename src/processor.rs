//! # Partial Span Processor
//!
//! The `PartialSpanProcessor` tracks every span between `on_start` and
//! `on_end` and emits periodic heartbeat log records for it, so a collector
//! can reconstruct traces whose spans never complete. It uses a **dedicated
//! background thread** to pace heartbeats; span lifecycle hooks only touch a
//! short critical section and never fail.
//!
//! Scheduling is two-staged. A newly started span enters the *delayed* queue
//! with a due time of `start + initial_heartbeat_delay`; once due, it is
//! promoted to the *ready* queue and heartbeats from then on every
//! `heartbeat_interval`. Both queues are FIFO: every insertion adds the same
//! constant to a non-decreasing now, so insertion order equals due-time
//! order and no priority heap is needed. Entries for spans that already
//! ended are dropped lazily at dequeue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, SystemTime};

use opentelemetry::logs::{AnyValue, LogRecord as _, Logger as _, LoggerProvider as _};
use opentelemetry::trace::{Span as _, SpanId};
use opentelemetry::{otel_debug, otel_error, otel_warn, Context};
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::logs::{LogExporter, SdkLogger, SdkLoggerProvider};
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use opentelemetry_sdk::Resource;

use crate::error::Error;
use crate::serializer::{JsonV1Serializer, Signal, SpanSerializer};

/// Default period between two heartbeats for a single span.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5_000);
/// Default grace period before a span's first heartbeat.
const DEFAULT_INITIAL_HEARTBEAT_DELAY: Duration = Duration::from_millis(5_000);
/// Default scheduler tick period.
const DEFAULT_PROCESS_INTERVAL: Duration = Duration::from_millis(5_000);

/// Record attribute distinguishing heartbeat from stop records.
const EVENT_ATTRIBUTE: &str = "partial.event";
/// Record attribute carrying the configured heartbeat period, e.g. `"5000ms"`.
const FREQUENCY_ATTRIBUTE: &str = "partial.frequency";
/// Record attribute naming the body encoding.
const BODY_TYPE_ATTRIBUTE: &str = "partial.body.type";

/// Instrumentation scope under which heartbeat and stop records are emitted.
const LOGGER_NAME: &str = "opentelemetry-partial-span-processor";

/// Messages sent from lifecycle hooks to the scheduler thread.
#[derive(Debug)]
enum WorkerMessage {
    /// Exit the scheduler loop, acknowledging on the enclosed channel.
    Shutdown(SyncSender<()>),
}

/// Scheduler state behind a single mutex: the registry of active spans and
/// both heartbeat queues. One lock keeps the "a span id sits in at most one
/// queue" invariant trivial to preserve; all critical sections are short and
/// emission always happens after the lock is released.
struct SchedulerState {
    /// Spans observed via `on_start` and not yet via `on_end`, keyed by span
    /// id, holding the snapshot taken at start.
    active: HashMap<SpanId, SpanData>,
    /// Spans waiting out the initial heartbeat delay, with their first due
    /// time.
    delayed: VecDeque<(SpanId, SystemTime)>,
    /// Ids currently present in `delayed`, so `on_end` can tell in O(1)
    /// whether a first heartbeat was ever due for the span.
    delayed_index: HashSet<SpanId>,
    /// Spans on the recurring heartbeat cadence, with their next due time.
    ready: VecDeque<(SpanId, SystemTime)>,
}

impl SchedulerState {
    fn new() -> Self {
        SchedulerState {
            active: HashMap::new(),
            delayed: VecDeque::new(),
            delayed_index: HashSet::new(),
            ready: VecDeque::new(),
        }
    }
}

/// Shared between the processor handle and the scheduler thread.
struct ProcessorInner<E: LogExporter> {
    state: Mutex<SchedulerState>,
    /// Exporter held until the log pipeline is bound; consumed exactly once.
    exporter: Mutex<Option<E>>,
    /// Resource recorded via `set_resource`, attached to emitted records and
    /// serialized envelopes.
    resource: Mutex<Resource>,
    /// Log pipeline, bound lazily on first emission so it carries the host
    /// provider's resource.
    logger: OnceLock<SdkLogger>,
    logger_provider: Mutex<Option<SdkLoggerProvider>>,
    serializer: Box<dyn SpanSerializer>,
    heartbeat_interval: Duration,
    initial_delay: Duration,
}

impl<E: LogExporter + 'static> ProcessorInner<E> {
    fn resource(&self) -> Resource {
        match self.resource.lock() {
            Ok(resource) => resource.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Bind the log pipeline on first use: a provider with a simple
    /// processor over the injected exporter, carrying whatever resource has
    /// been recorded by now.
    fn logger(&self) -> &SdkLogger {
        self.logger.get_or_init(|| {
            let mut builder = SdkLoggerProvider::builder().with_resource(self.resource());
            if let Some(exporter) = self
                .exporter
                .lock()
                .ok()
                .and_then(|mut exporter| exporter.take())
            {
                builder = builder.with_simple_exporter(exporter);
            }
            let provider = builder.build();
            let logger = provider.logger(LOGGER_NAME);
            if let Ok(mut slot) = self.logger_provider.lock() {
                *slot = Some(provider);
            }
            otel_debug!(name: "PartialSpanProcessor.LoggerBound");
            logger
        })
    }

    /// Build one heartbeat or stop record for `span` and hand it to the log
    /// pipeline. Export results are not inspected: duplicates and gaps are
    /// reconciled at the collector, and failures are only logged.
    fn emit(&self, span: &SpanData, signal: Signal) {
        let resource = self.resource();
        let body = match self.serializer.serialize(span, &resource, signal) {
            Ok(body) => body,
            Err(err) => {
                otel_warn!(
                    name: "PartialSpanProcessor.SerializeFailed",
                    signal = signal.as_str(),
                    error = format!("{err}")
                );
                return;
            }
        };

        let logger = self.logger();
        let mut record = logger.create_log_record();
        let now = opentelemetry::time::now();
        record.set_timestamp(now);
        record.set_observed_timestamp(now);
        record.set_trace_context(
            span.span_context.trace_id(),
            span.span_context.span_id(),
            Some(span.span_context.trace_flags()),
        );
        record.add_attribute(EVENT_ATTRIBUTE, signal.as_str());
        if signal == Signal::Heartbeat {
            record.add_attribute(
                FREQUENCY_ATTRIBUTE,
                format!("{}ms", self.heartbeat_interval.as_millis()),
            );
        }
        record.add_attribute(BODY_TYPE_ATTRIBUTE, self.serializer.body_type());
        record.set_body(AnyValue::String(body.into()));
        logger.emit(record);
    }

    /// Pop every entry of the delayed queue whose due time has passed,
    /// promoting still-active spans onto the recurring cadence. Returns the
    /// snapshots owed their first heartbeat.
    fn drain_delayed(&self, now: SystemTime) -> Vec<SpanData> {
        let mut due = Vec::new();
        if let Ok(mut state) = self.state.lock() {
            while let Some(&(span_id, due_at)) = state.delayed.front() {
                if due_at > now {
                    break;
                }
                state.delayed.pop_front();
                state.delayed_index.remove(&span_id);
                let span = state.active.get(&span_id).cloned();
                // An absent span ended in the meantime; its entry is a
                // tombstone and is dropped here.
                if let Some(span) = span {
                    state.ready.push_back((span_id, now + self.heartbeat_interval));
                    due.push(span);
                }
            }
        }
        due
    }

    /// Pop every due entry of the ready queue, re-enqueueing still-active
    /// spans one interval ahead. Entries pushed back during the drain are
    /// never due yet, so the pass always terminates.
    fn drain_ready(&self, now: SystemTime) -> Vec<SpanData> {
        let mut due = Vec::new();
        if let Ok(mut state) = self.state.lock() {
            while let Some(&(span_id, due_at)) = state.ready.front() {
                if due_at > now {
                    break;
                }
                state.ready.pop_front();
                let span = state.active.get(&span_id).cloned();
                if let Some(span) = span {
                    state.ready.push_back((span_id, now + self.heartbeat_interval));
                    due.push(span);
                }
            }
        }
        due
    }

    /// Emit one heartbeat per collected snapshot, outside any lock. A panic
    /// from the serializer or the exporter is contained here: one bad span
    /// must not stop heartbeats for all others.
    fn emit_heartbeats(&self, batch: Vec<SpanData>) {
        if batch.is_empty() {
            return;
        }
        let emitted = panic::catch_unwind(AssertUnwindSafe(|| {
            for span in &batch {
                self.emit(span, Signal::Heartbeat);
            }
        }));
        if emitted.is_err() {
            otel_error!(
                name: "PartialSpanProcessor.EmitPanicked",
                message = "Heartbeat emission panicked; the scheduler continues with the next tick."
            );
        }
    }
}

/// Scheduler loop. Waits on the control channel for up to one tick, then
/// runs the delayed pass followed by the ready pass. With a zero tick the
/// loop busy-polls and yields. The loop deliberately does not enter the
/// SDK's telemetry-suppression scope: emitting log records through the SDK
/// logger is its entire purpose.
fn worker<E: LogExporter + 'static>(
    inner: Arc<ProcessorInner<E>>,
    receiver: mpsc::Receiver<WorkerMessage>,
    process_interval: Duration,
) {
    otel_debug!(
        name: "PartialSpanProcessor.ThreadStarted",
        interval_in_millisecs = process_interval.as_millis()
    );
    loop {
        match receiver.recv_timeout(process_interval) {
            Ok(WorkerMessage::Shutdown(reply)) => {
                let _ = reply.send(());
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = opentelemetry::time::now();
                let first = inner.drain_delayed(now);
                inner.emit_heartbeats(first);
                let recurring = inner.drain_ready(now);
                inner.emit_heartbeats(recurring);
                if process_interval.is_zero() {
                    thread::yield_now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    otel_debug!(name: "PartialSpanProcessor.ThreadStopped");
}

/// A [`SpanProcessor`] that emits heartbeat log records for in-flight spans
/// and a stop record when they end, keeping partial traces visible to the
/// collector. See the crate docs for the overall contract.
///
/// Heartbeats carry the snapshot taken when the span started; the stop
/// record carries the final span delivered to `on_end`. For a given span the
/// emission order is heartbeat₁ … heartbeatₙ, stop; across spans no order is
/// guaranteed. Spans ending within the initial heartbeat delay emit nothing.
///
/// `on_end` performs a synchronous export on the calling thread; a slow
/// exporter will back-pressure span end. Heartbeats are exported from the
/// scheduler thread.
pub struct PartialSpanProcessor<E: LogExporter> {
    inner: Arc<ProcessorInner<E>>,
    message_sender: SyncSender<WorkerMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl<E: LogExporter> Debug for PartialSpanProcessor<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialSpanProcessor")
            .field("heartbeat_interval", &self.inner.heartbeat_interval)
            .field("initial_heartbeat_delay", &self.inner.initial_delay)
            .field("serializer", &self.inner.serializer)
            .finish()
    }
}

impl<E: LogExporter + 'static> PartialSpanProcessor<E> {
    /// Create a builder routing heartbeat and stop records to `exporter`.
    pub fn builder(exporter: E) -> PartialSpanProcessorBuilder<E> {
        PartialSpanProcessorBuilder {
            exporter,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            initial_delay: DEFAULT_INITIAL_HEARTBEAT_DELAY,
            process_interval: DEFAULT_PROCESS_INTERVAL,
            serializer: Box::new(JsonV1Serializer),
        }
    }
}

impl<E: LogExporter + 'static> SpanProcessor for PartialSpanProcessor<E> {
    fn on_start(&self, span: &mut Span, _cx: &Context) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        if !span.span_context().is_sampled() {
            return;
        }
        let Some(data) = span.exported_data() else {
            return;
        };
        let span_id = data.span_context.span_id();
        let now = opentelemetry::time::now();
        if let Ok(mut state) = self.inner.state.lock() {
            state.active.insert(span_id, data);
            state
                .delayed
                .push_back((span_id, now + self.inner.initial_delay));
            state.delayed_index.insert(span_id);
        }
    }

    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        if !span.span_context.is_sampled() {
            return;
        }
        let span_id = span.span_context.span_id();
        let (was_active, still_delayed) = match self.inner.state.lock() {
            Ok(mut state) => {
                let still_delayed = state.delayed_index.remove(&span_id);
                let was_active = state.active.remove(&span_id).is_some();
                (was_active, still_delayed)
            }
            Err(_) => return,
        };
        // A span still sitting in the delayed stage was never disclosed to
        // the collector, so no stop record is meaningful for it either.
        if was_active && !still_delayed {
            self.inner.emit(&span, Signal::Stop);
        }
    }

    fn force_flush(&self) -> OTelSdkResult {
        // Nothing is buffered: every record is handed to the exporter at
        // emission time.
        Ok(())
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(OTelSdkError::AlreadyShutdown);
        }

        let (reply_sender, reply_receiver) = mpsc::sync_channel(1);
        let worker_result = match self.message_sender.try_send(WorkerMessage::Shutdown(reply_sender))
        {
            // A zero timeout means "do not wait": the worker exits on its
            // own once it picks up the message.
            Ok(()) if timeout.is_zero() => Ok(()),
            Ok(()) => match reply_receiver.recv_timeout(timeout) {
                Ok(()) => {
                    if let Ok(mut handle) = self.handle.lock() {
                        if let Some(handle) = handle.take() {
                            if handle.join().is_err() {
                                otel_error!(name: "PartialSpanProcessor.Shutdown.WorkerPanicked");
                            }
                        }
                    }
                    Ok(())
                }
                Err(RecvTimeoutError::Timeout) => {
                    otel_error!(
                        name: "PartialSpanProcessor.Shutdown.Timeout",
                        timeout_in_millisecs = timeout.as_millis()
                    );
                    Err(OTelSdkError::Timeout(timeout))
                }
                Err(err) => Err(OTelSdkError::InternalFailure(format!("{err}"))),
            },
            Err(err) => Err(OTelSdkError::InternalFailure(format!(
                "failed to signal scheduler shutdown: {err}"
            ))),
        };

        // Forward shutdown to the exporter, through the log pipeline when it
        // was bound, directly otherwise.
        let provider = self
            .inner
            .logger_provider
            .lock()
            .ok()
            .and_then(|mut provider| provider.take());
        let exporter_result = if let Some(provider) = provider {
            provider.shutdown()
        } else if let Some(exporter) = self
            .inner
            .exporter
            .lock()
            .ok()
            .and_then(|mut exporter| exporter.take())
        {
            exporter.shutdown()
        } else {
            Ok(())
        };

        worker_result.and(exporter_result)
    }

    fn shutdown(&self) -> OTelSdkResult {
        self.shutdown_with_timeout(Duration::from_secs(5))
    }

    fn set_resource(&mut self, resource: &Resource) {
        if let Ok(mut guard) = self.inner.resource.lock() {
            *guard = resource.clone();
        }
    }
}

/// Builder for [`PartialSpanProcessor`] instances.
///
/// All durations default to five seconds. `build` validates the
/// configuration, spawns the scheduler thread and returns the processor.
/// The configuration surface is exactly this builder; no environment
/// variables are read.
pub struct PartialSpanProcessorBuilder<E: LogExporter> {
    exporter: E,
    heartbeat_interval: Duration,
    initial_delay: Duration,
    process_interval: Duration,
    serializer: Box<dyn SpanSerializer>,
}

impl<E: LogExporter> Debug for PartialSpanProcessorBuilder<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialSpanProcessorBuilder")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("initial_heartbeat_delay", &self.initial_delay)
            .field("process_interval", &self.process_interval)
            .finish()
    }
}

impl<E: LogExporter + 'static> PartialSpanProcessorBuilder<E> {
    /// Period between two heartbeats for a single span once its initial
    /// delay has elapsed. Must be non-zero.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Grace period before a span's first heartbeat. Spans ending within it
    /// emit neither heartbeat nor stop.
    pub fn with_initial_heartbeat_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Scheduler tick period: how often due heartbeats are looked for.
    /// Lower is more responsive, higher uses less CPU; zero busy-polls.
    pub fn with_process_interval(mut self, interval: Duration) -> Self {
        self.process_interval = interval;
        self
    }

    /// Replace the default `json/v1` serializer.
    pub fn with_serializer(mut self, serializer: Box<dyn SpanSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Validate the configuration and start the scheduler thread.
    pub fn build(self) -> Result<PartialSpanProcessor<E>, Error> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig {
                name: "heartbeat_interval",
                reason: "must be greater than zero",
            });
        }

        let inner = Arc::new(ProcessorInner {
            state: Mutex::new(SchedulerState::new()),
            exporter: Mutex::new(Some(self.exporter)),
            resource: Mutex::new(Resource::builder().build()),
            logger: OnceLock::new(),
            logger_provider: Mutex::new(None),
            serializer: self.serializer,
            heartbeat_interval: self.heartbeat_interval,
            initial_delay: self.initial_delay,
        });

        let (message_sender, message_receiver) = mpsc::sync_channel(1);
        let worker_inner = Arc::clone(&inner);
        let process_interval = self.process_interval;
        let handle = thread::Builder::new()
            .name("OpenTelemetry.Traces.PartialSpanProcessor".to_string())
            .spawn(move || worker(worker_inner, message_receiver, process_interval))?;

        Ok(PartialSpanProcessor {
            inner,
            message_sender,
            handle: Mutex::new(Some(handle)),
            is_shutdown: AtomicBool::new(false),
        })
    }
}
