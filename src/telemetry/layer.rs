//! `tracing` layer mirroring application log events into the telemetry queue.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{LogLevel, LogRecord, TelemetryQueue};
use crate::gateway::ACCESS_LOG_TARGET;

/// Events from this module tree are never forwarded, so sink failures cannot
/// loop back into the queue.
const SELF_TARGET: &str = "turnstile::telemetry";

/// Forwards events at or above `min_level` to a [`TelemetryQueue`].
///
/// Access records are enqueued directly by the gateway middleware and are
/// skipped here to avoid duplicates.
#[derive(Clone)]
pub struct TelemetryLayer {
    queue: Arc<TelemetryQueue>,
    min_level: LogLevel,
}

impl TelemetryLayer {
    pub fn new(queue: Arc<TelemetryQueue>, min_level: LogLevel) -> Self {
        Self { queue, min_level }
    }

    fn forwards(&self, level: LogLevel, target: &str) -> bool {
        level >= self.min_level
            && !target.starts_with(SELF_TARGET)
            && target != ACCESS_LOG_TARGET
    }
}

impl<S: Subscriber> Layer<S> for TelemetryLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = LogLevel::from(metadata.level());
        if !self.forwards(level, metadata.target()) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(chrono::Utc::now(), level, visitor.message);
        record.context = visitor.fields;
        record
            .context
            .insert("target".to_string(), Value::from(metadata.target()));

        self.queue.enqueue(record);
    }
}

/// Collects event fields as JSON values, splitting out `message`.
#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl RecordVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for RecordVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::from(format!("{:?}", value)));
    }
}
