//! Access telemetry: structured records and the non-blocking queue that
//! carries them to the durable sink.

mod layer;
mod queue;
mod record;

pub use layer::TelemetryLayer;
pub use queue::{TelemetryQueue, TelemetryQueueConfig};
pub use record::{LogLevel, LogRecord};
