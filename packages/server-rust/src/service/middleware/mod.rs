//! Tower layers wrapped around every outbound SP call.
//!
//! - [`timeout`]: per-call timeout, surfaced as a `Timeout` classification
//! - [`metrics`]: tracing span plus call counters and latency histogram
//! - [`pipeline`]: composes both around an `SpTransport`

pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use metrics::MetricsLayer;
pub use pipeline::{call_sp, TransportService};
pub use timeout::TimeoutLayer;
