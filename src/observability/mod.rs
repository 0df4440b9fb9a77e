//! Observability: structured logging and node status reporting

pub mod logging;
pub mod status;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use status::{NodeStatus, StatusFill, StatusShape, StatusSink, TracingStatus};

// Span macros for structured logging
pub use logging::{link_span, node_span};
