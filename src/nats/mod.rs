//! NATS JetStream integration
//!
//! Forwards pool lifecycle, reconnect, maintenance and metrics events to
//! the POOL stream.

mod publisher;

pub use publisher::{ensure_streams, route_subject, run_forwarder, streams, subjects, EventPublisher};
