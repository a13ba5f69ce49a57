//! Ports to collaborators outside the relay.

pub mod outbound;

pub use outbound::{ResultSink, SinkError};
