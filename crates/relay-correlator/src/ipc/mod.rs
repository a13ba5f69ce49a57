//! Broker-facing side of the correlator.
//!
//! The codec turns envelopes into bytes and back, the channel adapter owns
//! the broker handle, and the listener runs the consumer loop.

pub mod backoff;
pub mod channel;
pub mod codec;
pub mod listener;

pub use backoff::Backoff;
pub use channel::ChannelAdapter;
pub use codec::EnvelopeCodec;
pub use listener::{ListenerReport, MessageDisposition, ResponseListener};
