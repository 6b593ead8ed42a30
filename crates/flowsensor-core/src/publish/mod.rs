//! Envelope construction, HTTP transport and disk buffering for the
//! publisher client.

pub mod buffer;
pub mod client;
pub mod envelope;

pub use buffer::EnvelopeBuffer;
pub use client::{PublishError, PublisherClient, PublisherTransport, ReqwestTransport, TransportOutcome};
pub use envelope::{build_envelopes, EnvelopeError};
