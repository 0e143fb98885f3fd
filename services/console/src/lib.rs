// console: Library entry point.
// Exposes the reconnecting client for embedding and integration tests.

pub mod backoff;
pub mod client;

pub use backoff::ReconnectPolicy;
pub use client::{client_frame, ClientConfig, ClientEvent, ClientState, PulseClient};
