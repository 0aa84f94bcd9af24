//! Webhook intake boundary for the Maestro engine.
//!
//! Verifies request signatures (hex HMAC-SHA256 over the raw body,
//! constant-time compare) before any payload reaches the ingestion
//! pipeline, parses the inbound event wire format, and maps ingestion
//! outcomes to HTTP statuses.

/// Router and server construction.
pub mod server;
/// HMAC request signing and verification.
pub mod signature;
/// Webhook route handler and state.
pub mod webhook;

pub use server::GatewayServer;
pub use signature::{sign, verify};
pub use webhook::{GatewayState, IntegrationAuth, SIGNATURE_HEADER};
