//! E-signature provider integration.
//!
//! Two halves:
//! - **Outbound** (`client`) — envelope creation, embedded signing URLs and
//!   artifact downloads against the provider's REST API, timeout-bound.
//! - **Inbound** (`webhook`) — the completion-callback contract: payload
//!   types plus shared-secret HMAC verification over the raw body.
//!
//! Deliveries are at-least-once and may arrive out of order; the engine's
//! reconciler owns those guarantees, this crate only speaks the wire
//! contract.

pub mod client;
pub mod webhook;

pub use client::{
    CreatedEnvelope, HttpSignatureClient, RecordingSignatureClient, SignatureClient,
    SignatureClientError,
};
pub use webhook::{verify_signature, SignatureEventPayload, SIGNATURE_HEADER};
