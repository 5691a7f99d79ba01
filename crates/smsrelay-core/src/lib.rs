//! Core types for the SMS relay: the wire envelope and the error taxonomy.
//!
//! This crate is runtime-agnostic; everything network-facing lives in
//! `smsrelay-server`.

pub mod envelope;
pub mod errors;

pub use envelope::{EnvelopeKind, GREETING, LISTENING_REPLY, SmsEnvelope};
pub use errors::{ConnectionError, FaultKind, StartError};
