//! Core classification logic for tlsgauge.
//!
//! This crate is pure data and logic: the cipher suite catalogue, the
//! protocol version catalogue, the [`HandshakeSnapshot`] handed over by the
//! TLS engine, and the classifier that turns a snapshot into a [`Report`].
//! It performs no I/O and cannot fail at runtime.

pub mod catalogue;
pub mod classify;
pub mod report;
pub mod snapshot;
pub mod version;

pub use classify::classify;
pub use report::{Rating, Report};
pub use snapshot::{BeastObservation, HandshakeSnapshot};
