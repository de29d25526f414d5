//! Connectivity core for Elegoo 3D printers: discovery, wire codecs, the
//! session protocol state machine, a typed client façade, a status-polling
//! coordinator, and a local multiplexing proxy.
//!
//! See `SPEC_FULL.md` at the repository root for the full specification
//! this crate implements; module-level docs below map to its sections.

pub mod client;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod model;
pub mod proxy;
pub mod session;
pub mod transport;
pub mod wizard;
