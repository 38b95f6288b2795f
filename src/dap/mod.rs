//! The Debug Adapter Protocol backend: a proxy that spawns a language
//! adapter as a subprocess and speaks Content-Length-framed DAP over its
//! standard streams.

pub mod adapters;
pub mod client;
pub mod protocol;
pub mod transport;

pub use client::DapDriver;
