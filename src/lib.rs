//! Core of an intercepting HTTP/HTTPS/WebSocket forward proxy: a local
//! certificate authority, per-host leaf issuance, the CONNECT/upgrade
//! dispatcher, and the socket bookkeeping needed to shut down cleanly.

pub mod ca;
pub mod cert_cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod leaf;
pub mod lifecycle;
pub mod mitm;
pub mod recorder;
pub mod registry;
pub mod rule;
pub mod trace;

pub use error::ProxyError;
pub use lifecycle::{ProxyLifecycle, ProxyStatus};
