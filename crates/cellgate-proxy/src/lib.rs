//! cellgate-proxy: protocol-aware WebSocket proxy in front of a Jupyter
//! kernel gateway.
//!
//! Execute requests arriving from the browser carry a cell index in
//! `content.code`; the proxy swaps in the actual cell source before the
//! message reaches the backend, keeps session-to-notebook correlation
//! state from the kernel-creation control exchange, and defers kernel
//! deletion across brief client disconnects.

pub mod config;
pub mod notebooks;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod rewrite;

pub use config::ProxyConfig;
pub use proxy::{ConnectionInfo, ProxyGateway};
