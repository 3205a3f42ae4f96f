//! wsgate
//!
//! A tunnel gateway: accepts WebSocket tunnels carrying a compact request
//! header, connects to the requested destination through direct, SOCKS5,
//! NAT64 or relay strategies, and pumps bytes until either side closes.
//! UDP requests to port 53 are answered through DNS-over-HTTPS.

pub mod cli;
pub mod common;
pub mod config;
pub mod connectors;
pub mod copy;
pub mod dns_relay;
pub mod listeners;
pub mod server;
pub mod session;

#[cfg(feature = "metrics")]
pub mod metrics;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::Config;
pub use server::GatewayServer;
pub use session::{Gateway, handle_tunnel};
