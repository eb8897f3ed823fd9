//! GATT Proxy: the server role exposed to proxy clients, and the client role
//! connecting out to other proxy nodes.

pub mod advertiser;
pub mod client;
pub mod filter;
pub mod server;

pub use client::{FilterStatus, ProxyClient};
pub use filter::{Filter, FilterKind};
pub use server::ProxyServer;
