//! PB-GATT: provisioning over a GATT connection, as device or provisioner.

pub mod client;
pub mod link;
pub mod server;

pub use client::PbGattClient;
pub use link::PbGattLink;
pub use server::PbGattServer;
