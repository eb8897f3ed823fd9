#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(clippy::too_many_arguments)]

// This must go FIRST so that all the other modules see its macros.
pub(crate) mod fmt;

pub mod address;
pub mod bearer;
pub mod config;
pub mod crypto;
pub mod driver;
pub mod observer;
pub mod pdu;
pub mod provisioning;
pub mod proxy;
pub mod scan;
pub mod subnet;

pub use driver::{DeviceError, MeshGatt};
