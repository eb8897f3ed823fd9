use crate::bearer::{BdAddr, ConnId, Service};
use crate::config::{AdvParams, DeviceInfo, ProxyFeatures, ScanParams, NET_MAX_PDU_LEN};
use crate::crypto::InvalidKeyLength;
use crate::pdu::{InsufficientBuffer, ParseError};
use crate::scan::ScanError;
use heapless::Vec;
use rand_core::RngCore;

#[cfg(feature = "defmt")]
use defmt::Format;

pub mod deadline;
#[cfg(test)]
pub(crate) mod mock;
pub mod runner;
pub mod stack;

pub use stack::MeshGatt;

/// Longest secure network or private beacon handed to proxy clients.
pub const BEACON_MAX_LEN: usize = 27;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum DeviceError {
    InvalidArgument,
    NoMemory,
    Already,
    Busy,
    NotConnected,
    NotSupported,
    TimedOut,
    Again,
    Transport,
    InvalidKeyLength,
    InsufficientBuffer,
    ParseError(ParseError),
}

impl DeviceError {
    /// Negative status code as reported by the mesh host API.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Transport => -5,
            Self::Again => -11,
            Self::NoMemory | Self::InsufficientBuffer => -12,
            Self::Busy => -16,
            Self::InvalidArgument | Self::InvalidKeyLength | Self::ParseError(_) => -22,
            Self::TimedOut => -116,
            Self::Already => -120,
            Self::NotConnected => -128,
            Self::NotSupported => -134,
        }
    }
}

impl From<InsufficientBuffer> for DeviceError {
    fn from(_: InsufficientBuffer) -> Self {
        Self::InsufficientBuffer
    }
}

impl From<InvalidKeyLength> for DeviceError {
    fn from(_: InvalidKeyLength) -> Self {
        Self::InvalidKeyLength
    }
}

impl From<ParseError> for DeviceError {
    fn from(inner: ParseError) -> Self {
        Self::ParseError(inner)
    }
}

pub trait Link {
    fn disconnect(&mut self, conn: ConnId) -> Result<(), DeviceError>;
}

/// Local GATT database hosting the proxy and provisioning services.
pub trait GattServer: Link {
    fn server_mtu(&self, conn: ConnId) -> u16;

    fn register_service(&mut self, service: Service) -> Result<(), DeviceError>;

    fn remove_service(&mut self, service: Service);

    /// Notify on the data out characteristic of `service`.
    fn notify(&mut self, conn: ConnId, service: Service, data: &[u8]) -> Result<(), DeviceError>;
}

/// GATT client side of links we initiated.
pub trait GattCentral: Link {
    fn client_mtu(&self, conn: ConnId) -> u16;

    fn connect(&mut self, addr: &BdAddr) -> Result<(), DeviceError>;

    fn start_discovery(&mut self, conn: ConnId) -> Result<(), DeviceError>;

    /// Value handle of a discovered characteristic.
    fn find_characteristic(
        &self,
        conn: ConnId,
        service: u16,
        characteristic: u16,
    ) -> Option<u16>;

    /// Handle of a descriptor belonging to a discovered characteristic.
    fn find_descriptor(
        &self,
        conn: ConnId,
        service: u16,
        characteristic: u16,
        descriptor: u16,
    ) -> Option<u16>;

    fn write_request(&mut self, conn: ConnId, handle: u16, data: &[u8]) -> Result<(), DeviceError>;

    fn write_command(&mut self, conn: ConnId, handle: u16, data: &[u8]) -> Result<(), DeviceError>;
}

pub trait Advertiser {
    fn start_advertising(
        &mut self,
        params: &AdvParams,
        adv_data: &[u8],
        scan_data: &[u8],
    ) -> Result<(), DeviceError>;

    fn stop_advertising(&mut self);
}

pub trait Scanner {
    fn set_scan_params(&mut self, params: &ScanParams) -> Result<(), ScanError>;

    fn start_scan(&mut self) -> Result<(), ScanError>;

    fn stop_scan(&mut self) -> Result<(), ScanError>;
}

/// Interface a network PDU entered the node through.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum NetInterface {
    Advertising { rssi: i8 },
    Proxy(ConnId),
}

/// Metadata of a decoded proxy configuration PDU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct NetworkRx {
    pub net_idx: u16,
    pub src: u16,
    pub seq: u32,
    pub iv_index: u32,
}

/// Mesh network layer sitting above the bearers.
pub trait Network {
    fn is_provisioned(&self) -> bool;

    fn primary_address(&self) -> u16;

    fn features(&self) -> ProxyFeatures;

    /// Decrypt a proxy configuration PDU, leaving the network header and
    /// plaintext transport PDU in `pdu`.
    fn decode_proxy_config(
        &mut self,
        data: &[u8],
        pdu: &mut Vec<u8, NET_MAX_PDU_LEN>,
    ) -> Result<NetworkRx, DeviceError>;

    /// Check and record the sequence of `rx` in the replay cache.
    fn is_replay(&mut self, rx: &NetworkRx) -> bool;

    /// Encrypt `payload` into a proxy configuration PDU, `dst` unassigned,
    /// TTL 0.
    fn encode_proxy_config(
        &mut self,
        net_idx: u16,
        src: u16,
        payload: &[u8],
        pdu: &mut Vec<u8, NET_MAX_PDU_LEN>,
    ) -> Result<(), DeviceError>;

    fn create_beacon(
        &mut self,
        net_idx: u16,
        private: bool,
        beacon: &mut Vec<u8, BEACON_MAX_LEN>,
    ) -> Result<(), DeviceError>;

    fn network_received(&mut self, pdu: &[u8], interface: NetInterface);

    fn beacon_received(&mut self, beacon: &[u8]);

    /// Service UUID list advertised by a solicitation PDU sender.
    fn solicitation_received(&mut self, addr: &BdAddr, uuids: &[u8]);

    fn pb_adv_received(&mut self, pdu: &[u8]);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum LinkCloseReason {
    Success,
    Timeout,
    Fail,
}

/// Provisioning protocol driven over PB-GATT.
pub trait Provisioning {
    fn device_info(&self) -> DeviceInfo<'_>;

    fn link_opened(&mut self);

    fn link_closed(&mut self, reason: LinkCloseReason);

    fn provisioning_received(&mut self, pdu: &[u8]);

    fn send_complete(&mut self);

    fn unprovisioned_beacon(&mut self, uuid: &[u8; 16], oob_info: u16);
}

/// Every collaborator the GATT bearers drive, bundled for event dispatch.
pub trait Context: GattServer + GattCentral + Advertiser + Scanner + Network + Provisioning {
    type Rng: RngCore;

    fn rng(&mut self) -> &mut Self::Rng;
}
