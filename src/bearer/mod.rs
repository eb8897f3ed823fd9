//! GATT bearer shared by the proxy and provisioning services.

pub mod gatt_client;
pub mod role;

use crate::driver::{DeviceError, GattCentral, GattServer};

#[cfg(feature = "defmt")]
use defmt::Format;

pub const CCC_UUID: u16 = 0x2902;
pub const CCC_NOTIFY: u16 = 0x0001;

/// Handle of a link assigned by the BLE host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct ConnId(pub u8);

/// Our side of the GATT exchange on a link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum GattRole {
    /// We expose the service and notify the peer.
    Server,
    /// We discovered the peer's service and write to it.
    Client,
}

/// Layer that set a role up and receives its complete messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Owner {
    ProxyServer,
    ProxyClient,
    ProvisioningServer,
    ProvisioningClient,
}

impl Owner {
    pub fn gatt_role(&self) -> GattRole {
        match self {
            Self::ProxyServer | Self::ProvisioningServer => GattRole::Server,
            Self::ProxyClient | Self::ProvisioningClient => GattRole::Client,
        }
    }

    pub fn service(&self) -> Service {
        match self {
            Self::ProxyServer | Self::ProxyClient => Service::Proxy,
            Self::ProvisioningServer | Self::ProvisioningClient => Service::Provisioning,
        }
    }
}

/// Notification owed to the sender once the final fragment is acknowledged.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Completion {
    FilterOperation,
    ProvisioningPDU,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Service {
    Proxy,
    Provisioning,
}

impl Service {
    pub fn uuid(&self) -> u16 {
        match self {
            Self::Proxy => 0x1828,
            Self::Provisioning => 0x1827,
        }
    }

    pub fn data_in_uuid(&self) -> u16 {
        match self {
            Self::Proxy => 0x2ADD,
            Self::Provisioning => 0x2ADB,
        }
    }

    pub fn data_out_uuid(&self) -> u16 {
        match self {
            Self::Proxy => 0x2ADE,
            Self::Provisioning => 0x2ADC,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum AddressKind {
    Public,
    Random,
}

/// Peer device address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct BdAddr {
    pub kind: AddressKind,
    pub addr: [u8; 6],
}

impl BdAddr {
    pub fn new(kind: AddressKind, addr: [u8; 6]) -> Self {
        Self { kind, addr }
    }
}

/// Moves one fragment onto the link, as a notification or a write command
/// depending on which side of GATT we are.
pub trait Transmit {
    /// Negotiated ATT MTU of the link.
    fn mtu(&self, conn: ConnId) -> u16;

    fn transmit(&mut self, conn: ConnId, fragment: &[u8]) -> Result<(), DeviceError>;
}

/// Fragments leave as notifications on the data out characteristic.
pub struct NotifyTx<'c, C: ?Sized> {
    ctx: &'c mut C,
    service: Service,
}

impl<'c, C: GattServer + ?Sized> NotifyTx<'c, C> {
    pub fn new(ctx: &'c mut C, service: Service) -> Self {
        Self { ctx, service }
    }
}

impl<C: GattServer + ?Sized> Transmit for NotifyTx<'_, C> {
    fn mtu(&self, conn: ConnId) -> u16 {
        self.ctx.server_mtu(conn)
    }

    fn transmit(&mut self, conn: ConnId, fragment: &[u8]) -> Result<(), DeviceError> {
        self.ctx.notify(conn, self.service, fragment)
    }
}

/// Fragments leave as write commands on the peer's data in characteristic.
pub struct WriteTx<'c, C: ?Sized> {
    ctx: &'c mut C,
    handle: u16,
}

impl<'c, C: GattCentral + ?Sized> WriteTx<'c, C> {
    pub fn new(ctx: &'c mut C, handle: u16) -> Self {
        Self { ctx, handle }
    }
}

impl<C: GattCentral + ?Sized> Transmit for WriteTx<'_, C> {
    fn mtu(&self, conn: ConnId) -> u16 {
        self.ctx.client_mtu(conn)
    }

    fn transmit(&mut self, conn: ConnId, fragment: &[u8]) -> Result<(), DeviceError> {
        self.ctx.write_command(conn, self.handle, fragment)
    }
}
