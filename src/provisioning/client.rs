//! PB-GATT client: reaches unprovisioned devices advertising the
//! provisioning service.

use crate::bearer::gatt_client::GattClient;
use crate::bearer::role::Roles;
use crate::bearer::{Completion, ConnId, Owner, WriteTx};
use crate::driver::{DeviceError, GattCentral, Provisioning};
use crate::pdu::advertising::ProvisioningServiceData;
use crate::pdu::proxy::MessageType;
use crate::provisioning::link::PbGattLink;
use embassy_time::Instant;

#[derive(Default)]
pub struct PbGattClient {
    /// Device UUID we are looking for.
    target: Option<[u8; 16]>,
    srv: Option<ConnId>,
}

impl PbGattClient {
    pub const fn new() -> Self {
        Self {
            target: None,
            srv: None,
        }
    }

    pub fn conn(&self) -> Option<ConnId> {
        self.srv
    }

    pub fn target(&self) -> Option<&[u8; 16]> {
        self.target.as_ref()
    }

    /// Look for the device with `uuid`, or stop looking with `None`.
    pub fn setup(&mut self, uuid: Option<[u8; 16]>) -> Result<(), DeviceError> {
        if self.srv.is_some() {
            return Err(DeviceError::Busy);
        }
        self.target = uuid;
        Ok(())
    }

    /// Returns true when the advertiser is the device we are looking for.
    /// Other devices are reported as unprovisioned beacons.
    pub fn adv_recv<C: Provisioning + ?Sized>(
        &self,
        ctx: &mut C,
        data: &ProvisioningServiceData,
    ) -> bool {
        if self.srv.is_some() {
            return false;
        }
        if self.target.as_ref() == Some(&data.uuid) {
            return true;
        }
        ctx.unprovisioned_beacon(&data.uuid, data.oob_info);
        false
    }

    pub fn connected<const N: usize>(
        &mut self,
        roles: &mut Roles<N>,
        link: &mut PbGattLink,
        conn: ConnId,
        now: Instant,
    ) {
        if let Err(e) = roles.setup(conn, Owner::ProvisioningClient) {
            error!("PB-GATT client role setup failed: {:?}", e);
            return;
        }
        self.srv = Some(conn);
        self.target = None;
        if let Err(e) = link.cli_start(conn, now) {
            warn!("PB-GATT client link start failed: {:?}", e);
        }
    }

    pub fn link_open<C: Provisioning + ?Sized>(
        &mut self,
        ctx: &mut C,
        link: &mut PbGattLink,
        conn: ConnId,
    ) {
        if let Err(e) = link.cli_open(ctx, conn) {
            warn!("link open failed: {:?}", e);
        }
    }

    pub fn disconnected<C: Provisioning + ?Sized, const N: usize>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        link: &mut PbGattLink,
        conn: ConnId,
    ) {
        if let Err(e) = link.close(ctx, conn) {
            debug!("no link on {:?}: {:?}", conn, e);
        }
        if self.srv == Some(conn) {
            roles.cleanup(conn);
            self.srv = None;
        }
    }

    /// Notification received from the device.
    pub fn notification<C: Provisioning + ?Sized, const N: usize>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        link: &mut PbGattLink,
        conn: ConnId,
        data: &[u8],
        now: Instant,
    ) -> Result<(), DeviceError> {
        if let Some(msg) = roles.recv(conn, data, now)? {
            match msg.message_type {
                MessageType::ProvisioningPDU => link.recv(ctx, conn, &msg.payload, now)?,
                other => warn!("unhandled message type {:?}", other),
            }
        }
        Ok(())
    }

    /// Write a provisioning PDU to the device's data in characteristic.
    pub fn send<C: GattCentral + ?Sized, const N: usize, const G: usize>(
        &self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        gatt: &GattClient<G>,
        conn: ConnId,
        pdu: &[u8],
    ) -> Result<(), DeviceError> {
        if self.srv != Some(conn) {
            return Err(DeviceError::NotConnected);
        }
        let handle = gatt.data_in_handle(conn).ok_or(DeviceError::NotConnected)?;
        roles.send(
            &mut WriteTx::new(ctx, handle),
            conn,
            MessageType::ProvisioningPDU,
            pdu,
            Some(Completion::ProvisioningPDU),
        )
    }
}
