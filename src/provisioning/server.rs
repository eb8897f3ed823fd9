//! Mesh Provisioning service hosted while the node is unprovisioned.

use crate::bearer::role::Roles;
use crate::bearer::{Completion, ConnId, NotifyTx, Owner, Service, CCC_NOTIFY};
use crate::config::{AdvParams, FAST_ADV_TIME, SVC_REG_ATTEMPTS, SVC_REG_RETRY};
use crate::driver::deadline::Deadline;
use crate::driver::{Context, DeviceError, GattServer, Network, Provisioning};
use crate::pdu::advertising::{
    provisioning_advertisement, scan_response, AdvertisingData, ProvisioningServiceData,
};
use crate::pdu::proxy::{Header, MessageType};
use crate::provisioning::link::PbGattLink;
use embassy_time::{Duration, Instant};

/// Longest URI that fits a scan response next to its AD header.
const MAX_URI_LEN: usize = 29;

pub struct PbGattServer {
    registered: bool,
    registration: Deadline,
    attempts_left: u8,
    cli: Option<ConnId>,
    cccd: u16,
    fast_adv_since: Instant,
    adv_update: bool,
}

impl Default for PbGattServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PbGattServer {
    pub const fn new() -> Self {
        Self {
            registered: false,
            registration: Deadline::new(),
            attempts_left: 0,
            cli: None,
            cccd: 0,
            fast_adv_since: Instant::from_ticks(0),
            adv_update: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn take_adv_update(&mut self) -> bool {
        core::mem::take(&mut self.adv_update)
    }

    /// Schedule registration of the Mesh Provisioning service.
    pub fn enable<C: Network + ?Sized>(&mut self, ctx: &C, now: Instant) -> Result<(), DeviceError> {
        if ctx.is_provisioned() {
            return Err(DeviceError::NotSupported);
        }
        if self.registered || self.registration.is_scheduled() {
            return Err(DeviceError::Busy);
        }
        debug!("enabling PB-GATT");
        self.attempts_left = SVC_REG_ATTEMPTS;
        self.registration.schedule(now, SVC_REG_RETRY);
        Ok(())
    }

    fn register<C: GattServer + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        if let Err(e) = ctx.register_service(Service::Provisioning) {
            self.attempts_left = self.attempts_left.saturating_sub(1);
            if self.attempts_left > 0 {
                self.registration.schedule(now, SVC_REG_RETRY);
            } else {
                error!("unable to register mesh provisioning service: {:?}", e);
            }
            return;
        }
        info!("mesh provisioning service registered");
        self.registered = true;
        self.fast_adv_since = now;
        self.adv_update = true;
    }

    pub fn disable<C: GattServer + ?Sized>(&mut self, ctx: &mut C) -> Result<(), DeviceError> {
        self.registration.cancel();
        if !self.registered {
            return Err(DeviceError::Already);
        }
        ctx.remove_service(Service::Provisioning);
        self.registered = false;
        self.adv_update = true;
        Ok(())
    }

    pub fn poll<C: GattServer + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        if self.registration.poll(now) {
            self.register(ctx, now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registration.expires_at()
    }

    /// A peripheral link came up.
    pub fn connected<C: Network + ?Sized, const N: usize>(
        &mut self,
        ctx: &C,
        roles: &mut Roles<N>,
        conn: ConnId,
    ) {
        if !self.registered || ctx.is_provisioned() || self.cli.is_some() {
            return;
        }
        if let Err(e) = roles.setup(conn, Owner::ProvisioningServer) {
            error!("provisioning role setup failed: {:?}", e);
            return;
        }
        info!("provisioner connected {:?}", conn);
        self.cli = Some(conn);
        self.cccd = 0;
    }

    pub fn disconnected<C: GattServer + Network + Provisioning + ?Sized, const N: usize>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        link: &mut PbGattLink,
        conn: ConnId,
    ) {
        if !self.registered || self.cli != Some(conn) {
            return;
        }
        info!("provisioner disconnected {:?}", conn);
        roles.cleanup(conn);
        self.cli = None;
        if let Err(e) = link.close(ctx, conn) {
            warn!("link close failed: {:?}", e);
        }
        self.adv_update = true;

        if ctx.is_provisioned() {
            if let Err(e) = self.disable(ctx) {
                warn!("PB-GATT disable failed: {:?}", e);
            }
        }
    }

    pub fn ccc_write<C: Provisioning + ?Sized>(
        &mut self,
        ctx: &mut C,
        link: &mut PbGattLink,
        conn: ConnId,
        value: u16,
        now: Instant,
    ) {
        if self.cli != Some(conn) {
            error!("no PB-GATT client found");
            return;
        }
        if value != CCC_NOTIFY {
            warn!("client wrote 0x{:04x} instead of enabling notify", value);
            return;
        }
        self.cccd = value;
        if let Err(e) = link.start(ctx, conn, now) {
            warn!("PB-GATT link start failed: {:?}", e);
        }
    }

    pub fn ccc_read(&self, conn: ConnId) -> Option<u16> {
        self.cli.filter(|cli| *cli == conn).map(|_| self.cccd)
    }

    /// Fragment written to the provisioning data in characteristic.
    pub fn write<C: Provisioning + ?Sized, const N: usize>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        link: &mut PbGattLink,
        conn: ConnId,
        data: &[u8],
        now: Instant,
    ) -> Result<(), DeviceError> {
        if self.cli != Some(conn) {
            error!("no PB-GATT client found");
            return Err(DeviceError::NotConnected);
        }
        let header = data.first().ok_or_else(|| {
            warn!("too small proxy PDU");
            DeviceError::InvalidArgument
        })?;
        if Header::parse(*header).message_type != MessageType::ProvisioningPDU {
            warn!("proxy PDU type doesn't match GATT service");
            return Err(DeviceError::InvalidArgument);
        }

        if let Some(msg) = roles.recv(conn, data, now)? {
            match msg.message_type {
                MessageType::ProvisioningPDU => link.recv(ctx, conn, &msg.payload, now)?,
                other => warn!("unhandled message type {:?}", other),
            }
        }
        Ok(())
    }

    /// Notify a provisioning PDU to the connected provisioner.
    pub fn send<C: GattServer + ?Sized, const N: usize>(
        &self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        conn: ConnId,
        pdu: &[u8],
    ) -> Result<(), DeviceError> {
        if self.cli != Some(conn) || self.cccd != CCC_NOTIFY {
            error!("no PB-GATT client found");
            return Err(DeviceError::NotConnected);
        }
        roles.send(
            &mut NotifyTx::new(ctx, Service::Provisioning),
            conn,
            MessageType::ProvisioningPDU,
            pdu,
            Some(Completion::ProvisioningPDU),
        )
    }

    /// Advertise the unprovisioned device. Fast for the first minute after
    /// enabling, then slow for good. Returns how long the fast phase lasts.
    pub fn adv_start<C: Context + ?Sized, const N: usize>(
        &mut self,
        ctx: &mut C,
        roles: &Roles<N>,
        now: Instant,
    ) -> Option<Duration> {
        if !self.registered
            || ctx.is_provisioned()
            || !roles.has_available_conn()
            || self.cli.is_some()
        {
            return None;
        }

        let info = ctx.device_info();
        let service_data = ProvisioningServiceData {
            uuid: info.uuid,
            oob_info: info.oob_info,
        };
        let data = match provisioning_advertisement(&service_data) {
            Ok(data) => data,
            Err(_) => {
                warn!("failed to build provisioning advertisement");
                return None;
            }
        };
        let scan_data = match info.uri {
            Some(uri) if uri.len() > MAX_URI_LEN => {
                warn!("too long URI to fit advertising packet");
                AdvertisingData::new()
            }
            uri => scan_response(info.name, uri).unwrap_or_default(),
        };
        let connectable_only = scan_data.is_empty();

        let elapsed = now.saturating_duration_since(self.fast_adv_since);
        if elapsed >= FAST_ADV_TIME {
            let mut params = AdvParams::slow(None);
            params.connectable_only = connectable_only;
            if ctx.start_advertising(&params, &data, &scan_data).is_err() {
                warn!("failed to advertise");
            }
            return None;
        }

        let remaining = FAST_ADV_TIME - elapsed;
        debug!("remaining fast adv time {} ms", remaining.as_millis());
        let mut params = AdvParams::fast(Some(remaining));
        params.connectable_only = connectable_only;
        if ctx.start_advertising(&params, &data, &scan_data).is_err() {
            warn!("failed to advertise");
            return None;
        }
        Some(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::BdAddr;
    use crate::config::{DeviceInfo, ProxyFeatures, NET_MAX_PDU_LEN};
    use crate::driver::{Link, LinkCloseReason, NetInterface, NetworkRx, BEACON_MAX_LEN};
    use heapless::Vec;

    #[derive(Default)]
    struct Device {
        provisioned: bool,
        register_failures: usize,
        services: std::vec::Vec<Service>,
        notified: std::vec::Vec<std::vec::Vec<u8>>,
        opened: usize,
        closed: std::vec::Vec<LinkCloseReason>,
        received: std::vec::Vec<std::vec::Vec<u8>>,
    }

    impl Link for Device {
        fn disconnect(&mut self, _: ConnId) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    impl GattServer for Device {
        fn server_mtu(&self, _: ConnId) -> u16 {
            23
        }

        fn register_service(&mut self, service: Service) -> Result<(), DeviceError> {
            if self.register_failures > 0 {
                self.register_failures -= 1;
                return Err(DeviceError::Busy);
            }
            self.services.push(service);
            Ok(())
        }

        fn remove_service(&mut self, service: Service) {
            self.services.retain(|s| *s != service);
        }

        fn notify(&mut self, _: ConnId, _: Service, data: &[u8]) -> Result<(), DeviceError> {
            self.notified.push(data.to_vec());
            Ok(())
        }
    }

    impl Network for Device {
        fn is_provisioned(&self) -> bool {
            self.provisioned
        }

        fn primary_address(&self) -> u16 {
            0
        }

        fn features(&self) -> ProxyFeatures {
            ProxyFeatures::default()
        }

        fn decode_proxy_config(
            &mut self,
            _: &[u8],
            _: &mut Vec<u8, NET_MAX_PDU_LEN>,
        ) -> Result<NetworkRx, DeviceError> {
            Err(DeviceError::NotSupported)
        }

        fn is_replay(&mut self, _: &NetworkRx) -> bool {
            false
        }

        fn encode_proxy_config(
            &mut self,
            _: u16,
            _: u16,
            _: &[u8],
            _: &mut Vec<u8, NET_MAX_PDU_LEN>,
        ) -> Result<(), DeviceError> {
            Err(DeviceError::NotSupported)
        }

        fn create_beacon(
            &mut self,
            _: u16,
            _: bool,
            _: &mut Vec<u8, BEACON_MAX_LEN>,
        ) -> Result<(), DeviceError> {
            Err(DeviceError::NotSupported)
        }

        fn network_received(&mut self, _: &[u8], _: NetInterface) {}

        fn beacon_received(&mut self, _: &[u8]) {}

        fn solicitation_received(&mut self, _: &BdAddr, _: &[u8]) {}

        fn pb_adv_received(&mut self, _: &[u8]) {}
    }

    impl Provisioning for Device {
        fn device_info(&self) -> DeviceInfo<'_> {
            DeviceInfo {
                uuid: [0xDD; 16],
                oob_info: 0,
                uri: None,
                name: None,
            }
        }

        fn link_opened(&mut self) {
            self.opened += 1;
        }

        fn link_closed(&mut self, reason: LinkCloseReason) {
            self.closed.push(reason);
        }

        fn provisioning_received(&mut self, pdu: &[u8]) {
            self.received.push(pdu.to_vec());
        }

        fn send_complete(&mut self) {}

        fn unprovisioned_beacon(&mut self, _: &[u8; 16], _: u16) {}
    }

    const CONN: ConnId = ConnId(2);

    #[test]
    fn enable_and_disable() {
        let mut device = Device::default();
        let mut server = PbGattServer::new();
        let now = Instant::from_secs(0);

        server.enable(&device, now).unwrap();
        assert_eq!(server.enable(&device, now), Err(DeviceError::Busy));
        assert!(device.services.is_empty());

        device.register_failures = 4;
        for ms in 1..=4 {
            server.poll(&mut device, Instant::from_millis(ms * 10));
            assert!(!server.is_registered());
        }
        server.poll(&mut device, Instant::from_millis(50));
        assert!(server.is_registered());
        assert_eq!(device.services, [Service::Provisioning]);
        assert!(server.take_adv_update());
        assert_eq!(server.enable(&device, now), Err(DeviceError::Busy));

        server.disable(&mut device).unwrap();
        assert!(device.services.is_empty());
        assert!(server.take_adv_update());
        assert_eq!(server.disable(&mut device), Err(DeviceError::Already));

        device.provisioned = true;
        assert_eq!(server.enable(&device, now), Err(DeviceError::NotSupported));
    }

    #[test]
    fn registration_gives_up() {
        let mut device = Device::default();
        let mut server = PbGattServer::new();
        device.register_failures = 5;
        server.enable(&device, Instant::from_secs(0)).unwrap();
        for ms in 1..=6 {
            server.poll(&mut device, Instant::from_millis(ms * 10));
        }
        assert!(!server.is_registered());
        assert_eq!(server.next_deadline(), None);
    }

    #[test]
    fn provisioning_session() {
        let mut device = Device::default();
        let mut server = PbGattServer::new();
        let mut roles: Roles<2> = Roles::new();
        let mut link = PbGattLink::new();
        let now = Instant::from_secs(0);
        server.enable(&device, now).unwrap();
        server.poll(&mut device, Instant::from_millis(10));

        server.connected(&device, &mut roles, CONN);
        assert_eq!(roles.owner(CONN), Some(Owner::ProvisioningServer));
        // Only one provisioner at a time.
        server.connected(&device, &mut roles, ConnId(9));
        assert_eq!(roles.count(), 1);

        assert_eq!(
            server.send(&mut device, &mut roles, CONN, &[0x01]),
            Err(DeviceError::NotConnected)
        );
        server.ccc_write(&mut device, &mut link, CONN, 0x0002, now);
        assert_eq!(device.opened, 0);
        server.ccc_write(&mut device, &mut link, CONN, CCC_NOTIFY, now);
        assert_eq!(device.opened, 1);
        assert_eq!(server.ccc_read(CONN), Some(CCC_NOTIFY));

        assert_eq!(
            server.write(&mut device, &mut roles, &mut link, CONN, &[0x00, 0x01], now),
            Err(DeviceError::InvalidArgument)
        );
        server
            .write(&mut device, &mut roles, &mut link, CONN, &[0x03, 0x00, 0x1F], now)
            .unwrap();
        assert_eq!(device.received, [vec![0x00, 0x1F]]);

        server
            .send(&mut device, &mut roles, CONN, &[0x01, 0x02])
            .unwrap();
        assert_eq!(device.notified, [vec![0x03, 0x01, 0x02]]);

        device.provisioned = true;
        server.disconnected(&mut device, &mut roles, &mut link, CONN);
        assert_eq!(device.closed, [LinkCloseReason::Success]);
        assert_eq!(roles.count(), 0);
        assert!(!server.is_registered());
        assert!(server.take_adv_update());
    }
}
