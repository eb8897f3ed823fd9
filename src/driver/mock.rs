//! Scripted host used by the stack and runner tests.

use crate::bearer::{BdAddr, ConnId, Service, CCC_UUID};
use crate::config::{AdvParams, DeviceInfo, ProxyFeatures, ScanParams, NET_HDR_LEN, NET_MAX_PDU_LEN};
use crate::driver::{
    Advertiser, Context, DeviceError, GattCentral, GattServer, Link, LinkCloseReason, NetInterface,
    Network, NetworkRx, Provisioning, Scanner, BEACON_MAX_LEN,
};
use crate::scan::ScanError;
use heapless::Vec;
use rand_core::{impls, RngCore};

pub const DATA_IN: u16 = 0x0010;
pub const DATA_OUT_CCC: u16 = 0x0013;
pub const UUID: [u8; 16] = [0xdd; 16];

/// Counts up from zero, good enough for advertising randoms.
#[derive(Default)]
pub struct Counter(u64);

impl RngCore for Counter {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Advertisement {
    pub params: AdvParams,
    pub data: std::vec::Vec<u8>,
    pub scan_data: std::vec::Vec<u8>,
}

#[derive(Default)]
pub struct Host {
    pub provisioned: bool,
    pub features: ProxyFeatures,
    pub uri: Option<&'static str>,
    pub rng: Counter,

    pub registered: std::vec::Vec<Service>,
    pub notified: std::vec::Vec<(ConnId, Service, std::vec::Vec<u8>)>,
    pub disconnected: std::vec::Vec<ConnId>,
    pub connects: std::vec::Vec<BdAddr>,
    pub discoveries: std::vec::Vec<ConnId>,
    pub write_requests: std::vec::Vec<(ConnId, u16, std::vec::Vec<u8>)>,
    pub write_commands: std::vec::Vec<(ConnId, u16, std::vec::Vec<u8>)>,
    pub advertising: Option<Advertisement>,
    pub advertised: std::vec::Vec<Advertisement>,
    pub scanning: bool,
    pub scan_params: Option<ScanParams>,

    pub network: std::vec::Vec<std::vec::Vec<u8>>,
    pub beacons: std::vec::Vec<std::vec::Vec<u8>>,

    pub links_opened: usize,
    pub links_closed: std::vec::Vec<LinkCloseReason>,
    pub provisioning: std::vec::Vec<std::vec::Vec<u8>>,
    pub prov_sent: usize,
    pub unprovisioned: std::vec::Vec<[u8; 16]>,
}

impl Host {
    pub fn provisioned() -> Self {
        Self {
            provisioned: true,
            ..Default::default()
        }
    }
}

impl Link for Host {
    fn disconnect(&mut self, conn: ConnId) -> Result<(), DeviceError> {
        self.disconnected.push(conn);
        Ok(())
    }
}

impl GattServer for Host {
    fn server_mtu(&self, _: ConnId) -> u16 {
        23
    }

    fn register_service(&mut self, service: Service) -> Result<(), DeviceError> {
        self.registered.push(service);
        Ok(())
    }

    fn remove_service(&mut self, service: Service) {
        self.registered.retain(|s| *s != service);
    }

    fn notify(&mut self, conn: ConnId, service: Service, data: &[u8]) -> Result<(), DeviceError> {
        self.notified.push((conn, service, data.to_vec()));
        Ok(())
    }
}

impl GattCentral for Host {
    fn client_mtu(&self, _: ConnId) -> u16 {
        23
    }

    fn connect(&mut self, addr: &BdAddr) -> Result<(), DeviceError> {
        self.connects.push(*addr);
        Ok(())
    }

    fn start_discovery(&mut self, conn: ConnId) -> Result<(), DeviceError> {
        self.discoveries.push(conn);
        Ok(())
    }

    fn find_characteristic(&self, _: ConnId, _: u16, _: u16) -> Option<u16> {
        Some(DATA_IN)
    }

    fn find_descriptor(&self, _: ConnId, _: u16, _: u16, descriptor: u16) -> Option<u16> {
        (descriptor == CCC_UUID).then_some(DATA_OUT_CCC)
    }

    fn write_request(&mut self, conn: ConnId, handle: u16, data: &[u8]) -> Result<(), DeviceError> {
        self.write_requests.push((conn, handle, data.to_vec()));
        Ok(())
    }

    fn write_command(&mut self, conn: ConnId, handle: u16, data: &[u8]) -> Result<(), DeviceError> {
        self.write_commands.push((conn, handle, data.to_vec()));
        Ok(())
    }
}

impl Advertiser for Host {
    fn start_advertising(
        &mut self,
        params: &AdvParams,
        adv_data: &[u8],
        scan_data: &[u8],
    ) -> Result<(), DeviceError> {
        let adv = Advertisement {
            params: *params,
            data: adv_data.to_vec(),
            scan_data: scan_data.to_vec(),
        };
        self.advertising = Some(adv.clone());
        self.advertised.push(adv);
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.advertising = None;
    }
}

impl Scanner for Host {
    fn set_scan_params(&mut self, params: &ScanParams) -> Result<(), ScanError> {
        self.scan_params = Some(*params);
        Ok(())
    }

    fn start_scan(&mut self) -> Result<(), ScanError> {
        self.scanning = true;
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), ScanError> {
        self.scanning = false;
        Ok(())
    }
}

impl Network for Host {
    fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    fn primary_address(&self) -> u16 {
        0x0001
    }

    fn features(&self) -> ProxyFeatures {
        self.features
    }

    // Cleartext: nine zero bytes of network header, then the payload.
    fn decode_proxy_config(
        &mut self,
        data: &[u8],
        pdu: &mut Vec<u8, NET_MAX_PDU_LEN>,
    ) -> Result<NetworkRx, DeviceError> {
        pdu.extend_from_slice(&[0; NET_HDR_LEN])
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        pdu.extend_from_slice(data)
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        Ok(NetworkRx {
            net_idx: 0,
            src: 0x0100,
            seq: 1,
            iv_index: 0,
        })
    }

    fn is_replay(&mut self, _: &NetworkRx) -> bool {
        false
    }

    fn encode_proxy_config(
        &mut self,
        _: u16,
        _: u16,
        payload: &[u8],
        pdu: &mut Vec<u8, NET_MAX_PDU_LEN>,
    ) -> Result<(), DeviceError> {
        pdu.extend_from_slice(payload)
            .map_err(|_| DeviceError::InsufficientBuffer)
    }

    fn create_beacon(
        &mut self,
        net_idx: u16,
        private: bool,
        beacon: &mut Vec<u8, BEACON_MAX_LEN>,
    ) -> Result<(), DeviceError> {
        beacon
            .extend_from_slice(&[if private { 2 } else { 1 }, net_idx as u8])
            .map_err(|_| DeviceError::InsufficientBuffer)
    }

    fn network_received(&mut self, pdu: &[u8], _: NetInterface) {
        self.network.push(pdu.to_vec());
    }

    fn beacon_received(&mut self, beacon: &[u8]) {
        self.beacons.push(beacon.to_vec());
    }

    fn solicitation_received(&mut self, _: &BdAddr, _: &[u8]) {}

    fn pb_adv_received(&mut self, _: &[u8]) {}
}

impl Provisioning for Host {
    fn device_info(&self) -> DeviceInfo<'_> {
        DeviceInfo {
            uuid: UUID,
            oob_info: 0,
            uri: self.uri,
            name: Some("node"),
        }
    }

    fn link_opened(&mut self) {
        self.links_opened += 1;
    }

    fn link_closed(&mut self, reason: LinkCloseReason) {
        self.links_closed.push(reason);
    }

    fn provisioning_received(&mut self, pdu: &[u8]) {
        self.provisioning.push(pdu.to_vec());
    }

    fn send_complete(&mut self) {
        self.prov_sent += 1;
    }

    fn unprovisioned_beacon(&mut self, uuid: &[u8; 16], _: u16) {
        self.unprovisioned.push(*uuid);
    }
}

impl Context for Host {
    type Rng = Counter;

    fn rng(&mut self) -> &mut Counter {
        &mut self.rng
    }
}
