//! Proxy client: connects to advertising proxy servers and drives their
//! filters.

use crate::address::{self, UNASSIGNED};
use crate::bearer::gatt_client::GattClient;
use crate::bearer::role::{Inbound, Roles};
use crate::bearer::{ConnId, Completion, Owner, WriteTx};
use crate::config::{MAX_FILTER_ADDRS, NET_HDR_LEN, NET_MAX_PDU_LEN, PROXY_OP_TIMEOUT};
use crate::crypto::{node_identity_hash, private_network_hash};
use crate::driver::deadline::{earliest, Deadline};
use crate::driver::{DeviceError, GattCentral, Link, NetInterface, Network};
use crate::pdu::configuration::{FilterType, ProxyConfigMessage, FILTER_STATUS, MAX_ADDRESSES};
use crate::pdu::advertising::{IdentificationType, ProxyServiceData};
use crate::pdu::proxy::MessageType;
use crate::subnet::{Subnet, SubnetEvent, Subnets, KEY_ANY};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Instant;
use heapless::Vec;

/// Completion of a filter operation: `Ok` once the server answered with a
/// Filter Status, `TimedOut` when it never did or the link dropped.
pub type FilterStatus = Signal<CriticalSectionRawMutex, Result<(), DeviceError>>;

/// One proxy server we want to be, or are, connected to.
struct Server<'a> {
    conn: Option<ConnId>,
    link_opened: bool,
    /// `KEY_ANY` while the record is free.
    net_idx: u16,
    /// Unicast address expected in Node Identity beacons.
    id_addr: u16,
    pending: Option<u8>,
    status: Option<&'a FilterStatus>,
    op_timer: Deadline,
}

impl<'a> Server<'a> {
    const fn new() -> Self {
        Self {
            conn: None,
            link_opened: false,
            net_idx: KEY_ANY,
            id_addr: UNASSIGNED,
            pending: None,
            status: None,
            op_timer: Deadline::new(),
        }
    }

    fn resolve(&mut self, result: Result<(), DeviceError>) {
        if let Some(status) = self.status.take() {
            status.signal(result);
        }
    }
}

pub struct ProxyClient<'a, const N: usize> {
    servers: [Server<'a>; N],
    /// Connect to proxies of any known subnet.
    allow_all: bool,
}

impl<'a, const N: usize> Default for ProxyClient<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> ProxyClient<'a, N> {
    pub fn new() -> Self {
        Self {
            servers: core::array::from_fn(|_| Server::new()),
            allow_all: false,
        }
    }

    fn find(&self, net_idx: u16, connected: bool, disconnected: bool) -> Option<usize> {
        self.servers.iter().position(|srv| {
            let usable = match srv.conn {
                Some(_) => connected,
                None => disconnected,
            };
            usable && srv.net_idx == net_idx
        })
    }

    fn by_conn(&mut self, conn: ConnId) -> Option<&mut Server<'a>> {
        self.servers.iter_mut().find(|srv| srv.conn == Some(conn))
    }

    /// Ask for a proxy connection on `net_idx`, or on every subnet with
    /// `KEY_ANY`.
    pub fn connect(&mut self, net_idx: u16) -> Result<(), DeviceError> {
        if net_idx == KEY_ANY {
            if self.allow_all {
                return Err(DeviceError::Already);
            }
            self.allow_all = true;
            return Ok(());
        }
        self.claim(net_idx).map(|_| ())
    }

    /// Ask for a connection to the proxy with unicast address `addr`.
    pub fn connect_node_id(&mut self, net_idx: u16, addr: u16) -> Result<(), DeviceError> {
        if !address::is_unicast(addr) {
            return Err(DeviceError::InvalidArgument);
        }
        let idx = self.claim(net_idx)?;
        self.servers[idx].id_addr = addr;
        Ok(())
    }

    fn claim(&mut self, net_idx: u16) -> Result<usize, DeviceError> {
        if self.find(net_idx, true, true).is_some() {
            return Err(DeviceError::Already);
        }
        let idx = self.find(KEY_ANY, false, true).ok_or(DeviceError::NoMemory)?;
        self.servers[idx].net_idx = net_idx;
        Ok(idx)
    }

    /// Stop wanting a proxy on `net_idx`, dropping the link if up.
    pub fn disconnect<C: Link + ?Sized>(&mut self, ctx: &mut C, net_idx: u16) -> Result<(), DeviceError> {
        if net_idx != KEY_ANY {
            let idx = self.find(net_idx, true, true).ok_or(DeviceError::Already)?;
            let srv = &mut self.servers[idx];
            srv.net_idx = KEY_ANY;
            srv.id_addr = UNASSIGNED;
            return match srv.conn {
                Some(conn) => ctx.disconnect(conn),
                None => Ok(()),
            };
        }

        if !self.allow_all {
            return Err(DeviceError::Already);
        }
        self.allow_all = false;

        let mut result = Ok(());
        for srv in self.servers.iter_mut() {
            srv.net_idx = KEY_ANY;
            if let Some(conn) = srv.conn {
                if let Err(e) = ctx.disconnect(conn) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    pub fn is_connected(&self, net_idx: u16) -> bool {
        self.find(net_idx, true, false).is_some()
    }

    pub fn subnet_event<C: Link + ?Sized>(&mut self, ctx: &mut C, net_idx: u16, event: SubnetEvent) {
        if event == SubnetEvent::Deleted {
            if let Err(e) = self.disconnect(ctx, net_idx) {
                debug!("no proxy to drop for 0x{:04x}: {:?}", net_idx, e);
            }
        }
    }

    /// Match a proxy advertisement against the subnets we want a proxy for.
    /// Returns the record to connect for.
    pub fn adv_recv<const S: usize>(
        &mut self,
        subnets: &Subnets<S>,
        data: &ProxyServiceData,
    ) -> Option<usize> {
        match data {
            ProxyServiceData::NetworkId(network_id) => {
                for sub in subnets.iter() {
                    if let Some(found) = self.check_and_get(sub, Some(network_id)) {
                        return found;
                    }
                }
                None
            }
            ProxyServiceData::Identity {
                kind: IdentificationType::PrivateNetworkIdentity,
                hash,
                random,
            } => {
                for sub in subnets.iter() {
                    let matched = sub.rx_keys().any(|keys| {
                        private_network_hash(&keys.identity_key, &keys.network_id, random)
                            .map(|h| h == *hash)
                            .unwrap_or(false)
                    });
                    if !matched {
                        continue;
                    }
                    if let Some(found) = self.check_and_get(sub, None) {
                        return found;
                    }
                }
                None
            }
            ProxyServiceData::Identity { kind, hash, random } => {
                let private = kind.is_private();
                for sub in subnets.iter() {
                    let idx = match self.find(sub.net_idx, false, true) {
                        Some(idx) => idx,
                        None => continue,
                    };
                    let addr = self.servers[idx].id_addr;
                    let matched = sub.rx_keys().any(|keys| {
                        node_identity_hash(&keys.identity_key, random, addr, private)
                            .map(|h| h == *hash)
                            .unwrap_or(false)
                    });
                    if matched {
                        debug!("node identity of 0x{:04x} matched", addr);
                        return Some(idx);
                    }
                }
                None
            }
        }
    }

    // `None` moves on to the next subnet, `Some(None)` stops the search
    // without a record.
    fn check_and_get(&mut self, sub: &Subnet, network_id: Option<&[u8; 8]>) -> Option<Option<usize>> {
        let idx = match self.find(sub.net_idx, true, true) {
            Some(idx) if self.servers[idx].conn.is_some() => return Some(None),
            Some(idx) => idx,
            None if !self.allow_all => return None,
            None => match self.find(KEY_ANY, false, true) {
                Some(idx) => idx,
                None => return Some(None),
            },
        };

        if let Some(network_id) = network_id {
            if !sub.rx_keys().any(|keys| keys.network_id == *network_id) {
                return None;
            }
        }
        self.servers[idx].net_idx = sub.net_idx;
        Some(Some(idx))
    }

    /// A central link requested for record `idx` came up.
    pub fn connected<const R: usize>(&mut self, roles: &mut Roles<R>, conn: ConnId, idx: usize) {
        let srv = match self.servers.get_mut(idx) {
            Some(srv) => srv,
            None => return,
        };
        if let Err(e) = roles.setup(conn, Owner::ProxyClient) {
            error!("proxy client role setup failed: {:?}", e);
            return;
        }
        info!("proxy server connected {:?}", conn);
        srv.conn = Some(conn);
        srv.status = None;
    }

    /// Notifications of the data out characteristic are enabled.
    pub fn link_open(&mut self, conn: ConnId) {
        if let Some(srv) = self.by_conn(conn) {
            debug!("proxy link open {:?}", conn);
            srv.link_opened = true;
        }
    }

    pub fn disconnected<const R: usize>(&mut self, roles: &mut Roles<R>, conn: ConnId) {
        let srv = match self.by_conn(conn) {
            Some(srv) => srv,
            None => return,
        };
        info!("proxy server disconnected {:?}", conn);
        srv.conn = None;
        srv.link_opened = false;
        srv.pending = None;
        srv.op_timer.cancel();
        srv.resolve(Err(DeviceError::TimedOut));
        roles.cleanup(conn);
    }

    /// Final fragment of a filter operation left, with `result`.
    pub fn sent(&mut self, conn: ConnId, result: Result<(), DeviceError>) {
        if let Err(e) = result {
            if let Some(srv) = self.by_conn(conn) {
                warn!("filter operation not sent: {:?}", e);
                srv.pending = None;
                srv.op_timer.cancel();
                srv.resolve(Err(e));
            }
        }
    }

    /// Notification received from a proxy server.
    pub fn notification<C: Network + ?Sized, const R: usize>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<R>,
        conn: ConnId,
        data: &[u8],
        now: Instant,
    ) -> Result<(), DeviceError> {
        if let Some(msg) = roles.recv(conn, data, now)? {
            self.received(ctx, msg);
        }
        Ok(())
    }

    fn received<C: Network + ?Sized>(&mut self, ctx: &mut C, msg: Inbound) {
        match msg.message_type {
            MessageType::NetworkPDU => {
                ctx.network_received(&msg.payload, NetInterface::Proxy(msg.conn));
            }
            MessageType::MeshBeacon => ctx.beacon_received(&msg.payload),
            MessageType::ProxyConfiguration => self.configuration(ctx, msg.conn, &msg.payload),
            other => warn!("unhandled message type {:?}", other),
        }
    }

    fn configuration<C: Network + ?Sized>(&mut self, ctx: &mut C, conn: ConnId, data: &[u8]) {
        let mut pdu: Vec<u8, NET_MAX_PDU_LEN> = Vec::new();
        let rx = match ctx.decode_proxy_config(data, &mut pdu) {
            Ok(rx) => rx,
            Err(e) => {
                error!("failed to decode proxy configuration: {:?}", e);
                return;
            }
        };
        if ctx.is_replay(&rx) {
            warn!("replay: src 0x{:04x} seq 0x{:06x}", rx.src, rx.seq);
            return;
        }

        let payload = pdu.get(NET_HDR_LEN..).unwrap_or(&[]);
        match payload.first() {
            None => warn!("too short proxy configuration PDU"),
            Some(&FILTER_STATUS) => {
                if let Ok(ProxyConfigMessage::FilterStatus {
                    filter_type,
                    list_size,
                }) = ProxyConfigMessage::parse(payload)
                {
                    debug!("filter status {:?} size {}", filter_type, list_size);
                }
                if let Some(srv) = self.by_conn(conn) {
                    srv.pending = None;
                    srv.op_timer.cancel();
                    srv.resolve(Ok(()));
                }
            }
            Some(opcode) => warn!("unhandled configuration opcode 0x{:02x}", opcode),
        }
    }

    /// Switch the filter type of the proxy serving `net_idx`.
    pub fn filter_set<
        C: GattCentral + Network + ?Sized,
        const R: usize,
        const G: usize,
        const S: usize,
    >(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<R>,
        gatt: &GattClient<G>,
        subnets: &Subnets<S>,
        net_idx: u16,
        filter_type: FilterType,
        status: Option<&'a FilterStatus>,
        now: Instant,
    ) -> Result<(), DeviceError> {
        let msg = ProxyConfigMessage::SetFilterType(filter_type);
        self.filter_op(ctx, roles, gatt, subnets, net_idx, &msg, status, now)
    }

    /// Add `addrs` to, or remove them from, the proxy's filter list.
    pub fn filter_addr_op<
        C: GattCentral + Network + ?Sized,
        const R: usize,
        const G: usize,
        const S: usize,
    >(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<R>,
        gatt: &GattClient<G>,
        subnets: &Subnets<S>,
        net_idx: u16,
        addrs: &[u16],
        add: bool,
        status: Option<&'a FilterStatus>,
        now: Instant,
    ) -> Result<(), DeviceError> {
        if addrs.len() > MAX_FILTER_ADDRS {
            return Err(DeviceError::InvalidArgument);
        }
        let list: Vec<u16, MAX_ADDRESSES> =
            Vec::from_slice(addrs).map_err(|_| DeviceError::InvalidArgument)?;
        let msg = if add {
            ProxyConfigMessage::AddAddresses(list)
        } else {
            ProxyConfigMessage::RemoveAddresses(list)
        };
        self.filter_op(ctx, roles, gatt, subnets, net_idx, &msg, status, now)
    }

    fn filter_op<
        C: GattCentral + Network + ?Sized,
        const R: usize,
        const G: usize,
        const S: usize,
    >(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<R>,
        gatt: &GattClient<G>,
        subnets: &Subnets<S>,
        net_idx: u16,
        msg: &ProxyConfigMessage,
        status: Option<&'a FilterStatus>,
        now: Instant,
    ) -> Result<(), DeviceError> {
        let idx = self
            .find(net_idx, true, false)
            .ok_or(DeviceError::InvalidArgument)?;
        if self.servers[idx].pending.is_some() {
            return Err(DeviceError::Already);
        }
        if subnets.get(net_idx).is_none() {
            return Err(DeviceError::InvalidArgument);
        }
        let conn = self.servers[idx].conn.ok_or(DeviceError::InvalidArgument)?;
        let handle = gatt.data_in_handle(conn).ok_or(DeviceError::InvalidArgument)?;

        let mut payload: Vec<u8, { 1 + 2 * MAX_FILTER_ADDRS }> = Vec::new();
        msg.emit(&mut payload)?;
        let mut pdu: Vec<u8, NET_MAX_PDU_LEN> = Vec::new();
        let src = ctx.primary_address();
        ctx.encode_proxy_config(net_idx, src, &payload, &mut pdu)?;
        roles.send(
            &mut WriteTx::new(ctx, handle),
            conn,
            MessageType::ProxyConfiguration,
            &pdu,
            Some(Completion::FilterOperation),
        )?;

        let srv = &mut self.servers[idx];
        srv.status = status;
        srv.pending = Some(msg.opcode());
        srv.op_timer.schedule(now, PROXY_OP_TIMEOUT);
        Ok(())
    }

    /// Send a network PDU to every proxy server with an open link.
    pub fn relay<C: GattCentral + ?Sized, const R: usize, const G: usize>(
        &self,
        ctx: &mut C,
        roles: &mut Roles<R>,
        gatt: &GattClient<G>,
        pdu: &[u8],
    ) -> bool {
        let mut relayed = false;
        for srv in self.servers.iter().filter(|srv| srv.link_opened) {
            let conn = match srv.conn {
                Some(conn) => conn,
                None => continue,
            };
            let handle = match gatt.data_in_handle(conn) {
                Some(handle) => handle,
                None => continue,
            };
            match roles.send(
                &mut WriteTx::new(ctx, handle),
                conn,
                MessageType::NetworkPDU,
                pdu,
                None,
            ) {
                Ok(()) => relayed = true,
                Err(e) => debug!("relay to {:?} failed: {:?}", conn, e),
            }
        }
        relayed
    }

    pub fn poll<C: Link + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        for srv in self.servers.iter_mut() {
            if !srv.op_timer.poll(now) {
                continue;
            }
            warn!("proxy filter operation timed out");
            srv.resolve(Err(DeviceError::TimedOut));
            if srv.pending.is_some() {
                if let Some(conn) = srv.conn {
                    if let Err(e) = ctx.disconnect(conn) {
                        warn!("disconnecting {:?} failed: {:?}", conn, e);
                    }
                }
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.servers
            .iter()
            .fold(None, |acc, srv| earliest(acc, srv.op_timer.expires_at()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::{AddressKind, BdAddr};
    use crate::driver::NetworkRx;
    use crate::config::ProxyFeatures;
    use crate::subnet::NetKeys;

    #[derive(Default)]
    struct Central {
        disconnected: std::vec::Vec<ConnId>,
        writes: std::vec::Vec<(u16, std::vec::Vec<u8>)>,
        encoded: std::vec::Vec<std::vec::Vec<u8>>,
        fail_writes: bool,
    }

    impl Link for Central {
        fn disconnect(&mut self, conn: ConnId) -> Result<(), DeviceError> {
            self.disconnected.push(conn);
            Ok(())
        }
    }

    impl GattCentral for Central {
        fn client_mtu(&self, _: ConnId) -> u16 {
            23
        }

        fn connect(&mut self, _: &BdAddr) -> Result<(), DeviceError> {
            Ok(())
        }

        fn start_discovery(&mut self, _: ConnId) -> Result<(), DeviceError> {
            Ok(())
        }

        fn find_characteristic(&self, _: ConnId, _: u16, characteristic: u16) -> Option<u16> {
            Some(characteristic)
        }

        fn find_descriptor(&self, _: ConnId, _: u16, _: u16, _: u16) -> Option<u16> {
            Some(0x0042)
        }

        fn write_request(&mut self, _: ConnId, _: u16, _: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }

        fn write_command(&mut self, _: ConnId, handle: u16, data: &[u8]) -> Result<(), DeviceError> {
            if self.fail_writes {
                return Err(DeviceError::Transport);
            }
            self.writes.push((handle, data.to_vec()));
            Ok(())
        }
    }

    impl Network for Central {
        fn is_provisioned(&self) -> bool {
            true
        }

        fn primary_address(&self) -> u16 {
            0x0001
        }

        fn features(&self) -> ProxyFeatures {
            ProxyFeatures::default()
        }

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
            self.encoded.push(payload.to_vec());
            pdu.extend_from_slice(payload)
                .map_err(|_| DeviceError::InsufficientBuffer)
        }

        fn create_beacon(
            &mut self,
            _: u16,
            _: bool,
            _: &mut Vec<u8, { crate::driver::BEACON_MAX_LEN }>,
        ) -> Result<(), DeviceError> {
            Ok(())
        }

        fn network_received(&mut self, _: &[u8], _: NetInterface) {}

        fn beacon_received(&mut self, _: &[u8]) {}

        fn solicitation_received(&mut self, _: &BdAddr, _: &[u8]) {}

        fn pb_adv_received(&mut self, _: &[u8]) {}
    }

    const CONN: ConnId = ConnId(5);
    const KEYS: NetKeys = NetKeys {
        network_id: [0x3E, 0xCA, 0xFF, 0x67, 0x2F, 0x67, 0x33, 0x70],
        identity_key: [
            0x84, 0x39, 0x6C, 0x43, 0x5A, 0xC4, 0x85, 0x60, 0xB5, 0x96, 0x53, 0x85, 0x25, 0x3E,
            0x21, 0x0C,
        ],
    };

    fn subnets() -> Subnets<2> {
        let mut subnets = Subnets::new();
        subnets.add(Subnet::new(0, KEYS)).unwrap();
        subnets
    }

    fn peer() -> BdAddr {
        BdAddr::new(AddressKind::Random, [1, 2, 3, 4, 5, 6])
    }

    struct Linked<'a> {
        central: Central,
        roles: Roles<2>,
        gatt: GattClient<2>,
        client: ProxyClient<'a, 2>,
        subnets: Subnets<2>,
    }

    fn linked<'a>() -> Linked<'a> {
        let mut central = Central::default();
        let mut roles = Roles::new();
        let mut gatt = GattClient::new();
        let mut client = ProxyClient::new();
        let subnets = subnets();

        client.connect(0).unwrap();
        let idx = client
            .adv_recv(&subnets, &ProxyServiceData::NetworkId(KEYS.network_id))
            .unwrap();
        gatt.connect(&mut central, peer(), Owner::ProxyClient, idx)
            .unwrap();
        let (_, idx) = gatt.connected(CONN, &peer()).unwrap();
        client.connected(&mut roles, CONN, idx);
        gatt.discovered(&mut central, CONN, Ok(()));
        client.link_open(CONN);

        Linked {
            central,
            roles,
            gatt,
            client,
            subnets,
        }
    }

    #[test]
    fn connect_requests() {
        let mut central = Central::default();
        let mut client: ProxyClient<'_, 1> = ProxyClient::new();

        assert_eq!(client.connect_node_id(0, 0x8000), Err(DeviceError::InvalidArgument));
        client.connect(0).unwrap();
        assert_eq!(client.connect(0), Err(DeviceError::Already));
        assert_eq!(client.connect(1), Err(DeviceError::NoMemory));

        client.connect(KEY_ANY).unwrap();
        assert_eq!(client.connect(KEY_ANY), Err(DeviceError::Already));

        client.disconnect(&mut central, 0).unwrap();
        assert_eq!(client.disconnect(&mut central, 0), Err(DeviceError::Already));
        client.disconnect(&mut central, KEY_ANY).unwrap();
        assert_eq!(
            client.disconnect(&mut central, KEY_ANY),
            Err(DeviceError::Already)
        );
    }

    #[test]
    fn network_id_matching() {
        let subnets = subnets();
        let mut client: ProxyClient<'_, 2> = ProxyClient::new();
        let beacon = ProxyServiceData::NetworkId(KEYS.network_id);

        // Nothing asked for yet.
        assert_eq!(client.adv_recv(&subnets, &beacon), None);

        client.connect(0).unwrap();
        assert_eq!(
            client.adv_recv(&subnets, &ProxyServiceData::NetworkId([0; 8])),
            None
        );
        assert_eq!(client.adv_recv(&subnets, &beacon), Some(0));
    }

    #[test]
    fn allow_all_claims_a_free_record() {
        let subnets = subnets();
        let mut client: ProxyClient<'_, 2> = ProxyClient::new();
        client.connect(KEY_ANY).unwrap();

        let idx = client
            .adv_recv(&subnets, &ProxyServiceData::NetworkId(KEYS.network_id))
            .unwrap();
        let mut roles: Roles<2> = Roles::new();
        client.connected(&mut roles, CONN, idx);
        assert!(client.is_connected(0));

        // Already connected on that subnet.
        assert_eq!(
            client.adv_recv(&subnets, &ProxyServiceData::NetworkId(KEYS.network_id)),
            None
        );
    }

    #[test]
    fn node_identity_matching() {
        let subnets = subnets();
        let mut client: ProxyClient<'_, 2> = ProxyClient::new();
        client.connect_node_id(0, 0x1201).unwrap();

        let random = [0x34, 0xAE, 0x60, 0x8F, 0xBB, 0xC1, 0xF2, 0xC6];
        let hash = node_identity_hash(&KEYS.identity_key, &random, 0x1201, false).unwrap();
        let beacon = ProxyServiceData::Identity {
            kind: IdentificationType::NodeIdentity,
            hash,
            random,
        };
        assert_eq!(client.adv_recv(&subnets, &beacon), Some(0));

        let other = ProxyServiceData::Identity {
            kind: IdentificationType::PrivateNodeIdentity,
            hash,
            random,
        };
        assert_eq!(client.adv_recv(&subnets, &other), None);
    }

    #[test]
    fn private_network_identity_matching() {
        let subnets = subnets();
        let mut client: ProxyClient<'_, 2> = ProxyClient::new();
        client.connect(0).unwrap();

        let random = [7; 8];
        let hash = private_network_hash(&KEYS.identity_key, &KEYS.network_id, &random).unwrap();
        let beacon = ProxyServiceData::Identity {
            kind: IdentificationType::PrivateNetworkIdentity,
            hash,
            random,
        };
        assert_eq!(client.adv_recv(&subnets, &beacon), Some(0));
        let wrong = ProxyServiceData::Identity {
            kind: IdentificationType::PrivateNetworkIdentity,
            hash: [0; 8],
            random,
        };
        assert_eq!(client.adv_recv(&subnets, &wrong), None);
    }

    #[test]
    fn filter_operation_completes_on_status() {
        let status = FilterStatus::new();
        let mut l = linked();
        let now = Instant::from_secs(1);

        assert_eq!(
            l.client.filter_addr_op(
                &mut l.central,
                &mut l.roles,
                &l.gatt,
                &l.subnets,
                0,
                &[1, 2, 3, 4, 5, 6],
                true,
                None,
                now
            ),
            Err(DeviceError::InvalidArgument)
        );
        assert_eq!(
            l.client.filter_set(
                &mut l.central,
                &mut l.roles,
                &l.gatt,
                &l.subnets,
                1,
                FilterType::Reject,
                None,
                now
            ),
            Err(DeviceError::InvalidArgument)
        );

        l.client
            .filter_set(
                &mut l.central,
                &mut l.roles,
                &l.gatt,
                &l.subnets,
                0,
                FilterType::Reject,
                Some(&status),
                now,
            )
            .unwrap();
        assert_eq!(l.central.encoded, [vec![0x00, 0x01]]);
        // Proxy configuration PDU on the data in characteristic.
        assert_eq!(l.central.writes.last().unwrap().1, vec![0x02, 0x00, 0x01]);

        assert_eq!(
            l.client.filter_addr_op(
                &mut l.central,
                &mut l.roles,
                &l.gatt,
                &l.subnets,
                0,
                &[0x0005],
                true,
                None,
                now
            ),
            Err(DeviceError::Already)
        );

        l.client
            .notification(&mut l.central, &mut l.roles, CONN, &[0x02, 0x03, 0x01, 0x00, 0x00], now)
            .unwrap();
        assert_eq!(status.try_take(), Some(Ok(())));
        assert_eq!(l.client.next_deadline(), None);
    }

    #[test]
    fn filter_operation_times_out() {
        let status = FilterStatus::new();
        let mut l = linked();
        let now = Instant::from_secs(1);

        l.client
            .filter_addr_op(
                &mut l.central,
                &mut l.roles,
                &l.gatt,
                &l.subnets,
                0,
                &[0x0005, 0xC000],
                false,
                Some(&status),
                now,
            )
            .unwrap();
        assert_eq!(l.central.encoded, [vec![0x02, 0x00, 0x05, 0xC0, 0x00]]);
        assert_eq!(l.client.next_deadline(), Some(now + PROXY_OP_TIMEOUT));

        l.client.poll(&mut l.central, now + PROXY_OP_TIMEOUT);
        assert_eq!(status.try_take(), Some(Err(DeviceError::TimedOut)));
        assert_eq!(l.central.disconnected, [CONN]);

        l.client.disconnected(&mut l.roles, CONN);
        assert!(!l.client.is_connected(0));
        assert_eq!(l.roles.count(), 0);
    }

    #[test]
    fn failed_send_leaves_no_pending_operation() {
        let mut l = linked();
        let now = Instant::from_secs(1);
        l.central.fail_writes = true;
        assert!(l
            .client
            .filter_set(
                &mut l.central,
                &mut l.roles,
                &l.gatt,
                &l.subnets,
                0,
                FilterType::Accept,
                None,
                now
            )
            .is_err());
        assert_eq!(l.client.next_deadline(), None);

        l.central.fail_writes = false;
        assert!(l
            .client
            .filter_set(
                &mut l.central,
                &mut l.roles,
                &l.gatt,
                &l.subnets,
                0,
                FilterType::Accept,
                None,
                now
            )
            .is_ok());
    }

    #[test]
    fn relay_needs_open_links() {
        let mut l = linked();
        assert!(l.client.relay(&mut l.central, &mut l.roles, &l.gatt, &[0xAA, 0xBB]));
        assert_eq!(l.central.writes.last().unwrap().1, vec![0x00, 0xAA, 0xBB]);

        l.client.disconnected(&mut l.roles, CONN);
        assert!(!l.client.relay(&mut l.central, &mut l.roles, &l.gatt, &[0xAA]));
    }
}
