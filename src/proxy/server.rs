//! Mesh Proxy service hosted for connected proxy clients.

use crate::bearer::role::{Inbound, Roles};
use crate::bearer::{ConnId, NotifyTx, Owner, Service, CCC_NOTIFY};
use crate::config::{NodeIdState, NET_HDR_LEN, NET_MAX_PDU_LEN, SVC_REG_ATTEMPTS, SVC_REG_RETRY};
use crate::driver::deadline::Deadline;
use crate::driver::{Context, DeviceError, GattServer, Link, NetInterface, Network, BEACON_MAX_LEN};
use crate::observer::{ProxyObserver, Subscribers};
use crate::pdu::configuration::ProxyConfigMessage;
use crate::pdu::proxy::{Header, MessageType};
use crate::pdu::ParseError;
use crate::proxy::advertiser::{self, ProxyAdvertiser};
use crate::proxy::filter::{Filter, FilterKind};
use crate::subnet::{SubnetEvent, Subnets};
use embassy_time::{Duration, Instant};
use heapless::Vec;

#[derive(Clone, Debug)]
struct Client {
    conn: ConnId,
    filter: Filter,
    cccd: u16,
    /// Send private beacons rather than secure network beacons.
    privacy: bool,
}

pub struct ProxyServer<const N: usize> {
    clients: [Option<Client>; N],
    registered: bool,
    registration: Deadline,
    attempts_left: u8,
    advertiser: ProxyAdvertiser,
    adv_update: bool,
}

impl<const N: usize> Default for ProxyServer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ProxyServer<N> {
    pub fn new() -> Self {
        Self {
            clients: core::array::from_fn(|_| None),
            registered: false,
            registration: Deadline::new(),
            attempts_left: 0,
            advertiser: ProxyAdvertiser::new(),
            adv_update: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Whether connectable advertising must be recomputed.
    pub fn take_adv_update(&mut self) -> bool {
        core::mem::take(&mut self.adv_update)
    }

    fn client(&self, conn: ConnId) -> Option<&Client> {
        self.clients.iter().flatten().find(|c| c.conn == conn)
    }

    fn client_mut(&mut self, conn: ConnId) -> Option<&mut Client> {
        self.clients.iter_mut().flatten().find(|c| c.conn == conn)
    }

    pub fn filter(&self, conn: ConnId) -> Option<&Filter> {
        self.client(conn).map(|c| &c.filter)
    }

    pub fn connected_count(&self) -> usize {
        self.clients.iter().flatten().count()
    }

    /// Schedule registration of the Mesh Proxy service.
    pub fn gatt_enable<C: Network + ?Sized>(&mut self, ctx: &C, now: Instant) -> Result<(), DeviceError> {
        if !ctx.is_provisioned() {
            return Err(DeviceError::NotSupported);
        }
        if self.registered {
            return Err(DeviceError::Busy);
        }
        debug!("enabling GATT proxy");
        self.attempts_left = SVC_REG_ATTEMPTS;
        self.registration.schedule(now, SVC_REG_RETRY);
        Ok(())
    }

    fn register<C: GattServer + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        if let Err(e) = ctx.register_service(Service::Proxy) {
            self.attempts_left = self.attempts_left.saturating_sub(1);
            if self.attempts_left > 0 {
                self.registration.schedule(now, SVC_REG_RETRY);
            } else {
                error!("unable to register mesh proxy service: {:?}", e);
            }
            return;
        }

        info!("mesh proxy service registered");
        self.registered = true;
        for client in self.clients.iter_mut().flatten() {
            client.filter.set_kind(FilterKind::Accept);
        }
        self.adv_update = true;
    }

    /// Drop every client that has configured a filter.
    pub fn gatt_disconnect<C: Link + ?Sized>(&mut self, ctx: &mut C) {
        for client in self.clients.iter_mut().flatten() {
            if matches!(client.filter.kind(), FilterKind::Accept | FilterKind::Reject) {
                client.filter.set_kind(FilterKind::None);
                if let Err(e) = ctx.disconnect(client.conn) {
                    warn!("disconnecting {:?} failed: {:?}", client.conn, e);
                }
            }
        }
    }

    pub fn gatt_disable<C: GattServer + ?Sized>(&mut self, ctx: &mut C) -> Result<(), DeviceError> {
        if !self.registered {
            return Err(DeviceError::Already);
        }
        debug!("disabling GATT proxy");
        self.gatt_disconnect(ctx);
        ctx.remove_service(Service::Proxy);
        self.registered = false;
        Ok(())
    }

    /// A peripheral link came up while the service is exposed.
    pub fn connected<C: Network + ?Sized, const S: usize>(
        &mut self,
        ctx: &C,
        roles: &mut Roles<N>,
        subnets: &mut Subnets<S>,
        conn: ConnId,
    ) {
        if !self.registered {
            return;
        }
        info!("proxy client connected {:?}", conn);

        let slot = match self.clients.iter_mut().find(|c| c.is_none()) {
            Some(slot) => slot,
            None => {
                error!("no free proxy client for {:?}", conn);
                return;
            }
        };
        if let Err(e) = roles.setup(conn, Owner::ProxyServer) {
            error!("role setup failed for {:?}: {:?}", conn, e);
            return;
        }

        let features = ctx.features();
        let privacy = if features.gatt_proxy || features.node_id == NodeIdState::Enabled {
            false
        } else {
            features.private_gatt_proxy || features.node_id == NodeIdState::EnabledPrivate
        };
        debug!("privacy {}", privacy);

        *slot = Some(Client {
            conn,
            filter: Filter::default(),
            cccd: 0,
            privacy,
        });

        // A connection formed after solicitation ends on-demand advertising.
        for sub in subnets.iter_mut() {
            sub.solicited = false;
            sub.private_net_id_sent = None;
        }

        if roles.has_available_conn() {
            self.adv_update = true;
        }
    }

    pub fn disconnected<C: Network + ?Sized>(
        &mut self,
        ctx: &C,
        roles: &mut Roles<N>,
        conn: ConnId,
        now: Instant,
    ) {
        if let Some(slot) = self
            .clients
            .iter_mut()
            .find(|c| matches!(c, Some(c) if c.conn == conn))
        {
            info!("proxy client disconnected {:?}", conn);
            *slot = None;
            roles.cleanup(conn);
        }

        if !self.registered && ctx.is_provisioned() {
            if let Err(e) = self.gatt_enable(ctx, now) {
                warn!("proxy service re-enable failed: {:?}", e);
            }
        }
    }

    /// Client wrote the CCC of the data out characteristic.
    pub fn ccc_write<C: GattServer + Network + ?Sized, const S: usize>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        subnets: &Subnets<S>,
        conn: ConnId,
        value: u16,
    ) {
        if value != CCC_NOTIFY {
            warn!("client wrote 0x{:04x} instead of enabling notify", value);
            return;
        }
        let client = match self.client_mut(conn) {
            Some(client) => client,
            None => {
                error!("no proxy client for {:?}", conn);
                return;
            }
        };
        client.cccd = value;

        if client.filter.kind() == FilterKind::None {
            client.filter.set_kind(FilterKind::Accept);
            let privacy = client.privacy;
            for sub in subnets.iter() {
                if let Err(e) = self.beacon_to(ctx, roles, conn, sub.net_idx, privacy) {
                    debug!("beacon to {:?} failed: {:?}", conn, e);
                    break;
                }
            }
        }
    }

    pub fn ccc_read(&self, conn: ConnId) -> Option<u16> {
        self.client(conn).map(|c| c.cccd)
    }

    /// Fragment written to the data in characteristic.
    pub fn write<C: GattServer + Network + ?Sized>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        conn: ConnId,
        data: &[u8],
        now: Instant,
    ) -> Result<(), DeviceError> {
        let header = data.first().ok_or_else(|| {
            warn!("too small proxy PDU");
            DeviceError::InvalidArgument
        })?;
        if Header::parse(*header).message_type == MessageType::ProvisioningPDU {
            warn!("proxy PDU type doesn't match GATT service");
            return Err(DeviceError::InvalidArgument);
        }

        if let Some(inbound) = roles.recv(conn, data, now)? {
            self.received(ctx, roles, inbound);
        }
        Ok(())
    }

    fn received<C: GattServer + Network + ?Sized>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        msg: Inbound,
    ) {
        match msg.message_type {
            MessageType::NetworkPDU => {
                debug!("mesh network PDU");
                ctx.network_received(&msg.payload, NetInterface::Proxy(msg.conn));
            }
            MessageType::MeshBeacon => {
                debug!("mesh beacon PDU");
                ctx.beacon_received(&msg.payload);
            }
            MessageType::ProxyConfiguration => {
                debug!("mesh configuration PDU");
                self.configuration(ctx, roles, msg.conn, &msg.payload);
            }
            other => warn!("unhandled message type {:?}", other),
        }
    }

    fn configuration<C: GattServer + Network + ?Sized>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        conn: ConnId,
        data: &[u8],
    ) {
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
        if payload.is_empty() {
            warn!("too short proxy configuration PDU");
            return;
        }

        let client = match self.client_mut(conn) {
            Some(client) => client,
            None => {
                error!("no proxy client for {:?}", conn);
                return;
            }
        };

        match ProxyConfigMessage::parse(payload) {
            Ok(ProxyConfigMessage::SetFilterType(filter_type)) => {
                debug!("filter type {:?}", filter_type);
                client.filter.reset(filter_type.into());
            }
            Ok(ProxyConfigMessage::AddAddresses(addrs)) => {
                for addr in addrs {
                    client.filter.add(addr);
                }
            }
            Ok(ProxyConfigMessage::RemoveAddresses(addrs)) => {
                for addr in addrs {
                    client.filter.remove(addr);
                }
            }
            Ok(ProxyConfigMessage::FilterStatus { .. }) | Err(ParseError::InvalidPDUFormat) => {
                warn!("unhandled configuration opcode 0x{:02x}", payload[0]);
                return;
            }
            Err(e) => {
                warn!("malformed filter message: {:?}", e);
                return;
            }
        }

        let (filter_type, list_size) = client.filter.status();
        let status = ProxyConfigMessage::FilterStatus {
            filter_type,
            list_size,
        };
        if let Err(e) = self.send_config(ctx, roles, conn, rx.net_idx, &status) {
            error!("failed to send filter status: {:?}", e);
        }
    }

    fn send_config<C: GattServer + Network + ?Sized>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        conn: ConnId,
        net_idx: u16,
        msg: &ProxyConfigMessage,
    ) -> Result<(), DeviceError> {
        let mut payload: Vec<u8, 4> = Vec::new();
        msg.emit(&mut payload)?;
        let mut pdu: Vec<u8, NET_MAX_PDU_LEN> = Vec::new();
        let src = ctx.primary_address();
        ctx.encode_proxy_config(net_idx, src, &payload, &mut pdu)?;
        self.send(ctx, roles, conn, MessageType::ProxyConfiguration, &pdu)
    }

    /// Notify a complete message to a client that enabled notifications.
    pub fn send<C: GattServer + ?Sized>(
        &self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        conn: ConnId,
        message_type: MessageType,
        msg: &[u8],
    ) -> Result<(), DeviceError> {
        match self.client(conn) {
            Some(client) if client.cccd == CCC_NOTIFY => {}
            _ => return Err(DeviceError::NotConnected),
        }
        roles.send(
            &mut NotifyTx::new(ctx, Service::Proxy),
            conn,
            message_type,
            msg,
            None,
        )
    }

    fn beacon_to<C: GattServer + Network + ?Sized>(
        &self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        conn: ConnId,
        net_idx: u16,
        privacy: bool,
    ) -> Result<(), DeviceError> {
        let mut beacon: Vec<u8, BEACON_MAX_LEN> = Vec::new();
        ctx.create_beacon(net_idx, privacy, &mut beacon)?;
        self.send(ctx, roles, conn, MessageType::MeshBeacon, &beacon)
    }

    /// Send the beacon of `net_idx`, or of every subnet, to all clients.
    pub fn beacon_send<C: GattServer + Network + ?Sized, const S: usize>(
        &self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        subnets: &Subnets<S>,
        net_idx: Option<u16>,
    ) {
        for sub in subnets.iter() {
            if net_idx.map(|idx| idx != sub.net_idx).unwrap_or(false) {
                continue;
            }
            for client in self.clients.iter().flatten() {
                if let Err(e) = self.beacon_to(ctx, roles, client.conn, sub.net_idx, client.privacy) {
                    trace!("beacon to {:?} failed: {:?}", client.conn, e);
                }
            }
        }
    }

    /// Relay a network PDU to every client whose filter lets `dst` through.
    pub fn relay<C: GattServer + ?Sized>(
        &self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        pdu: &[u8],
        dst: u16,
    ) -> bool {
        debug!("{} bytes to dst 0x{:04x}", pdu.len(), dst);
        let mut relayed = false;
        for client in self.clients.iter().flatten() {
            if !client.filter.accepts(dst) {
                continue;
            }
            if self
                .send(ctx, roles, client.conn, MessageType::NetworkPDU, pdu)
                .is_ok()
            {
                relayed = true;
            }
        }
        relayed
    }

    /// Record the source of a PDU received from a client in its filter.
    pub fn addr_add(&mut self, conn: ConnId, addr: u16) {
        let client = match self.client_mut(conn) {
            Some(client) => client,
            None => {
                error!("no proxy client for {:?}", conn);
                return;
            }
        };
        trace!("filter {:?} addr 0x{:04x}", client.filter.kind(), addr);
        match client.filter.kind() {
            FilterKind::Accept => client.filter.add(addr),
            FilterKind::Reject => client.filter.remove(addr),
            FilterKind::None => {}
        }
    }

    pub fn identity_start<'a, const S: usize, const O: usize>(
        &mut self,
        subnets: &mut Subnets<S>,
        net_idx: u16,
        private: bool,
        observers: &Subscribers<'a, dyn ProxyObserver + 'a, O>,
        now: Instant,
    ) -> Result<(), DeviceError> {
        let sub = subnets.get_mut(net_idx).ok_or(DeviceError::InvalidArgument)?;
        advertiser::identity_start(sub, private, observers, now);
        Ok(())
    }

    pub fn identity_stop<'a, const S: usize, const O: usize>(
        &mut self,
        subnets: &mut Subnets<S>,
        net_idx: u16,
        observers: &Subscribers<'a, dyn ProxyObserver + 'a, O>,
    ) -> Result<(), DeviceError> {
        let sub = subnets.get_mut(net_idx).ok_or(DeviceError::InvalidArgument)?;
        advertiser::identity_stop(sub, observers);
        Ok(())
    }

    /// Start (private) Node Identity advertising on every subnet.
    pub fn identity_enable<'a, C: Network + ?Sized, const S: usize, const O: usize>(
        &mut self,
        ctx: &C,
        subnets: &mut Subnets<S>,
        private: bool,
        observers: &Subscribers<'a, dyn ProxyObserver + 'a, O>,
        now: Instant,
    ) -> Result<(), DeviceError> {
        if !ctx.is_provisioned() {
            return Err(DeviceError::Again);
        }
        let mut started = false;
        for sub in subnets.iter_mut() {
            advertiser::identity_start(sub, private, observers, now);
            started = true;
        }
        if started {
            self.adv_update = true;
        }
        Ok(())
    }

    pub fn subnet_event<C: GattServer + Network + ?Sized, const S: usize>(
        &mut self,
        ctx: &mut C,
        roles: &mut Roles<N>,
        subnets: &Subnets<S>,
        net_idx: u16,
        event: SubnetEvent,
    ) {
        if event == SubnetEvent::Deleted {
            return;
        }
        self.beacon_send(ctx, roles, subnets, Some(net_idx));
        self.adv_update = true;
    }

    /// Advertise the service when it is exposed and the node provisioned.
    pub fn adv_start<'a, C: Context + ?Sized, const S: usize, const O: usize>(
        &mut self,
        ctx: &mut C,
        roles: &Roles<N>,
        subnets: &mut Subnets<S>,
        observers: &Subscribers<'a, dyn ProxyObserver + 'a, O>,
        now: Instant,
    ) -> Option<Duration> {
        if !self.registered || !ctx.is_provisioned() {
            return None;
        }
        self.advertiser
            .advertise(ctx, subnets, observers, roles.has_available_conn(), now)
    }

    pub fn poll<C: GattServer + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        if self.registration.poll(now) {
            self.register(ctx, now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registration.expires_at()
    }
}
