use crate::bearer::gatt_client::{mesh_services, GattClient, WriteOutcome};
use crate::bearer::role::Roles;
use crate::bearer::{BdAddr, Completion, ConnId, GattRole, Owner, Service};
use crate::config::{MAX_OBSERVERS, MAX_SCAN_LISTENERS};
use crate::driver::deadline::{earliest, Deadline};
use crate::driver::{Context, DeviceError, LinkCloseReason};
use crate::observer::{ProxyObserver, Subscribers};
use crate::pdu::advertising::MeshServiceData;
use crate::pdu::configuration::FilterType;
use crate::provisioning::{PbGattClient, PbGattLink, PbGattServer};
use crate::proxy::{Filter, FilterStatus, ProxyClient, ProxyServer};
use crate::scan::{AdvReport, AdvType, Scan, ScanListener, ScanState};
use crate::subnet::{Subnet, SubnetEvent, Subnets};
use embassy_time::{Duration, Instant};

/// The GATT bearers of a mesh node: proxy server and client, PB-GATT device
/// and provisioner sides, sharing `N` links and the keys of `S` subnets.
///
/// Every entry point is a synchronous state transition taking the current
/// time. Timers are reported through [`MeshGatt::next_deadline`] and fired by
/// [`MeshGatt::poll`].
pub struct MeshGatt<'a, const N: usize, const S: usize> {
    roles: Roles<N>,
    subnets: Subnets<S>,
    gatt: GattClient<N>,
    proxy: ProxyServer<N>,
    proxy_client: ProxyClient<'a, N>,
    pb_server: PbGattServer,
    pb_client: PbGattClient,
    pb_link: PbGattLink,
    scan: Scan<'a, MAX_SCAN_LISTENERS>,
    observers: Subscribers<'a, dyn ProxyObserver + 'a, MAX_OBSERVERS>,
    adv_enabled: bool,
    adv_timer: Deadline,
}

impl<'a, const N: usize, const S: usize> Default for MeshGatt<'a, N, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize, const S: usize> MeshGatt<'a, N, S> {
    pub fn new() -> Self {
        Self {
            roles: Roles::new(),
            subnets: Subnets::new(),
            gatt: GattClient::new(),
            proxy: ProxyServer::new(),
            proxy_client: ProxyClient::new(),
            pb_server: PbGattServer::new(),
            pb_client: PbGattClient::new(),
            pb_link: PbGattLink::new(),
            scan: Scan::new(),
            observers: Subscribers::new(),
            adv_enabled: false,
            adv_timer: Deadline::new(),
        }
    }

    pub fn roles(&self) -> &Roles<N> {
        &self.roles
    }

    pub fn subnets(&self) -> &Subnets<S> {
        &self.subnets
    }

    pub fn scan_state(&self) -> ScanState {
        self.scan.state()
    }

    pub fn proxy_filter(&self, conn: ConnId) -> Option<&Filter> {
        self.proxy.filter(conn)
    }

    pub fn register_observer(&mut self, observer: &'a (dyn ProxyObserver + 'a)) -> Result<(), DeviceError> {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&mut self, observer: &'a (dyn ProxyObserver + 'a)) -> bool {
        self.observers.unregister(observer)
    }

    pub fn register_scan_listener(&mut self, listener: &'a (dyn ScanListener + 'a)) -> Result<(), DeviceError> {
        self.scan.register(listener)
    }

    pub fn unregister_scan_listener(&mut self, listener: &'a (dyn ScanListener + 'a)) -> bool {
        self.scan.unregister(listener)
    }

    // Advertising

    /// Allow connectable advertising and start it.
    pub fn enable_advertising<C: Context + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        self.adv_enabled = true;
        self.update_advertising(ctx, now);
    }

    pub fn disable_advertising<C: Context + ?Sized>(&mut self, ctx: &mut C) {
        self.adv_enabled = false;
        self.adv_timer.cancel();
        ctx.stop_advertising();
    }

    /// Recompute connectable advertising: the proxy service once
    /// provisioned, the provisioning service before.
    pub fn update_advertising<C: Context + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        if !self.adv_enabled {
            return;
        }
        ctx.stop_advertising();
        let next = if ctx.is_provisioned() {
            self.proxy
                .adv_start(ctx, &self.roles, &mut self.subnets, &self.observers, now)
        } else {
            self.pb_server.adv_start(ctx, &self.roles, now)
        };
        match next {
            Some(after) => self.adv_timer.schedule(now, after),
            None => self.adv_timer.cancel(),
        }
    }

    fn settle<C: Context + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        let released = self.roles.take_released();
        let proxy = self.proxy.take_adv_update();
        let pb = self.pb_server.take_adv_update();
        if released || proxy || pb {
            self.update_advertising(ctx, now);
        }
    }

    // Subnets

    pub fn add_subnet<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        subnet: Subnet,
        now: Instant,
    ) -> Result<(), DeviceError> {
        let net_idx = subnet.net_idx;
        self.subnets.add(subnet).map_err(|_| DeviceError::NoMemory)?;
        self.subnet_event(ctx, net_idx, SubnetEvent::Added, now);
        Ok(())
    }

    pub fn remove_subnet<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        net_idx: u16,
        now: Instant,
    ) -> Result<(), DeviceError> {
        if self.subnets.get(net_idx).is_none() {
            return Err(DeviceError::InvalidArgument);
        }
        self.subnet_event(ctx, net_idx, SubnetEvent::Deleted, now);
        self.subnets.remove(net_idx);
        Ok(())
    }

    /// Mutable access to a subnet, followed by `event` to propagate the
    /// change.
    pub fn subnet_mut(&mut self, net_idx: u16) -> Option<&mut Subnet> {
        self.subnets.get_mut(net_idx)
    }

    pub fn subnet_event<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        net_idx: u16,
        event: SubnetEvent,
        now: Instant,
    ) {
        debug!("subnet 0x{:03x} {:?}", net_idx, event);
        self.proxy
            .subnet_event(ctx, &mut self.roles, &self.subnets, net_idx, event);
        self.proxy_client.subnet_event(ctx, net_idx, event);
        self.settle(ctx, now);
    }

    /// A solicitation PDU asked for on-demand Private Network ID on
    /// `net_idx`.
    pub fn solicited<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        net_idx: u16,
        now: Instant,
    ) -> Result<(), DeviceError> {
        let sub = self.subnets.get_mut(net_idx).ok_or(DeviceError::InvalidArgument)?;
        sub.solicited = true;
        self.update_advertising(ctx, now);
        Ok(())
    }

    // Proxy server

    pub fn gatt_proxy_enable<C: Context + ?Sized>(&mut self, ctx: &mut C, now: Instant) -> Result<(), DeviceError> {
        self.proxy.gatt_enable(ctx, now)
    }

    pub fn gatt_proxy_disable<C: Context + ?Sized>(&mut self, ctx: &mut C, now: Instant) -> Result<(), DeviceError> {
        self.proxy.gatt_disable(ctx)?;
        self.update_advertising(ctx, now);
        Ok(())
    }

    /// Drop proxy clients that configured a filter, keeping the service.
    pub fn gatt_proxy_disconnect<C: Context + ?Sized>(&mut self, ctx: &mut C) {
        self.proxy.gatt_disconnect(ctx)
    }

    /// Start Node Identity, or Private Node Identity, on every subnet.
    pub fn identity_enable<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        private: bool,
        now: Instant,
    ) -> Result<(), DeviceError> {
        self.proxy
            .identity_enable(ctx, &mut self.subnets, private, &self.observers, now)?;
        self.settle(ctx, now);
        Ok(())
    }

    pub fn identity_start<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        net_idx: u16,
        private: bool,
        now: Instant,
    ) -> Result<(), DeviceError> {
        self.proxy
            .identity_start(&mut self.subnets, net_idx, private, &self.observers, now)?;
        self.update_advertising(ctx, now);
        Ok(())
    }

    pub fn identity_stop<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        net_idx: u16,
        now: Instant,
    ) -> Result<(), DeviceError> {
        self.proxy
            .identity_stop(&mut self.subnets, net_idx, &self.observers)?;
        self.update_advertising(ctx, now);
        Ok(())
    }

    /// Send the beacon of `net_idx`, or of all subnets, to proxy clients.
    pub fn beacon_send<C: Context + ?Sized>(&mut self, ctx: &mut C, net_idx: Option<u16>) {
        self.proxy
            .beacon_send(ctx, &mut self.roles, &self.subnets, net_idx)
    }

    /// Relay a network PDU to the proxy clients connected to us.
    pub fn relay<C: Context + ?Sized>(&mut self, ctx: &mut C, pdu: &[u8], dst: u16) -> bool {
        self.proxy.relay(ctx, &mut self.roles, pdu, dst)
    }

    /// Record the source address of a PDU received from proxy client `conn`.
    pub fn proxy_addr_add(&mut self, conn: ConnId, addr: u16) {
        self.proxy.addr_add(conn, addr)
    }

    // Proxy client

    pub fn proxy_connect(&mut self, net_idx: u16) -> Result<(), DeviceError> {
        self.proxy_client.connect(net_idx)
    }

    pub fn proxy_connect_node_id(&mut self, net_idx: u16, addr: u16) -> Result<(), DeviceError> {
        self.proxy_client.connect_node_id(net_idx, addr)
    }

    pub fn proxy_disconnect<C: Context + ?Sized>(&mut self, ctx: &mut C, net_idx: u16) -> Result<(), DeviceError> {
        self.proxy_client.disconnect(ctx, net_idx)
    }

    pub fn proxy_is_connected(&self, net_idx: u16) -> bool {
        self.proxy_client.is_connected(net_idx)
    }

    /// Send a network PDU to the proxy servers we are connected to.
    pub fn proxy_cli_relay<C: Context + ?Sized>(&mut self, ctx: &mut C, pdu: &[u8]) -> bool {
        self.proxy_client
            .relay(ctx, &mut self.roles, &self.gatt, pdu)
    }

    /// Set the filter type of the proxy serving `net_idx`. `status` is
    /// signalled with the outcome once the server answers or the operation
    /// times out.
    pub fn proxy_filter_set<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        net_idx: u16,
        filter_type: FilterType,
        status: Option<&'a FilterStatus>,
        now: Instant,
    ) -> Result<(), DeviceError> {
        self.proxy_client.filter_set(
            ctx,
            &mut self.roles,
            &self.gatt,
            &self.subnets,
            net_idx,
            filter_type,
            status,
            now,
        )
    }

    pub fn proxy_filter_addr_op<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        net_idx: u16,
        addrs: &[u16],
        add: bool,
        status: Option<&'a FilterStatus>,
        now: Instant,
    ) -> Result<(), DeviceError> {
        self.proxy_client.filter_addr_op(
            ctx,
            &mut self.roles,
            &self.gatt,
            &self.subnets,
            net_idx,
            addrs,
            add,
            status,
            now,
        )
    }

    // PB-GATT

    pub fn pb_gatt_enable<C: Context + ?Sized>(&mut self, ctx: &mut C, now: Instant) -> Result<(), DeviceError> {
        self.pb_server.enable(ctx, now)
    }

    pub fn pb_gatt_disable<C: Context + ?Sized>(&mut self, ctx: &mut C, now: Instant) -> Result<(), DeviceError> {
        let result = self.pb_server.disable(ctx);
        self.settle(ctx, now);
        result
    }

    /// Wait for a provisioner as unprovisioned device.
    pub fn link_accept<C: Context + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        self.adv_enabled = true;
        if let Err(e) = self.pb_server.enable(ctx, now) {
            warn!("PB-GATT enable failed: {:?}", e);
        }
        self.update_advertising(ctx, now);
    }

    /// Open a link to the device with `uuid` as provisioner.
    pub fn link_open(&mut self, uuid: [u8; 16], timeout: Duration, now: Instant) -> Result<(), DeviceError> {
        self.pb_link.open(timeout, now)?;
        self.pb_client.setup(Some(uuid))
    }

    pub fn link_close<C: Context + ?Sized>(&mut self, ctx: &mut C, reason: LinkCloseReason) -> Result<(), DeviceError> {
        self.pb_link.link_close(ctx, reason)
    }

    /// Send a provisioning PDU over the open link.
    pub fn prov_send<C: Context + ?Sized>(&mut self, ctx: &mut C, pdu: &[u8], now: Instant) -> Result<(), DeviceError> {
        let conn = self.pb_link.send(now)?;
        match self.roles.owner(conn) {
            Some(Owner::ProvisioningServer) => self.pb_server.send(ctx, &mut self.roles, conn, pdu),
            Some(Owner::ProvisioningClient) => {
                self.pb_client
                    .send(ctx, &mut self.roles, &self.gatt, conn, pdu)
            }
            _ => Err(DeviceError::NotConnected),
        }
    }

    // Scanning

    pub fn scan_enable<C: Context + ?Sized>(&mut self, ctx: &mut C) -> Result<(), DeviceError> {
        Ok(self.scan.enable(ctx)?)
    }

    pub fn scan_disable<C: Context + ?Sized>(&mut self, ctx: &mut C) -> Result<(), DeviceError> {
        Ok(self.scan.disable(ctx)?)
    }

    pub fn scan_active_set<C: Context + ?Sized>(&mut self, ctx: &mut C, active: bool) {
        self.scan.set_active(ctx, active)
    }

    pub fn scan_state_changed<C: Context + ?Sized>(&mut self, ctx: &mut C, state: ScanState) {
        self.scan.state_changed(ctx, state)
    }

    pub fn adv_report<C: Context + ?Sized>(&mut self, ctx: &mut C, report: &AdvReport<'_>, now: Instant) {
        self.scan.report(ctx, report);

        if report.adv_type != AdvType::Ind || !self.roles.has_available_conn() {
            return;
        }
        for service in mesh_services(report.data) {
            match service {
                MeshServiceData::Proxy(data) => {
                    if let Some(slot) = self.proxy_client.adv_recv(&self.subnets, &data) {
                        if let Err(e) = self.gatt.connect(ctx, report.addr, Owner::ProxyClient, slot) {
                            warn!("proxy connect failed: {:?}", e);
                        }
                    }
                }
                MeshServiceData::Provisioning(data) => {
                    if self.pb_client.adv_recv(ctx, &data) {
                        if let Err(e) = self.gatt.connect(ctx, report.addr, Owner::ProvisioningClient, 0) {
                            warn!("PB-GATT connect failed: {:?}", e);
                        }
                    }
                }
            }
        }
        self.settle(ctx, now);
    }

    // Link events

    pub fn connected<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        role: GattRole,
        addr: &BdAddr,
        now: Instant,
    ) {
        match role {
            GattRole::Server => {
                self.proxy
                    .connected(ctx, &mut self.roles, &mut self.subnets, conn);
                self.pb_server.connected(ctx, &mut self.roles, conn);
            }
            GattRole::Client => match self.gatt.connected(conn, addr) {
                Some((Owner::ProxyClient, slot)) => {
                    self.proxy_client.connected(&mut self.roles, conn, slot);
                    self.gatt.start_discovery(ctx, conn);
                }
                Some((Owner::ProvisioningClient, _)) => {
                    self.pb_client
                        .connected(&mut self.roles, &mut self.pb_link, conn, now);
                    self.gatt.start_discovery(ctx, conn);
                }
                _ => {}
            },
        }
        self.settle(ctx, now);
    }

    /// A connection we initiated never came up.
    pub fn connect_failed<C: Context + ?Sized>(&mut self, ctx: &mut C, addr: &BdAddr, now: Instant) {
        self.gatt.connect_failed(addr);
        self.settle(ctx, now);
    }

    pub fn disconnected<C: Context + ?Sized>(&mut self, ctx: &mut C, conn: ConnId, now: Instant) {
        match self.gatt.disconnected(conn) {
            Some(Owner::ProxyClient) => self.proxy_client.disconnected(&mut self.roles, conn),
            Some(Owner::ProvisioningClient) => {
                self.pb_client
                    .disconnected(ctx, &mut self.roles, &mut self.pb_link, conn)
            }
            _ => {
                self.proxy.disconnected(ctx, &mut self.roles, conn, now);
                self.pb_server
                    .disconnected(ctx, &mut self.roles, &mut self.pb_link, conn);
            }
        }
        self.settle(ctx, now);
    }

    pub fn discovery_complete<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        result: Result<(), DeviceError>,
    ) {
        self.gatt.discovered(ctx, conn, result)
    }

    /// A write request we issued as GATT client was answered.
    pub fn write_response<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        handle: u16,
        result: Result<(), DeviceError>,
    ) {
        match self.gatt.write_response(conn, handle, result) {
            Some(WriteOutcome::LinkOpen(Owner::ProxyClient)) => self.proxy_client.link_open(conn),
            Some(WriteOutcome::LinkOpen(Owner::ProvisioningClient)) => {
                self.pb_client.link_open(ctx, &mut self.pb_link, conn)
            }
            Some(WriteOutcome::Sent(_)) => self.send_complete(ctx, conn, result),
            _ => {}
        }
    }

    /// A notification we sent as GATT server went out.
    pub fn notify_complete<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        result: Result<(), DeviceError>,
    ) {
        self.send_complete(ctx, conn, result)
    }

    fn send_complete<C: Context + ?Sized>(&mut self, ctx: &mut C, conn: ConnId, result: Result<(), DeviceError>) {
        match self.roles.send_complete(conn) {
            Some((_, Completion::FilterOperation)) => self.proxy_client.sent(conn, result),
            Some((_, Completion::ProvisioningPDU)) => self.pb_link.sent(ctx, conn, result),
            None => {}
        }
    }

    /// Notification received from a server we are connected to.
    pub fn notification<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        data: &[u8],
        now: Instant,
    ) -> Result<(), DeviceError> {
        match self.gatt.notification(conn, data)? {
            Owner::ProxyClient => self
                .proxy_client
                .notification(ctx, &mut self.roles, conn, data, now),
            Owner::ProvisioningClient => self.pb_client.notification(
                ctx,
                &mut self.roles,
                &mut self.pb_link,
                conn,
                data,
                now,
            ),
            _ => Err(DeviceError::NotConnected),
        }
    }

    /// Peer wrote the data in characteristic of one of our services.
    pub fn gatt_write<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        service: Service,
        data: &[u8],
        now: Instant,
    ) -> Result<(), DeviceError> {
        match service {
            Service::Proxy => self.proxy.write(ctx, &mut self.roles, conn, data, now),
            Service::Provisioning => {
                self.pb_server
                    .write(ctx, &mut self.roles, &mut self.pb_link, conn, data, now)
            }
        }
    }

    /// Peer wrote the CCC descriptor of one of our data out characteristics.
    pub fn ccc_write<C: Context + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        service: Service,
        value: u16,
        now: Instant,
    ) {
        match service {
            Service::Proxy => {
                self.proxy
                    .ccc_write(ctx, &mut self.roles, &self.subnets, conn, value)
            }
            Service::Provisioning => {
                self.pb_server
                    .ccc_write(ctx, &mut self.pb_link, conn, value, now)
            }
        }
    }

    pub fn ccc_read(&self, conn: ConnId, service: Service) -> Option<u16> {
        match service {
            Service::Proxy => self.proxy.ccc_read(conn),
            Service::Provisioning => self.pb_server.ccc_read(conn),
        }
    }

    // Timers

    /// Fire every timer due at `now`.
    pub fn poll<C: Context + ?Sized>(&mut self, ctx: &mut C, now: Instant) {
        for conn in self.roles.poll_timeouts(now) {
            if let Err(e) = ctx.disconnect(conn) {
                warn!("disconnecting {:?} failed: {:?}", conn, e);
            }
        }

        self.proxy.poll(ctx, now);
        self.pb_server.poll(ctx, now);
        self.proxy_client.poll(ctx, now);
        if self.pb_link.poll(ctx, now) {
            if let Err(e) = self.pb_client.setup(None) {
                warn!("PB-GATT client reset failed: {:?}", e);
            }
        }

        if self.adv_timer.poll(now) {
            self.update_advertising(ctx, now);
        }
        self.settle(ctx, now);
    }

    /// When [`MeshGatt::poll`] next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.roles.next_deadline(),
            self.proxy.next_deadline(),
            self.pb_server.next_deadline(),
            self.proxy_client.next_deadline(),
            self.pb_link.next_deadline(),
            self.adv_timer.expires_at(),
        ]
        .into_iter()
        .fold(None, earliest)
    }
}
