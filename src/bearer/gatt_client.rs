//! Links we initiate towards remote proxy and provisioning servers.

use crate::bearer::{BdAddr, ConnId, Owner, CCC_NOTIFY, CCC_UUID};
use crate::driver::{DeviceError, GattCentral};
use crate::pdu::advertising::{AdStructures, MeshServiceData, AD_SVC_DATA16};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Server {
    addr: BdAddr,
    conn: Option<ConnId>,
    connecting: bool,
    owner: Owner,
    /// Record of the owner this link belongs to.
    slot: usize,
    data_in: u16,
    data_out_ccc: u16,
}

/// Outcome of a write request acknowledged by a server.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteOutcome {
    /// Notifications are on, the link is usable.
    LinkOpen(Owner),
    /// A fragment written to the data in characteristic went out.
    Sent(Owner),
}

pub struct GattClient<const N: usize> {
    servers: [Option<Server>; N],
}

impl<const N: usize> Default for GattClient<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> GattClient<N> {
    pub fn new() -> Self {
        Self {
            servers: core::array::from_fn(|_| None),
        }
    }

    fn by_addr(&self, addr: &BdAddr) -> Option<&Server> {
        self.servers.iter().flatten().find(|s| s.addr == *addr)
    }

    fn by_conn(&self, conn: ConnId) -> Option<&Server> {
        self.servers.iter().flatten().find(|s| s.conn == Some(conn))
    }

    fn by_conn_mut(&mut self, conn: ConnId) -> Option<&mut Server> {
        self.servers
            .iter_mut()
            .flatten()
            .find(|s| s.conn == Some(conn))
    }

    pub fn has_free_slot(&self) -> bool {
        self.servers.iter().any(Option::is_none)
    }

    pub fn is_connecting(&self, addr: &BdAddr) -> bool {
        self.by_addr(addr).map(|s| s.connecting).unwrap_or(false)
    }

    pub fn owner(&self, conn: ConnId) -> Option<Owner> {
        self.by_conn(conn).map(|s| s.owner)
    }

    /// Handle of the data in characteristic, once discovered.
    pub fn data_in_handle(&self, conn: ConnId) -> Option<u16> {
        self.by_conn(conn)
            .map(|s| s.data_in)
            .filter(|handle| *handle != 0)
    }

    /// Start connecting to `addr` on behalf of record `slot` of `owner`.
    /// Asking again for an address already in progress is not an error.
    pub fn connect<C: GattCentral + ?Sized>(
        &mut self,
        ctx: &mut C,
        addr: BdAddr,
        owner: Owner,
        slot: usize,
    ) -> Result<(), DeviceError> {
        if self.by_addr(&addr).is_some() {
            return Ok(());
        }

        let free = self
            .servers
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or_else(|| {
                error!("no free GATT client slot");
                DeviceError::NoMemory
            })?;

        debug!("connecting to {:?} for {:?}", addr, owner);
        ctx.connect(&addr).map_err(|e| {
            error!("connection failed: {:?}", e);
            e
        })?;

        *free = Some(Server {
            addr,
            conn: None,
            connecting: true,
            owner,
            slot,
            data_in: 0,
            data_out_ccc: 0,
        });
        Ok(())
    }

    /// A central link came up. Returns the owner that asked for it and the
    /// record it was requested for.
    pub fn connected(&mut self, conn: ConnId, addr: &BdAddr) -> Option<(Owner, usize)> {
        let server = self
            .servers
            .iter_mut()
            .flatten()
            .find(|s| s.addr == *addr && s.conn.is_none())?;
        info!("client link {:?} up", conn);
        server.conn = Some(conn);
        server.connecting = false;
        Some((server.owner, server.slot))
    }

    pub fn start_discovery<C: GattCentral + ?Sized>(&self, ctx: &mut C, conn: ConnId) {
        if self.by_conn(conn).is_none() {
            return;
        }
        if let Err(e) = ctx.start_discovery(conn) {
            error!("discovery start failed: {:?}", e);
        }
    }

    /// Service discovery finished; locate the characteristics and turn
    /// notifications on.
    pub fn discovered<C: GattCentral + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        result: Result<(), DeviceError>,
    ) {
        if let Err(e) = result {
            error!("discovery failed on {:?}: {:?}", conn, e);
            return;
        }
        let server = match self.by_conn_mut(conn) {
            Some(server) => server,
            None => {
                warn!("no server for {:?}", conn);
                return;
            }
        };
        let service = server.owner.service();

        let ccc = match ctx.find_descriptor(conn, service.uuid(), service.data_out_uuid(), CCC_UUID)
        {
            Some(handle) => handle,
            None => {
                error!("data out CCC not found");
                return;
            }
        };
        let data_in = match ctx.find_characteristic(conn, service.uuid(), service.data_in_uuid()) {
            Some(handle) => handle,
            None => {
                error!("data in characteristic not found");
                return;
            }
        };
        debug!("data out CCC 0x{:04x}, data in 0x{:04x}", ccc, data_in);
        server.data_out_ccc = ccc;
        server.data_in = data_in;

        if let Err(e) = ctx.write_request(conn, ccc, &CCC_NOTIFY.to_le_bytes()) {
            error!("enabling notifications failed: {:?}", e);
        }
    }

    pub fn write_response(
        &self,
        conn: ConnId,
        handle: u16,
        result: Result<(), DeviceError>,
    ) -> Option<WriteOutcome> {
        let server = self.by_conn(conn)?;
        if handle == server.data_out_ccc && result.is_ok() {
            debug!("subscribed on {:?}", conn);
            Some(WriteOutcome::LinkOpen(server.owner))
        } else if handle == server.data_in {
            Some(WriteOutcome::Sent(server.owner))
        } else {
            None
        }
    }

    /// Validate a notification before reassembly.
    pub fn notification(&self, conn: ConnId, data: &[u8]) -> Result<Owner, DeviceError> {
        let owner = self.owner(conn).ok_or(DeviceError::NotConnected)?;
        if data.is_empty() {
            warn!("too small proxy PDU");
            return Err(DeviceError::InvalidArgument);
        }
        Ok(owner)
    }

    /// Forget a connection attempt the host gave up on.
    pub fn connect_failed(&mut self, addr: &BdAddr) -> Option<Owner> {
        let entry = self
            .servers
            .iter_mut()
            .find(|s| matches!(s, Some(s) if s.addr == *addr && s.connecting))?;
        let server = entry.take()?;
        warn!("connecting to {:?} failed", addr);
        Some(server.owner)
    }

    pub fn disconnected(&mut self, conn: ConnId) -> Option<Owner> {
        let entry = self
            .servers
            .iter_mut()
            .find(|s| matches!(s, Some(s) if s.conn == Some(conn)))?;
        let server = entry.take()?;
        info!("client link {:?} down", conn);
        Some(server.owner)
    }
}

/// Mesh service data carried by a connectable advertisement.
pub fn mesh_services(data: &[u8]) -> impl Iterator<Item = MeshServiceData> + '_ {
    AdStructures::new(data)
        .map_while(Result::ok)
        .filter(|ad| ad.ad_type == AD_SVC_DATA16)
        .filter_map(|ad| MeshServiceData::parse(ad.data).ok().flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::AddressKind;
    use crate::driver::Link;
    use crate::pdu::advertising::ProxyServiceData;

    #[derive(Default)]
    struct Central {
        connects: usize,
        refuse: bool,
        writes: std::vec::Vec<(u16, std::vec::Vec<u8>)>,
        discoveries: usize,
    }

    impl Link for Central {
        fn disconnect(&mut self, _: ConnId) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    impl GattCentral for Central {
        fn client_mtu(&self, _: ConnId) -> u16 {
            23
        }

        fn connect(&mut self, _: &BdAddr) -> Result<(), DeviceError> {
            if self.refuse {
                return Err(DeviceError::Transport);
            }
            self.connects += 1;
            Ok(())
        }

        fn start_discovery(&mut self, _: ConnId) -> Result<(), DeviceError> {
            self.discoveries += 1;
            Ok(())
        }

        fn find_characteristic(&self, _: ConnId, service: u16, characteristic: u16) -> Option<u16> {
            assert_eq!(service, 0x1828);
            assert_eq!(characteristic, 0x2ADD);
            Some(0x0010)
        }

        fn find_descriptor(
            &self,
            _: ConnId,
            service: u16,
            characteristic: u16,
            descriptor: u16,
        ) -> Option<u16> {
            assert_eq!(service, 0x1828);
            assert_eq!(characteristic, 0x2ADE);
            assert_eq!(descriptor, CCC_UUID);
            Some(0x0013)
        }

        fn write_request(&mut self, _: ConnId, handle: u16, data: &[u8]) -> Result<(), DeviceError> {
            self.writes.push((handle, data.to_vec()));
            Ok(())
        }

        fn write_command(&mut self, _: ConnId, _: u16, _: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn peer(last: u8) -> BdAddr {
        BdAddr::new(AddressKind::Random, [0xC0, 0, 0, 0, 0, last])
    }

    #[test]
    fn connect_discover_subscribe() {
        let mut central = Central::default();
        let mut client: GattClient<2> = GattClient::new();

        client.connect(&mut central, peer(1), Owner::ProxyClient, 1).unwrap();
        client.connect(&mut central, peer(1), Owner::ProxyClient, 1).unwrap();
        assert_eq!(central.connects, 1);
        assert!(client.is_connecting(&peer(1)));

        let conn = ConnId(4);
        assert_eq!(client.connected(conn, &peer(2)), None);
        assert_eq!(
            client.connected(conn, &peer(1)),
            Some((Owner::ProxyClient, 1))
        );
        assert!(!client.is_connecting(&peer(1)));
        client.start_discovery(&mut central, conn);
        assert_eq!(central.discoveries, 1);
        assert_eq!(client.data_in_handle(conn), None);

        client.discovered(&mut central, conn, Ok(()));
        assert_eq!(central.writes, [(0x0013, vec![0x01, 0x00])]);
        assert_eq!(client.data_in_handle(conn), Some(0x0010));

        assert_eq!(
            client.write_response(conn, 0x0013, Err(DeviceError::Transport)),
            None
        );
        assert_eq!(
            client.write_response(conn, 0x0013, Ok(())),
            Some(WriteOutcome::LinkOpen(Owner::ProxyClient))
        );
        assert_eq!(
            client.write_response(conn, 0x0010, Ok(())),
            Some(WriteOutcome::Sent(Owner::ProxyClient))
        );

        assert_eq!(
            client.notification(conn, &[]),
            Err(DeviceError::InvalidArgument)
        );
        assert_eq!(client.notification(conn, &[0x00]), Ok(Owner::ProxyClient));

        assert_eq!(client.disconnected(conn), Some(Owner::ProxyClient));
        assert_eq!(client.disconnected(conn), None);
        assert!(client.has_free_slot());
    }

    #[test]
    fn slots_are_bounded_and_released_on_failure() {
        let mut central = Central::default();
        let mut client: GattClient<1> = GattClient::new();

        central.refuse = true;
        assert_eq!(
            client.connect(&mut central, peer(1), Owner::ProvisioningClient, 0),
            Err(DeviceError::Transport)
        );
        assert!(client.has_free_slot());

        central.refuse = false;
        client.connect(&mut central, peer(1), Owner::ProvisioningClient, 0).unwrap();
        assert_eq!(
            client.connect(&mut central, peer(2), Owner::ProxyClient, 0),
            Err(DeviceError::NoMemory)
        );

        assert_eq!(
            client.connect_failed(&peer(1)),
            Some(Owner::ProvisioningClient)
        );
        assert!(client.has_free_slot());
    }

    #[test]
    fn finds_mesh_service_data() {
        let data = [
            0x02, 0x01, 0x06, // flags
            0x03, 0x03, 0x28, 0x18, // uuid list
            0x0C, 0x16, 0x28, 0x18, 0x00, 1, 2, 3, 4, 5, 6, 7, 8, // network id
            0x03, 0x16, 0x0F, 0x18, // battery service
        ];
        let found: std::vec::Vec<MeshServiceData> = mesh_services(&data).collect();
        assert_eq!(
            found,
            [MeshServiceData::Proxy(ProxyServiceData::NetworkId([
                1, 2, 3, 4, 5, 6, 7, 8
            ]))]
        );
    }
}
