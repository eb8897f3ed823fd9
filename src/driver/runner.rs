//! Async front of [`MeshGatt`]: host events and application requests arrive
//! on a channel, timers are slept on in between.

use crate::bearer::{BdAddr, ConnId, GattRole, Service};
use crate::config::{MAX_FILTER_ADDRS, PROXY_MSG_LEN};
use crate::driver::{Context, DeviceError, LinkCloseReason, MeshGatt};
use crate::pdu::advertising::AdvertisingData;
use crate::pdu::configuration::FilterType;
use crate::proxy::FilterStatus;
use crate::scan::{AdvReport, AdvType, ScanState};
use crate::subnet::Subnet;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use futures::future::{select, Either};
use futures::pin_mut;
use heapless::Vec;

/// Outcome of a request, signalled once the runner has handled it.
pub type Reply = Signal<CriticalSectionRawMutex, Result<(), DeviceError>>;

pub type EventChannel<'a, const Q: usize> = Channel<CriticalSectionRawMutex, Event<'a>, Q>;
pub type EventSender<'c, 'a, const Q: usize> = Sender<'c, CriticalSectionRawMutex, Event<'a>, Q>;
pub type EventReceiver<'c, 'a, const Q: usize> = Receiver<'c, CriticalSectionRawMutex, Event<'a>, Q>;

/// Longest fragment queued from the host; larger writes are refused by the
/// characteristic length anyway.
pub const FRAGMENT_LEN: usize = PROXY_MSG_LEN;

pub enum Event<'a> {
    Connected {
        conn: ConnId,
        role: GattRole,
        addr: BdAddr,
    },
    ConnectFailed {
        addr: BdAddr,
    },
    Disconnected {
        conn: ConnId,
    },
    DiscoveryComplete {
        conn: ConnId,
        result: Result<(), DeviceError>,
    },
    WriteResponse {
        conn: ConnId,
        handle: u16,
        result: Result<(), DeviceError>,
    },
    NotifyComplete {
        conn: ConnId,
        result: Result<(), DeviceError>,
    },
    Notification {
        conn: ConnId,
        data: Vec<u8, FRAGMENT_LEN>,
    },
    Write {
        conn: ConnId,
        service: Service,
        data: Vec<u8, FRAGMENT_LEN>,
    },
    CccWrite {
        conn: ConnId,
        service: Service,
        value: u16,
    },
    AdvReport {
        addr: BdAddr,
        rssi: i8,
        adv_type: AdvType,
        data: AdvertisingData,
    },
    ScanState(ScanState),
    Request {
        op: Operation<'a>,
        reply: &'a Reply,
    },
}

/// Application requests executed in the runner's context.
pub enum Operation<'a> {
    EnableAdvertising,
    DisableAdvertising,
    AddSubnet(Subnet),
    RemoveSubnet(u16),
    GattProxyEnable,
    GattProxyDisable,
    IdentityEnable {
        private: bool,
    },
    Relay {
        pdu: Vec<u8, PROXY_MSG_LEN>,
        dst: u16,
    },
    ProxyConnect {
        net_idx: u16,
    },
    ProxyConnectNodeId {
        net_idx: u16,
        addr: u16,
    },
    ProxyDisconnect {
        net_idx: u16,
    },
    FilterSet {
        net_idx: u16,
        filter_type: FilterType,
        status: Option<&'a FilterStatus>,
    },
    FilterAddrOp {
        net_idx: u16,
        addrs: Vec<u16, MAX_FILTER_ADDRS>,
        add: bool,
        status: Option<&'a FilterStatus>,
    },
    PbGattEnable,
    PbGattDisable,
    LinkAccept,
    LinkOpen {
        uuid: [u8; 16],
        timeout: Duration,
    },
    LinkClose(LinkCloseReason),
    ProvSend(Vec<u8, PROXY_MSG_LEN>),
    ScanEnable,
    ScanDisable,
    ScanActive(bool),
}

pub struct Runner<'a, 'c, C, const N: usize, const S: usize, const Q: usize>
where
    C: Context,
{
    ctx: C,
    stack: MeshGatt<'a, N, S>,
    events: EventReceiver<'c, 'a, Q>,
}

impl<'a, 'c, C, const N: usize, const S: usize, const Q: usize> Runner<'a, 'c, C, N, S, Q>
where
    C: Context,
{
    pub fn new(ctx: C, stack: MeshGatt<'a, N, S>, events: EventReceiver<'c, 'a, Q>) -> Self {
        Self { ctx, stack, events }
    }

    pub fn stack(&self) -> &MeshGatt<'a, N, S> {
        &self.stack
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    pub async fn run(&mut self) {
        info!("mesh GATT bearers running");
        loop {
            self.process().await;
        }
    }

    /// Wait for the next event or timer, then bring the stack up to date.
    pub async fn process(&mut self) {
        let deadline = self.stack.next_deadline().unwrap_or(Instant::MAX);
        let event = {
            let event_fut = self.events.receive();
            let timer_fut = Timer::at(deadline);
            pin_mut!(event_fut);
            pin_mut!(timer_fut);
            match select(event_fut, timer_fut).await {
                Either::Left((event, _)) => Some(event),
                Either::Right(_) => None,
            }
        };

        let now = Instant::now();
        if let Some(event) = event {
            self.handle(event, now);
        }
        self.stack.poll(&mut self.ctx, now);
    }

    pub fn handle(&mut self, event: Event<'a>, now: Instant) {
        let ctx = &mut self.ctx;
        let stack = &mut self.stack;
        match event {
            Event::Connected { conn, role, addr } => stack.connected(ctx, conn, role, &addr, now),
            Event::ConnectFailed { addr } => stack.connect_failed(ctx, &addr, now),
            Event::Disconnected { conn } => stack.disconnected(ctx, conn, now),
            Event::DiscoveryComplete { conn, result } => stack.discovery_complete(ctx, conn, result),
            Event::WriteResponse {
                conn,
                handle,
                result,
            } => stack.write_response(ctx, conn, handle, result),
            Event::NotifyComplete { conn, result } => stack.notify_complete(ctx, conn, result),
            Event::Notification { conn, data } => {
                if let Err(e) = stack.notification(ctx, conn, &data, now) {
                    debug!("notification from {:?} dropped: {:?}", conn, e);
                }
            }
            Event::Write {
                conn,
                service,
                data,
            } => {
                if let Err(e) = stack.gatt_write(ctx, conn, service, &data, now) {
                    debug!("write from {:?} dropped: {:?}", conn, e);
                }
            }
            Event::CccWrite {
                conn,
                service,
                value,
            } => stack.ccc_write(ctx, conn, service, value, now),
            Event::AdvReport {
                addr,
                rssi,
                adv_type,
                data,
            } => {
                let report = AdvReport {
                    addr,
                    rssi,
                    adv_type,
                    data: &data,
                };
                stack.adv_report(ctx, &report, now)
            }
            Event::ScanState(state) => stack.scan_state_changed(ctx, state),
            Event::Request { op, reply } => {
                let result = Self::execute(stack, ctx, op, now);
                if let Err(e) = &result {
                    debug!("request failed: {:?}", e);
                }
                reply.signal(result);
            }
        }
    }

    fn execute(
        stack: &mut MeshGatt<'a, N, S>,
        ctx: &mut C,
        op: Operation<'a>,
        now: Instant,
    ) -> Result<(), DeviceError> {
        match op {
            Operation::EnableAdvertising => {
                stack.enable_advertising(ctx, now);
                Ok(())
            }
            Operation::DisableAdvertising => {
                stack.disable_advertising(ctx);
                Ok(())
            }
            Operation::AddSubnet(subnet) => stack.add_subnet(ctx, subnet, now),
            Operation::RemoveSubnet(net_idx) => stack.remove_subnet(ctx, net_idx, now),
            Operation::GattProxyEnable => stack.gatt_proxy_enable(ctx, now),
            Operation::GattProxyDisable => stack.gatt_proxy_disable(ctx, now),
            Operation::IdentityEnable { private } => stack.identity_enable(ctx, private, now),
            Operation::Relay { pdu, dst } => {
                let relayed = stack.relay(ctx, &pdu, dst) | stack.proxy_cli_relay(ctx, &pdu);
                if relayed {
                    Ok(())
                } else {
                    Err(DeviceError::NotConnected)
                }
            }
            Operation::ProxyConnect { net_idx } => stack.proxy_connect(net_idx),
            Operation::ProxyConnectNodeId { net_idx, addr } => stack.proxy_connect_node_id(net_idx, addr),
            Operation::ProxyDisconnect { net_idx } => stack.proxy_disconnect(ctx, net_idx),
            Operation::FilterSet {
                net_idx,
                filter_type,
                status,
            } => stack.proxy_filter_set(ctx, net_idx, filter_type, status, now),
            Operation::FilterAddrOp {
                net_idx,
                addrs,
                add,
                status,
            } => stack.proxy_filter_addr_op(ctx, net_idx, &addrs, add, status, now),
            Operation::PbGattEnable => stack.pb_gatt_enable(ctx, now),
            Operation::PbGattDisable => stack.pb_gatt_disable(ctx, now),
            Operation::LinkAccept => {
                stack.link_accept(ctx, now);
                Ok(())
            }
            Operation::LinkOpen { uuid, timeout } => stack.link_open(uuid, timeout, now),
            Operation::LinkClose(reason) => stack.link_close(ctx, reason),
            Operation::ProvSend(pdu) => stack.prov_send(ctx, &pdu, now),
            Operation::ScanEnable => stack.scan_enable(ctx),
            Operation::ScanDisable => stack.scan_disable(ctx),
            Operation::ScanActive(active) => {
                stack.scan_active_set(ctx, active);
                Ok(())
            }
        }
    }
}

/// Queue `op` and wait for the runner to handle it.
pub async fn request<'a, const Q: usize>(
    events: &EventSender<'_, 'a, Q>,
    reply: &'a Reply,
    op: Operation<'a>,
) -> Result<(), DeviceError> {
    reply.reset();
    events.send(Event::Request { op, reply }).await;
    reply.wait().await
}

/// Set the filter type of the proxy serving `net_idx` and wait for its
/// Filter Status, or the operation timeout.
pub async fn filter_set<'a, const Q: usize>(
    events: &EventSender<'_, 'a, Q>,
    reply: &'a Reply,
    status: &'a FilterStatus,
    net_idx: u16,
    filter_type: FilterType,
) -> Result<(), DeviceError> {
    status.reset();
    let op = Operation::FilterSet {
        net_idx,
        filter_type,
        status: Some(status),
    };
    request(events, reply, op).await?;
    status.wait().await
}

/// Add `addrs` to, or remove them from, the filter of the proxy serving
/// `net_idx` and wait for its Filter Status.
pub async fn filter_addr_op<'a, const Q: usize>(
    events: &EventSender<'_, 'a, Q>,
    reply: &'a Reply,
    status: &'a FilterStatus,
    net_idx: u16,
    addrs: &[u16],
    add: bool,
) -> Result<(), DeviceError> {
    let addrs = Vec::from_slice(addrs).map_err(|_| DeviceError::InvalidArgument)?;
    status.reset();
    let op = Operation::FilterAddrOp {
        net_idx,
        addrs,
        add,
        status: Some(status),
    };
    request(events, reply, op).await?;
    status.wait().await
}
