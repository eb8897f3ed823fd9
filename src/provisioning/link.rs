//! Provisioning bearer link carried over a GATT connection.

use crate::bearer::ConnId;
use crate::config::PROTOCOL_TIMEOUT;
use crate::driver::deadline::Deadline;
use crate::driver::{DeviceError, Link, LinkCloseReason, Provisioning};
use embassy_time::{Duration, Instant};

/// The single PB-GATT link, opened either by a remote provisioner on our
/// server or by us as provisioner through the client.
pub struct PbGattLink {
    conn: Option<ConnId>,
    active: bool,
    provisioner: bool,
    protocol_timer: Deadline,
}

impl Default for PbGattLink {
    fn default() -> Self {
        Self::new()
    }
}

impl PbGattLink {
    pub const fn new() -> Self {
        Self {
            conn: None,
            active: false,
            provisioner: false,
            protocol_timer: Deadline::new(),
        }
    }

    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn reset(&mut self) {
        self.conn = None;
        self.active = false;
        self.provisioner = false;
        self.protocol_timer.cancel();
    }

    fn closed<C: Provisioning + ?Sized>(&mut self, ctx: &mut C, reason: LinkCloseReason) {
        self.reset();
        ctx.link_closed(reason);
    }

    fn keep_alive(&mut self, now: Instant) {
        self.protocol_timer.schedule(now, PROTOCOL_TIMEOUT);
    }

    /// A provisioner enabled notifications on our provisioning service.
    pub fn start<C: Provisioning + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        now: Instant,
    ) -> Result<(), DeviceError> {
        debug!("link start {:?}", conn);
        if self.conn.is_some() {
            return Err(DeviceError::Busy);
        }
        self.active = true;
        self.conn = Some(conn);
        self.keep_alive(now);
        ctx.link_opened();
        Ok(())
    }

    /// The connection carrying the link went away.
    pub fn close<C: Provisioning + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
    ) -> Result<(), DeviceError> {
        if self.conn != Some(conn) {
            debug!("not connected");
            return Err(DeviceError::NotConnected);
        }
        self.closed(ctx, LinkCloseReason::Success);
        Ok(())
    }

    /// A reassembled provisioning PDU arrived on `conn`.
    pub fn recv<C: Provisioning + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        pdu: &[u8],
        now: Instant,
    ) -> Result<(), DeviceError> {
        if self.conn != Some(conn) {
            warn!("data for unexpected connection");
            return Err(DeviceError::NotConnected);
        }
        if pdu.is_empty() {
            warn!("too short provisioning packet");
            return Err(DeviceError::InvalidArgument);
        }
        self.keep_alive(now);
        ctx.provisioning_received(pdu);
        Ok(())
    }

    /// Our central link to the device being provisioned came up.
    pub fn cli_start(&mut self, conn: ConnId, now: Instant) -> Result<(), DeviceError> {
        debug!("client link start {:?}", conn);
        if self.conn.is_some() {
            return Err(DeviceError::Busy);
        }
        self.conn = Some(conn);
        self.keep_alive(now);
        Ok(())
    }

    /// Notifications from the device are on; the link is usable.
    pub fn cli_open<C: Provisioning + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
    ) -> Result<(), DeviceError> {
        if self.conn != Some(conn) {
            debug!("not connected");
            return Err(DeviceError::NotConnected);
        }
        ctx.link_opened();
        Ok(())
    }

    /// Open a link as provisioner. The caller then points the PB-GATT client
    /// at the device.
    pub fn open(&mut self, timeout: Duration, now: Instant) -> Result<(), DeviceError> {
        if self.active {
            error!("ignoring bearer open: link already active");
            return Err(DeviceError::Busy);
        }
        self.active = true;
        self.provisioner = true;
        self.protocol_timer.schedule(now, timeout);
        Ok(())
    }

    /// Close the link, through a disconnect when a connection carries it.
    pub fn link_close<C: Link + Provisioning + ?Sized>(
        &mut self,
        ctx: &mut C,
        reason: LinkCloseReason,
    ) -> Result<(), DeviceError> {
        match self.conn {
            None => {
                self.closed(ctx, reason);
                Ok(())
            }
            Some(conn) => ctx.disconnect(conn),
        }
    }

    /// Connection to send the next PDU on, restarting the protocol timer.
    pub fn send(&mut self, now: Instant) -> Result<ConnId, DeviceError> {
        let conn = self.conn.ok_or(DeviceError::NotConnected)?;
        self.keep_alive(now);
        Ok(conn)
    }

    /// The last fragment of a PDU went out on `conn`.
    pub fn sent<C: Provisioning + ?Sized>(
        &mut self,
        ctx: &mut C,
        conn: ConnId,
        result: Result<(), DeviceError>,
    ) {
        if self.conn != Some(conn) {
            warn!("not connected");
            return;
        }
        match result {
            Ok(()) => ctx.send_complete(),
            Err(e) => warn!("send failed: {:?}", e),
        }
    }

    /// Expire the protocol timer. Returns true when a provisioner link that
    /// never connected timed out, so the client target must be dropped.
    pub fn poll<C: Link + Provisioning + ?Sized>(&mut self, ctx: &mut C, now: Instant) -> bool {
        if !self.protocol_timer.poll(now) || !self.active {
            return false;
        }
        let mut reset_target = false;
        if self.provisioner {
            match self.conn {
                Some(conn) => {
                    if let Err(e) = ctx.disconnect(conn) {
                        warn!("disconnecting {:?} failed: {:?}", conn, e);
                    }
                }
                None => reset_target = true,
            }
        }
        debug!("protocol timeout");
        self.closed(ctx, LinkCloseReason::Timeout);
        reset_target
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.protocol_timer.expires_at()
    }
}
