//! Per link segmentation and reassembly of proxy PDUs.

use crate::bearer::{Completion, ConnId, Owner, Transmit};
use crate::config::{PROXY_MSG_LEN, SAR_TIMEOUT};
use crate::driver::deadline::{earliest, Deadline};
use crate::driver::DeviceError;
use crate::pdu::proxy::{Header, MessageType, ProxyPDU, SAR};
use embassy_time::Instant;
use heapless::Vec;

/// Fragment header plus payload never exceeds this, whatever the MTU.
const MAX_FRAGMENT_LEN: usize = 512;

/// ATT opcode and handle preceding the value of a write or notification.
const ATT_OVERHEAD: u16 = 3;

#[derive(Debug)]
pub struct Role<const L: usize> {
    conn: ConnId,
    owner: Owner,
    buf: Vec<u8, L>,
    message_type: MessageType,
    sar_timer: Deadline,
    completion: Option<Completion>,
}

impl<const L: usize> Role<L> {
    fn new(conn: ConnId, owner: Owner) -> Self {
        Self {
            conn,
            owner,
            buf: Vec::new(),
            message_type: MessageType::NetworkPDU,
            sar_timer: Deadline::new(),
            completion: None,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Bytes of the message currently being reassembled.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    fn append(&mut self, data: &[u8]) {
        // Capacity was checked before any state change.
        let _ = self.buf.extend_from_slice(data);
    }

    fn take(&mut self) -> Inbound<L> {
        let payload = self.buf.clone();
        self.buf.clear();
        Inbound {
            conn: self.conn,
            owner: self.owner,
            message_type: self.message_type,
            payload,
        }
    }
}

/// A reassembled proxy message ready for its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound<const L: usize = PROXY_MSG_LEN> {
    pub conn: ConnId,
    pub owner: Owner,
    pub message_type: MessageType,
    pub payload: Vec<u8, L>,
}

/// Arena of the links carrying mesh traffic, one role per link.
pub struct Roles<const N: usize, const L: usize = PROXY_MSG_LEN> {
    roles: [Option<Role<L>>; N],
    released: bool,
}

impl<const N: usize, const L: usize> Default for Roles<N, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const L: usize> Roles<N, L> {
    pub fn new() -> Self {
        Self {
            roles: core::array::from_fn(|_| None),
            released: false,
        }
    }

    pub fn setup(&mut self, conn: ConnId, owner: Owner) -> Result<(), DeviceError> {
        if self.get(conn).is_some() {
            warn!("role already set up for {:?}", conn);
            return Err(DeviceError::Already);
        }
        let slot = self
            .roles
            .iter_mut()
            .find(|role| role.is_none())
            .ok_or(DeviceError::NoMemory)?;
        debug!("role setup {:?} {:?}", conn, owner);
        *slot = Some(Role::new(conn, owner));
        Ok(())
    }

    /// Release the role of `conn`, dropping any partial message.
    pub fn cleanup(&mut self, conn: ConnId) -> Option<Owner> {
        let slot = self
            .roles
            .iter_mut()
            .find(|role| matches!(role, Some(role) if role.conn == conn))?;
        let role = slot.take()?;
        debug!("role cleanup {:?}", conn);
        self.released = true;
        Some(role.owner)
    }

    /// Whether a link was released since the last call, freeing a slot for
    /// connectable advertising.
    pub fn take_released(&mut self) -> bool {
        core::mem::take(&mut self.released)
    }

    pub fn get(&self, conn: ConnId) -> Option<&Role<L>> {
        self.roles.iter().flatten().find(|role| role.conn == conn)
    }

    fn get_mut(&mut self, conn: ConnId) -> Option<&mut Role<L>> {
        self.roles.iter_mut().flatten().find(|role| role.conn == conn)
    }

    pub fn owner(&self, conn: ConnId) -> Option<Owner> {
        self.get(conn).map(Role::owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Role<L>> {
        self.roles.iter().flatten()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn has_available_conn(&self) -> bool {
        self.count() < N
    }

    /// Feed one received fragment, returning the message it completes.
    pub fn recv(
        &mut self,
        conn: ConnId,
        data: &[u8],
        now: Instant,
    ) -> Result<Option<Inbound<L>>, DeviceError> {
        let role = self.get_mut(conn).ok_or_else(|| {
            warn!("no role for {:?}", conn);
            DeviceError::InvalidArgument
        })?;
        let pdu = ProxyPDU::parse(data).ok_or(DeviceError::InvalidArgument)?;

        trace!("{:?} recv {} bytes", conn, data.len());

        if role.buf.capacity() - role.buf.len() < pdu.data.len() {
            warn!("reassembly buffer overflow");
            return Err(DeviceError::InvalidArgument);
        }

        let message_type = pdu.header.message_type;
        match pdu.header.sar {
            SAR::Complete => {
                if !role.buf.is_empty() {
                    warn!("complete PDU while a pending incomplete one");
                    return Err(DeviceError::InvalidArgument);
                }
                role.message_type = message_type;
                role.append(pdu.data);
                Ok(Some(role.take()))
            }
            SAR::First => {
                if !role.buf.is_empty() {
                    warn!("first PDU while a pending incomplete one");
                    return Err(DeviceError::InvalidArgument);
                }
                role.sar_timer.schedule(now, SAR_TIMEOUT);
                role.message_type = message_type;
                role.append(pdu.data);
                Ok(None)
            }
            SAR::Continuation => {
                if role.buf.is_empty() {
                    warn!("continuation with no prior data");
                    return Err(DeviceError::InvalidArgument);
                }
                if role.message_type != message_type {
                    warn!("unexpected message type in continuation");
                    return Err(DeviceError::InvalidArgument);
                }
                role.sar_timer.schedule(now, SAR_TIMEOUT);
                role.append(pdu.data);
                Ok(None)
            }
            SAR::Last => {
                if role.buf.is_empty() {
                    warn!("last PDU with no prior data");
                    return Err(DeviceError::InvalidArgument);
                }
                if role.message_type != message_type {
                    warn!("unexpected message type in last PDU");
                    return Err(DeviceError::InvalidArgument);
                }
                role.sar_timer.cancel();
                role.append(pdu.data);
                Ok(Some(role.take()))
            }
        }
    }

    /// Segment `msg` to the link MTU and hand every fragment to `tx`.
    ///
    /// Only the final fragment carries `completion`. A failed fragment aborts
    /// the message, leaving the peer to time out the partial reassembly.
    pub fn send<T: Transmit + ?Sized>(
        &mut self,
        tx: &mut T,
        conn: ConnId,
        message_type: MessageType,
        msg: &[u8],
        completion: Option<Completion>,
    ) -> Result<(), DeviceError> {
        if self.get(conn).is_none() {
            warn!("no role for {:?}", conn);
            return Err(DeviceError::InvalidArgument);
        }

        let mtu = usize::from(tx.mtu(conn).saturating_sub(ATT_OVERHEAD)).min(MAX_FRAGMENT_LEN);
        if mtu < 2 {
            return Err(DeviceError::InvalidArgument);
        }
        trace!("{:?} send {} bytes, mtu {}", conn, msg.len(), mtu);

        if mtu > msg.len() {
            return self.send_fragment(tx, conn, SAR::Complete, message_type, msg, completion);
        }

        let (first, mut rest) = msg.split_at(mtu - 1);
        self.send_fragment(tx, conn, SAR::First, message_type, first, None)?;

        while !rest.is_empty() {
            if rest.len() < mtu {
                return self.send_fragment(tx, conn, SAR::Last, message_type, rest, completion);
            }
            let (chunk, remainder) = rest.split_at(mtu - 1);
            self.send_fragment(tx, conn, SAR::Continuation, message_type, chunk, None)?;
            rest = remainder;
        }

        Ok(())
    }

    fn send_fragment<T: Transmit + ?Sized>(
        &mut self,
        tx: &mut T,
        conn: ConnId,
        sar: SAR,
        message_type: MessageType,
        data: &[u8],
        completion: Option<Completion>,
    ) -> Result<(), DeviceError> {
        let mut fragment: Vec<u8, MAX_FRAGMENT_LEN> = Vec::new();
        ProxyPDU {
            header: Header::new(sar, message_type),
            data,
        }
        .emit(&mut fragment)?;

        if let Some(role) = self.get_mut(conn) {
            role.completion = completion;
        }
        tx.transmit(conn, &fragment)
    }

    /// A queued fragment left the radio; yields the completion it carried.
    pub fn send_complete(&mut self, conn: ConnId) -> Option<(Owner, Completion)> {
        let role = self.get_mut(conn)?;
        let completion = role.completion.take()?;
        Some((role.owner, completion))
    }

    /// Links whose reassembly stalled past the SAR timeout.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<ConnId, N> {
        let mut expired = Vec::new();
        for role in self.roles.iter_mut().flatten() {
            if role.sar_timer.poll(now) {
                warn!("SAR timeout on {:?}", role.conn);
                let _ = expired.push(role.conn);
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.iter()
            .fold(None, |next, role| earliest(next, role.sar_timer.expires_at()))
    }
}
