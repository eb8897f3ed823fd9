use crate::address::{ALL_NODES, UNASSIGNED};
use crate::config::PROXY_FILTER_SIZE;
use crate::pdu::configuration::FilterType;
use heapless::Vec;

#[cfg(feature = "defmt")]
use defmt::Format;

/// Filter state of a proxy client. `None` until the client enables
/// notifications or picks a type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum FilterKind {
    #[default]
    None,
    Accept,
    Reject,
}

impl From<FilterType> for FilterKind {
    fn from(filter_type: FilterType) -> Self {
        match filter_type {
            FilterType::Accept => Self::Accept,
            FilterType::Reject => Self::Reject,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    kind: FilterKind,
    addrs: Vec<u16, PROXY_FILTER_SIZE>,
}

impl Filter {
    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Switch to `kind`, emptying the list.
    pub fn reset(&mut self, kind: FilterKind) {
        self.kind = kind;
        self.addrs.clear();
    }

    /// Only changes the type, keeping the list.
    pub fn set_kind(&mut self, kind: FilterKind) {
        self.kind = kind;
    }

    pub fn add(&mut self, addr: u16) {
        if addr == UNASSIGNED || self.contains(addr) {
            return;
        }
        if self.addrs.push(addr).is_err() {
            debug!("filter full, dropping 0x{:04x}", addr);
        }
    }

    pub fn remove(&mut self, addr: u16) {
        if addr == UNASSIGNED {
            return;
        }
        if let Some(pos) = self.addrs.iter().position(|a| *a == addr) {
            self.addrs.swap_remove(pos);
        }
    }

    pub fn contains(&self, addr: u16) -> bool {
        self.addrs.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Whether a PDU for `dst` may be relayed to this client.
    pub fn accepts(&self, dst: u16) -> bool {
        match self.kind {
            FilterKind::Reject => !self.contains(dst),
            FilterKind::None => false,
            FilterKind::Accept if dst == ALL_NODES => true,
            FilterKind::Accept => self.contains(dst),
        }
    }

    /// Type and list size reported in a Filter Status.
    pub fn status(&self) -> (FilterType, u16) {
        let filter_type = match self.kind {
            FilterKind::Accept => FilterType::Accept,
            _ => FilterType::Reject,
        };
        (filter_type, self.addrs.len() as u16)
    }
}
