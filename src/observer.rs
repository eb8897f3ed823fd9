//! Ordered subscriber lists for cross cutting events.

use crate::driver::DeviceError;
use heapless::Vec;

/// Told when a subnet starts or stops advertising its Node Identity.
pub trait ProxyObserver {
    fn identity_enabled(&self, _net_idx: u16) {}

    fn identity_disabled(&self, _net_idx: u16) {}
}

/// Subscribers notified in registration order.
pub struct Subscribers<'a, T: ?Sized, const N: usize> {
    list: Vec<&'a T, N>,
}

impl<'a, T: ?Sized, const N: usize> Default for Subscribers<'a, T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T: ?Sized, const N: usize> Subscribers<'a, T, N> {
    pub const fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn register(&mut self, subscriber: &'a T) -> Result<(), DeviceError> {
        if self.contains(subscriber) {
            return Err(DeviceError::Already);
        }
        self.list
            .push(subscriber)
            .map_err(|_| DeviceError::NoMemory)
    }

    pub fn unregister(&mut self, subscriber: &'a T) -> bool {
        match self
            .list
            .iter()
            .position(|s| core::ptr::addr_eq(*s, subscriber))
        {
            Some(pos) => {
                self.list.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, subscriber: &T) -> bool {
        self.list.iter().any(|s| core::ptr::addr_eq(*s, subscriber))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a T> + '_ {
        self.list.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
