//! Subnet key material and proxy advertising state.

use embassy_time::Instant;

#[cfg(feature = "defmt")]
use defmt::Format;

/// Wildcard and unused network key index.
pub const KEY_ANY: u16 = 0xFFFF;

/// Keys derived from one network key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct NetKeys {
    pub network_id: [u8; 8],
    pub identity_key: [u8; 16],
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum KeyRefreshPhase {
    #[default]
    Normal,
    Phase1,
    Phase2,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum NodeIdentity {
    #[default]
    Stopped,
    Running {
        since: Instant,
        private: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Subnet {
    pub net_idx: u16,
    /// Current keys, followed by the new ones during a key refresh.
    pub keys: [NetKeys; 2],
    pub kr_phase: KeyRefreshPhase,
    pub has_new_key: bool,
    pub node_identity: NodeIdentity,
    /// A solicitation PDU asked for on-demand Private Network ID.
    pub solicited: bool,
    pub private_net_id_sent: Option<Instant>,
}

impl Subnet {
    pub fn new(net_idx: u16, keys: NetKeys) -> Self {
        Self {
            net_idx,
            keys: [keys, keys],
            kr_phase: KeyRefreshPhase::Normal,
            has_new_key: false,
            node_identity: NodeIdentity::Stopped,
            solicited: false,
            private_net_id_sent: None,
        }
    }

    /// Start a key refresh with `keys` as the new key set.
    pub fn update_keys(&mut self, keys: NetKeys) {
        self.keys[1] = keys;
        self.has_new_key = true;
        self.kr_phase = KeyRefreshPhase::Phase1;
    }

    /// Keys used for transmission in the current key refresh phase.
    pub fn tx_keys(&self) -> &NetKeys {
        match self.kr_phase {
            KeyRefreshPhase::Phase2 => &self.keys[1],
            _ => &self.keys[0],
        }
    }

    /// Current keys, then the new ones while a refresh is running.
    pub fn rx_keys(&self) -> impl Iterator<Item = &NetKeys> {
        let count = if self.has_new_key { 2 } else { 1 };
        self.keys.iter().take(count)
    }

    pub fn is_node_identity_running(&self) -> bool {
        matches!(self.node_identity, NodeIdentity::Running { .. })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum SubnetEvent {
    Added,
    Updated,
    Swapped,
    Revoked,
    Deleted,
}

/// Fixed table of the subnets known to this node.
#[derive(Clone, Debug)]
pub struct Subnets<const S: usize> {
    subnets: [Option<Subnet>; S],
}

impl<const S: usize> Default for Subnets<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const S: usize> Subnets<S> {
    pub fn new() -> Self {
        Self {
            subnets: core::array::from_fn(|_| None),
        }
    }

    pub fn add(&mut self, subnet: Subnet) -> Result<(), Subnet> {
        if let Some(existing) = self.get_mut(subnet.net_idx) {
            *existing = subnet;
            return Ok(());
        }
        match self.subnets.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(subnet);
                Ok(())
            }
            None => Err(subnet),
        }
    }

    pub fn remove(&mut self, net_idx: u16) -> Option<Subnet> {
        self.subnets
            .iter_mut()
            .find(|slot| matches!(slot, Some(sub) if sub.net_idx == net_idx))
            .and_then(Option::take)
    }

    pub fn get(&self, net_idx: u16) -> Option<&Subnet> {
        self.iter().find(|sub| sub.net_idx == net_idx)
    }

    pub fn get_mut(&mut self, net_idx: u16) -> Option<&mut Subnet> {
        self.iter_mut().find(|sub| sub.net_idx == net_idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subnet> {
        self.subnets.iter_mut().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Net indexes in table order, starting after `after` and wrapping around
    /// so that `after` itself comes last.
    pub fn round_robin(&self, after: Option<u16>) -> impl Iterator<Item = u16> + '_ {
        let start = after
            .and_then(|idx| {
                self.subnets
                    .iter()
                    .position(|slot| matches!(slot, Some(sub) if sub.net_idx == idx))
            })
            .map(|pos| pos + 1)
            .unwrap_or(0);
        (0..S)
            .map(move |offset| (start + offset) % S)
            .filter_map(move |pos| self.subnets[pos].as_ref().map(|sub| sub.net_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> NetKeys {
        NetKeys {
            network_id: [seed; 8],
            identity_key: [seed; 16],
        }
    }

    #[test]
    fn add_replace_remove() {
        let mut subnets: Subnets<2> = Subnets::new();
        subnets.add(Subnet::new(0, keys(1))).unwrap();
        subnets.add(Subnet::new(1, keys(2))).unwrap();
        subnets.add(Subnet::new(0, keys(3))).unwrap();
        assert_eq!(subnets.get(0).unwrap().keys[0], keys(3));
        assert!(subnets.add(Subnet::new(2, keys(4))).is_err());

        assert!(subnets.remove(0).is_some());
        assert!(subnets.get(0).is_none());
        assert!(subnets.add(Subnet::new(2, keys(4))).is_ok());
    }

    #[test]
    fn key_refresh_selects_keys() {
        let mut sub = Subnet::new(0, keys(1));
        assert_eq!(sub.rx_keys().count(), 1);
        sub.update_keys(keys(2));
        assert_eq!(sub.rx_keys().count(), 2);
        assert_eq!(sub.tx_keys(), &keys(1));
        sub.kr_phase = KeyRefreshPhase::Phase2;
        assert_eq!(sub.tx_keys(), &keys(2));
    }

    #[test]
    fn round_robin_wraps_to_cursor() {
        let mut subnets: Subnets<4> = Subnets::new();
        for idx in [10, 11, 12] {
            subnets.add(Subnet::new(idx, keys(idx as u8))).unwrap();
        }
        let order: std::vec::Vec<u16> = subnets.round_robin(Some(11)).collect();
        assert_eq!(order, [12, 10, 11]);
        let order: std::vec::Vec<u16> = subnets.round_robin(None).collect();
        assert_eq!(order, [10, 11, 12]);
        let order: std::vec::Vec<u16> = subnets.round_robin(Some(99)).collect();
        assert_eq!(order, [10, 11, 12]);
    }
}
