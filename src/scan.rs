//! Observer scanning shared by every mesh bearer.

use crate::bearer::BdAddr;
use crate::config::ScanParams;
use crate::driver::{DeviceError, NetInterface, Network, Scanner};
use crate::observer::Subscribers;
use crate::pdu::advertising::{
    AdStructures, AD_MESH_BEACON, AD_MESH_MESSAGE, AD_MESH_PROV, AD_UUID16_ALL, AD_UUID16_SOME,
};

#[cfg(feature = "defmt")]
use defmt::Format;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum ScanError {
    /// The controller refused the command during a state transition.
    CommandDisallowed,
    Other(u8),
}

impl From<ScanError> for DeviceError {
    fn from(_: ScanError) -> Self {
        DeviceError::Transport
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum ScanState {
    #[default]
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
enum Pending {
    #[default]
    None,
    Enable,
    Disable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum AdvType {
    /// Connectable and scannable undirected.
    Ind,
    DirectInd,
    ScanInd,
    NonConnInd,
    ScanRsp,
}

impl AdvType {
    pub fn is_connectable(&self) -> bool {
        matches!(self, Self::Ind | Self::DirectInd)
    }

    pub fn is_scannable(&self) -> bool {
        matches!(self, Self::Ind | Self::ScanInd)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct AdvReport<'a> {
    pub addr: BdAddr,
    pub rssi: i8,
    pub adv_type: AdvType,
    pub data: &'a [u8],
}

/// Receives every advertising report seen while scanning.
pub trait ScanListener {
    fn on_report(&self, report: &AdvReport<'_>);
}

pub struct Scan<'a, const LISTENERS: usize> {
    state: ScanState,
    pending: Pending,
    enabled: bool,
    active: bool,
    listeners: Subscribers<'a, dyn ScanListener + 'a, LISTENERS>,
}

impl<'a, const LISTENERS: usize> Default for Scan<'a, LISTENERS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const LISTENERS: usize> Scan<'a, LISTENERS> {
    pub fn new() -> Self {
        Self {
            state: ScanState::Disabled,
            pending: Pending::None,
            enabled: false,
            active: false,
            listeners: Subscribers::new(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn register(&mut self, listener: &'a (dyn ScanListener + 'a)) -> Result<(), DeviceError> {
        self.listeners.register(listener)
    }

    pub fn unregister(&mut self, listener: &'a (dyn ScanListener + 'a)) -> bool {
        self.listeners.unregister(listener)
    }

    pub fn enable<S: Scanner + ?Sized>(&mut self, scanner: &mut S) -> Result<(), ScanError> {
        if self.state == ScanState::Enabled {
            debug!("scan already enabled");
            return Ok(());
        }

        match scanner.set_scan_params(&ScanParams::new(self.active)) {
            Ok(()) => {}
            Err(ScanError::CommandDisallowed) if self.state == ScanState::Disabling => {
                debug!("pending scan enable");
                self.pending = Pending::Enable;
                return Ok(());
            }
            Err(e) => {
                error!("set scan params failed: {:?}, state {:?}", e, self.state);
                return Err(e);
            }
        }

        self.enabled = true;

        scanner.start_scan().map_err(|e| {
            error!("starting scan failed: {:?}", e);
            e
        })
    }

    pub fn disable<S: Scanner + ?Sized>(&mut self, scanner: &mut S) -> Result<(), ScanError> {
        if self.state == ScanState::Disabled {
            debug!("scan already disabled");
            return Ok(());
        }

        match scanner.stop_scan() {
            Ok(()) => Ok(()),
            Err(ScanError::CommandDisallowed) => {
                match self.state {
                    ScanState::Disabling => debug!("duplicate scan disable"),
                    ScanState::Enabling => {
                        debug!("pending scan disable");
                        self.pending = Pending::Disable;
                    }
                    _ => {}
                }
                Ok(())
            }
            Err(e) => {
                error!("stopping scan failed: {:?}", e);
                Err(e)
            }
        }
    }

    /// Switch between active and passive scanning, restarting the scanner
    /// once it has stopped.
    pub fn set_active<S: Scanner + ?Sized>(&mut self, scanner: &mut S, active: bool) {
        if self.active == active {
            return;
        }
        self.active = active;
        if let Err(e) = self.disable(scanner) {
            warn!("scan restart failed: {:?}", e);
        }
        self.pending = Pending::Enable;
    }

    /// Controller reported a scan state transition.
    pub fn state_changed<S: Scanner + ?Sized>(&mut self, scanner: &mut S, state: ScanState) {
        if !self.enabled {
            return;
        }

        self.state = state;
        match state {
            ScanState::Enabled => {
                info!("scan enabled");
                if self.pending == Pending::Disable {
                    if let Err(e) = self.disable(scanner) {
                        warn!("pending scan disable failed: {:?}", e);
                    }
                }
                self.pending = Pending::None;
            }
            ScanState::Disabled => {
                info!("scan disabled");
                self.enabled = false;
                if self.pending == Pending::Enable {
                    if let Err(e) = self.enable(scanner) {
                        warn!("pending scan enable failed: {:?}", e);
                    }
                }
                self.pending = Pending::None;
            }
            _ => {}
        }
    }

    /// Deliver a report to the mesh layers and every listener. Returns false
    /// when scanning was not enabled by us and the report was ignored.
    pub fn report<N: Network + ?Sized>(&self, net: &mut N, report: &AdvReport<'_>) -> bool {
        if !self.enabled {
            return false;
        }

        if !report.adv_type.is_connectable() && !report.adv_type.is_scannable() {
            decode_mesh_report(net, report);
        }

        for listener in self.listeners.iter() {
            listener.on_report(report);
        }
        true
    }
}

fn decode_mesh_report<N: Network + ?Sized>(net: &mut N, report: &AdvReport<'_>) {
    let mut offset = 0;
    for structure in AdStructures::new(report.data) {
        let structure = match structure {
            Ok(structure) => structure,
            Err(_) => {
                warn!("AD malformed");
                return;
            }
        };
        let raw = &report.data[offset..offset + 2 + structure.data.len()];
        offset += raw.len();

        match structure.ad_type {
            AD_MESH_MESSAGE => {
                trace!("mesh message, {} bytes", structure.data.len());
                net.network_received(
                    structure.data,
                    NetInterface::Advertising { rssi: report.rssi },
                );
            }
            AD_MESH_PROV => net.pb_adv_received(structure.data),
            AD_MESH_BEACON => {
                trace!("mesh beacon, {} bytes", structure.data.len());
                net.beacon_received(structure.data);
            }
            AD_UUID16_SOME | AD_UUID16_ALL => net.solicitation_received(&report.addr, raw),
            _ => {}
        }
    }
}
