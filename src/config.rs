//! Timing, sizing and advertising parameters of the GATT bearers.

use embassy_time::Duration;

/// Size of a per connection reassembly buffer.
pub const PROXY_MSG_LEN: usize = 66;

/// Number of addresses a proxy server client can hold in its filter.
pub const PROXY_FILTER_SIZE: usize = 16;

/// Largest network PDU carried in a proxy message.
pub const NET_MAX_PDU_LEN: usize = 29;

/// Length of the network header stripped from proxy configuration PDUs.
pub const NET_HDR_LEN: usize = 9;

pub const SAR_TIMEOUT: Duration = Duration::from_secs(20);
pub const PROXY_OP_TIMEOUT: Duration = Duration::from_secs(10);
pub const NODE_ID_TIMEOUT: Duration = Duration::from_secs(60);
pub const FAST_ADV_TIME: Duration = Duration::from_secs(60);
pub const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which the random value of private beacons is refreshed.
pub const PROXY_RANDOM_UPDATE_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub const SVC_REG_ATTEMPTS: u8 = 5;
pub const SVC_REG_RETRY: Duration = Duration::from_millis(10);

/// Shortest slice granted to a subnet when several share the advertiser.
pub const MIN_ADV_SLICE: Duration = Duration::from_millis(1020);

pub const SCAN_INTERVAL_MS: u16 = 30;
pub const SCAN_WINDOW_MS: u16 = 30;

/// Most addresses carried by a single filter add/remove request.
pub const MAX_FILTER_ADDRS: usize = 5;

pub const MAX_OBSERVERS: usize = 4;
pub const MAX_SCAN_LISTENERS: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvInterval {
    pub min_ms: u16,
    pub max_ms: u16,
}

pub const ADV_FAST_INT: AdvInterval = AdvInterval {
    min_ms: 100,
    max_ms: 150,
};

pub const ADV_SLOW_INT: AdvInterval = AdvInterval {
    min_ms: 1000,
    max_ms: 1200,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OwnAddress {
    Static,
    Resolvable,
}

/// Parameters of a connectable advertising set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvParams {
    pub interval: AdvInterval,
    pub own_address: OwnAddress,
    /// Advertise only, without answering scan requests.
    pub connectable_only: bool,
    /// `None` advertises until stopped.
    pub timeout: Option<Duration>,
}

impl AdvParams {
    pub fn fast(timeout: Option<Duration>) -> Self {
        Self {
            interval: ADV_FAST_INT,
            own_address: OwnAddress::Static,
            connectable_only: false,
            timeout,
        }
    }

    pub fn slow(timeout: Option<Duration>) -> Self {
        Self {
            interval: ADV_SLOW_INT,
            own_address: OwnAddress::Static,
            connectable_only: false,
            timeout,
        }
    }

    pub fn with_own_address(mut self, own_address: OwnAddress) -> Self {
        self.own_address = own_address;
        self
    }
}

/// Observer scan parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanParams {
    pub active: bool,
    pub interval_ms: u16,
    pub window_ms: u16,
}

impl ScanParams {
    pub fn new(active: bool) -> Self {
        Self {
            active,
            interval_ms: SCAN_INTERVAL_MS,
            window_ms: SCAN_WINDOW_MS,
        }
    }
}

/// Static identity of an unprovisioned device, advertised over PB-GATT.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceInfo<'a> {
    pub uuid: [u8; 16],
    pub oob_info: u16,
    pub uri: Option<&'a str>,
    pub name: Option<&'a str>,
}

/// Proxy feature states owned by the configuration server.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProxyFeatures {
    pub gatt_proxy: bool,
    pub private_gatt_proxy: bool,
    /// On-demand private proxy window in seconds, 0 when disabled.
    pub on_demand_private_proxy: u8,
    pub node_id: NodeIdState,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeIdState {
    #[default]
    NotEnabled,
    Enabled,
    EnabledPrivate,
}
