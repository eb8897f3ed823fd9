//! Connectable proxy advertising, shared between subnets in time slices.

use crate::config::{
    AdvParams, OwnAddress, ProxyFeatures, MIN_ADV_SLICE, NODE_ID_TIMEOUT,
    PROXY_RANDOM_UPDATE_INTERVAL,
};
use crate::crypto::{node_identity_hash, private_network_hash};
use crate::driver::{Context, DeviceError};
use crate::observer::{ProxyObserver, Subscribers};
use crate::pdu::advertising::{
    proxy_advertisement, scan_response, IdentificationType, ProxyServiceData,
};
use crate::subnet::{NodeIdentity, Subnet, Subnets};
use embassy_time::{Duration, Instant};
use rand_core::RngCore;

#[cfg(feature = "defmt")]
use defmt::Format;

const SECOND: Duration = Duration::from_secs(1);

/// What a subnet wants to advertise, in priority order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum AdvEvent {
    /// Private Network ID on demand, after a solicitation.
    OnDemandPrivateNetId,
    NodeId,
    PrivateNodeId,
    PrivateNetId,
    NetId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct AdvRequest {
    pub event: AdvEvent,
    /// `None` for as long as nothing else needs the advertiser.
    pub duration: Option<Duration>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
struct Slice {
    start: Instant,
    net_idx: u16,
    request: AdvRequest,
}

/// Ends Node Identity and on-demand advertising that ran out.
pub fn expire<'a, const O: usize>(
    sub: &mut Subnet,
    features: &ProxyFeatures,
    observers: &Subscribers<'a, dyn ProxyObserver + 'a, O>,
    now: Instant,
) {
    if let NodeIdentity::Running { since, .. } = sub.node_identity {
        if now.saturating_duration_since(since) > NODE_ID_TIMEOUT - SECOND {
            debug!("node identity stopped for 0x{:04x}", sub.net_idx);
            identity_stop(sub, observers);
        }
    }

    if features.on_demand_private_proxy > 0 && sub.solicited {
        if let Some(sent) = sub.private_net_id_sent {
            let window = Duration::from_secs(features.on_demand_private_proxy.into());
            if now.saturating_duration_since(sent) > window - SECOND {
                debug!("on demand private network id stopped for 0x{:04x}", sub.net_idx);
                sub.private_net_id_sent = None;
                sub.solicited = false;
            }
        }
    }
}

pub fn identity_start<'a, const O: usize>(
    sub: &mut Subnet,
    private: bool,
    observers: &Subscribers<'a, dyn ProxyObserver + 'a, O>,
    now: Instant,
) {
    sub.node_identity = NodeIdentity::Running {
        since: now,
        private,
    };
    for observer in observers.iter() {
        observer.identity_enabled(sub.net_idx);
    }
}

pub fn identity_stop<'a, const O: usize>(
    sub: &mut Subnet,
    observers: &Subscribers<'a, dyn ProxyObserver + 'a, O>,
) {
    sub.node_identity = NodeIdentity::Stopped;
    for observer in observers.iter() {
        observer.identity_disabled(sub.net_idx);
    }
}

/// Whether `sub` needs proxy advertising at all.
pub fn is_active(sub: &Subnet, features: &ProxyFeatures) -> bool {
    sub.is_node_identity_running()
        || (features.on_demand_private_proxy > 0 && sub.solicited)
        || features.gatt_proxy
        || features.private_gatt_proxy
}

/// Highest priority advertisement `sub` wants right now.
pub fn request(sub: &Subnet, features: &ProxyFeatures, now: Instant) -> Option<AdvRequest> {
    if features.on_demand_private_proxy > 0 && sub.solicited {
        let window = Duration::from_secs(features.on_demand_private_proxy.into());
        let duration = match sub.private_net_id_sent {
            None => window,
            Some(sent) => window
                .checked_sub(now.saturating_duration_since(sent))
                .unwrap_or(Duration::from_ticks(0)),
        };
        return Some(AdvRequest {
            event: AdvEvent::OnDemandPrivateNetId,
            duration: Some(duration),
        });
    }

    if let NodeIdentity::Running { since, private } = sub.node_identity {
        let duration = NODE_ID_TIMEOUT
            .checked_sub(now.saturating_duration_since(since))
            .unwrap_or(Duration::from_ticks(0));
        return Some(AdvRequest {
            event: if private {
                AdvEvent::PrivateNodeId
            } else {
                AdvEvent::NodeId
            },
            duration: Some(duration),
        });
    }

    if features.private_gatt_proxy {
        return Some(AdvRequest {
            event: AdvEvent::PrivateNetId,
            duration: Some(PROXY_RANDOM_UPDATE_INTERVAL),
        });
    }

    if features.gatt_proxy {
        return Some(AdvRequest {
            event: AdvEvent::NetId,
            duration: None,
        });
    }

    None
}

/// Round robin over the subnets needing connectable advertising.
#[derive(Debug, Default)]
pub struct ProxyAdvertiser {
    current: Option<Slice>,
}

impl ProxyAdvertiser {
    pub const fn new() -> Self {
        Self { current: None }
    }

    /// Subnet advertised by the latest slice.
    pub fn current(&self) -> Option<u16> {
        self.current.map(|slice| slice.net_idx)
    }

    /// Start the next slice of proxy advertising and return how long it
    /// runs. `None` means until the next explicit update.
    pub fn advertise<'a, C: Context + ?Sized, const S: usize, const O: usize>(
        &mut self,
        ctx: &mut C,
        subnets: &mut Subnets<S>,
        observers: &Subscribers<'a, dyn ProxyObserver + 'a, O>,
        has_available_conn: bool,
        now: Instant,
    ) -> Option<Duration> {
        let features = ctx.features();

        for sub in subnets.iter_mut() {
            expire(sub, &features, observers, now);
        }

        if !has_available_conn {
            debug!("connectable advertising deferred, max connections");
            return None;
        }

        let count = subnets.iter().filter(|sub| is_active(sub, &features)).count();
        if count == 0 {
            debug!("no subnets to advertise proxy on");
            return None;
        }

        let mut slice_limit = None;
        let mut chosen = None;
        if count > 1 {
            let limit = (NODE_ID_TIMEOUT / count.max(6) as u32).max(MIN_ADV_SLICE);
            slice_limit = Some(limit);
            chosen = self.remaining_slice(subnets, &features, now);
        }

        let (net_idx, mut request) = match chosen {
            Some(chosen) => chosen,
            None => {
                let cursor = self.current.map(|slice| slice.net_idx);
                let next = subnets.round_robin(cursor).find_map(|net_idx| {
                    subnets
                        .get(net_idx)
                        .and_then(|sub| request(sub, &features, now))
                        .map(|request| (net_idx, request))
                });
                match next {
                    Some(next) => next,
                    None => {
                        error!("could not find subnet to advertise");
                        return None;
                    }
                }
            }
        };

        if let Some(limit) = slice_limit {
            request.duration = Some(match request.duration {
                None => limit,
                Some(duration) => duration.min(limit),
            });
        }

        self.current = Some(Slice {
            start: now,
            net_idx,
            request,
        });

        let sub = subnets.get_mut(net_idx)?;
        if request.event == AdvEvent::OnDemandPrivateNetId && sub.private_net_id_sent.is_none() {
            sub.private_net_id_sent = Some(now);
        }

        if let Err(e) = start(ctx, sub, request) {
            error!("advertising proxy failed: {:?}", e);
            return None;
        }

        debug!(
            "advertising {:?} for net_idx 0x{:04x}, {:?}",
            request.event, net_idx, request.duration
        );
        request.duration
    }

    // The previous subnet keeps the advertiser while its slice has at
    // least a second left and it still wants the same thing.
    fn remaining_slice<const S: usize>(
        &self,
        subnets: &Subnets<S>,
        features: &ProxyFeatures,
        now: Instant,
    ) -> Option<(u16, AdvRequest)> {
        let slice = self.current?;
        let duration = slice.request.duration?;
        let current = request(subnets.get(slice.net_idx)?, features, now)?;
        if current.event != slice.request.event {
            return None;
        }

        let passed = now.saturating_duration_since(slice.start);
        if passed < duration && duration - passed >= SECOND {
            Some((
                slice.net_idx,
                AdvRequest {
                    event: current.event,
                    duration: Some(duration - passed),
                },
            ))
        } else {
            None
        }
    }
}

fn start<C: Context + ?Sized>(
    ctx: &mut C,
    sub: &Subnet,
    request: AdvRequest,
) -> Result<(), DeviceError> {
    let keys = sub.tx_keys();
    let kind = match request.event {
        AdvEvent::NetId => {
            let data = proxy_advertisement(&ProxyServiceData::NetworkId(keys.network_id))?;
            let scan_data = scan_response(ctx.device_info().name, None)?;
            return ctx.start_advertising(&AdvParams::slow(request.duration), &data, &scan_data);
        }
        AdvEvent::OnDemandPrivateNetId | AdvEvent::PrivateNetId => {
            IdentificationType::PrivateNetworkIdentity
        }
        AdvEvent::NodeId => IdentificationType::NodeIdentity,
        AdvEvent::PrivateNodeId => IdentificationType::PrivateNodeIdentity,
    };

    let mut random = [0; 8];
    ctx.rng().fill_bytes(&mut random);

    let hash = match kind {
        IdentificationType::PrivateNetworkIdentity => {
            private_network_hash(&keys.identity_key, &keys.network_id, &random)?
        }
        _ => node_identity_hash(
            &keys.identity_key,
            &random,
            ctx.primary_address(),
            kind.is_private(),
        )?,
    };

    let data = proxy_advertisement(&ProxyServiceData::Identity { kind, hash, random })?;
    let scan_data = scan_response(ctx.device_info().name, None)?;

    let params = if kind == IdentificationType::PrivateNetworkIdentity {
        AdvParams::slow(request.duration)
    } else {
        AdvParams::fast(request.duration)
    };
    let params = if kind.is_private() {
        params.with_own_address(OwnAddress::Resolvable)
    } else {
        params
    };

    ctx.start_advertising(&params, &data, &scan_data).map_err(|e| {
        warn!("failed to advertise using {:?}: {:?}", kind, e);
        e
    })
}
