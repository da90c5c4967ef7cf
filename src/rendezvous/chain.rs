//! Strategy fallback order
//!
//! Pure decision functions; the engine feeds them the current transport
//! descriptor and policy and starts whatever they return.

use super::StrategyKind;
use crate::config::ProxyPolicy;
use crate::control::ConnectionInfo;

/// Fallback order of the connecting strategies
pub const STRATEGY_ORDER: [StrategyKind; 4] = [
    StrategyKind::DirectLan,
    StrategyKind::DirectInternet,
    StrategyKind::ProxyRelay,
    StrategyKind::ProxyRedirect,
];

/// Policy inputs to strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPolicy {
    /// Which strategies may use a proxy
    pub proxy_policy: ProxyPolicy,
    /// Whether proxies proposed by the peer are honoured
    pub proxy_trusted: bool,
}

/// Whether `kind` can run against `info` under `policy`
pub fn is_eligible(kind: StrategyKind, info: Option<&ConnectionInfo>, policy: ChainPolicy) -> bool {
    match kind {
        StrategyKind::DirectLan => {
            policy.proxy_policy.allows_direct() && info.and_then(ConnectionInfo::lan_target).is_some()
        }
        StrategyKind::DirectInternet => {
            policy.proxy_policy.allows_direct() && info.and_then(ConnectionInfo::internet_target).is_some()
        }
        StrategyKind::ProxyRelay => {
            policy.proxy_policy.allows_proxy()
                && policy.proxy_trusted
                && info.is_some_and(|i| i.relay_proxy().is_some() && i.port != 0)
        }
        StrategyKind::ProxyRedirect => policy.proxy_policy.allows_proxy(),
        // Only ever the opening move of an outgoing negotiation
        StrategyKind::Passive => false,
    }
}

/// First strategy to try against a received descriptor
pub fn first_strategy(info: Option<&ConnectionInfo>, policy: ChainPolicy) -> Option<StrategyKind> {
    STRATEGY_ORDER
        .iter()
        .copied()
        .find(|kind| is_eligible(*kind, info, policy))
}

/// Strategy to fall back to after `failed`
///
/// A failed passive listener falls back as if nothing had been tried yet.
pub fn next_strategy(
    failed: StrategyKind,
    info: Option<&ConnectionInfo>,
    policy: ChainPolicy,
) -> Option<StrategyKind> {
    let start = STRATEGY_ORDER
        .iter()
        .position(|kind| *kind == failed)
        .map_or(0, |pos| pos + 1);
    STRATEGY_ORDER[start..]
        .iter()
        .copied()
        .find(|kind| is_eligible(*kind, info, policy))
}

/// Opening strategy of an outgoing negotiation
pub fn initial_outgoing(policy: ChainPolicy) -> StrategyKind {
    match policy.proxy_policy {
        ProxyPolicy::Only => StrategyKind::ProxyRedirect,
        ProxyPolicy::Never | ProxyPolicy::Allow => StrategyKind::Passive,
    }
}
