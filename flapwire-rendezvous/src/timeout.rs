//! Connection attempt timeouts.

use flapwire_client::config::RendezvousConfig;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

/// How the peer is expected to be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Lan,
    Internet,
    Proxy,
}

impl ConnectionType {
    /// Classifies a direct route to a peer. Peers whose server-verified
    /// address matches ours sit behind the same gateway.
    pub fn for_peer(our_verified: Option<Ipv4Addr>, peer_verified: Option<Ipv4Addr>) -> Self {
        match (our_verified, peer_verified) {
            (Some(ours), Some(theirs)) if ours == theirs => ConnectionType::Lan,
            _ => ConnectionType::Internet,
        }
    }
}

/// Which side started the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiator {
    Local,
    Buddy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub lan: Duration,
    pub internet: Duration,
    pub proxy: Duration,
    pub ack: Duration,
    pub buddy_bonus: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_config(&RendezvousConfig::default())
    }
}

impl TimeoutPolicy {
    pub fn from_config(config: &RendezvousConfig) -> Self {
        Self {
            lan: Duration::from_millis(config.lan_timeout_ms),
            internet: Duration::from_millis(config.internet_timeout_ms),
            proxy: Duration::from_millis(config.proxy_timeout_ms),
            ack: Duration::from_millis(config.ack_timeout_ms),
            buddy_bonus: Duration::from_millis(config.buddy_initiated_bonus_ms),
        }
    }

    pub fn base(&self, kind: ConnectionType) -> Duration {
        match kind {
            ConnectionType::Lan => self.lan,
            ConnectionType::Internet => self.internet,
            ConnectionType::Proxy => self.proxy,
        }
    }

    /// Timeout for one attempt. Sessions the buddy started get the bonus
    /// because the buddy's client is still setting up its side.
    pub fn connect(&self, kind: ConnectionType, initiator: Initiator) -> Duration {
        match initiator {
            Initiator::Local => self.base(kind),
            Initiator::Buddy => self.base(kind) + self.buddy_bonus,
        }
    }

    /// How long the peer may take to answer a proposal.
    pub fn ack(&self) -> Duration {
        self.ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.connect(ConnectionType::Lan, Initiator::Local), Duration::from_secs(2));
        assert_eq!(policy.connect(ConnectionType::Internet, Initiator::Local), Duration::from_secs(3));
        assert_eq!(policy.connect(ConnectionType::Proxy, Initiator::Local), Duration::from_secs(10));
        assert_eq!(policy.ack(), Duration::from_secs(120));
    }

    #[test]
    fn test_buddy_bonus() {
        let mut config = RendezvousConfig::default();
        config.internet_timeout_ms = 1_500;
        config.buddy_initiated_bonus_ms = 750;
        let policy = TimeoutPolicy::from_config(&config);
        assert_eq!(
            policy.connect(ConnectionType::Internet, Initiator::Buddy),
            policy.base(ConnectionType::Internet) + Duration::from_millis(750)
        );
        assert_eq!(
            policy.connect(ConnectionType::Internet, Initiator::Buddy),
            Duration::from_millis(2_250)
        );
    }

    #[test]
    fn test_connection_type_for_peer() {
        let a = Ipv4Addr::new(203, 0, 113, 7);
        let b = Ipv4Addr::new(198, 51, 100, 2);
        assert_eq!(ConnectionType::for_peer(Some(a), Some(a)), ConnectionType::Lan);
        assert_eq!(ConnectionType::for_peer(Some(a), Some(b)), ConnectionType::Internet);
        assert_eq!(ConnectionType::for_peer(None, Some(b)), ConnectionType::Internet);
    }
}
