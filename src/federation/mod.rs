// src/federation/mod.rs
//! Build federation with peer instances
//!
//! Peers are managed resources like chroots: they are prepared (endpoint
//! validated), checked (advertisement fetched) and activated by an operator.
//! The [`PeerRegistry`] holds what the coordinator needs to pick a peer for
//! an architecture it does not host: which peers are Active, what they
//! advertise, and whether their circuit is open.
//!
//! Selection among eligible peers is a pluggable [`PeerSelector`].
//!
//! ```toml
//! [federation]
//! selection = "round-robin"   # or "least-loaded"
//!
//! [[peers]]
//! endpoint = "https://builder.example.org:8066/"
//! token = "shared-secret"
//! ```

mod circuit;
pub mod client;
pub mod protocol;

pub use circuit::{CircuitState, PeerCircuits};
pub use client::{HttpPeerClient, PeerEndpoint, RemoteBuilder};
pub use protocol::Advertisement;

use crate::chroot::ChrootKey;
use crate::config::FederationSection;
use crate::error::{Error, Result};
use crate::status::{ManagedResource, ResourceKind, fingerprint};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Jitter applied to suspect cooldowns
const COOLDOWN_JITTER: f32 = 0.25;

/// Peer id: SHA-256 of the endpoint URL, hex encoded
pub fn peer_id(endpoint: &str) -> String {
    hex::encode(Sha256::digest(endpoint.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub endpoint: String,

    /// Shared token sent with every request
    #[serde(default)]
    pub token: Option<String>,
}

impl PeerConfig {
    pub fn validate(&self) -> Result<()> {
        self.url().map(|_| ())
    }

    pub fn url(&self) -> Result<Url> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| Error::Config(format!("Invalid peer URL '{}': {}", self.endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(Error::Config(format!(
                "peer URL '{}' must be http(s) with a host",
                self.endpoint
            )));
        }
        Ok(url)
    }

    pub fn id(&self) -> String {
        peer_id(&self.endpoint)
    }

    pub fn endpoint(&self) -> Result<PeerEndpoint> {
        Ok(PeerEndpoint {
            id: self.id(),
            url: self.url()?,
            token: self.token.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
}

/// A peer eligible for one job
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub endpoint: PeerEndpoint,
    pub load: f64,
    pub free_capacity: usize,
    /// Builds this instance currently has running there
    pub in_flight: usize,
}

/// Picks one peer among eligible candidates (sorted by id)
pub trait PeerSelector: Send + Sync {
    fn select(&self, key: &ChrootKey, candidates: &[PeerCandidate]) -> Option<usize>;
}

/// Rotate through candidates per (codename, architecture)
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: Mutex<HashMap<ChrootKey, usize>>,
}

impl PeerSelector for RoundRobin {
    fn select(&self, key: &ChrootKey, candidates: &[PeerCandidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut next = self.next.lock();
        let counter = next.entry(key.clone()).or_insert(0);
        let index = *counter % candidates.len();
        *counter = counter.wrapping_add(1);
        Some(index)
    }
}

/// Lowest advertised load first, then fewest builds of ours in flight
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl PeerSelector for LeastLoaded {
    fn select(&self, _key: &ChrootKey, candidates: &[PeerCandidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.load
                    .total_cmp(&b.load)
                    .then(a.in_flight.cmp(&b.in_flight))
                    .then(b.free_capacity.cmp(&a.free_capacity))
            })
            .map(|(i, _)| i)
    }
}

impl SelectionStrategy {
    pub fn selector(self) -> Box<dyn PeerSelector> {
        match self {
            SelectionStrategy::RoundRobin => Box::new(RoundRobin::default()),
            SelectionStrategy::LeastLoaded => Box::new(LeastLoaded),
        }
    }
}

#[derive(Debug, Clone)]
struct PeerState {
    endpoint: PeerEndpoint,
    active: bool,
    advertisement: Option<Advertisement>,
    in_flight: usize,
}

/// Shared view of all configured peers
pub struct PeerRegistry {
    peers: RwLock<BTreeMap<String, PeerState>>,
    circuits: PeerCircuits,
    selector: Box<dyn PeerSelector>,
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.peers.read().len())
            .finish_non_exhaustive()
    }
}

impl PeerRegistry {
    pub fn new(selector: Box<dyn PeerSelector>, circuits: PeerCircuits) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            circuits,
            selector,
        }
    }

    pub fn from_config(config: &FederationSection) -> Self {
        Self::new(
            config.selection.selector(),
            PeerCircuits::new(config.failure_threshold, config.cooldown(), COOLDOWN_JITTER),
        )
    }

    /// Register a peer (inactive until told otherwise)
    pub fn register(&self, endpoint: PeerEndpoint) {
        self.peers
            .write()
            .entry(endpoint.id.clone())
            .or_insert_with(|| PeerState {
                endpoint,
                active: false,
                advertisement: None,
                in_flight: 0,
            });
    }

    pub fn unregister(&self, id: &str) {
        self.peers.write().remove(id);
    }

    pub fn set_active(&self, id: &str, active: bool) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            if peer.active != active {
                info!(
                    "[federation] peer {} {}",
                    peer.endpoint.url,
                    if active { "active" } else { "inactive" }
                );
            }
            peer.active = active;
        }
    }

    pub fn advertise(&self, id: &str, advertisement: Advertisement) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            debug!(
                "[federation] {} advertises {} chroot(s), load {:.2}",
                peer.endpoint.url,
                advertisement.chroots.len(),
                advertisement.load
            );
            peer.advertisement = Some(advertisement);
        }
    }

    /// Active, non-suspect peers advertising `key`, minus `exclude`
    pub fn candidates(&self, key: &ChrootKey, exclude: &[String]) -> Vec<PeerCandidate> {
        self.peers
            .read()
            .values()
            .filter(|p| p.active && !exclude.contains(&p.endpoint.id))
            .filter(|p| self.circuits.allows(&p.endpoint.id))
            .filter_map(|p| {
                let adv = p.advertisement.as_ref()?;
                (adv.active && adv.hosts(key)).then(|| PeerCandidate {
                    endpoint: p.endpoint.clone(),
                    load: adv.load,
                    free_capacity: adv.free_capacity,
                    in_flight: p.in_flight,
                })
            })
            .collect()
    }

    /// Whether any Active peer advertises `key`, suspect or not
    pub fn hosts(&self, key: &ChrootKey) -> bool {
        self.hosts_except(key, &[])
    }

    pub fn hosts_except(&self, key: &ChrootKey, exclude: &[String]) -> bool {
        self.peers.read().values().any(|p| {
            p.active
                && !exclude.contains(&p.endpoint.id)
                && p.advertisement
                    .as_ref()
                    .is_some_and(|a| a.active && a.hosts(key))
        })
    }

    pub fn select(&self, key: &ChrootKey, exclude: &[String]) -> Option<PeerEndpoint> {
        let candidates = self.candidates(key, exclude);
        let index = self.selector.select(key, &candidates)?;
        candidates.get(index).map(|c| c.endpoint.clone())
    }

    pub fn begin(&self, id: &str) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.in_flight += 1;
        }
    }

    pub fn finish(&self, id: &str) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.in_flight = peer.in_flight.saturating_sub(1);
        }
    }

    pub fn record_success(&self, id: &str) {
        self.circuits.record_success(id);
    }

    /// Network-level failure: counts towards marking the peer suspect
    pub fn record_failure(&self, id: &str) {
        self.circuits.record_failure(id);
    }

    pub fn circuit(&self, id: &str) -> CircuitState {
        self.circuits.state(id)
    }
}

/// One peer as a managed resource
pub struct RemotePeer {
    config: PeerConfig,
    client: Arc<dyn RemoteBuilder>,
    registry: Arc<PeerRegistry>,
}

impl RemotePeer {
    pub fn new(config: PeerConfig, client: Arc<dyn RemoteBuilder>, registry: Arc<PeerRegistry>) -> Self {
        Self {
            config,
            client,
            registry,
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn id(&self) -> String {
        self.config.id()
    }
}

#[async_trait]
impl ManagedResource for RemotePeer {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RemotePeer
    }

    fn key(&self) -> String {
        self.config.endpoint.clone()
    }

    fn fingerprint(&self) -> String {
        fingerprint(&self.config)
    }

    async fn prepare(&mut self) -> Result<()> {
        self.registry.register(self.config.endpoint()?);
        Ok(())
    }

    async fn check(&mut self) -> Result<()> {
        let endpoint = self.config.endpoint()?;
        let advertisement = self.client.advertisement(&endpoint).await?;
        if !advertisement.active {
            return Err(Error::Rejected(format!(
                "peer {} ({}) is not active",
                advertisement.identity, self.config.endpoint
            )));
        }
        self.registry.advertise(&endpoint.id, advertisement);
        self.registry.record_success(&endpoint.id);
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        self.registry.unregister(&self.id());
        Ok(())
    }

    async fn activate_side_effects(&mut self) -> Result<()> {
        self.registry.set_active(&self.id(), true);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::status::Tracked;
    use std::time::Duration;

    fn registry(strategy: SelectionStrategy) -> PeerRegistry {
        PeerRegistry::new(
            strategy.selector(),
            PeerCircuits::new(1, Duration::from_secs(60), 0.0),
        )
    }

    #[test]
    fn test_peer_id_is_sha256_of_endpoint() {
        let id = peer_id("https://peer.example.org/");
        assert_eq!(id.len(), 64);
        assert_eq!(id, peer_id("https://peer.example.org/"));
        assert_ne!(id, peer_id("https://other.example.org/"));
    }

    #[test]
    fn test_peer_config_validation() {
        let ok = PeerConfig {
            endpoint: "https://peer.example.org:8066/".into(),
            token: None,
        };
        assert!(ok.validate().is_ok());
        for bad in ["not a url", "ftp://peer.example.org/", "file:///tmp"] {
            let config = PeerConfig {
                endpoint: bad.into(),
                token: None,
            };
            assert!(config.validate().is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_round_robin_rotates() {
        let registry = registry(SelectionStrategy::RoundRobin);
        let a = add_peer(&registry, "http://a.example.org/", &[("sid", "armel")], 0.0);
        let b = add_peer(&registry, "http://b.example.org/", &[("sid", "armel")], 0.0);
        let key = ChrootKey::new("sid", "armel");

        let picks: Vec<String> = (0..4).map(|_| registry.select(&key, &[]).unwrap().id).collect();
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
        assert_ne!(picks[0], picks[1]);
        assert!(picks.contains(&a) && picks.contains(&b));
    }

    #[test]
    fn test_least_loaded() {
        let registry = registry(SelectionStrategy::LeastLoaded);
        add_peer(&registry, "http://busy.example.org/", &[("sid", "armel")], 0.9);
        let idle = add_peer(&registry, "http://idle.example.org/", &[("sid", "armel")], 0.1);
        let key = ChrootKey::new("sid", "armel");
        assert_eq!(registry.select(&key, &[]).unwrap().id, idle);
    }

    #[test]
    fn test_eligibility() {
        let registry = registry(SelectionStrategy::RoundRobin);
        let a = add_peer(&registry, "http://a.example.org/", &[("sid", "armel")], 0.0);
        let key = ChrootKey::new("sid", "armel");

        assert!(registry.select(&ChrootKey::new("sid", "mips"), &[]).is_none());
        assert!(registry.select(&key, &[a.clone()]).is_none());

        registry.set_active(&a, false);
        assert!(registry.select(&key, &[]).is_none());
        assert!(!registry.hosts(&key));

        registry.set_active(&a, true);
        registry.record_failure(&a);
        assert_eq!(registry.circuit(&a), CircuitState::Open);
        assert!(registry.select(&key, &[]).is_none());
        assert!(registry.hosts(&key));
    }

    struct FixedAdvertisement(Advertisement);

    #[async_trait]
    impl RemoteBuilder for FixedAdvertisement {
        async fn build(
            &self,
            _peer: &PeerEndpoint,
            _submission: &crate::build::Submission,
            _job: &crate::build::JobSpec,
            _request_id: &str,
        ) -> crate::build::BuildResult {
            crate::build::BuildResult::new(crate::build::ResultKind::Refused, "not here")
        }

        async fn cancel(&self, _peer: &PeerEndpoint, _request_id: &str) -> Result<()> {
            Ok(())
        }

        async fn advertisement(&self, _peer: &PeerEndpoint) -> Result<Advertisement> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_peer_lifecycle_updates_registry() {
        let registry = Arc::new(registry(SelectionStrategy::RoundRobin));
        let config = PeerConfig {
            endpoint: "http://a.example.org/".into(),
            token: None,
        };
        let id = config.id();
        let client = Arc::new(FixedAdvertisement(advertisement(&[("sid", "armel")], 0.0)));
        let mut peer = Tracked::new(RemotePeer::new(config, client, registry.clone()));
        let key = ChrootKey::new("sid", "armel");

        peer.prepare().await.unwrap();
        assert!(peer.check().await.unwrap());
        assert!(registry.select(&key, &[]).is_none());

        peer.activate().await.unwrap();
        assert_eq!(registry.select(&key, &[]).unwrap().id, id);

        peer.remove().await.unwrap();
        assert!(registry.select(&key, &[]).is_none());
    }
}
