// src/federation/circuit.rs
//! Per-peer circuit breaking
//!
//! A peer that fails at the network level `threshold` times in a row is
//! marked suspect (Open) and skipped by peer selection for a jittered
//! cooldown. After the cooldown one trial build is let through (HalfOpen);
//! its result closes the circuit or opens it again.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use strum_macros::Display;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl Breaker {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// Open -> HalfOpen once the cooldown ran out
    fn refresh(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open
            && let Some(until) = self.open_until
            && now >= until
        {
            self.state = CircuitState::HalfOpen;
        }
        self.state
    }
}

/// Circuit breakers for all peers, keyed by peer id
#[derive(Debug)]
pub struct PeerCircuits {
    breakers: DashMap<String, Breaker>,
    threshold: u32,
    cooldown: Duration,
    jitter: f32,
}

impl PeerCircuits {
    pub fn new(threshold: u32, cooldown: Duration, jitter: f32) -> Self {
        Self {
            breakers: DashMap::new(),
            threshold: threshold.max(1),
            cooldown,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn state(&self, peer: &str) -> CircuitState {
        self.state_at(peer, Instant::now())
    }

    pub fn state_at(&self, peer: &str, now: Instant) -> CircuitState {
        self.breakers
            .get_mut(peer)
            .map(|mut b| b.refresh(now))
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether selection may hand this peer a build
    pub fn allows(&self, peer: &str) -> bool {
        self.allows_at(peer, Instant::now())
    }

    pub fn allows_at(&self, peer: &str, now: Instant) -> bool {
        self.state_at(peer, now) != CircuitState::Open
    }

    pub fn record_success(&self, peer: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(peer) {
            if breaker.state != CircuitState::Closed {
                debug!("[federation] peer {} recovered", short(peer));
            }
            *breaker = Breaker::closed();
        }
    }

    pub fn record_failure(&self, peer: &str) {
        self.record_failure_at(peer, Instant::now());
    }

    pub fn record_failure_at(&self, peer: &str, now: Instant) {
        let mut breaker = self
            .breakers
            .entry(peer.to_string())
            .or_insert_with(Breaker::closed);
        breaker.consecutive_failures += 1;
        let trip = match breaker.refresh(now) {
            CircuitState::Closed => breaker.consecutive_failures >= self.threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            let factor = 1.0 + rand::random::<f32>() * self.jitter;
            let cooldown = self.cooldown.mul_f32(factor);
            breaker.state = CircuitState::Open;
            breaker.open_until = Some(now + cooldown);
            warn!(
                "[federation] peer {} suspect after {} failure(s), skipping for {:?}",
                short(peer),
                breaker.consecutive_failures,
                cooldown
            );
        }
    }

    /// Number of peers currently suspect
    pub fn suspect_count(&self) -> usize {
        let now = Instant::now();
        self.breakers
            .iter_mut()
            .map(|mut entry| entry.value_mut().refresh(now))
            .filter(|state| *state == CircuitState::Open)
            .count()
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_after_threshold() {
        let circuits = PeerCircuits::new(2, Duration::from_secs(60), 0.0);
        let now = Instant::now();
        assert!(circuits.allows_at("p", now));
        circuits.record_failure_at("p", now);
        assert_eq!(circuits.state_at("p", now), CircuitState::Closed);
        circuits.record_failure_at("p", now);
        assert_eq!(circuits.state_at("p", now), CircuitState::Open);
        assert!(!circuits.allows_at("p", now));
        assert_eq!(circuits.suspect_count(), 1);
    }

    #[test]
    fn test_success_resets_count() {
        let circuits = PeerCircuits::new(2, Duration::from_secs(60), 0.0);
        circuits.record_failure("p");
        circuits.record_success("p");
        circuits.record_failure("p");
        assert_eq!(circuits.state("p"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_trial() {
        let circuits = PeerCircuits::new(1, Duration::from_secs(10), 0.0);
        let t0 = Instant::now();
        circuits.record_failure_at("p", t0);
        let later = t0 + Duration::from_secs(11);
        assert_eq!(circuits.state_at("p", later), CircuitState::HalfOpen);
        assert!(circuits.allows_at("p", later));

        // a failing trial re-opens immediately
        circuits.record_failure_at("p", later);
        assert_eq!(circuits.state_at("p", later), CircuitState::Open);

        let much_later = later + Duration::from_secs(11);
        assert!(circuits.allows_at("p", much_later));
        circuits.record_success("p");
        assert_eq!(circuits.state_at("p", much_later), CircuitState::Closed);
    }

    #[test]
    fn test_jitter_bounds_cooldown() {
        let circuits = PeerCircuits::new(1, Duration::from_secs(10), 0.5);
        let t0 = Instant::now();
        circuits.record_failure_at("p", t0);
        assert!(!circuits.allows_at("p", t0 + Duration::from_secs(9)));
        assert!(circuits.allows_at("p", t0 + Duration::from_secs(16)));
    }
}
