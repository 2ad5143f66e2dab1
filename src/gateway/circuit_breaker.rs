//! Per-role circuit breaker
//!
//! Each [`AgentRole`] owns an independent circuit so a failing responder
//! cannot starve the safety classifier (and vice versa). All transitions for
//! a role happen under that role's lock.
//!
//! CLOSED --(failures >= threshold)--> OPEN --(cooldown elapsed)--> HALF_OPEN
//! HALF_OPEN admits exactly one trial; success closes, failure re-opens.

use super::generator::AgentRole;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct RoleCircuit {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for RoleCircuit {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Point-in-time view of one role's circuit
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub role: AgentRole,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// Milliseconds since the circuit opened, if it is not closed
    pub open_for_ms: Option<u64>,
}

/// Outcome of asking the breaker for permission to call the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Half-open probe; the caller must not retry within this admission
    Trial,
    Rejected,
}

pub struct CircuitBreaker {
    circuits: HashMap<AgentRole, Mutex<RoleCircuit>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        let circuits = AgentRole::ALL
            .iter()
            .map(|role| (*role, Mutex::new(RoleCircuit::default())))
            .collect();
        Self {
            circuits,
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn with_circuit<T>(&self, role: AgentRole, f: impl FnOnce(&mut RoleCircuit) -> T) -> T {
        // Every role is registered in `new`
        let slot = &self.circuits[&role];
        let mut circuit = match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut circuit)
    }

    /// Ask for permission to make one transport attempt.
    ///
    /// The returned permit must be settled with [`CircuitPermit::success`],
    /// [`CircuitPermit::failure`] or [`CircuitPermit::reachable`]. Dropping an
    /// unsettled trial permit (cancellation) hands the probe slot back.
    pub fn acquire(&self, role: AgentRole) -> Option<CircuitPermit<'_>> {
        let admission = self.with_circuit(role, |c| match c.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let cooled = c
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    c.state = BreakerState::HalfOpen;
                    tracing::info!(role = %role, "Circuit half-open, allowing trial call");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            // A trial is already in flight
            BreakerState::HalfOpen => Admission::Rejected,
        });

        match admission {
            Admission::Rejected => None,
            admission => Some(CircuitPermit {
                breaker: self,
                role,
                trial: admission == Admission::Trial,
                settled: false,
            }),
        }
    }

    fn record_success(&self, role: AgentRole) {
        self.with_circuit(role, |c| {
            if c.state == BreakerState::HalfOpen {
                tracing::info!(role = %role, "Circuit recovered (trial call succeeded)");
            }
            *c = RoleCircuit::default();
        });
    }

    fn record_failure(&self, role: AgentRole) {
        let threshold = self.failure_threshold;
        let cooldown = self.cooldown;
        self.with_circuit(role, |c| {
            c.consecutive_failures = c.consecutive_failures.saturating_add(1);
            match c.state {
                BreakerState::Closed => {
                    if c.consecutive_failures >= threshold {
                        tracing::warn!(
                            role = %role,
                            failures = c.consecutive_failures,
                            "Circuit opened - role will fail fast for {}ms",
                            cooldown.as_millis()
                        );
                        c.state = BreakerState::Open;
                        c.opened_at = Some(Instant::now());
                    }
                }
                BreakerState::HalfOpen => {
                    tracing::warn!(role = %role, "Trial call failed - circuit re-opened");
                    c.state = BreakerState::Open;
                    c.opened_at = Some(Instant::now());
                }
                // Late failure from a call admitted before the circuit opened
                BreakerState::Open => {}
            }
        });
    }

    fn abandon_trial(&self, role: AgentRole) {
        self.with_circuit(role, |c| {
            if c.state == BreakerState::HalfOpen {
                // opened_at is untouched, so the next caller may probe at once
                c.state = BreakerState::Open;
            }
        });
    }

    pub fn state(&self, role: AgentRole) -> BreakerState {
        self.with_circuit(role, |c| c.state)
    }

    pub fn snapshot(&self, role: AgentRole) -> BreakerSnapshot {
        self.with_circuit(role, |c| BreakerSnapshot {
            role,
            state: c.state,
            consecutive_failures: c.consecutive_failures,
            open_for_ms: c.opened_at.map(|t| t.elapsed().as_millis() as u64),
        })
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        AgentRole::ALL.iter().map(|r| self.snapshot(*r)).collect()
    }

    /// Force a role closed (operator reset)
    pub fn reset(&self, role: AgentRole) {
        self.with_circuit(role, |c| *c = RoleCircuit::default());
    }

    #[cfg(test)]
    fn force_open_since(&self, role: AgentRole, opened_at: Instant) {
        self.with_circuit(role, |c| {
            c.state = BreakerState::Open;
            c.consecutive_failures = self.failure_threshold;
            c.opened_at = Some(opened_at);
        });
    }
}

/// Permission for exactly one transport attempt
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    role: AgentRole,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.role);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.role);
    }

    /// The service answered but rejected the request. It is reachable, so
    /// the failure streak ends.
    pub fn reachable(self) {
        self.success();
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial(self.role);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(60);

    fn fail(cb: &CircuitBreaker, role: AgentRole) {
        cb.acquire(role).expect("permit").failure();
    }

    #[test]
    fn test_new_role_is_closed() {
        let cb = CircuitBreaker::new(5, COOLDOWN);
        assert_eq!(cb.state(AgentRole::Kai), BreakerState::Closed);
        assert!(cb.acquire(AgentRole::Kai).is_some());
    }

    #[test]
    fn test_threshold_failures_open_circuit() {
        let cb = CircuitBreaker::new(5, COOLDOWN);
        for _ in 0..4 {
            fail(&cb, AgentRole::Kai);
        }
        assert_eq!(cb.state(AgentRole::Kai), BreakerState::Closed);
        fail(&cb, AgentRole::Kai);
        assert_eq!(cb.state(AgentRole::Kai), BreakerState::Open);
        assert!(cb.acquire(AgentRole::Kai).is_none());
    }

    #[test]
    fn test_success_resets_streak() {
        let cb = CircuitBreaker::new(3, COOLDOWN);
        fail(&cb, AgentRole::Kai);
        fail(&cb, AgentRole::Kai);
        cb.acquire(AgentRole::Kai).unwrap().success();
        fail(&cb, AgentRole::Kai);
        assert_eq!(cb.state(AgentRole::Kai), BreakerState::Closed);
        assert_eq!(cb.snapshot(AgentRole::Kai).consecutive_failures, 1);
    }

    #[test]
    fn test_roles_are_isolated() {
        let cb = CircuitBreaker::new(2, COOLDOWN);
        fail(&cb, AgentRole::Kai);
        fail(&cb, AgentRole::Kai);
        assert!(cb.acquire(AgentRole::Kai).is_none());
        assert!(cb.acquire(AgentRole::SafetyClassifier).is_some());
    }

    #[test]
    fn test_cooldown_admits_single_trial() {
        let cb = CircuitBreaker::new(5, COOLDOWN);
        cb.force_open_since(AgentRole::Kai, Instant::now() - COOLDOWN - Duration::from_secs(1));

        let trial = cb.acquire(AgentRole::Kai).expect("trial permit");
        assert!(trial.is_trial());
        assert_eq!(cb.state(AgentRole::Kai), BreakerState::HalfOpen);
        // Second caller is rejected while the trial is in flight
        assert!(cb.acquire(AgentRole::Kai).is_none());

        trial.success();
        let snap = cb.snapshot(AgentRole::Kai);
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.open_for_ms.is_none());
    }

    #[test]
    fn test_failed_trial_reopens_with_fresh_timestamp() {
        let cb = CircuitBreaker::new(5, COOLDOWN);
        cb.force_open_since(AgentRole::Kai, Instant::now() - COOLDOWN - Duration::from_secs(1));

        cb.acquire(AgentRole::Kai).unwrap().failure();
        assert_eq!(cb.state(AgentRole::Kai), BreakerState::Open);
        // opened_at was reset, so the cooldown starts over
        assert!(cb.acquire(AgentRole::Kai).is_none());
        assert!(cb.snapshot(AgentRole::Kai).open_for_ms.unwrap() < 1000);
    }

    #[test]
    fn test_dropped_trial_returns_probe_slot() {
        let cb = CircuitBreaker::new(5, COOLDOWN);
        cb.force_open_since(AgentRole::Kai, Instant::now() - COOLDOWN - Duration::from_secs(1));

        {
            let _trial = cb.acquire(AgentRole::Kai).unwrap();
        }
        assert_eq!(cb.state(AgentRole::Kai), BreakerState::Open);
        assert!(cb.acquire(AgentRole::Kai).unwrap().is_trial());
    }

    #[test]
    fn test_reachable_closes_half_open() {
        let cb = CircuitBreaker::new(5, COOLDOWN);
        cb.force_open_since(AgentRole::Kai, Instant::now() - COOLDOWN - Duration::from_secs(1));
        cb.acquire(AgentRole::Kai).unwrap().reachable();
        assert_eq!(cb.state(AgentRole::Kai), BreakerState::Closed);
    }
}
