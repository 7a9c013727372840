//! Selection strategies over the eligible provider set.
//!
//! A strategy owns the mutable set of currently selectable provider ids and
//! hands out one id per `next` call. It is deliberately not thread-safe:
//! the dispatch core serializes every access behind its own lock, so the
//! strategy can stay a plain value.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rotary_core::ProviderId;

/// Policy for picking the next provider from a mutating set.
///
/// `include`/`exclude` are idempotent and report whether they changed the
/// set; strategies must tolerate mutation between any two `next` calls.
pub trait SelectionStrategy: Send {
    /// Number of ids currently selectable.
    fn len(&self) -> usize;

    /// True iff `next` would yield an id.
    fn has_next(&self) -> bool {
        self.len() > 0
    }

    /// Picks the next provider, or `None` when the set is empty.
    fn next(&mut self) -> Option<ProviderId>;

    /// Adds `id` to the set. Returns `false` if it was already present.
    fn include(&mut self, id: ProviderId) -> bool;

    /// Removes `id` from the set. Returns `false` if it was absent.
    fn exclude(&mut self, id: &ProviderId) -> bool;
}

/// Cycles through the set in insertion order.
///
/// The cursor resets to the front whenever the set changes; rotation
/// fairness is approximate, not a strict guarantee.
pub struct RoundRobin {
    members: Vec<ProviderId>,
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            cursor: 0,
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobin {
    fn len(&self) -> usize {
        self.members.len()
    }

    fn next(&mut self) -> Option<ProviderId> {
        if self.members.is_empty() {
            return None;
        }
        let idx = self.cursor % self.members.len();
        self.cursor = self.cursor.wrapping_add(1) % self.members.len();
        Some(self.members[idx].clone())
    }

    fn include(&mut self, id: ProviderId) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        self.members.push(id);
        self.cursor = 0;
        true
    }

    fn exclude(&mut self, id: &ProviderId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| member != id);
        if self.members.len() == before {
            return false;
        }
        self.cursor = 0;
        true
    }
}

/// Draws uniformly from the set using a caller-seeded generator, so test
/// runs are reproducible.
pub struct Random {
    members: Vec<ProviderId>,
    rng: StdRng,
}

impl Random {
    pub fn new(seed: u64) -> Self {
        Self {
            members: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SelectionStrategy for Random {
    fn len(&self) -> usize {
        self.members.len()
    }

    fn next(&mut self) -> Option<ProviderId> {
        if self.members.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.members.len());
        Some(self.members[idx].clone())
    }

    fn include(&mut self, id: ProviderId) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        self.members.push(id);
        true
    }

    fn exclude(&mut self, id: &ProviderId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| member != id);
        self.members.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ids(strategy: &mut dyn SelectionStrategy, count: usize) -> Vec<String> {
        (0..count)
            .map(|_| strategy.next().expect("set should be non-empty").to_string())
            .collect()
    }

    #[test]
    fn test_round_robin_rotates_and_wraps() {
        let mut rr = RoundRobin::new();
        for name in ["a", "b", "c"] {
            assert!(rr.include(name.into()));
        }

        assert_eq!(ids(&mut rr, 4), vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_round_robin_empty_returns_none() {
        let mut rr = RoundRobin::new();
        assert!(!rr.has_next());
        assert_eq!(rr.next(), None);
    }

    #[test]
    fn test_include_is_idempotent() {
        let mut rr = RoundRobin::new();
        assert!(rr.include("a".into()));
        assert!(!rr.include("a".into()));
        assert_eq!(rr.len(), 1);
    }

    #[test]
    fn test_exclude_is_idempotent() {
        let mut rr = RoundRobin::new();
        rr.include("a".into());
        assert!(rr.exclude(&"a".into()));
        assert!(!rr.exclude(&"a".into()));
        assert!(!rr.has_next());
    }

    #[test]
    fn test_round_robin_skips_excluded_member() {
        let mut rr = RoundRobin::new();
        for name in ["a", "b", "c"] {
            rr.include(name.into());
        }
        rr.exclude(&"b".into());

        assert_eq!(ids(&mut rr, 6), vec!["a", "c", "a", "c", "a", "c"]);
    }

    #[test]
    fn test_round_robin_reinclusion_restarts_rotation() {
        let mut rr = RoundRobin::new();
        rr.include("a".into());
        rr.include("b".into());
        rr.next();
        rr.exclude(&"b".into());
        rr.include("b".into());

        // The cursor is back at the front after the set changed.
        assert_eq!(ids(&mut rr, 2), vec!["a", "b"]);
    }

    #[test]
    fn test_round_robin_cursor_wraps_at_usize_max() {
        let mut rr = RoundRobin::new();
        rr.include("a".into());
        rr.cursor = usize::MAX;
        assert_eq!(rr.next(), Some(ProviderId::new("a")));
        assert_eq!(rr.cursor, 0);
    }

    #[test]
    fn test_round_robin_distributes_evenly() {
        let mut rr = RoundRobin::new();
        for name in ["a", "b", "c"] {
            rr.include(name.into());
        }

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..300 {
            *counts.entry(rr.next().unwrap().to_string()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 100);
        assert_eq!(counts["b"], 100);
        assert_eq!(counts["c"], 100);
    }

    #[test]
    fn test_random_is_deterministic_per_seed() {
        let mut first = Random::new(42);
        let mut second = Random::new(42);
        for name in ["a", "b", "c", "d"] {
            first.include(name.into());
            second.include(name.into());
        }

        assert_eq!(ids(&mut first, 32), ids(&mut second, 32));
    }

    #[test]
    fn test_random_covers_all_members() {
        let mut random = Random::new(7);
        for name in ["a", "b", "c"] {
            random.include(name.into());
        }

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..600 {
            *counts.entry(random.next().unwrap().to_string()).or_insert(0) += 1;
        }
        // Uniform draws: each member lands well away from zero.
        for name in ["a", "b", "c"] {
            assert!(counts[name] > 100, "{name} drawn only {} times", counts[name]);
        }
    }

    #[test]
    fn test_random_never_yields_excluded_member() {
        let mut random = Random::new(11);
        for name in ["a", "b", "c"] {
            random.include(name.into());
        }
        random.exclude(&"b".into());

        for _ in 0..200 {
            assert_ne!(random.next(), Some(ProviderId::new("b")));
        }
    }

    #[test]
    fn test_random_empty_returns_none() {
        let mut random = Random::new(3);
        assert_eq!(random.next(), None);
        random.include("a".into());
        random.exclude(&"a".into());
        assert_eq!(random.next(), None);
    }
}
