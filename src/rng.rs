//! A round-robin pool of seeded PRNGs.
//!
//! Seeding a fresh generator per use is expensive and sharing one behind a
//! single lock serializes every caller; a small fixed set handed out by a
//! monotonic counter spreads the contention. With a fixed seed the pool is
//! deterministic, which tests rely on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub struct RngPool {
    rngs: Box<[Mutex<StdRng>]>,
    next: AtomicUsize,
}

impl RngPool {
    /// A pool of `size` generators seeded from the OS.
    pub fn new(size: usize) -> Self {
        Self::build(size, |_| StdRng::from_entropy())
    }

    /// A deterministic pool: each generator is seeded from `seed` offset by
    /// its index.
    pub fn with_seed(size: usize, seed: u64) -> Self {
        Self::build(size, |index| {
            StdRng::seed_from_u64(seed.wrapping_add(index as u64))
        })
    }

    fn build(size: usize, make: impl Fn(usize) -> StdRng) -> Self {
        assert!(size > 0, "RngPool requires at least one generator");

        RngPool {
            rngs: (0..size).map(|index| Mutex::new(make(index))).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.rngs.len()
    }

    /// Run `f` against the next generator in round-robin order.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.rngs.len();
        let mut rng = self.rngs[index].lock().expect("BUG: rng pool poisoned");

        f(&mut rng)
    }

    pub fn next_u64(&self) -> u64 {
        self.with_rng(RngCore::next_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_pools_are_deterministic() {
        let a = RngPool::with_seed(4, 42);
        let b = RngPool::with_seed(4, 42);

        let from_a: Vec<u64> = (0..16).map(|_| a.next_u64()).collect();
        let from_b: Vec<u64> = (0..16).map(|_| b.next_u64()).collect();

        assert_eq!(from_a, from_b);
    }

    #[test]
    fn different_seeds_diverge() {
        let a = RngPool::with_seed(2, 1);
        let b = RngPool::with_seed(2, 2);

        let from_a: Vec<u64> = (0..8).map(|_| a.next_u64()).collect();
        let from_b: Vec<u64> = (0..8).map(|_| b.next_u64()).collect();

        assert_ne!(from_a, from_b);
    }

    #[test]
    fn round_robin_revisits_generators_in_order() {
        let pool = RngPool::with_seed(3, 7);

        // Draw one full cycle, then a second; each generator continues its
        // own sequence rather than restarting.
        let first: Vec<u64> = (0..3).map(|_| pool.next_u64()).collect();
        let second: Vec<u64> = (0..3).map(|_| pool.next_u64()).collect();

        let mut replay: Vec<u64> = Vec::new();
        let mut rngs: Vec<StdRng> = (0..3)
            .map(|index| StdRng::seed_from_u64(7u64.wrapping_add(index as u64)))
            .collect();
        for _ in 0..2 {
            for rng in rngs.iter_mut() {
                replay.push(rng.next_u64());
            }
        }

        assert_eq!(replay, [first, second].concat());
    }
}
