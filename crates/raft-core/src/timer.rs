//! # timer
//!
//! why: randomized election timeouts break symmetry between candidates
//! relations: owned by raft-runtime's node actor, configured from RaftConfig
//! what: TimeoutSource trait, RandomTimeouts, ElectionTimer

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::config::RaftConfig;

/// Supplies election timeout durations inside an inclusive window.
///
/// Production nodes use [`RandomTimeouts`]; tests inject scripted sources to
/// force ties and check recovery.
pub trait TimeoutSource: Send {
    fn next_timeout(&mut self, min: Duration, max: Duration) -> Duration;
}

/// Uniform draw in whole milliseconds from any random generator.
pub struct RandomTimeouts<R>(pub R);

impl<R: RngCore + Send> TimeoutSource for RandomTimeouts<R> {
    fn next_timeout(&mut self, min: Duration, max: Duration) -> Duration {
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        Duration::from_millis(self.0.gen_range(min_ms..=max_ms))
    }
}

/// Single-shot election alarm durations. Every call to [`next`] yields a fresh
/// draw, so each reset (vote granted, append accepted, candidacy entered)
/// gets its own randomized deadline.
///
/// [`next`]: ElectionTimer::next
pub struct ElectionTimer {
    min: Duration,
    max: Duration,
    source: Box<dyn TimeoutSource>,
}

impl ElectionTimer {
    pub fn new(config: &RaftConfig) -> Self {
        Self::with_source(config, RandomTimeouts(StdRng::from_entropy()))
    }

    pub fn seeded(config: &RaftConfig, seed: u64) -> Self {
        Self::with_source(config, RandomTimeouts(StdRng::seed_from_u64(seed)))
    }

    pub fn with_source(config: &RaftConfig, source: impl TimeoutSource + 'static) -> Self {
        Self {
            min: Duration::from_millis(config.election_timeout_min),
            max: Duration::from_millis(config.election_timeout_max),
            source: Box::new(source),
        }
    }

    pub fn next(&mut self) -> Duration {
        let timeout = self.source.next_timeout(self.min, self.max);
        timeout.clamp(self.min, self.max)
    }
}

impl std::fmt::Debug for ElectionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionTimer")
            .field("min", &self.min)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}
