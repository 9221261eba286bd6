// Rollover reconciliation: previous + current reading -> non-negative octet delta.
//
// Per key: no baseline -> first reading stored, nothing emitted. With a baseline,
// every reading is diffed and stored. Backward movement is resolved as one or more
// wraps or as a counter reset (delta 0, rebased); it is never an error.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::store::{CounterShard, CounterState};
use crate::models::CounterKey;
use crate::vendor::CounterWidth;

/// Default plausibility ceiling for a single-interval 32-bit wrap (3 GiB).
pub const DEFAULT_CEILING_32: u64 = 3 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_WRAPS: u32 = 10;
/// Agreeing intervals a rate needs before it may justify more than one wrap.
pub const MIN_HINT_INTERVALS: u32 = 2;
/// Extra wraps are counted only once the estimate clears n + 0.5 by this much.
const WRAP_MARGIN: f64 = 0.25;

/// Traffic expected over an interval from the counter's recent rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WrapHint {
    pub expected_octets: f64,
    /// Consecutive agreeing intervals behind the rate.
    pub intervals: u32,
}

/// Tunables for backward-moving readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RolloverPolicy {
    /// Largest believable single-wrap delta for 32-bit counters; `None` disables the check.
    pub ceiling_32: Option<u64>,
    /// Same for 64-bit counters (unset by default).
    pub ceiling_64: Option<u64>,
    /// More estimated wraps than this in one interval is treated as a reset.
    pub max_wraps: u32,
}

impl Default for RolloverPolicy {
    fn default() -> Self {
        Self {
            ceiling_32: Some(DEFAULT_CEILING_32),
            ceiling_64: None,
            max_wraps: DEFAULT_MAX_WRAPS,
        }
    }
}

/// Result of diffing two readings of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Forward(u64),
    Wrapped { delta: u64, wraps: u32 },
    Reset,
}

impl DeltaOutcome {
    pub fn delta(self) -> u64 {
        match self {
            DeltaOutcome::Forward(d) => d,
            DeltaOutcome::Wrapped { delta, .. } => delta,
            DeltaOutcome::Reset => 0,
        }
    }

    pub fn wraps(self) -> u32 {
        match self {
            DeltaOutcome::Wrapped { wraps, .. } => wraps,
            _ => 0,
        }
    }
}

impl RolloverPolicy {
    pub fn ceiling(&self, width: CounterWidth) -> Option<u64> {
        match width {
            CounterWidth::Bits32 => self.ceiling_32,
            CounterWidth::Bits64 => self.ceiling_64,
        }
    }

    /// Delta between `prior` and `current` for a counter of `width`.
    ///
    /// `hint` is the only evidence that can justify more than one wrap. An estimate of
    /// extra wraps backed by fewer than `MIN_HINT_INTERVALS` agreeing intervals is
    /// read as a reboot instead.
    pub fn delta(
        &self,
        prior: u64,
        current: u64,
        width: CounterWidth,
        hint: Option<WrapHint>,
    ) -> DeltaOutcome {
        if current >= prior {
            return DeltaOutcome::Forward(current - prior);
        }

        let modulus = width.modulus();
        let max = width.max_value() as u128;
        let single_wrap = (max - prior as u128) + current as u128 + 1;

        let wraps = match hint {
            Some(WrapHint {
                expected_octets,
                intervals,
            }) if expected_octets.is_finite() && expected_octets > single_wrap as f64 => {
                let estimate = (expected_octets - single_wrap as f64) / modulus as f64;
                let extra = (estimate - WRAP_MARGIN).round().max(0.0);
                if extra >= self.max_wraps as f64 {
                    return DeltaOutcome::Reset;
                }
                if extra >= 1.0 && intervals < MIN_HINT_INTERVALS {
                    return DeltaOutcome::Reset;
                }
                1 + extra as u32
            }
            _ => 1,
        };

        if wraps > self.max_wraps {
            return DeltaOutcome::Reset;
        }
        if wraps == 1
            && let Some(ceiling) = self.ceiling(width)
            && single_wrap > ceiling as u128
        {
            return DeltaOutcome::Reset;
        }

        // k * 2^W - p + v
        let delta = wraps as u128 * modulus - prior as u128 + current as u128;
        match u64::try_from(delta) {
            Ok(delta) => DeltaOutcome::Wrapped { delta, wraps },
            Err(_) => DeltaOutcome::Reset,
        }
    }
}

/// One decoded counter reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: u64,
    pub width: CounterWidth,
    /// The counter's other column, read in the same exchange.
    pub alternate: Option<(CounterWidth, u64)>,
    pub at: Instant,
    pub timestamp: DateTime<Utc>,
}

/// Emittable result of a reading against an existing baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciled {
    /// Column the delta was taken on.
    pub width: CounterWidth,
    pub delta_octets: u64,
    pub interval_seconds: f64,
    pub wraps: u32,
    pub reset: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// First reading of the key; stored, nothing to emit.
    Baseline,
    /// No column of the reading was also read at the stored instant.
    Rebased { previous: CounterWidth },
    /// No monotonic time elapsed since the stored reading; kept the old baseline.
    Ignored,
    Delta(Reconciled),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    policy: RolloverPolicy,
}

impl Reconciler {
    pub fn new(policy: RolloverPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RolloverPolicy {
        &self.policy
    }

    /// Applies `reading` to the state of `key`. Taking the shard by `&mut` is what makes
    /// reconciliation single-writer per key.
    ///
    /// The delta is taken on the reading's own column when the stored reading has a value
    /// for it, else on its alternate column. Either way the interval starts at the stored
    /// instant, so consecutive samples never overlap.
    pub fn observe(&self, shard: &mut CounterShard, key: &CounterKey, reading: Reading) -> Observation {
        let Some(prev) = shard.get(key) else {
            tracing::trace!(counter = %key, value = reading.value, "baseline established");
            shard.insert(key.clone(), state_of(&reading, None, 0));
            return Observation::Baseline;
        };

        let elapsed = reading.at.saturating_duration_since(prev.last_seen);
        if elapsed.is_zero() {
            tracing::debug!(counter = %key, "no time elapsed since last reading; ignored");
            return Observation::Ignored;
        }
        let interval_seconds = elapsed.as_secs_f64();

        let shared = std::iter::once((reading.width, reading.value))
            .chain(reading.alternate)
            .find_map(|(width, current)| prev.value(width).map(|prior| (width, prior, current)));
        let Some((width, prior, current)) = shared else {
            let previous = prev.width;
            tracing::debug!(
                counter = %key,
                from_bits = previous.bits(),
                to_bits = reading.width.bits(),
                "no column in common with the stored reading; rebasing"
            );
            shard.insert(key.clone(), state_of(&reading, None, 0));
            return Observation::Rebased { previous };
        };

        let hint = prev.rate_hint.map(|rate| WrapHint {
            expected_octets: rate * interval_seconds,
            intervals: prev.hint_intervals,
        });
        let outcome = self.policy.delta(prior, current, width, hint);

        match outcome {
            DeltaOutcome::Reset => {
                tracing::info!(
                    counter = %key,
                    prior,
                    current,
                    bits = width.bits(),
                    "counter reset detected; rebasing"
                );
            }
            DeltaOutcome::Wrapped { delta, wraps } => {
                tracing::debug!(
                    counter = %key,
                    prior,
                    current,
                    wraps,
                    delta,
                    "counter wrap reconstructed"
                );
            }
            DeltaOutcome::Forward(_) => {}
        }

        let delta_octets = outcome.delta();
        let (rate_hint, hint_intervals) = match outcome {
            DeltaOutcome::Reset => (None, 0),
            _ => {
                let rate = delta_octets as f64 / interval_seconds;
                let intervals = match prev.rate_hint {
                    Some(previous) if rates_agree(previous, rate) => prev.hint_intervals + 1,
                    _ => 1,
                };
                (Some(rate), intervals)
            }
        };
        shard.insert(key.clone(), state_of(&reading, rate_hint, hint_intervals));

        Observation::Delta(Reconciled {
            width,
            delta_octets,
            interval_seconds,
            wraps: outcome.wraps(),
            reset: outcome == DeltaOutcome::Reset,
            timestamp: reading.timestamp,
        })
    }
}

fn rates_agree(previous: f64, current: f64) -> bool {
    current <= previous * 2.0 && previous <= current * 2.0
}

fn state_of(reading: &Reading, rate_hint: Option<f64>, hint_intervals: u32) -> CounterState {
    CounterState {
        last_value: reading.value,
        last_seen: reading.at,
        last_timestamp: reading.timestamp,
        width: reading.width,
        alternate: reading.alternate,
        rate_hint,
        hint_intervals,
    }
}
