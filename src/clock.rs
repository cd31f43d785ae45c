//! Causal clock module
//!
//! Every mutation path in the crate orders events through the helpers in this
//! module:
//! - `ClockSource` supplies wall-clock milliseconds
//! - `next_clock_and_timestamp` advances a per-chat logical clock
//! - `newer` / `supersedes` are the single comparator used by all merges
//! - `Register` is a clock-stamped last-writer-wins field

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Source of wall-clock time in milliseconds
pub trait ClockSource: Send + Sync {
    /// Current wall time in Unix milliseconds
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually driven clock for replays and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `now_ms`
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    /// Move the clock to an absolute time
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, AtomicOrdering::SeqCst);
    }

    /// Move the clock forward
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, AtomicOrdering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

/// Outcome of a merge that was not rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    /// The incoming state was newer and is now stored
    Applied,
    /// The incoming clock was not newer; nothing changed
    Stale,
}

impl MergeOutcome {
    /// Build an outcome from a "did anything change" flag
    pub fn from_applied(applied: bool) -> Self {
        if applied {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Stale
        }
    }

    /// Whether the merge changed state
    pub fn is_applied(self) -> bool {
        self == MergeOutcome::Applied
    }

    /// Combine two outcomes, applied wins
    pub fn or(self, other: MergeOutcome) -> MergeOutcome {
        MergeOutcome::from_applied(self.is_applied() || other.is_applied())
    }
}

/// Compute the next logical clock for a chat and the wall time it was taken at
///
/// The clock resynchronizes to wall time whenever wall time is ahead of the
/// stored value, and otherwise ticks by one. The result is strictly greater
/// than `stored` except at `u64::MAX`, where the clock saturates instead of
/// wrapping back to zero.
///
/// # Returns
/// `(clock, timestamp_ms)`
pub fn next_clock_and_timestamp(stored: u64, source: &dyn ClockSource) -> (u64, u64) {
    let now = source.now_ms();
    let clock = if stored < now { now } else { stored.saturating_add(1) };
    (clock, now)
}

/// `true` iff `incoming` is strictly newer than `current`
pub fn newer(incoming: u64, current: u64) -> bool {
    incoming > current
}

/// Total order over `(clock, id)` stamps
///
/// Equal clocks from different originators are broken by the
/// lexicographically greater ID so that every peer picks the same winner.
pub fn compare(a_clock: u64, a_id: &str, b_clock: u64, b_id: &str) -> Ordering {
    a_clock.cmp(&b_clock).then_with(|| a_id.cmp(b_id))
}

/// `true` iff the incoming stamp wins over the current one
pub fn supersedes(
    incoming_clock: u64,
    incoming_id: &str,
    current_clock: u64,
    current_id: &str,
) -> bool {
    compare(incoming_clock, incoming_id, current_clock, current_id) == Ordering::Greater
}

/// Clock-stamped last-writer-wins field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register<T> {
    /// Current value
    pub value: T,
    /// Clock the value was written at
    pub clock: u64,
    /// Originator of the write, used as tie-breaker
    pub author: String,
}

impl<T: PartialEq> Register<T> {
    /// Create a register holding a value written at `clock`
    pub fn new(value: T, clock: u64, author: impl Into<String>) -> Self {
        Self {
            value,
            clock,
            author: author.into(),
        }
    }

    /// Offer a write to the register
    ///
    /// The write is taken iff its `(clock, author)` stamp supersedes the stored
    /// one. Re-offering the stored write is a stale no-op.
    pub fn merge(&mut self, value: T, clock: u64, author: &str) -> MergeOutcome {
        if !supersedes(clock, author, self.clock, &self.author) {
            return MergeOutcome::Stale;
        }
        self.value = value;
        self.clock = clock;
        self.author = author.to_string();
        MergeOutcome::Applied
    }
}

/// Offer a write to an optional register, creating it on first write
pub fn merge_optional<T: PartialEq>(
    slot: &mut Option<Register<T>>,
    value: T,
    clock: u64,
    author: &str,
) -> MergeOutcome {
    match slot {
        Some(register) => register.merge(value, clock, author),
        None => {
            *slot = Some(Register::new(value, clock, author));
            MergeOutcome::Applied
        }
    }
}

/// Offer a write to the register kept for its author
pub fn merge_keyed<T: PartialEq>(
    registers: &mut BTreeMap<String, Register<T>>,
    value: T,
    clock: u64,
    author: &str,
) -> MergeOutcome {
    match registers.get_mut(author) {
        Some(register) => register.merge(value, clock, author),
        None => {
            registers.insert(author.to_string(), Register::new(value, clock, author));
            MergeOutcome::Applied
        }
    }
}
