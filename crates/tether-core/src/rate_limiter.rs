//! Per-operator dispatch cooldown
//!
//! Each operator may run one dispatch job per cooldown window. The limiter
//! keeps a process-wide map from operator identity to the time of its last
//! reservation:
//! - `check_and_reserve` allows and stamps `now`, or denies with the exact
//!   time the window closes
//! - `release` rolls a reservation back when the job it guarded failed
//! - a periodic sweep evicts entries older than `stale_after`, bounding memory

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownConfig {
    /// Minimum time between reservations for one operator
    pub cooldown_window: Duration,

    /// Age after which the sweep evicts an entry
    pub stale_after: Duration,

    /// Sweep period
    pub sweep_interval: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for CooldownConfig {
    fn from(config: &LinkConfig) -> Self {
        Self {
            cooldown_window: config.cooldown_window,
            stale_after: config.stale_after,
            sweep_interval: config.sweep_interval,
        }
    }
}

/// Outcome of [`CooldownLimiter::check_and_reserve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Dispatch may proceed; the cooldown now runs from `reservation.reserved_at`
    Allowed(Reservation),
    /// Still cooling down
    Denied {
        /// When the window closes
        retry_after: SystemTime,
    },
}

impl RateDecision {
    /// Whether dispatch may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// A granted reservation, needed to roll it back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Operator the reservation belongs to
    pub operator: String,
    /// Time stamped into the map
    pub reserved_at: SystemTime,
    previous: Option<SystemTime>,
}

/// Rate limiting metrics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CooldownMetrics {
    /// Reservations granted
    pub allowed: u64,
    /// Requests denied inside a cooldown window
    pub denied: u64,
    /// Reservations rolled back
    pub released: u64,
    /// Entries evicted by sweeps
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    released: AtomicU64,
    evicted: AtomicU64,
}

/// Process-wide cooldown map keyed by operator identity
pub struct CooldownLimiter {
    config: CooldownConfig,
    entries: DashMap<String, SystemTime>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl CooldownLimiter {
    /// Limiter on the system clock
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` if `stale_after < cooldown_window`
    /// or the sweep interval is zero.
    pub fn new(config: CooldownConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Limiter on an explicit clock
    ///
    /// # Errors
    ///
    /// Same as [`CooldownLimiter::new`].
    pub fn with_clock(config: CooldownConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.stale_after < config.cooldown_window {
            return Err(LinkError::InvalidConfig(
                "stale_after must be at least cooldown_window".into(),
            ));
        }
        if config.sweep_interval.is_zero() {
            return Err(LinkError::InvalidConfig(
                "sweep_interval must be non-zero".into(),
            ));
        }

        Ok(Self {
            config,
            entries: DashMap::new(),
            clock,
            counters: Counters::default(),
        })
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CooldownConfig {
        &self.config
    }

    /// Allow and reserve, or deny with the time the window closes.
    ///
    /// The timestamp is only updated when the request is allowed.
    pub fn check_and_reserve(&self, operator: &str) -> RateDecision {
        let now = self.clock.now();

        let previous = match self.entries.entry(operator.to_string()) {
            Entry::Occupied(mut entry) => {
                let last = *entry.get();
                let window_end = last + self.config.cooldown_window;
                if now < window_end {
                    self.counters.denied.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(operator, "Dispatch denied, cooldown active");
                    return RateDecision::Denied {
                        retry_after: window_end,
                    };
                }
                Some(entry.insert(now))
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                None
            }
        };

        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        RateDecision::Allowed(Reservation {
            operator: operator.to_string(),
            reserved_at: now,
            previous,
        })
    }

    /// Roll back a reservation, restoring the operator's previous timestamp.
    ///
    /// No-op if a newer reservation has replaced it meanwhile.
    pub fn release(&self, reservation: Reservation) {
        if let Entry::Occupied(mut entry) = self.entries.entry(reservation.operator) {
            if *entry.get() != reservation.reserved_at {
                return;
            }
            match reservation.previous {
                Some(previous) => {
                    entry.insert(previous);
                }
                None => {
                    entry.remove();
                }
            }
            self.counters.released.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Time the operator's current window closes, if one is open
    #[must_use]
    pub fn next_available(&self, operator: &str) -> Option<SystemTime> {
        let now = self.clock.now();
        self.entries
            .get(operator)
            .map(|last| *last + self.config.cooldown_window)
            .filter(|end| now < *end)
    }

    /// Evict stale entries, returning how many were removed.
    ///
    /// Entries still enforcing a cooldown are never evicted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let threshold = self.config.stale_after.max(self.config.cooldown_window);
        let before = self.entries.len();

        self.entries.retain(|_, last| {
            now.duration_since(*last)
                .map_or(true, |age| age <= threshold)
        });

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, remaining = self.entries.len(), "Rate limit sweep");
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the handle is dropped
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let limiter = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.sweep();
                    }
                    None => return,
                }
            }
        });

        SweeperHandle { task }
    }

    /// Number of tracked operators
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no operator is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> CooldownMetrics {
        CooldownMetrics {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CooldownLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownLimiter")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

/// Owned handle to the sweep task; aborts it on drop
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop sweeping
    pub fn stop(self) {}
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
