//! Per rule throttling of forwarded matches.
//!
//! Each active rule owns an independent budget, so a noisy rule can't starve
//! the others. Budgets survive reloads for rules that stay active.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::{
        Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use warden_core::{StatsError, StatsSink, stats::tag};

/// Source of time for the limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitPolicy {
    /// `burst` tokens, refilled continuously at `burst` per `period`.
    #[default]
    TokenBucket,
    /// At most `burst` matches in each `period` long window.
    FixedWindow,
}

impl FromStr for LimitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_bucket" => Ok(Self::TokenBucket),
            "fixed_window" => Ok(Self::FixedWindow),
            other => Err(format!(
                "unknown policy '{other}', expected 'token_bucket' or 'fixed_window'"
            )),
        }
    }
}

impl fmt::Display for LimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenBucket => write!(f, "token_bucket"),
            Self::FixedWindow => write!(f, "fixed_window"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub policy: LimitPolicy,
    pub burst: u32,
    pub period: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            policy: LimitPolicy::TokenBucket,
            burst: 40,
            period: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug)]
enum Budget {
    TokenBucket { tokens: f64, last_refill: Instant },
    FixedWindow { used: u32, window_start: Instant },
}

impl Budget {
    fn new(limit: &RateLimit, now: Instant) -> Self {
        match limit.policy {
            LimitPolicy::TokenBucket => Budget::TokenBucket {
                tokens: f64::from(limit.burst),
                last_refill: now,
            },
            LimitPolicy::FixedWindow => Budget::FixedWindow {
                used: 0,
                window_start: now,
            },
        }
    }

    fn take(&mut self, limit: &RateLimit, now: Instant) -> bool {
        match self {
            Budget::TokenBucket {
                tokens,
                last_refill,
            } => {
                let burst = f64::from(limit.burst);
                if !limit.period.is_zero() {
                    let elapsed = now.saturating_duration_since(*last_refill);
                    let refill = burst * elapsed.as_secs_f64() / limit.period.as_secs_f64();
                    *tokens = (*tokens + refill).min(burst);
                }
                *last_refill = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            Budget::FixedWindow { used, window_start } => {
                if now.saturating_duration_since(*window_start) >= limit.period {
                    *used = 0;
                    *window_start = now;
                }

                if *used < limit.burst {
                    *used += 1;
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[derive(Debug)]
struct Entry {
    budget: Mutex<Budget>,
    allowed: AtomicU64,
    dropped: AtomicU64,
}

/// Counters of one rule.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct LimiterStats {
    pub allowed: u64,
    pub dropped: u64,
}

pub struct RateLimiter {
    limit: RateLimit,
    clock: Box<dyn Clock>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("rules", &self.stats().len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self::with_clock(limit, SystemClock)
    }

    pub fn with_clock(limit: RateLimit, clock: impl Clock + 'static) -> Self {
        Self {
            limit,
            clock: Box::new(clock),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> &RateLimit {
        &self.limit
    }

    /// Track exactly `rule_ids`: new rules get a full budget, removed rules
    /// are forgotten, the others keep their state.
    pub fn apply(&self, rule_ids: &[String]) {
        let now = self.clock.now();
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let active: HashSet<&str> = rule_ids.iter().map(String::as_str).collect();
        entries.retain(|id, _| active.contains(id.as_str()));
        for id in rule_ids {
            entries.entry(id.clone()).or_insert_with(|| Entry {
                budget: Mutex::new(Budget::new(&self.limit, now)),
                allowed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            });
        }
    }

    /// Consume one unit of the budget of `rule_id`. Unknown rules are denied.
    pub fn allow(&self, rule_id: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get(rule_id) else {
            return false;
        };

        let allowed = entry
            .budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(&self.limit, self.clock.now());

        if allowed {
            entry.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.dropped.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    pub fn stats(&self) -> BTreeMap<String, LimiterStats> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    LimiterStats {
                        allowed: entry.allowed.load(Ordering::Relaxed),
                        dropped: entry.dropped.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    /// Publish the monotonic per rule counters.
    pub fn send_stats(&self, sink: &dyn StatsSink) -> Result<(), StatsError> {
        for (rule_id, stats) in self.stats() {
            let tags = [tag("rule_id", &rule_id)];
            sink.gauge("rate_limiter.allowed", stats.allowed as f64, &tags)?;
            sink.gauge("rate_limiter.dropped", stats.dropped as f64, &tags)?;
        }
        Ok(())
    }
}
