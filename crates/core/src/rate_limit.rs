//! Daily embedding call budget shared by every pipeline in the process.
//!
//! Share one limiter behind an `Arc`. A call reserves its slot with [`RateLimiter::try_acquire`]
//! before the provider is contacted; the compare-and-swap only succeeds while the count is
//! below the limit, so concurrent documents cannot overrun the budget. A reservation whose
//! call fails is handed back with [`RateLimiter::release`], so the count tracks successful
//! calls. [`BudgetState`] carries the count across process restarts.

use crate::error::EmbeddingError;
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::info;

/// Persisted form of the counter: calls made on `day` (days since the common era).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub day: i64,
    pub count: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: u64,
    count: AtomicU64,
    day: AtomicI64,
}

impl RateLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            count: AtomicU64::new(0),
            day: AtomicI64::new(today()),
        }
    }

    /// Resumes from a saved state. A state from another day starts the count at zero.
    pub fn restore(limit: u64, state: Option<BudgetState>) -> Self {
        let limiter = Self::new(limit);
        if let Some(state) = state.filter(|state| state.day == today()) {
            limiter.count.store(state.count, Ordering::Release);
        }
        limiter
    }

    pub fn state(&self) -> BudgetState {
        let count = self.count();
        BudgetState {
            day: self.day.load(Ordering::Acquire),
            count,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn count(&self) -> u64 {
        self.roll_over(today());
        self.count.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count())
    }

    pub fn is_exhausted(&self) -> bool {
        self.count() >= self.limit
    }

    /// Reserves one call and returns the day's total including it.
    pub fn try_acquire(&self) -> Result<u64, EmbeddingError> {
        self.roll_over(today());
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return Err(EmbeddingError::BudgetExhausted(self.limit));
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns a reservation whose call did not succeed.
    pub fn release(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }

    /// Zeroes the counter once per day change. Only the thread that wins the swap resets.
    fn roll_over(&self, current_day: i64) {
        let stored = self.day.load(Ordering::Acquire);
        if stored == current_day {
            return;
        }
        if self
            .day
            .compare_exchange(stored, current_day, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.count.store(0, Ordering::Release);
            info!(day = current_day, "daily embedding budget reset");
        }
    }
}

fn today() -> i64 {
    i64::from(Utc::now().date_naive().num_days_from_ce())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn budget_is_exhausted_at_limit() {
        let limiter = RateLimiter::new(2);
        assert!(!limiter.is_exhausted());
        assert_eq!(limiter.try_acquire().unwrap(), 1);
        assert_eq!(limiter.try_acquire().unwrap(), 2);
        assert!(limiter.is_exhausted());
        assert_eq!(limiter.remaining(), 0);
        assert_eq!(
            limiter.try_acquire(),
            Err(EmbeddingError::BudgetExhausted(2))
        );
        assert_eq!(limiter.count(), 2);
    }

    #[test]
    fn released_slots_can_be_reused() {
        let limiter = RateLimiter::new(1);
        limiter.try_acquire().unwrap();
        limiter.release();
        assert_eq!(limiter.count(), 0);
        assert_eq!(limiter.try_acquire().unwrap(), 1);

        let empty = RateLimiter::new(1);
        empty.release();
        assert_eq!(empty.count(), 0);
    }

    #[test]
    fn day_change_resets_the_count() {
        let limiter = RateLimiter::new(5);
        limiter.try_acquire().unwrap();
        limiter.try_acquire().unwrap();
        limiter.roll_over(today() + 1);
        assert_eq!(limiter.count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn restore_keeps_only_todays_count() {
        let saved = RateLimiter::restore(10, Some(BudgetState { day: today(), count: 7 }));
        assert_eq!(saved.count(), 7);
        assert_eq!(saved.state(), BudgetState { day: today(), count: 7 });

        let stale = RateLimiter::restore(10, Some(BudgetState { day: today() - 1, count: 7 }));
        assert_eq!(stale.count(), 0);
        assert_eq!(RateLimiter::restore(10, None).count(), 0);
    }

    #[test]
    fn concurrent_reservations_never_pass_the_limit() {
        let limiter = Arc::new(RateLimiter::new(1_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..250).filter(|_| limiter.try_acquire().is_ok()).count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|handle| handle.join().unwrap()).sum();
        assert_eq!(granted, 1_000);
        assert_eq!(limiter.count(), 1_000);
    }
}
