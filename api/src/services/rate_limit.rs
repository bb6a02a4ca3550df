//! Per-user daily usage ledger
//!
//! Each user has a counter and the date it was last written. The counter is
//! reset lazily: a read or write on a later UTC date sees zero and moves the
//! boundary forward as part of the same write. Nothing sweeps old entries.

use chrono::{DateTime, Days, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::LedgerEntry;

impl LedgerEntry {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            daily_count: 0,
            reset_boundary: today,
        }
    }

    /// Count that applies on `today`, honoring the lazy reset
    pub fn effective_count(&self, today: NaiveDate) -> u32 {
        if today > self.reset_boundary {
            0
        } else {
            self.daily_count
        }
    }

    /// Slots still available under `limit` on `today`
    pub fn remaining(&self, limit: u32, today: NaiveDate) -> u32 {
        limit.saturating_sub(self.effective_count(today))
    }

    /// Take up to `requested` slots without exceeding `limit`.
    /// Returns the number granted (possibly zero). A grant of zero leaves the entry untouched.
    pub fn reserve(&mut self, limit: u32, requested: u32, today: NaiveDate) -> u32 {
        let granted = requested.min(self.remaining(limit, today));
        if granted == 0 {
            return 0;
        }
        self.daily_count = self.effective_count(today) + granted;
        if today > self.reset_boundary {
            self.reset_boundary = today;
        }
        granted
    }

    /// Give back slots reserved earlier on `today`. Slots from a previous day are gone already.
    pub fn release(&mut self, count: u32, today: NaiveDate) {
        if today > self.reset_boundary {
            return;
        }
        self.daily_count = self.daily_count.saturating_sub(count);
    }
}

/// Instant at which the effective count next returns to zero (next UTC midnight)
pub fn resets_at(today: NaiveDate) -> DateTime<Utc> {
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

/// In-process ledger. Each operation runs in a single critical section, so
/// check-then-increment cannot interleave between concurrent callers.
#[derive(Default)]
pub struct UsageLedger {
    entries: Mutex<HashMap<Uuid, LedgerEntry>>,
}

impl UsageLedger {
    pub fn entry(&self, user_id: Uuid, today: NaiveDate) -> LedgerEntry {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&user_id)
            .copied()
            .unwrap_or_else(|| LedgerEntry::new(today))
    }

    /// Overwrite a user's stored entry
    #[cfg(test)]
    pub fn set(&self, user_id: Uuid, entry: LedgerEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(user_id, entry);
    }

    pub fn reserve(&self, user_id: Uuid, limit: u32, requested: u32, today: NaiveDate) -> u32 {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(user_id)
            .or_insert_with(|| LedgerEntry::new(today))
            .reserve(limit, requested, today)
    }

    pub fn release(&self, user_id: Uuid, count: u32, today: NaiveDate) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(&user_id) {
            entry.release(count, today);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_count_resets_on_a_later_date() {
        let entry = LedgerEntry {
            daily_count: 5,
            reset_boundary: date("2026-02-19"),
        };
        assert_eq!(entry.effective_count(date("2026-02-19")), 5);
        assert_eq!(entry.effective_count(date("2026-02-20")), 0);
    }

    #[test]
    fn test_reserve_never_exceeds_limit() {
        let today = date("2026-02-20");
        let mut entry = LedgerEntry {
            daily_count: 3,
            reset_boundary: today,
        };
        assert_eq!(entry.reserve(5, 4, today), 2);
        assert_eq!(entry.daily_count, 5);
        assert_eq!(entry.reserve(5, 1, today), 0);
        assert_eq!(entry.daily_count, 5);
    }

    #[test]
    fn test_reserve_after_reset_advances_boundary() {
        let mut entry = LedgerEntry {
            daily_count: 5,
            reset_boundary: date("2026-02-19"),
        };
        assert_eq!(entry.reserve(5, 1, date("2026-02-20")), 1);
        assert_eq!(entry.daily_count, 1);
        assert_eq!(entry.reset_boundary, date("2026-02-20"));
    }

    #[test]
    fn test_denied_reserve_leaves_entry_unchanged() {
        let today = date("2026-02-20");
        let mut entry = LedgerEntry {
            daily_count: 5,
            reset_boundary: today,
        };
        let before = entry;
        assert_eq!(entry.reserve(5, 1, today), 0);
        assert_eq!(entry, before);
    }

    #[test]
    fn test_release_ignores_stale_day() {
        let mut entry = LedgerEntry {
            daily_count: 4,
            reset_boundary: date("2026-02-19"),
        };
        entry.release(2, date("2026-02-20"));
        assert_eq!(entry.daily_count, 4);
        entry.release(10, date("2026-02-19"));
        assert_eq!(entry.daily_count, 0);
    }

    #[test]
    fn test_resets_at_is_next_midnight() {
        let at = resets_at(date("2026-02-20"));
        assert_eq!(at.to_rfc3339(), "2026-02-21T00:00:00+00:00");
    }

    #[test]
    fn test_concurrent_reserves_do_not_overshoot() {
        use std::sync::Arc;

        let ledger = Arc::new(UsageLedger::default());
        let user = Uuid::new_v4();
        let today = date("2026-02-20");
        ledger.set(
            user,
            LedgerEntry {
                daily_count: 2,
                reset_boundary: today,
            },
        );

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.reserve(user, 5, 1, today))
            })
            .collect();
        let granted: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(granted, 3);
        assert_eq!(ledger.entry(user, today).daily_count, 5);
    }
}
