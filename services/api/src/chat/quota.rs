//! services/api/src/chat/quota.rs
//!
//! The quota ledger: per-user monthly allowances for metered actions.
//!
//! Every check-and-increment is delegated to a single conditional update in the
//! storage layer, so two reservations racing for the last unit can never both
//! succeed. The monthly rollover is applied lazily, by another conditional
//! update, before the limit is evaluated.

use chrono::{DateTime, Utc};
use research_assistant_core::domain::{
    month_start, next_reset_date, SubscriptionTier, UsageCounters, UsageKind, User,
};
use research_assistant_core::ports::{CounterUpdate, DatabaseService, PortResult};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::QuotaLimits;

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// One unit was consumed; carries the counter's new value.
    Granted { usage: i64 },
    /// The allowance is exhausted until `reset_date`.
    Denied {
        current_usage: i64,
        limit: i64,
        reset_date: DateTime<Utc>,
    },
}

/// A user's current standing against the free-tier allowance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub tier: SubscriptionTier,
    pub usage: UsageCounters,
    /// `None` for tiers that are never gated.
    pub request_limit: Option<i64>,
    pub plagiarism_limit: Option<i64>,
    pub document_limit: Option<i64>,
    pub reset_date: DateTime<Utc>,
}

pub struct QuotaLedger {
    db: Arc<dyn DatabaseService>,
    limits: QuotaLimits,
}

impl QuotaLedger {
    pub fn new(db: Arc<dyn DatabaseService>, limits: QuotaLimits) -> Self {
        Self { db, limits }
    }

    /// The free-tier limit for a counter. Voice minutes are tracked but not gated.
    fn limit_for(&self, tier: SubscriptionTier, kind: UsageKind) -> Option<i64> {
        if !tier.is_metered() {
            return None;
        }
        match kind {
            UsageKind::Request => Some(self.limits.monthly_requests),
            UsageKind::PlagiarismCheck => Some(self.limits.plagiarism_checks),
            UsageKind::Document => Some(self.limits.documents),
            UsageKind::VoiceMinute => None,
        }
    }

    pub async fn reserve(&self, user_id: Uuid, kind: UsageKind) -> PortResult<Reservation> {
        self.reserve_at(user_id, kind, Utc::now()).await
    }

    /// Reserves one unit of `kind` as of `now`.
    pub async fn reserve_at(
        &self,
        user_id: Uuid,
        kind: UsageKind,
        now: DateTime<Utc>,
    ) -> PortResult<Reservation> {
        let user = self.db.get_user(user_id).await?;
        self.apply_rollover(&user, now).await?;

        let limit = self.limit_for(user.tier, kind);
        match self.db.increment_usage_within(user_id, kind, limit).await? {
            CounterUpdate::Applied(usage) => {
                debug!(%user_id, kind = kind.as_str(), usage, "Quota unit reserved");
                Ok(Reservation::Granted { usage })
            }
            CounterUpdate::AtLimit(current_usage) => {
                info!(%user_id, kind = kind.as_str(), current_usage, "Quota exhausted");
                Ok(Reservation::Denied {
                    current_usage,
                    limit: limit.unwrap_or(current_usage),
                    reset_date: next_reset_date(now),
                })
            }
        }
    }

    /// Gives `amount` units of `kind` back. Never gated, floors at zero.
    pub async fn release(&self, user_id: Uuid, kind: UsageKind, amount: i64) -> PortResult<i64> {
        let remaining = self.db.adjust_usage(user_id, kind, -amount).await?;
        debug!(%user_id, kind = kind.as_str(), amount, remaining, "Quota released");
        Ok(remaining)
    }

    pub async fn usage_report(&self, user_id: Uuid) -> PortResult<UsageReport> {
        self.usage_report_at(user_id, Utc::now()).await
    }

    /// Reports the user's counters as of `now`, applying a pending rollover first.
    pub async fn usage_report_at(&self, user_id: Uuid, now: DateTime<Utc>) -> PortResult<UsageReport> {
        let mut user = self.db.get_user(user_id).await?;
        if self.apply_rollover(&user, now).await? {
            user = self.db.get_user(user_id).await?;
        }

        Ok(UsageReport {
            tier: user.tier,
            request_limit: self.limit_for(user.tier, UsageKind::Request),
            plagiarism_limit: self.limit_for(user.tier, UsageKind::PlagiarismCheck),
            document_limit: self.limit_for(user.tier, UsageKind::Document),
            reset_date: next_reset_date(now),
            usage: user.usage,
        })
    }

    /// Zeroes the rolling counters once per calendar month. The storage guard
    /// makes concurrent callers agree on a single reset.
    async fn apply_rollover(&self, user: &User, now: DateTime<Utc>) -> PortResult<bool> {
        if !user.usage.needs_rollover(now) {
            return Ok(false);
        }
        let applied = self
            .db
            .reset_usage_before(user.user_id, month_start(now), now)
            .await?;
        if applied {
            info!(user_id = %user.user_id, "Monthly usage counters rolled over");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryDatabase;
    use chrono::TimeZone;

    fn ledger_with(db: Arc<InMemoryDatabase>, monthly_requests: i64) -> QuotaLedger {
        QuotaLedger::new(
            db,
            QuotaLimits {
                monthly_requests,
                ..QuotaLimits::default()
            },
        )
    }

    fn usage_at(requests: i64, last_reset: DateTime<Utc>) -> UsageCounters {
        let mut usage = UsageCounters::new(last_reset);
        usage.monthly_requests = requests;
        usage
    }

    #[tokio::test]
    async fn free_user_is_denied_after_limit() {
        let db = Arc::new(InMemoryDatabase::new());
        let user_id = Uuid::new_v4();
        db.get_or_create_user(user_id, SubscriptionTier::Free).await.unwrap();
        let ledger = ledger_with(db, 3);
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();

        for expected in 1..=3 {
            assert_eq!(
                ledger.reserve_at(user_id, UsageKind::Request, now).await.unwrap(),
                Reservation::Granted { usage: expected }
            );
        }
        assert_eq!(
            ledger.reserve_at(user_id, UsageKind::Request, now).await.unwrap(),
            Reservation::Denied {
                current_usage: 3,
                limit: 3,
                reset_date: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn month_boundary_grants_again() {
        let db = Arc::new(InMemoryDatabase::new());
        let user_id = Uuid::new_v4();
        let may = Utc.with_ymd_and_hms(2024, 5, 20, 8, 0, 0).unwrap();
        db.set_usage(user_id, SubscriptionTier::Free, usage_at(50, may));
        let ledger = ledger_with(db.clone(), 50);

        let late_may = Utc.with_ymd_and_hms(2024, 5, 31, 23, 59, 0).unwrap();
        assert!(matches!(
            ledger.reserve_at(user_id, UsageKind::Request, late_may).await.unwrap(),
            Reservation::Denied { .. }
        ));

        let june = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 1).unwrap();
        assert_eq!(
            ledger.reserve_at(user_id, UsageKind::Request, june).await.unwrap(),
            Reservation::Granted { usage: 1 }
        );
        let user = db.get_user(user_id).await.unwrap();
        assert_eq!(user.usage.last_reset_date, june);
    }

    #[tokio::test]
    async fn premium_is_never_gated_but_still_counted() {
        let db = Arc::new(InMemoryDatabase::new());
        let user_id = Uuid::new_v4();
        db.set_usage(user_id, SubscriptionTier::Premium, usage_at(500, Utc::now()));
        let ledger = ledger_with(db, 50);

        assert_eq!(
            ledger.reserve(user_id, UsageKind::Request).await.unwrap(),
            Reservation::Granted { usage: 501 }
        );
        assert_eq!(
            ledger.reserve(user_id, UsageKind::Request).await.unwrap(),
            Reservation::Granted { usage: 502 }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn last_unit_goes_to_exactly_one_caller() {
        let db = Arc::new(InMemoryDatabase::new());
        let user_id = Uuid::new_v4();
        db.set_usage(user_id, SubscriptionTier::Free, usage_at(49, Utc::now()));
        let ledger = Arc::new(ledger_with(db, 50));

        let (a, b) = tokio::join!(
            {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.reserve(user_id, UsageKind::Request).await })
            },
            {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.reserve(user_id, UsageKind::Request).await })
            }
        );
        let outcomes = [a.unwrap().unwrap(), b.unwrap().unwrap()];

        let granted = outcomes
            .iter()
            .filter(|r| matches!(r, Reservation::Granted { .. }))
            .count();
        assert_eq!(granted, 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Reservation::Denied { current_usage: 50, limit: 50, .. })));
    }

    #[tokio::test]
    async fn release_floors_at_zero() {
        let db = Arc::new(InMemoryDatabase::new());
        let user_id = Uuid::new_v4();
        db.get_or_create_user(user_id, SubscriptionTier::Free).await.unwrap();
        let ledger = ledger_with(db, 50);

        ledger.reserve(user_id, UsageKind::Document).await.unwrap();
        assert_eq!(ledger.release(user_id, UsageKind::Document, 3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn report_applies_pending_rollover() {
        let db = Arc::new(InMemoryDatabase::new());
        let user_id = Uuid::new_v4();
        let january = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        db.set_usage(user_id, SubscriptionTier::Free, usage_at(12, january));
        let ledger = ledger_with(db, 50);

        let march = Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap();
        let report = ledger.usage_report_at(user_id, march).await.unwrap();
        assert_eq!(report.usage.monthly_requests, 0);
        assert_eq!(report.request_limit, Some(50));
        assert_eq!(report.reset_date, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
    }
}
