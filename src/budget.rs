use crate::config::{BudgetConfig, EnforcementAction};
use crate::types::ComplexityTier;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Compensated floating-point accumulator. Cost totals are summed across
/// many small values, where naive accumulation drifts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    pub fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn value(&self) -> f64 {
        self.sum
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.compensation = 0.0;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SpendWindow {
    spent: KahanSum,
    reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TierSpend {
    daily: SpendWindow,
    weekly: SpendWindow,
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub daily_remaining: f64,
    pub weekly_remaining: f64,
    pub alert_triggered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierBudgetStatus {
    pub tier: ComplexityTier,
    pub daily_spent_cents: i64,
    pub daily_limit: Option<f64>,
    pub daily_reset_at: DateTime<Utc>,
    pub weekly_spent_cents: i64,
    pub weekly_limit: Option<f64>,
    pub weekly_reset_at: DateTime<Utc>,
}

/// Serialized tracker state; the explicit extension point for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    tiers: HashMap<ComplexityTier, TierSpend>,
}

/// Per-tier daily and weekly spend with UTC reset clocks.
///
/// Daily windows reset at the next UTC midnight, weekly windows at the next
/// Monday 00:00 UTC. Resets are applied lazily and idempotently at the start
/// of every record and check.
#[derive(Debug)]
pub struct BudgetTracker {
    tiers: Mutex<HashMap<ComplexityTier, TierSpend>>,
    config: BudgetConfig,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        let now = Utc::now();
        let tiers = ComplexityTier::ALL
            .iter()
            .map(|tier| (*tier, fresh_tier_spend(now)))
            .collect();

        Self {
            tiers: Mutex::new(tiers),
            config,
        }
    }

    /// Add spend to a tier. Zero, negative, and disabled-tracker calls are
    /// ignored.
    pub fn record(&self, tier: ComplexityTier, cost_usd: f64) {
        if !self.config.enabled || !(cost_usd > 0.0) {
            return;
        }

        let Ok(mut tiers) = self.tiers.lock() else {
            return;
        };
        let now = Utc::now();
        let spend = tiers.entry(tier).or_insert_with(|| fresh_tier_spend(now));
        maybe_reset(spend, now);

        spend.daily.spent.add(cost_usd);
        spend.weekly.spent.add(cost_usd);

        debug!(
            tier = %tier,
            cost_usd,
            daily = spend.daily.spent.value(),
            weekly = spend.weekly.spent.value(),
            "recorded spend"
        );
    }

    /// Check whether a tier is within budget. A missing or zero limit means
    /// unlimited.
    pub fn check(&self, tier: ComplexityTier) -> BudgetCheck {
        let open = BudgetCheck {
            allowed: true,
            daily_remaining: f64::INFINITY,
            weekly_remaining: f64::INFINITY,
            alert_triggered: false,
        };
        if !self.config.enabled {
            return open;
        }

        let Ok(mut tiers) = self.tiers.lock() else {
            return open;
        };
        let now = Utc::now();
        let spend = tiers.entry(tier).or_insert_with(|| fresh_tier_spend(now));
        maybe_reset(spend, now);

        let daily_limit = limit_for(&self.config.daily, tier);
        let weekly_limit = limit_for(&self.config.weekly, tier);

        let daily_spent = spend.daily.spent.value();
        let weekly_spent = spend.weekly.spent.value();

        let daily_remaining = daily_limit.map_or(f64::INFINITY, |l| l - daily_spent);
        let weekly_remaining = weekly_limit.map_or(f64::INFINITY, |l| l - weekly_spent);

        let threshold = self.config.alert_threshold_percent;
        let alert_triggered = daily_limit
            .map(|l| daily_spent / l * 100.0 >= threshold)
            .unwrap_or(false)
            || weekly_limit
                .map(|l| weekly_spent / l * 100.0 >= threshold)
                .unwrap_or(false);

        let daily_over = daily_remaining < 0.0;
        let weekly_over = weekly_remaining < 0.0;

        let allowed = match self.config.enforcement_action {
            EnforcementAction::AlertOnly => true,
            EnforcementAction::Block => !(daily_over || weekly_over),
            // Weekly overrun is only signalled; the router reacts by picking
            // a cheaper tier rather than refusing outright.
            EnforcementAction::Downgrade => !daily_over,
        };

        if alert_triggered {
            warn!(
                tier = %tier,
                daily_remaining,
                weekly_remaining,
                "budget alert threshold reached"
            );
        }

        BudgetCheck {
            allowed,
            daily_remaining,
            weekly_remaining,
            alert_triggered,
        }
    }

    pub fn enforcement_action(&self) -> EnforcementAction {
        self.config.enforcement_action
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Snapshot per tier with spend rounded to cents.
    pub fn get_status(&self) -> Vec<TierBudgetStatus> {
        let Ok(mut tiers) = self.tiers.lock() else {
            return Vec::new();
        };
        let now = Utc::now();

        ComplexityTier::ALL
            .iter()
            .map(|tier| {
                let spend = tiers.entry(*tier).or_insert_with(|| fresh_tier_spend(now));
                maybe_reset(spend, now);
                TierBudgetStatus {
                    tier: *tier,
                    daily_spent_cents: (spend.daily.spent.value() * 100.0).round() as i64,
                    daily_limit: limit_for(&self.config.daily, *tier),
                    daily_reset_at: spend.daily.reset_at,
                    weekly_spent_cents: (spend.weekly.spent.value() * 100.0).round() as i64,
                    weekly_limit: limit_for(&self.config.weekly, *tier),
                    weekly_reset_at: spend.weekly.reset_at,
                }
            })
            .collect()
    }

    pub fn serialize(&self) -> BudgetSnapshot {
        let tiers = self
            .tiers
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default();
        BudgetSnapshot { tiers }
    }

    pub fn from_snapshot(config: BudgetConfig, snapshot: BudgetSnapshot) -> Self {
        Self {
            tiers: Mutex::new(snapshot.tiers),
            config,
        }
    }
}

fn limit_for(limits: &HashMap<ComplexityTier, f64>, tier: ComplexityTier) -> Option<f64> {
    limits.get(&tier).copied().filter(|l| *l > 0.0)
}

fn fresh_tier_spend(now: DateTime<Utc>) -> TierSpend {
    TierSpend {
        daily: SpendWindow {
            spent: KahanSum::default(),
            reset_at: next_utc_midnight(now),
        },
        weekly: SpendWindow {
            spent: KahanSum::default(),
            reset_at: next_monday_midnight(now),
        },
    }
}

/// Idempotent: each expired window resets exactly once, to the next boundary
/// after `now`.
fn maybe_reset(spend: &mut TierSpend, now: DateTime<Utc>) {
    if now >= spend.daily.reset_at {
        spend.daily.spent.reset();
        spend.daily.reset_at = next_utc_midnight(now);
    }
    if now >= spend.weekly.reset_at {
        spend.weekly.spent.reset();
        spend.weekly.reset_at = next_monday_midnight(now);
    }
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

fn next_monday_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_ahead = 7 - now.weekday().num_days_from_monday() as i64;
    let monday = now.date_naive() + Duration::days(days_ahead);
    Utc.from_utc_datetime(&monday.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(action: EnforcementAction, daily_complex: f64) -> BudgetConfig {
        let mut config = BudgetConfig {
            enabled: true,
            enforcement_action: action,
            ..BudgetConfig::default()
        };
        config.daily.insert(ComplexityTier::Complex, daily_complex);
        config
    }

    #[test]
    fn block_enforcement_denies_when_over() {
        let tracker = BudgetTracker::new(config(EnforcementAction::Block, 1.0));
        tracker.record(ComplexityTier::Complex, 0.60);
        tracker.record(ComplexityTier::Complex, 0.50);

        let check = tracker.check(ComplexityTier::Complex);
        assert!(!check.allowed);
        assert!((check.daily_remaining - (-0.10)).abs() < 1e-9);
        assert!(check.alert_triggered);
    }

    #[test]
    fn alert_only_always_allows() {
        let tracker = BudgetTracker::new(config(EnforcementAction::AlertOnly, 1.0));
        tracker.record(ComplexityTier::Complex, 5.0);

        let check = tracker.check(ComplexityTier::Complex);
        assert!(check.allowed);
        assert!(check.alert_triggered);
    }

    #[test]
    fn downgrade_blocks_only_on_daily_overrun() {
        let mut cfg = config(EnforcementAction::Downgrade, 0.0);
        cfg.weekly.insert(ComplexityTier::Complex, 1.0);
        let tracker = BudgetTracker::new(cfg);
        tracker.record(ComplexityTier::Complex, 2.0);

        // Weekly is over but daily is unlimited: still allowed, just flagged.
        let check = tracker.check(ComplexityTier::Complex);
        assert!(check.allowed);
        assert!(check.weekly_remaining < 0.0);
        assert!(check.alert_triggered);
    }

    #[test]
    fn remaining_decreases_by_recorded_cost() {
        let tracker = BudgetTracker::new(config(EnforcementAction::Block, 10.0));
        let before = tracker.check(ComplexityTier::Complex).daily_remaining;
        tracker.record(ComplexityTier::Complex, 0.25);
        let after = tracker.check(ComplexityTier::Complex).daily_remaining;

        assert!((before - after - 0.25).abs() < 1e-9);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let tracker = BudgetTracker::new(config(EnforcementAction::Block, 0.0));
        tracker.record(ComplexityTier::Complex, 1000.0);

        let check = tracker.check(ComplexityTier::Complex);
        assert!(check.allowed);
        assert!(check.daily_remaining.is_infinite());
        assert!(!check.alert_triggered);
    }

    #[test]
    fn negative_and_zero_costs_are_ignored() {
        let tracker = BudgetTracker::new(config(EnforcementAction::Block, 1.0));
        tracker.record(ComplexityTier::Complex, 0.0);
        tracker.record(ComplexityTier::Complex, -5.0);

        let check = tracker.check(ComplexityTier::Complex);
        assert!((check.daily_remaining - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_tracker_is_wide_open() {
        let mut cfg = config(EnforcementAction::Block, 0.01);
        cfg.enabled = false;
        let tracker = BudgetTracker::new(cfg);
        tracker.record(ComplexityTier::Complex, 100.0);

        let check = tracker.check(ComplexityTier::Complex);
        assert!(check.allowed);
        assert!(check.daily_remaining.is_infinite());
    }

    #[test]
    fn expired_windows_reset_exactly_once() {
        let tracker = BudgetTracker::new(config(EnforcementAction::Block, 1.0));
        tracker.record(ComplexityTier::Complex, 0.5);

        // Force both windows into the past.
        {
            let mut tiers = tracker.tiers.lock().unwrap();
            let spend = tiers.get_mut(&ComplexityTier::Complex).unwrap();
            spend.daily.reset_at = Utc::now() - Duration::hours(1);
            spend.weekly.reset_at = Utc::now() - Duration::hours(1);
        }

        let check = tracker.check(ComplexityTier::Complex);
        assert!((check.daily_remaining - 1.0).abs() < 1e-9);

        // A second check does not reset again.
        let again = tracker.check(ComplexityTier::Complex);
        assert!((again.daily_remaining - 1.0).abs() < 1e-9);

        let status = tracker.get_status();
        let complex = status
            .iter()
            .find(|s| s.tier == ComplexityTier::Complex)
            .unwrap();
        assert_eq!(complex.daily_spent_cents, 0);
        assert!(complex.daily_reset_at > Utc::now());
    }

    #[test]
    fn reset_boundaries_are_utc_midnights() {
        let wednesday = Utc.with_ymd_and_hms(2026, 2, 18, 15, 30, 0).unwrap();
        let daily = next_utc_midnight(wednesday);
        assert_eq!(daily, Utc.with_ymd_and_hms(2026, 2, 19, 0, 0, 0).unwrap());

        let weekly = next_monday_midnight(wednesday);
        assert_eq!(weekly, Utc.with_ymd_and_hms(2026, 2, 23, 0, 0, 0).unwrap());

        // From a Monday, the next weekly boundary is the following Monday.
        let monday = Utc.with_ymd_and_hms(2026, 2, 23, 0, 0, 1).unwrap();
        assert_eq!(
            next_monday_midnight(monday),
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn kahan_sum_is_stable_over_many_small_values() {
        let mut kahan = KahanSum::default();
        for _ in 0..1_000_000 {
            kahan.add(0.000001);
        }
        assert!((kahan.value() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_round_trip_preserves_spend() {
        let tracker = BudgetTracker::new(config(EnforcementAction::Block, 10.0));
        tracker.record(ComplexityTier::Complex, 1.5);

        let snapshot = tracker.serialize();
        let restored =
            BudgetTracker::from_snapshot(config(EnforcementAction::Block, 10.0), snapshot);

        let check = restored.check(ComplexityTier::Complex);
        assert!((check.daily_remaining - 8.5).abs() < 1e-9);
    }
}
