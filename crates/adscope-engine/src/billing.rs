//! Billing-period rollover policy.
//!
//! Monthly usage resets when the calendar month of the last consumption
//! differs from the current one. The policy only decides; persisting the
//! reset is the caller's business (in-memory for validation, written by the
//! reconciliation sweep or the next commit).

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use tracing::warn;

use adscope_models::PlanRecord;

/// Outcome of evaluating the rollover policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollover {
    /// Same calendar month (or no usage yet): keep the counter.
    Keep,
    /// Calendar month changed: usage resets to zero.
    NewMonth,
    /// The stored last-usage instant is unparseable. Fail safe toward a
    /// clean slate for the user rather than blocking them.
    AssumeZero,
}

impl Rollover {
    /// Whether the monthly counter must be treated as zero.
    pub fn requires_reset(&self) -> bool {
        !matches!(self, Rollover::Keep)
    }
}

/// Decides whether monthly usage must roll over to zero.
pub struct BillingPeriodPolicy;

impl BillingPeriodPolicy {
    /// Evaluate the policy for a stored last-usage value at `now`.
    ///
    /// A missing value means usage is already at baseline. A malformed
    /// value is not silent data loss: it is surfaced as a warning event and
    /// treated as "reset required".
    pub fn evaluate(last_usage_date: Option<&str>, now: DateTime<Utc>) -> Rollover {
        let Some(raw) = last_usage_date else {
            return Rollover::Keep;
        };

        match parse_instant(raw) {
            Some(last) => {
                if (last.year(), last.month()) == (now.year(), now.month()) {
                    Rollover::Keep
                } else {
                    Rollover::NewMonth
                }
            }
            None => {
                warn!(
                    last_usage_date = %raw,
                    "Unparseable last usage date; assuming a clean monthly slate"
                );
                Rollover::AssumeZero
            }
        }
    }

    /// The monthly counter a record effectively has at `now`, together with
    /// the rollover decision that produced it. Does not persist anything.
    pub fn effective_ads_used(record: &PlanRecord, now: DateTime<Utc>) -> (u32, Rollover) {
        let rollover = Self::evaluate(record.last_usage_date.as_deref(), now);
        let effective = if rollover.requires_reset() {
            0
        } else {
            record.ads_used
        };
        (effective, rollover)
    }
}

/// Parse a stored usage instant.
///
/// Accepts RFC3339, plus the naive `YYYY-MM-DDTHH:MM:SS[.f]` form that
/// older records carry (written without an offset).
fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.into());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_month_change_triggers_reset() {
        let rollover =
            BillingPeriodPolicy::evaluate(Some("2024-01-15T10:00:00Z"), instant(2024, 2, 1));
        assert_eq!(rollover, Rollover::NewMonth);
    }

    #[test]
    fn test_same_month_keeps_usage() {
        let rollover =
            BillingPeriodPolicy::evaluate(Some("2024-02-10T10:00:00Z"), instant(2024, 2, 20));
        assert_eq!(rollover, Rollover::Keep);
    }

    #[test]
    fn test_year_change_with_same_month_number() {
        let rollover =
            BillingPeriodPolicy::evaluate(Some("2023-02-10T10:00:00Z"), instant(2024, 2, 10));
        assert_eq!(rollover, Rollover::NewMonth);
    }

    #[test]
    fn test_missing_last_usage_means_baseline() {
        assert_eq!(
            BillingPeriodPolicy::evaluate(None, instant(2024, 2, 1)),
            Rollover::Keep
        );
    }

    #[test]
    fn test_malformed_value_assumes_zero() {
        let rollover = BillingPeriodPolicy::evaluate(Some("not-a-date"), instant(2024, 2, 1));
        assert_eq!(rollover, Rollover::AssumeZero);
        assert!(rollover.requires_reset());
    }

    #[test]
    fn test_naive_legacy_format_is_accepted() {
        let rollover =
            BillingPeriodPolicy::evaluate(Some("2024-02-10T08:30:00.123456"), instant(2024, 2, 20));
        assert_eq!(rollover, Rollover::Keep);
    }

    #[test]
    fn test_effective_usage_resets_in_memory_only() {
        use adscope_models::{NewSubscription, PlanTier};

        let mut record =
            PlanRecord::activate(&NewSubscription::new("u1", PlanTier::Lite), instant(2024, 1, 5));
        record.ads_used = 3;
        record.last_usage_date = Some("2024-01-20T10:00:00Z".to_string());

        let (effective, rollover) =
            BillingPeriodPolicy::effective_ads_used(&record, instant(2024, 2, 2));
        assert_eq!(effective, 0);
        assert_eq!(rollover, Rollover::NewMonth);
        // The record itself is untouched
        assert_eq!(record.ads_used, 3);
    }
}
