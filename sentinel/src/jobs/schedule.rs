//! Job expiry predicate and the default schedule set.

use chrono::{DateTime, TimeDelta, Utc};
use sentinel_store::job::{JobRunState, JobSchedule, JobScheduleUpdate, MarketTiming};

/// Failure count beyond which backoff gives way to the normal interval.
const BACKOFF_FAILURE_CAP: u32 = 3;

/// Effective interval in minutes for a job given its failure count and the market
/// state: exponential backoff (`2^failures` minutes) while failing, the tighter
/// market-open interval when any market is open, else the normal interval.
pub fn effective_interval_minutes(
    schedule: &JobSchedule,
    run: &JobRunState,
    any_market_open: bool,
) -> u32 {
    if run.consecutive_failures > 0 && run.consecutive_failures <= BACKOFF_FAILURE_CAP {
        return 2_u32.pow(run.consecutive_failures);
    }

    if any_market_open {
        if let Some(open_interval) = schedule.interval_market_open_minutes {
            return open_interval;
        }
    }
    schedule.interval_minutes
}

/// Whether a job is due: never run, or at least its effective interval since the
/// last attempt (successful or not - backoff is measured from every attempt).
pub fn is_expired(
    schedule: &JobSchedule,
    run: &JobRunState,
    any_market_open: bool,
    now: DateTime<Utc>,
) -> bool {
    let Some(last_run) = run.last_run else {
        return true;
    };
    let interval = effective_interval_minutes(schedule, run, any_market_open);
    now - last_run >= TimeDelta::seconds(i64::from(interval) * 60)
}

/// The default schedule set, seeded idempotently at startup. All fields remain
/// configurable at runtime through the schedules table.
pub fn seed_schedules() -> Vec<JobScheduleUpdate> {
    fn seed(
        job_type: &str,
        interval_minutes: u32,
        interval_market_open_minutes: Option<u32>,
        market_timing: MarketTiming,
        description: &str,
        category: &str,
    ) -> JobScheduleUpdate {
        JobScheduleUpdate {
            job_type: job_type.to_string(),
            interval_minutes: Some(interval_minutes),
            interval_market_open_minutes,
            market_timing: Some(market_timing),
            description: Some(description.to_string()),
            category: Some(category.to_string()),
            enabled: Some(true),
        }
    }

    vec![
        seed(
            "sync:portfolio",
            30,
            Some(5),
            MarketTiming::Any,
            "Mirror broker positions and cash",
            "sync",
        ),
        seed(
            "sync:prices",
            1440,
            None,
            MarketTiming::AllClosed,
            "Daily historical price sync",
            "sync",
        ),
        seed(
            "sync:quotes",
            15,
            Some(5),
            MarketTiming::DuringOpen,
            "Refresh live quotes",
            "sync",
        ),
        seed(
            "sync:metadata",
            1440,
            None,
            MarketTiming::AnyTime,
            "Refresh security metadata",
            "sync",
        ),
        seed(
            "sync:fx",
            120,
            None,
            MarketTiming::AnyTime,
            "Refresh exchange rates",
            "sync",
        ),
        seed(
            "sync:trades",
            60,
            None,
            MarketTiming::AnyTime,
            "Mirror broker trade history",
            "sync",
        ),
        seed(
            "sync:cashflows",
            360,
            None,
            MarketTiming::AnyTime,
            "Mirror broker cash flows",
            "sync",
        ),
        seed(
            "sync:dividends",
            1440,
            None,
            MarketTiming::AnyTime,
            "Track dividends and corporate actions",
            "sync",
        ),
        seed(
            "analytics:scoring",
            360,
            None,
            MarketTiming::AnyTime,
            "Recompute security scores",
            "analytics",
        ),
        seed(
            "analytics:market-status",
            15,
            None,
            MarketTiming::AnyTime,
            "Check market open/closed state",
            "analytics",
        ),
        seed(
            "analytics:aggregates",
            60,
            None,
            MarketTiming::AnyTime,
            "Recompute cached aggregates and snapshots",
            "analytics",
        ),
        seed(
            "trading:execute",
            60,
            None,
            MarketTiming::DuringOpen,
            "Execute planner recommendations",
            "trading",
        ),
        seed(
            "trading:rebalance",
            360,
            None,
            MarketTiming::DuringOpen,
            "Refresh rebalance plan",
            "trading",
        ),
        seed(
            "trading:balance-fix",
            15,
            None,
            MarketTiming::DuringOpen,
            "Convert surplus cash to cover negative balances",
            "trading",
        ),
        seed(
            "maintenance:backup",
            1440,
            None,
            MarketTiming::AllClosed,
            "Back up the store",
            "maintenance",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::time_plus_days;

    fn schedule(interval: u32, open_interval: Option<u32>) -> JobSchedule {
        JobSchedule {
            job_type: String::from("sync:test"),
            interval_minutes: interval,
            interval_market_open_minutes: open_interval,
            market_timing: MarketTiming::AnyTime,
            description: None,
            category: String::from("sync"),
            enabled: true,
        }
    }

    fn run_state(minutes_ago: i64, failures: u32, now: DateTime<Utc>) -> JobRunState {
        JobRunState {
            last_run: Some(now - TimeDelta::minutes(minutes_ago)),
            consecutive_failures: failures,
        }
    }

    #[test]
    fn test_never_run_is_expired() {
        let now = time_plus_days(DateTime::<Utc>::MIN_UTC, 1000);
        assert!(is_expired(
            &schedule(60, None),
            &JobRunState::default(),
            false,
            now
        ));
    }

    #[test]
    fn test_interval_expiry() {
        let now = time_plus_days(DateTime::<Utc>::MIN_UTC, 1000);
        let schedule = schedule(60, None);

        assert!(!is_expired(&schedule, &run_state(59, 0, now), false, now));
        assert!(is_expired(&schedule, &run_state(60, 0, now), false, now));
    }

    #[test]
    fn test_market_open_interval_applies_only_when_open() {
        let now = time_plus_days(DateTime::<Utc>::MIN_UTC, 1000);
        let schedule = schedule(30, Some(5));
        let run = run_state(10, 0, now);

        assert!(is_expired(&schedule, &run, true, now));
        assert!(!is_expired(&schedule, &run, false, now));
    }

    #[test]
    fn test_exponential_backoff() {
        let now = time_plus_days(DateTime::<Utc>::MIN_UTC, 1000);
        let schedule = schedule(60, None);

        struct TestCase {
            failures: u32,
            minutes_ago: i64,
            expected: bool,
        }

        let cases = vec![
            // 1 failure: 2 minute backoff.
            TestCase {
                failures: 1,
                minutes_ago: 1,
                expected: false,
            },
            TestCase {
                failures: 1,
                minutes_ago: 2,
                expected: true,
            },
            // 2 failures: 4 minutes.
            TestCase {
                failures: 2,
                minutes_ago: 3,
                expected: false,
            },
            TestCase {
                failures: 2,
                minutes_ago: 4,
                expected: true,
            },
            // 3 failures: 8 minutes.
            TestCase {
                failures: 3,
                minutes_ago: 7,
                expected: false,
            },
            TestCase {
                failures: 3,
                minutes_ago: 8,
                expected: true,
            },
            // Beyond the cap: the normal interval applies again.
            TestCase {
                failures: 4,
                minutes_ago: 30,
                expected: false,
            },
            TestCase {
                failures: 4,
                minutes_ago: 60,
                expected: true,
            },
        ];

        for (index, test) in cases.iter().enumerate() {
            assert_eq!(
                is_expired(
                    &schedule,
                    &run_state(test.minutes_ago, test.failures, now),
                    false,
                    now
                ),
                test.expected,
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_seed_schedules_shape() {
        let seeds = seed_schedules();
        assert_eq!(seeds.len(), 15);

        let portfolio = seeds
            .iter()
            .find(|s| s.job_type == "sync:portfolio")
            .unwrap();
        assert_eq!(portfolio.interval_minutes, Some(30));
        assert_eq!(portfolio.interval_market_open_minutes, Some(5));
        assert_eq!(portfolio.category.as_deref(), Some("sync"));

        let rebalance = seeds
            .iter()
            .find(|s| s.job_type == "trading:rebalance")
            .unwrap();
        assert_eq!(rebalance.category.as_deref(), Some("trading"));
        assert_eq!(rebalance.market_timing, Some(MarketTiming::DuringOpen));
    }
}
