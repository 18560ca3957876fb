use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Market-timing gate evaluated against the open/closed state of the markets touched
/// by the active universe.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub enum MarketTiming {
    /// Legacy alias for [`Self::AnyTime`].
    #[display("any")]
    Any,
    /// Run only when every market is closed.
    #[display("all_closed")]
    AllClosed,
    /// Run only while at least one market is open.
    #[display("during_open")]
    DuringOpen,
    /// No market gate.
    #[display("any_time")]
    AnyTime,
}

impl MarketTiming {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Any => 0,
            Self::AllClosed => 1,
            Self::DuringOpen => 2,
            Self::AnyTime => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Any),
            1 => Some(Self::AllClosed),
            2 => Some(Self::DuringOpen),
            3 => Some(Self::AnyTime),
            _ => None,
        }
    }

    /// Evaluate the gate given how many of the universe's markets are open.
    pub fn permits(&self, open_markets: usize) -> bool {
        match self {
            Self::Any | Self::AnyTime => true,
            Self::AllClosed => open_markets == 0,
            Self::DuringOpen => open_markets >= 1,
        }
    }
}

/// Configurable schedule for one background job type.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JobSchedule {
    pub job_type: String,
    pub interval_minutes: u32,
    /// Optional tighter interval applied while any market is open.
    pub interval_market_open_minutes: Option<u32>,
    pub market_timing: MarketTiming,
    pub description: Option<String>,
    pub category: String,
    pub enabled: bool,
}

/// Partial schedule update - `None` fields keep their stored value.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct JobScheduleUpdate {
    pub job_type: String,
    pub interval_minutes: Option<u32>,
    pub interval_market_open_minutes: Option<u32>,
    pub market_timing: Option<MarketTiming>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub enabled: Option<bool>,
}

/// Run bookkeeping per job id. Parameterised jobs use composite ids
/// (`job_type:param`) so state is tracked per composite id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct JobRunState {
    pub last_run: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Append-only execution history row.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JobHistoryRecord {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_timing_permits() {
        struct TestCase {
            timing: MarketTiming,
            open_markets: usize,
            expected: bool,
        }

        let cases = vec![
            TestCase {
                timing: MarketTiming::AnyTime,
                open_markets: 0,
                expected: true,
            },
            TestCase {
                timing: MarketTiming::Any,
                open_markets: 3,
                expected: true,
            },
            TestCase {
                timing: MarketTiming::AllClosed,
                open_markets: 0,
                expected: true,
            },
            TestCase {
                timing: MarketTiming::AllClosed,
                open_markets: 1,
                expected: false,
            },
            TestCase {
                timing: MarketTiming::DuringOpen,
                open_markets: 0,
                expected: false,
            },
            TestCase {
                timing: MarketTiming::DuringOpen,
                open_markets: 2,
                expected: true,
            },
        ];

        for (index, test) in cases.iter().enumerate() {
            assert_eq!(
                test.timing.permits(test.open_markets),
                test.expected,
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_market_timing_i64_round_trip() {
        for value in 0..4 {
            let timing = MarketTiming::from_i64(value).unwrap();
            assert_eq!(timing.as_i64(), value);
        }
        assert_eq!(MarketTiming::from_i64(4), None);
    }
}
