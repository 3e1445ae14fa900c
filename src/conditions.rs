// src/conditions.rs
//
// Stopping conditions evaluated against the running statistics. Any
// triggered condition stops the test; the driver also arms a timer for the
// runtime condition so an idle test still stops on schedule.

use std::time::{Duration, Instant};

use crate::stats::Statistics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoppingCondition {
    Runtime(Duration),
    TotalOperations(u64),
    TotalAborts(u64),
    StatusCodeCount { status_code: u16, count: u64 },
}

impl StoppingCondition {
    pub fn triggered(&self, stats: &Statistics, started: Instant) -> bool {
        match self {
            StoppingCondition::Runtime(limit) => started.elapsed() >= *limit,
            StoppingCondition::TotalOperations(limit) => stats.total_operations() >= *limit,
            StoppingCondition::TotalAborts(limit) => stats.aborts() >= *limit,
            StoppingCondition::StatusCodeCount { status_code, count } => {
                stats.status_code_count(*status_code) >= *count
            }
        }
    }

    pub fn runtime(&self) -> Option<Duration> {
        match self {
            StoppingCondition::Runtime(d) => Some(*d),
            _ => None,
        }
    }
}

impl std::fmt::Display for StoppingCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoppingCondition::Runtime(d) => write!(f, "runtime {:?}", d),
            StoppingCondition::TotalOperations(n) => write!(f, "operations >= {}", n),
            StoppingCondition::TotalAborts(n) => write!(f, "aborts >= {}", n),
            StoppingCondition::StatusCodeCount { status_code, count } => {
                write!(f, "status {} count >= {}", status_code, count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Operation;

    #[test]
    fn operations_condition_triggers_at_threshold() {
        let stats = Statistics::new();
        let cond = StoppingCondition::TotalOperations(2);
        let started = Instant::now();
        assert!(!cond.triggered(&stats, started));
        stats.record(Operation::Write, 200, 0, Duration::from_micros(1));
        assert!(!cond.triggered(&stats, started));
        stats.record(Operation::Read, 200, 0, Duration::from_micros(1));
        assert!(cond.triggered(&stats, started));
    }

    #[test]
    fn status_code_condition_counts_only_that_code() {
        let stats = Statistics::new();
        let cond = StoppingCondition::StatusCodeCount {
            status_code: 500,
            count: 1,
        };
        let started = Instant::now();
        stats.record(Operation::Read, 200, 0, Duration::from_micros(1));
        assert!(!cond.triggered(&stats, started));
        stats.record(Operation::Read, 500, 0, Duration::from_micros(1));
        assert!(cond.triggered(&stats, started));
    }

    #[test]
    fn aborts_condition() {
        let stats = Statistics::new();
        let cond = StoppingCondition::TotalAborts(1);
        let started = Instant::now();
        assert!(!cond.triggered(&stats, started));
        stats.record_abort();
        assert!(cond.triggered(&stats, started));
    }

    #[test]
    fn runtime_condition_uses_the_clock() {
        let stats = Statistics::new();
        let cond = StoppingCondition::Runtime(Duration::from_millis(5));
        let started = Instant::now() - Duration::from_millis(10);
        assert!(cond.triggered(&stats, started));
        assert!(!cond.triggered(&stats, Instant::now()));
    }
}
