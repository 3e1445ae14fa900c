// src/stats.rs
//
// Running counters and latency histograms, and the end-of-test summary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hdrhistogram::Histogram;

use crate::events::{Completed, Subscriber};
use crate::request::{Method, Operation, ALL_OPERATIONS};

/// Synthetic status used when a request never produced a wire response
/// (supplier I/O failure, transport error).
pub const STATUS_REQUEST_FAILED: u16 = 599;

pub struct Statistics {
    operations: Vec<AtomicU64>,
    bytes: Vec<AtomicU64>,
    status_classes: [AtomicU64; 6],
    status_codes: Mutex<HashMap<u16, u64>>,
    aborts: AtomicU64,
    skips: AtomicU64,
    histograms: Vec<Mutex<Histogram<u64>>>,
}

impl Statistics {
    pub fn new() -> Statistics {
        let n = ALL_OPERATIONS.len();
        Statistics {
            operations: (0..n).map(|_| AtomicU64::new(0)).collect(),
            bytes: (0..n).map(|_| AtomicU64::new(0)).collect(),
            status_classes: Default::default(),
            status_codes: Mutex::new(HashMap::new()),
            aborts: AtomicU64::new(0),
            skips: AtomicU64::new(0),
            histograms: (0..n)
                .map(|_| {
                    Mutex::new(
                        Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3)
                            .expect("failed to allocate histogram"),
                    )
                })
                .collect(),
        }
    }

    pub fn record(&self, operation: Operation, status_code: u16, bytes: u64, latency: Duration) {
        let idx = operation.index();
        self.operations[idx].fetch_add(1, Ordering::Relaxed);
        self.bytes[idx].fetch_add(bytes, Ordering::Relaxed);
        self.status_classes[(status_code as usize / 100).min(5)].fetch_add(1, Ordering::Relaxed);
        *self
            .status_codes
            .lock()
            .expect("statistics lock poisoned")
            .entry(status_code)
            .or_insert(0) += 1;
        let mut hist = self.histograms[idx].lock().expect("statistics lock poisoned");
        let _ = hist.record(latency.as_micros() as u64);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_operations(&self) -> u64 {
        self.operations.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn operation_count(&self, operation: Operation) -> u64 {
        self.operations[operation.index()].load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    pub fn skips(&self) -> u64 {
        self.skips.load(Ordering::Relaxed)
    }

    pub fn status_code_count(&self, status_code: u16) -> u64 {
        self.status_codes
            .lock()
            .expect("statistics lock poisoned")
            .get(&status_code)
            .copied()
            .unwrap_or(0)
    }

    pub fn summary(&self, elapsed: Duration) -> Summary {
        let mut ops = Vec::new();
        for operation in ALL_OPERATIONS {
            let idx = operation.index();
            let count = self.operations[idx].load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            let hist = self.histograms[idx].lock().expect("statistics lock poisoned");
            ops.push(OpSummary {
                operation,
                count,
                bytes: self.bytes[idx].load(Ordering::Relaxed),
                mean_us: hist.mean(),
                p50_us: hist.value_at_quantile(0.50),
                p95_us: hist.value_at_quantile(0.95),
                p99_us: hist.value_at_quantile(0.99),
                max_us: hist.max(),
            });
        }
        let mut status_codes: Vec<(u16, u64)> = self
            .status_codes
            .lock()
            .expect("statistics lock poisoned")
            .iter()
            .map(|(&k, &v)| (k, v))
            .collect();
        status_codes.sort_unstable();
        Summary {
            total_operations: self.total_operations(),
            ops,
            status_codes,
            aborts: self.aborts(),
            skips: self.skips(),
            elapsed,
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OpSummary {
    pub operation: Operation,
    pub count: u64,
    pub bytes: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

pub struct Summary {
    pub total_operations: u64,
    pub ops: Vec<OpSummary>,
    pub status_codes: Vec<(u16, u64)>,
    pub aborts: u64,
    pub skips: u64,
    pub elapsed: Duration,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "total operations: {} in {:.3}s ({:.1} op/s)",
            self.total_operations,
            self.elapsed.as_secs_f64(),
            self.total_operations as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON),
        )?;
        for op in &self.ops {
            writeln!(
                f,
                "  {:<26} count={:<8} bytes={:<12} mean={:<9.0} p50={:<8} p95={:<8} p99={:<8} max={:<8}",
                op.operation, op.count, op.bytes, op.mean_us, op.p50_us, op.p95_us, op.p99_us,
                op.max_us,
            )?;
        }
        write!(f, "status codes:")?;
        for (code, count) in &self.status_codes {
            write!(f, " {}={}", code, count)?;
        }
        writeln!(f)?;
        write!(f, "aborts: {}  skips: {}", self.aborts, self.skips)
    }
}

/// Bus subscriber feeding the counters. A synthetic 599 or a failed
/// multipart INITIATE counts as an abort.
pub struct StatsSubscriber {
    stats: std::sync::Arc<Statistics>,
}

impl StatsSubscriber {
    pub fn new(stats: std::sync::Arc<Statistics>) -> StatsSubscriber {
        StatsSubscriber { stats }
    }
}

#[async_trait]
impl Subscriber for StatsSubscriber {
    fn name(&self) -> &'static str {
        "statistics"
    }

    async fn on_completed(&self, event: &Completed) -> Result<()> {
        let moved = match event.request.method {
            Method::Put | Method::Post => event.request.body.size(),
            _ => event.response.body.len() as u64,
        };
        self.stats.record(
            event.request.operation,
            event.response.status_code,
            moved,
            event.latency,
        );
        let initiate_failed = event.request.operation == Operation::MultipartWriteInitiate
            && event.response.status_code != 200;
        if event.response.status_code == STATUS_REQUEST_FAILED || initiate_failed {
            self.stats.record_abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_operation() {
        let stats = Statistics::new();
        stats.record(Operation::Write, 201, 1024, Duration::from_micros(250));
        stats.record(Operation::Write, 201, 1024, Duration::from_micros(750));
        stats.record(Operation::Read, 200, 4096, Duration::from_micros(100));
        assert_eq!(stats.total_operations(), 3);
        assert_eq!(stats.operation_count(Operation::Write), 2);
        assert_eq!(stats.status_code_count(201), 2);

        let summary = stats.summary(Duration::from_secs(1));
        assert_eq!(summary.ops.len(), 2);
        let write = &summary.ops[0];
        assert_eq!(write.operation, Operation::Write);
        assert_eq!(write.bytes, 2048);
    }

    #[test]
    fn summary_renders_counts_and_codes() {
        let stats = Statistics::new();
        stats.record(Operation::Delete, 204, 0, Duration::from_micros(90));
        stats.record_abort();
        stats.record_skip();
        let text = stats.summary(Duration::from_millis(500)).to_string();
        assert!(text.contains("total operations: 1"));
        assert!(text.contains("204=1"));
        assert!(text.contains("aborts: 1"));
        assert!(text.contains("skips: 1"));
    }

    #[tokio::test]
    async fn initiate_failure_counts_as_abort() {
        use crate::body::Body;
        use crate::request::{HttpRequest, HttpResponse, Method};
        let stats = std::sync::Arc::new(Statistics::new());
        let sub = StatsSubscriber::new(stats.clone());
        let request = HttpRequest::builder(
            Method::Post,
            "http://h/c/o?uploads",
            Operation::MultipartWriteInitiate,
        )
        .body(Body::none())
        .build();
        let response = HttpResponse {
            status_code: 503,
            headers: Vec::new(),
            body: bytes::Bytes::new(),
            context: Default::default(),
        };
        sub.on_completed(&Completed {
            request,
            response,
            latency: Duration::from_millis(2),
        })
        .await
        .unwrap();
        assert_eq!(stats.aborts(), 1);
        assert_eq!(stats.status_code_count(503), 1);
    }
}
