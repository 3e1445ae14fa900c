// src/driver.rs
//
// The load test runtime. One dispatch loop pulls requests from the weighted
// mix and spawns them onto a bounded pool; a consumer task publishes every
// completed exchange on the bus and evaluates stopping conditions. All
// suspension points observe the shutdown token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use rand::distr::weighted::WeightedIndex;
use rand_distr::Distribution;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::Client;
use crate::conditions::StoppingCondition;
use crate::events::{Completed, EventBus};
use crate::multipart;
use crate::objects::EmptyPopulation;
use crate::request::{HttpRequest, HttpResponse, Method, Operation};
use crate::request_supplier::RequestSupplier;
use crate::scheduler::InterArrivalScheduler;
use crate::stats::{Statistics, STATUS_REQUEST_FAILED};

/// Cooperative cancellation, observed at every await point that can block.
#[derive(Clone)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        let (tx, _rx) = watch::channel(false);
        ShutdownToken { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for returns immediately when already stopped
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A source of requests the driver can pull from. Returns `Ok(None)` once
/// the test is stopping.
#[async_trait]
pub trait RequestSource: Send + Sync {
    fn operation(&self) -> Operation;
    async fn get(&self) -> Result<Option<HttpRequest>>;
}

/// Adapts a single-step supplier to the source seam.
pub struct SupplierSource {
    inner: std::sync::Mutex<RequestSupplier>,
    shutdown: ShutdownToken,
}

impl SupplierSource {
    pub fn new(supplier: RequestSupplier, shutdown: ShutdownToken) -> SupplierSource {
        SupplierSource {
            inner: std::sync::Mutex::new(supplier),
            shutdown,
        }
    }
}

#[async_trait]
impl RequestSource for SupplierSource {
    fn operation(&self) -> Operation {
        self.inner.lock().expect("supplier lock poisoned").operation()
    }

    async fn get(&self) -> Result<Option<HttpRequest>> {
        if self.shutdown.is_stopped() {
            return Ok(None);
        }
        self.inner
            .lock()
            .expect("supplier lock poisoned")
            .get()
            .map(Some)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drain in-flight requests before returning.
    Graceful,
    /// Cancel in-flight requests.
    Immediate,
}

pub struct TestOutcome {
    pub aborted: bool,
    pub elapsed: Duration,
}

pub struct LoadTest {
    sources: Vec<(Arc<dyn RequestSource>, u32)>,
    client: Arc<dyn Client>,
    bus: Arc<EventBus>,
    stats: Arc<Statistics>,
    conditions: Vec<StoppingCondition>,
    shutdown: ShutdownToken,
    concurrency: usize,
    scheduler: Option<Arc<InterArrivalScheduler>>,
    shutdown_mode: ShutdownMode,
    progress: bool,
}

#[allow(clippy::too_many_arguments)]
impl LoadTest {
    pub fn new(
        sources: Vec<(Arc<dyn RequestSource>, u32)>,
        client: Arc<dyn Client>,
        bus: EventBus,
        stats: Arc<Statistics>,
        conditions: Vec<StoppingCondition>,
        shutdown: ShutdownToken,
        concurrency: usize,
        scheduler: Option<Arc<InterArrivalScheduler>>,
        shutdown_mode: ShutdownMode,
    ) -> Result<LoadTest> {
        anyhow::ensure!(!sources.is_empty(), "no operations configured");
        anyhow::ensure!(concurrency > 0, "concurrency must be > 0");
        anyhow::ensure!(
            sources.iter().map(|(_, w)| *w as u64).sum::<u64>() > 0,
            "operation weights sum to zero"
        );
        Ok(LoadTest {
            sources,
            client,
            bus: Arc::new(bus),
            stats,
            conditions,
            shutdown,
            concurrency,
            scheduler,
            shutdown_mode,
            progress: false,
        })
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<TestOutcome> {
        let started = Instant::now();
        info!(
            "starting load test: {} operation(s), concurrency {}",
            self.sources.len(),
            self.concurrency
        );

        self.arm_runtime_conditions();
        let progress = self.spawn_progress();

        let weights: Vec<u32> = self.sources.iter().map(|(_, w)| *w).collect();
        let chooser = WeightedIndex::new(weights).context("invalid operation weights")?;

        let (tx, rx) = mpsc::unbounded_channel::<Completed>();
        let consumer = self.spawn_consumer(rx, started);

        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight: FuturesUnordered<JoinHandle<()>> = FuturesUnordered::new();

        while !self.shutdown.is_stopped() {
            if let Some(scheduler) = &self.scheduler {
                tokio::select! {
                    _ = scheduler.wait_for_next() => {}
                    _ = self.shutdown.cancelled() => break,
                }
            }
            let permit = tokio::select! {
                permit = sem.clone().acquire_owned() => {
                    permit.expect("admission semaphore closed")
                }
                _ = self.shutdown.cancelled() => break,
            };

            let idx = chooser.sample(&mut rand::rng());
            let (source, _) = &self.sources[idx];
            let pulled = tokio::select! {
                request = source.get() => request,
                _ = self.shutdown.cancelled() => break,
            };
            let request = match pulled {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(err) if err.downcast_ref::<EmptyPopulation>().is_some() => {
                    self.stats.record_skip();
                    continue;
                }
                Err(err) => {
                    // supplier-internal failure: surface on the bus as a
                    // failed exchange instead of crossing the interface
                    warn!("supplier failed: {:#}", err);
                    let _ = tx.send(failed_exchange(source.operation(), &err));
                    continue;
                }
            };

            let client = self.client.clone();
            let results = tx.clone();
            in_flight.push(tokio::spawn(async move {
                let t0 = Instant::now();
                let response = match client.execute(&request).await {
                    Ok(response) => response,
                    Err(err) => {
                        warn!("request failed: {:#}", err);
                        transport_failure(&request)
                    }
                };
                drop(permit);
                let _ = results.send(Completed {
                    request,
                    response,
                    latency: t0.elapsed(),
                });
            }));
            // reap finished tasks so the set stays bounded
            while let Some(joined) = in_flight.next().now_or_never().flatten() {
                if let Err(err) = joined {
                    error!("request task panicked: {}", err);
                }
            }
        }

        let mut aborted = false;
        match self.shutdown_mode {
            ShutdownMode::Graceful => {
                while let Some(joined) = in_flight.next().await {
                    if let Err(err) = joined {
                        error!("request task panicked: {}", err);
                        aborted = true;
                    }
                }
            }
            ShutdownMode::Immediate => {
                for handle in in_flight.iter() {
                    handle.abort();
                }
                while in_flight.next().await.is_some() {}
            }
        }
        self.client.shutdown(self.shutdown_mode == ShutdownMode::Graceful).await?;

        drop(tx);
        if consumer.await.context("consumer task failed")?.is_err() {
            aborted = true;
        }
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        let elapsed = started.elapsed();
        info!(
            "load test finished in {:.3}s ({})",
            elapsed.as_secs_f64(),
            if aborted { "aborted" } else { "complete" }
        );
        Ok(TestOutcome { aborted, elapsed })
    }

    /// The runtime condition stops an idle test too, so it gets its own
    /// timer rather than waiting for a completion to evaluate it.
    fn arm_runtime_conditions(&self) {
        if let Some(limit) = self
            .conditions
            .iter()
            .filter_map(|c| c.runtime())
            .min()
        {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        info!("runtime limit {:?} reached, stopping", limit);
                        shutdown.stop();
                    }
                    _ = shutdown.cancelled() => {}
                }
            });
        }
    }

    fn spawn_progress(&self) -> Option<ProgressBar> {
        if !self.progress {
            return None;
        }
        let limit = self.conditions.iter().filter_map(|c| c.runtime()).min()?;
        let bar = ProgressBar::new(limit.as_secs().max(1));
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len}s {msg}",
        ) {
            bar.set_style(style);
        }
        let updater = bar.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                if shutdown.is_stopped() || started.elapsed() >= limit {
                    break;
                }
                updater.set_position(started.elapsed().as_secs());
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        Some(bar)
    }

    fn spawn_consumer(
        &self,
        mut rx: mpsc::UnboundedReceiver<Completed>,
        started: Instant,
    ) -> tokio::task::JoinHandle<Result<()>> {
        let bus = self.bus.clone();
        let stats = self.stats.clone();
        let conditions = self.conditions.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            while let Some(mut event) = rx.recv().await {
                multipart::consume_response_body(&event.request, &mut event.response);
                if let Err(err) = bus.publish(&event).await {
                    error!("aborting test: {:#}", err);
                    shutdown.stop();
                    return Err(err);
                }
                for condition in &conditions {
                    if !shutdown.is_stopped() && condition.triggered(&stats, started) {
                        info!("stopping condition met: {}", condition);
                        shutdown.stop();
                    }
                }
            }
            Ok(())
        })
    }
}

/// A synthetic failed exchange for an error that produced no request.
fn failed_exchange(operation: Operation, err: &anyhow::Error) -> Completed {
    let request = HttpRequest::builder(Method::Get, "http://unavailable/", operation)
        .context("x-og-supplier-error", format!("{:#}", err))
        .build();
    let response = transport_failure(&request);
    Completed {
        request,
        response,
        latency: Duration::ZERO,
    }
}

fn transport_failure(request: &HttpRequest) -> HttpResponse {
    HttpResponse {
        status_code: STATUS_REQUEST_FAILED,
        headers: Vec::new(),
        body: bytes::Bytes::new(),
        context: request.context.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        assert!(!token.is_stopped());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                true
            })
        };
        token.stop();
        assert!(waiter.await.unwrap());
        assert!(token.is_stopped());
        // already-stopped token resolves immediately
        token.cancelled().await;
    }
}
