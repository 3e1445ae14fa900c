// src/events.rs
//
// In-process event dispatch. Subscribers are wired explicitly when the
// driver is assembled and receive every completed (request, response) pair
// in publication order. A subscriber error aborts the test.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::objects::ObjectManager;
use crate::request::{keys, HttpRequest, HttpResponse, Operation};

/// A completed request/response exchange, as published on the bus.
pub struct Completed {
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub latency: Duration,
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &'static str;
    async fn on_completed(&self, event: &Completed) -> Result<()>;
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus {
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Delivers to every subscriber in registration order. The first failure
    /// propagates and aborts the test with a diagnostic.
    pub async fn publish(&self, event: &Completed) -> Result<()> {
        for subscriber in &self.subscribers {
            subscriber
                .on_completed(event)
                .await
                .with_context(|| format!("subscriber [{}] failed", subscriber.name()))?;
        }
        Ok(())
    }
}

/// Couples responses back into the object population: successful writes are
/// inserted, read borrows are returned, delete borrows commit on success.
pub struct PopulationSubscriber {
    manager: Arc<ObjectManager>,
    shards: u8,
}

impl PopulationSubscriber {
    pub fn new(manager: Arc<ObjectManager>, shards: u8) -> PopulationSubscriber {
        PopulationSubscriber { manager, shards }
    }
}

#[async_trait]
impl Subscriber for PopulationSubscriber {
    fn name(&self) -> &'static str {
        "object-manager"
    }

    async fn on_completed(&self, event: &Completed) -> Result<()> {
        let ctx = &event.request.context;
        let Some(name) = ctx.get(keys::OBJECT_NAME) else {
            return Ok(());
        };
        match event.request.operation {
            Operation::Write | Operation::MultipartWriteComplete => {
                if event.response.is_success() {
                    let size = ctx
                        .get(keys::OBJECT_SIZE)
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(0);
                    self.manager.add(name, self.shards, size)?;
                } else {
                    debug!(
                        "write of [{}] failed with {}, not recording",
                        name, event.response.status_code
                    );
                }
            }
            Operation::Read | Operation::Head | Operation::MetadataRead | Operation::Overwrite => {
                self.manager.release_read(name)?;
            }
            Operation::Delete => {
                self.manager
                    .release_delete(name, event.response.is_success())?;
            }
            _ => {}
        }
        Ok(())
    }
}
