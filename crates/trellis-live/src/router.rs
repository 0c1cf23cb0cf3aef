//! Notification router.
//!
//! Owns the LISTEN connection. Each received payload is parsed into a
//! change event (oversized ones are dequeued from the overflow queue
//! first), batched with whatever else is already waiting, grouped by
//! origin schema, and handed to the consumers subscribed to that channel
//! on detached tasks. A slow consumer therefore never blocks receipt.
//!
//! The connection is assumed to die: on any listener error the router
//! reconnects with exponential backoff and re-issues every LISTEN.
//! Notifications emitted while disconnected are lost, which is within the
//! delivery contract — consumers already tolerate gaps.

use crate::event::ChangeEvent;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use trellis_commons::{BackoffPolicy, Result, SchemaName};
use trellis_store::{queue, Database};

/// Notifications drained into one batch after the first receipt.
const BATCH_LIMIT: usize = 256;

/// A subscriber to row-change batches. Batches arrive per origin schema,
/// possibly out of order across schemas, and may contain duplicates.
#[async_trait]
pub trait ChangeConsumer: Send + Sync {
    async fn consume(&self, schema: SchemaName, events: Vec<ChangeEvent>);
}

pub struct NotificationRouter {
    db: Database,
    backoff: BackoffPolicy,
    subscriptions: Vec<(String, Arc<dyn ChangeConsumer>)>,
}

impl NotificationRouter {
    pub fn new(db: Database) -> Self {
        NotificationRouter {
            db,
            backoff: BackoffPolicy::listener(),
            subscriptions: Vec::new(),
        }
    }

    /// Register a consumer for one channel. The same consumer may be
    /// subscribed to any number of channels.
    pub fn subscribe(&mut self, channel: impl Into<String>, consumer: Arc<dyn ChangeConsumer>) {
        self.subscriptions.push((channel.into(), consumer));
    }

    fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = Vec::new();
        for (channel, _) in &self.subscriptions {
            if !channels.contains(channel) {
                channels.push(channel.clone());
            }
        }
        channels
    }

    /// Run the listen loop on a background task until the process exits.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let channels = self.channels();
        if channels.is_empty() {
            log::warn!("notification router started with no subscriptions");
            return;
        }
        let mut attempt = 0u32;
        loop {
            match self.listen_session(&channels).await {
                Ok(()) => {
                    // Session only returns on connection loss
                    attempt = 0;
                }
                Err(err) => {
                    log::warn!("notification listener failed: {}", err);
                }
            }
            attempt += 1;
            if let Some(delay) = self.backoff.delay_for(attempt) {
                log::info!("reconnecting listener in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// One listener connection's lifetime. Returns `Ok` on clean
    /// connection loss, `Err` on setup or receive failure.
    async fn listen_session(&self, channels: &[String]) -> Result<()> {
        let mut listener = self.db.listener().await?;
        let refs: Vec<&str> = channels.iter().map(String::as_str).collect();
        listener.listen_all(refs).await?;
        log::info!("listening on {} channel(s)", channels.len());
        loop {
            let first = listener.recv().await?;
            let mut batch = vec![(first.channel().to_string(), first.payload().to_string())];
            while batch.len() < BATCH_LIMIT {
                match listener.try_recv().await? {
                    Some(notification) => batch.push((
                        notification.channel().to_string(),
                        notification.payload().to_string(),
                    )),
                    None => break,
                }
            }
            self.dispatch(batch).await;
        }
    }

    async fn dispatch(&self, batch: Vec<(String, String)>) {
        // channel -> schema -> events
        let mut grouped: HashMap<String, HashMap<SchemaName, Vec<ChangeEvent>>> = HashMap::new();
        for (channel, payload) in batch {
            let event = match self.decode(&payload).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("dropping malformed notification on {}: {}", channel, err);
                    continue;
                }
            };
            grouped
                .entry(channel)
                .or_default()
                .entry(event.schema.clone())
                .or_default()
                .push(event);
        }
        for (channel, per_schema) in grouped {
            for (schema, events) in per_schema {
                for (subscribed, consumer) in &self.subscriptions {
                    if *subscribed == channel {
                        let consumer = Arc::clone(consumer);
                        let schema = schema.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            consumer.consume(schema, events).await;
                        });
                    }
                }
            }
        }
    }

    /// Parse a raw payload, following the overflow-queue indirection when
    /// the trigger parked an oversized event. `None` means the queued row
    /// was already pruned.
    async fn decode(&self, payload: &str) -> Result<Option<ChangeEvent>> {
        let value: Value = serde_json::from_str(payload)?;
        let value = match value.get("queued").and_then(Value::as_i64) {
            Some(queue_id) => match queue::fetch(self.db.pool(), queue_id).await? {
                Some(message) => message,
                None => {
                    log::warn!("queued notification {} already pruned", queue_id);
                    return Ok(None);
                }
            },
            None => value,
        };
        ChangeEvent::parse(&value).map(Some)
    }
}
