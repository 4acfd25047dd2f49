//! Topic-keyed registry of async producers.
//!
//! Producers are created from a `;`-separated topic list at startup and on
//! every change of the `topic` configuration key. The registry only grows.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ProducerConfig;
use crate::core::error::ProducerError;
use crate::core::packet::Destination;
use crate::producer::alarm::AlarmSink;
use crate::producer::client::RemoteSendClient;
use crate::producer::handler::AsyncHandler;

/// Dynamic-config key carrying the `;`-separated topic list.
pub const TOPIC_KEY: &str = "topic";

/// Builds the remote client used by a topic's producer.
pub trait ClientFactory: Send + Sync {
    fn create(&self, destination: &Destination) -> Result<Arc<dyn RemoteSendClient>, ProducerError>;
}

impl<F> ClientFactory for F
where
    F: Fn(&Destination) -> Result<Arc<dyn RemoteSendClient>, ProducerError> + Send + Sync,
{
    fn create(&self, destination: &Destination) -> Result<Arc<dyn RemoteSendClient>, ProducerError> {
        self(destination)
    }
}

/// Receives updates from a dynamic configuration source.
pub trait ConfigChangeListener {
    fn on_config_change(&self, key: &str, value: &str);
}

/// Splits a `;`-separated topic list, skipping empty entries.
pub fn parse_topics(raw: &str) -> Vec<&str> {
    raw.split(';').map(str::trim).filter(|t| !t.is_empty()).collect()
}

/// One async producer per topic.
///
/// Topics are only ever added: a topic removed from configuration keeps its
/// producer until the registry shuts down.
pub struct ProducerRegistry {
    config: ProducerConfig,
    factory: Arc<dyn ClientFactory>,
    alarm: Arc<dyn AlarmSink>,
    producers: DashMap<String, Arc<AsyncHandler>>,
    /// Serialises producer creation so a topic's queue is opened once.
    creating: Mutex<()>,
}

impl ProducerRegistry {
    pub fn new(config: ProducerConfig, factory: Arc<dyn ClientFactory>, alarm: Arc<dyn AlarmSink>) -> Self {
        Self {
            config,
            factory,
            alarm,
            producers: DashMap::new(),
            creating: Mutex::new(()),
        }
    }

    /// Starts producers for every topic in `topics`, stopping at the first failure.
    pub fn init(&self, topics: &str) -> Result<usize, ProducerError> {
        let topics = parse_topics(topics);
        info!(target: "producer::registry", ?topics, "initialising producers");
        let mut created = 0;
        for topic in topics {
            if self.ensure_producer(topic)? {
                created += 1;
            }
        }
        info!(target: "producer::registry", producers = ?self.topics(), "producer map");
        Ok(created)
    }

    pub fn get(&self, topic: &str) -> Option<Arc<AsyncHandler>> {
        self.producers.get(topic).map(|entry| Arc::clone(&*entry))
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.producers.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Buffers `payload` on the producer registered for `topic`.
    pub fn enqueue(&self, topic: &str, payload: impl Into<Bytes>) -> Result<Uuid, ProducerError> {
        let producer = self
            .get(topic)
            .ok_or_else(|| ProducerError::UnknownTopic(topic.to_string()))?;
        producer.enqueue(payload)
    }

    /// Closes every producer and waits for its workers to stop.
    pub async fn shutdown(&self) {
        let producers: Vec<Arc<AsyncHandler>> =
            self.producers.iter().map(|e| Arc::clone(e.value())).collect();
        join_all(producers.iter().map(|p| p.shutdown())).await;
    }

    /// Returns `true` when a new producer was created.
    ///
    /// The producer is built without holding a map shard, so lookups for
    /// other topics are not held up by its disk and spawn work.
    fn ensure_producer(&self, topic: &str) -> Result<bool, ProducerError> {
        if self.producers.contains_key(topic) {
            debug!(target: "producer::registry", topic, "producer already registered");
            return Ok(false);
        }

        let _creating = self.creating.lock();
        if self.producers.contains_key(topic) {
            return Ok(false);
        }
        let destination = Destination::topic(topic)?;
        let client = self.factory.create(&destination)?;
        let handler = AsyncHandler::new(destination, &self.config, client)?;
        self.producers.insert(topic.to_string(), Arc::new(handler));
        Ok(true)
    }
}

impl ConfigChangeListener for ProducerRegistry {
    fn on_config_change(&self, key: &str, value: &str) {
        if key != TOPIC_KEY {
            return;
        }
        let topics = parse_topics(value);
        info!(target: "producer::registry", ?topics, "topic list changed");
        for topic in topics {
            if let Err(e) = self.ensure_producer(topic) {
                self.alarm.alarm("Error initialize producer", &e, true);
            }
        }
        info!(target: "producer::registry", producers = ?self.topics(), "producer map");
    }
}
