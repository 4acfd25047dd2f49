//! Asynchronous send path of a producer.
//!
//! The handler owns one durable queue and the pool of delivery workers that
//! drain it. Callers only ever touch the queue: `enqueue` returns as soon as
//! the packet is on local disk, and delivery results surface through logs,
//! [`DeliveryStats`] and the optional drop hook.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProducerConfig;
use crate::core::error::ProducerError;
use crate::core::packet::{Destination, Packet};
use crate::core::queue::DurableQueue;
use crate::core::shutdown::{self, ShutdownTrigger};
use crate::producer::client::RemoteSendClient;
use crate::producer::stats::{DeliveryStats, DeliveryStatsSnapshot};
use crate::producer::worker::{spawn_named, DeliveryWorker, DropHook};

const WORKER_NAME_PREFIX: &str = "AsyncProducer_";

pub struct AsyncHandler {
    destination: Destination,
    queue: Arc<DurableQueue>,
    stats: Arc<DeliveryStats>,
    trigger: ShutdownTrigger,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for AsyncHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandler")
            .field("destination", &self.destination)
            .field("pending", &self.queue.len())
            .field("workers", &self.workers.lock().len())
            .field("shut_down", &self.trigger.is_triggered())
            .finish()
    }
}

impl AsyncHandler {
    /// Opens the destination's queue and starts `thread_pool_size` workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        destination: Destination,
        config: &ProducerConfig,
        client: Arc<dyn RemoteSendClient>,
    ) -> Result<Self, ProducerError> {
        Self::start(destination, config, client, None)
    }

    /// Same as [`new`](Self::new), invoking `hook` for each dropped packet.
    pub fn with_drop_hook(
        destination: Destination,
        config: &ProducerConfig,
        client: Arc<dyn RemoteSendClient>,
        hook: DropHook,
    ) -> Result<Self, ProducerError> {
        Self::start(destination, config, client, Some(hook))
    }

    fn start(
        destination: Destination,
        config: &ProducerConfig,
        client: Arc<dyn RemoteSendClient>,
        drop_hook: Option<DropHook>,
    ) -> Result<Self, ProducerError> {
        config.validate()?;
        Handle::try_current().map_err(|_| ProducerError::NoRuntime)?;

        let queue = Arc::new(DurableQueue::open(
            &config.queue,
            destination.name(),
            !config.continue_send,
        )?);
        let stats = Arc::new(DeliveryStats::default());
        let (trigger, shutdown) = shutdown::channel();

        let workers = (0..config.thread_pool_size)
            .map(|idx| {
                let name = format!("{WORKER_NAME_PREFIX}{idx}");
                let worker = DeliveryWorker::new(
                    name.clone(),
                    Arc::clone(&queue),
                    Arc::clone(&client),
                    config.retry_times,
                    config.backoff(),
                    shutdown.clone(),
                    Arc::clone(&stats),
                    drop_hook.clone(),
                );
                spawn_named(&name, worker.run())
            })
            .collect::<Vec<_>>();

        info!(
            target: "producer::handler",
            destination = %destination,
            workers = workers.len(),
            retry_times = config.retry_times,
            continue_send = config.continue_send,
            pending = queue.len(),
            "async handler started"
        );

        Ok(Self {
            destination,
            queue,
            stats,
            trigger,
            workers: Mutex::new(workers),
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Buffers `payload` for delivery and returns the packet id.
    pub fn enqueue(&self, payload: impl Into<Bytes>) -> Result<Uuid, ProducerError> {
        let packet = Packet::new(self.destination.clone(), payload);
        let id = packet.id();
        self.enqueue_packet(packet)?;
        Ok(id)
    }

    pub fn enqueue_with_properties(
        &self,
        payload: impl Into<Bytes>,
        properties: BTreeMap<String, String>,
    ) -> Result<Uuid, ProducerError> {
        let packet = Packet::with_properties(self.destination.clone(), payload, properties);
        let id = packet.id();
        self.enqueue_packet(packet)?;
        Ok(id)
    }

    /// Buffers a prebuilt packet. Never performs network I/O.
    pub fn enqueue_packet(&self, packet: Packet) -> Result<(), ProducerError> {
        if packet.destination() != &self.destination {
            return Err(ProducerError::DestinationMismatch {
                producer: self.destination.to_string(),
                packet: packet.destination().to_string(),
            });
        }
        self.queue.enqueue(&packet)?;
        self.stats.record_enqueued();
        debug!(target: "producer::handler", packet = %packet.id(), "packet buffered");
        Ok(())
    }

    /// Packets buffered on disk and not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Stops accepting packets. Workers keep draining what is buffered.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Closes the queue and waits until workers have drained it.
    pub async fn close_and_drain(&self) {
        self.close();
        self.join_workers().await;
        info!(target: "producer::handler", destination = %self.destination, "async handler drained");
    }

    /// Closes the queue, interrupts backoff waits and stops workers after
    /// their current packet. Undelivered packets stay on disk.
    pub async fn shutdown(&self) {
        self.close();
        self.trigger.trigger();
        self.join_workers().await;
        if let Err(e) = self.queue.flush() {
            warn!(target: "producer::handler", error = %e, "failed to flush queue on shutdown");
        }
        info!(
            target: "producer::handler",
            destination = %self.destination,
            pending = self.queue.len(),
            "async handler stopped"
        );
    }

    async fn join_workers(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(target: "producer::handler", error = %e, "delivery worker ended abnormally");
            }
        }
    }
}

impl Drop for AsyncHandler {
    fn drop(&mut self) {
        self.trigger.trigger();
        self.queue.close();
    }
}
