//! Delivery workers draining a durable queue into the remote service.
//!
//! Every worker loops on: dequeue one packet, try to send it up to
//! `retry_times` times with backoff between failures, then move on. A packet
//! that exhausts its attempts is dropped and logged. A packet whose retries
//! are cut short by shutdown is requeued for the next run instead. Delivery
//! is at-least-once effort, not guaranteed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::core::error::QueueError;
use crate::core::packet::Packet;
use crate::core::queue::DurableQueue;
use crate::core::shutdown::Shutdown;
use crate::producer::client::{FailureAction, FailureCategory, RemoteSendClient, SendError};
use crate::producer::stats::DeliveryStats;
use crate::util::backoff::Backoff;

/// A packet given up on after its last attempt failed.
#[derive(Debug, Clone)]
pub struct DroppedPacket {
    pub packet: Packet,
    pub attempts: u32,
    pub category: FailureCategory,
    pub reason: String,
}

/// Called for every dropped packet.
pub type DropHook = Arc<dyn Fn(&DroppedPacket) + Send + Sync>;

/// Outcome of one packet's attempt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    Dropped { attempts: u32 },
    /// Shutdown arrived between attempts; the packet went back on disk.
    Requeued { attempts: u32 },
}

pub struct DeliveryWorker {
    name: String,
    queue: Arc<DurableQueue>,
    client: Arc<dyn RemoteSendClient>,
    retry_times: u32,
    backoff: Backoff,
    shutdown: Shutdown,
    stats: Arc<DeliveryStats>,
    drop_hook: Option<DropHook>,
}

impl fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("name", &self.name)
            .field("queue", &self.queue.name())
            .field("retry_times", &self.retry_times)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        queue: Arc<DurableQueue>,
        client: Arc<dyn RemoteSendClient>,
        retry_times: u32,
        backoff: Backoff,
        shutdown: Shutdown,
        stats: Arc<DeliveryStats>,
        drop_hook: Option<DropHook>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            client,
            retry_times,
            backoff,
            shutdown,
            stats,
            drop_hook,
        }
    }

    /// Runs until the queue is closed and drained, or shutdown is signalled
    /// between packets.
    pub async fn run(mut self) {
        debug!(target: "producer::worker", "delivery worker started");
        loop {
            if self.shutdown.is_shutdown() {
                info!(target: "producer::worker", "shutdown observed, worker exiting");
                break;
            }

            let next = tokio::select! {
                biased;
                _ = self.shutdown.recv() => continue,
                next = self.queue.dequeue() => next,
            };

            match next {
                Ok(packet) => {
                    self.deliver(packet).await;
                }
                Err(QueueError::Closed) => {
                    info!(target: "producer::worker", "queue closed and drained, worker exiting");
                    break;
                }
                Err(e) => {
                    // Local disk trouble; pause like a failed send and try again.
                    error!(target: "producer::worker", error = %e, "failed to read from durable queue");
                    self.backoff.on_failure(true, &mut self.shutdown).await;
                }
            }
        }
    }

    /// Sends one packet with bounded retries.
    pub async fn deliver(&mut self, packet: Packet) -> Delivery {
        let id: Uuid = packet.id();
        let mut left_retry_times = self.retry_times;
        let mut attempts = 0u32;

        while left_retry_times > 0 {
            attempts += 1;
            match self.client.send(&packet).await {
                Ok(()) => {
                    self.backoff.on_success();
                    self.stats.record_delivered();
                    trace!(target: "producer::worker", packet = %id, attempts, "packet delivered");
                    return Delivery::Delivered { attempts };
                }
                Err(err) => {
                    left_retry_times -= 1;
                    self.stats.record_failed_attempt();

                    if left_retry_times == 0 {
                        error!(
                            target: "producer::worker",
                            packet = %id,
                            destination = %packet.destination(),
                            attempts,
                            reason = err.category().as_str(),
                            error = %err,
                            "[AsyncHandler]: message send failed, dropping"
                        );
                        self.stats.record_dropped();
                        if let Some(hook) = &self.drop_hook {
                            hook(&DroppedPacket {
                                packet: packet.clone(),
                                attempts,
                                category: err.category(),
                                reason: err.to_string(),
                            });
                        }
                    } else {
                        debug!(
                            target: "producer::worker",
                            packet = %id,
                            attempts,
                            left_retry_times,
                            error = %err,
                            "send failed, will retry"
                        );
                    }

                    match err.action() {
                        FailureAction::RetryWithBackoff => {
                            self.backoff.on_failure(true, &mut self.shutdown).await;
                        }
                    }
                    if left_retry_times > 0 && self.shutdown.is_shutdown() {
                        return self.requeue(packet, attempts, err);
                    }
                }
            }
        }

        if attempts == 0 {
            warn!(target: "producer::worker", packet = %id, "retry budget is zero, packet dropped unsent");
            self.stats.record_dropped();
        }
        Delivery::Dropped { attempts }
    }

    fn requeue(&self, packet: Packet, attempts: u32, last: SendError) -> Delivery {
        match self.queue.requeue(&packet) {
            Ok(()) => {
                self.stats.record_requeued();
                info!(
                    target: "producer::worker",
                    packet = %packet.id(),
                    attempts,
                    "shutdown during retries, packet kept for next run"
                );
                Delivery::Requeued { attempts }
            }
            Err(e) => {
                error!(
                    target: "producer::worker",
                    packet = %packet.id(),
                    destination = %packet.destination(),
                    attempts,
                    reason = last.category().as_str(),
                    error = %e,
                    "[AsyncHandler]: message send failed, dropping"
                );
                self.stats.record_dropped();
                if let Some(hook) = &self.drop_hook {
                    hook(&DroppedPacket {
                        packet,
                        attempts,
                        category: last.category(),
                        reason: format!("{last}; requeue failed: {e}"),
                    });
                }
                Delivery::Dropped { attempts }
            }
        }
    }
}

/// Spawns a named worker task, the name carried as a tracing span.
pub fn spawn_named<F>(name: &str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let span = info_span!("worker", name = %name);
    tokio::spawn(fut.instrument(span))
}
