//! blipmq-producer – drive the asynchronous producer against a simulated
//! broker and print delivery stats.
//
//  $ blipmq-producer --config blipmq-producer.toml --publishers 4 --messages 1000
//  $ blipmq-producer --topics "orders;payments" --fail-every 3
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blipmq_producer::config::{load_config, Config};
use blipmq_producer::logging::init_logging;
use blipmq_producer::producer::registry::parse_topics;
use blipmq_producer::producer::{
    LogAlarmSink, ProducerRegistry, RemoteSendClient, SendError, TimeoutClient,
};
use blipmq_producer::{Destination, Packet, ProducerError};
use clap::Parser;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(name = "blipmq-producer", version, about = "BlipMQ async producer demo")]
struct Cli {
    /// Path to config TOML (env BLIPMQ_PRODUCER_CONFIG overrides)
    #[arg(short, long)]
    config: Option<String>,

    /// `;`-separated topics, overriding `registry.topics`
    #[arg(short, long)]
    topics: Option<String>,

    /// Concurrent publishing tasks per topic
    #[arg(short, long, default_value_t = 4)]
    publishers: usize,

    /// Messages sent by each publishing task
    #[arg(short, long, default_value_t = 100)]
    messages: usize,

    /// Simulated broker fails every Nth send (0 = never)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,

    /// Simulated broker latency per send, in milliseconds
    #[arg(long, default_value_t = 1)]
    latency_ms: u64,
}

/// Stand-in for the broker RPC: sleeps, then succeeds or fails on schedule.
struct SimulatedBroker {
    calls: AtomicU64,
    fail_every: u64,
    latency: Duration,
}

#[async_trait]
impl RemoteSendClient for SimulatedBroker {
    async fn send(&self, packet: &Packet) -> Result<(), SendError> {
        tokio::time::sleep(self.latency).await;
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(SendError::Network(format!("simulated failure on call {call}")));
        }
        debug!(target: "demo", packet = %packet.id(), destination = %packet.destination(), "delivered");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let cfg: Config = match std::env::var("BLIPMQ_PRODUCER_CONFIG").ok().or(cli.config.clone()) {
        Some(path) => load_config(&path)?,
        None => Config::default(),
    };
    let topics = cli.topics.clone().unwrap_or_else(|| cfg.registry.topics.clone());
    if parse_topics(&topics).is_empty() {
        anyhow::bail!("no topics configured; pass --topics or set registry.topics");
    }

    let fail_every = cli.fail_every;
    let latency = Duration::from_millis(cli.latency_ms);
    let timeout = cfg.producer.remote_timeout();
    let factory = move |_: &Destination| -> Result<Arc<dyn RemoteSendClient>, ProducerError> {
        let broker = SimulatedBroker {
            calls: AtomicU64::new(0),
            fail_every,
            latency,
        };
        Ok(Arc::new(TimeoutClient::new(broker, timeout)))
    };

    let registry = Arc::new(ProducerRegistry::new(
        cfg.producer.clone(),
        Arc::new(factory),
        Arc::new(LogAlarmSink),
    ));
    registry.init(&topics)?;

    let mut tasks = Vec::new();
    for topic in registry.topics() {
        for publisher in 0..cli.publishers {
            let registry = Arc::clone(&registry);
            let topic = topic.clone();
            let messages = cli.messages;
            tasks.push(tokio::spawn(async move {
                for seq in 0..messages {
                    let body = format!("{topic}/{publisher}/{seq}");
                    if let Err(e) = registry.enqueue(&topic, body) {
                        warn!(target: "demo", %topic, error = %e, "enqueue failed");
                        break;
                    }
                }
            }));
        }
    }
    for task in tasks {
        task.await?;
    }

    for topic in registry.topics() {
        if let Some(producer) = registry.get(&topic) {
            producer.close_and_drain().await;
            let stats = producer.stats();
            info!(target: "demo", %topic, ?stats, "topic drained");
            println!(
                "{topic}: enqueued={} delivered={} failed_attempts={} dropped={} requeued={}",
                stats.enqueued, stats.delivered, stats.failed_attempts, stats.dropped, stats.requeued
            );
        }
    }
    registry.shutdown().await;
    Ok(())
}
