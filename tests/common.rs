#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blipmq_producer::config::{ProducerConfig, QueueConfig};
use blipmq_producer::{Packet, RemoteSendClient, SendError};
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

type Policy = Box<dyn Fn(&Packet, u32) -> Result<(), SendError> + Send + Sync>;

/// Remote client double that records every attempt and succeeds or fails
/// according to a per-packet policy (`attempt` starts at 1).
pub struct RecordingClient {
    policy: Policy,
    attempts: Mutex<Vec<(Uuid, Instant)>>,
    per_packet: Mutex<HashMap<Uuid, u32>>,
    delivered: Mutex<Vec<Packet>>,
}

impl RecordingClient {
    pub fn with_policy<F>(policy: F) -> Arc<Self>
    where
        F: Fn(&Packet, u32) -> Result<(), SendError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            policy: Box::new(policy),
            attempts: Mutex::new(Vec::new()),
            per_packet: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn always_ok() -> Arc<Self> {
        Self::with_policy(|_, _| Ok(()))
    }

    pub fn always_fail() -> Arc<Self> {
        Self::with_policy(|_, _| Err(SendError::Network("connection refused".into())))
    }

    /// Fails the first `n` attempts of every packet.
    pub fn fail_first(n: u32) -> Arc<Self> {
        Self::with_policy(move |_, attempt| {
            if attempt <= n {
                Err(SendError::Storage("broker storage unavailable".into()))
            } else {
                Ok(())
            }
        })
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().iter().map(|(_, t)| *t).collect()
    }

    pub fn delivered(&self) -> Vec<Packet> {
        self.delivered.lock().clone()
    }

    pub fn delivered_bodies(&self) -> Vec<String> {
        self.delivered.lock().iter().map(body).collect()
    }
}

#[async_trait]
impl RemoteSendClient for RecordingClient {
    async fn send(&self, packet: &Packet) -> Result<(), SendError> {
        let attempt = {
            let mut per_packet = self.per_packet.lock();
            let n = per_packet.entry(packet.id()).or_insert(0);
            *n += 1;
            *n
        };
        self.attempts.lock().push((packet.id(), Instant::now()));
        let result = (self.policy)(packet, attempt);
        if result.is_ok() {
            self.delivered.lock().push(packet.clone());
        }
        result
    }
}

pub fn body(packet: &Packet) -> String {
    String::from_utf8(packet.payload().to_vec()).expect("utf8 payload")
}

pub fn producer_config(dir: &Path, workers: usize, retry_times: u32) -> ProducerConfig {
    ProducerConfig {
        queue: QueueConfig {
            directory: dir.to_path_buf(),
            segment_size_bytes: 1 << 20,
            fsync_every_n: None,
        },
        continue_send: true,
        thread_pool_size: workers,
        retry_times,
        remote_timeout_ms: 2,
        ..ProducerConfig::default()
    }
}

/// Polls `cond` until it holds or `limit` elapses.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// In-memory log sink for asserting on emitted records.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Routes this thread's tracing output into a buffer while the guard lives.
/// Pair with a current-thread runtime so spawned workers log here too.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}
