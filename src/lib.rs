//! BlipMQ producer – durable asynchronous delivery to a BlipMQ broker.
//!
//! This crate exports
//!  * `core`     – packets, the disk-backed queue, shutdown signalling
//!  * `producer` – delivery workers, the async handler, the topic registry
//!  * `config`   – TOML-driven producer configuration
//!  * `util`     – failure backoff
//!
//! Callers hand packets to an [`AsyncHandler`]; they land on local disk and
//! a pool of workers sends them to the broker with bounded retries. Delivery
//! is at-least-once effort: a packet that exhausts its retries is logged and
//! dropped.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod producer;
pub mod util;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config, ProducerConfig};
pub use crate::core::error::{PacketError, ProducerError, QueueError};
pub use crate::core::packet::{Destination, Packet};
pub use producer::{AsyncHandler, ProducerRegistry, RemoteSendClient, SendError};
