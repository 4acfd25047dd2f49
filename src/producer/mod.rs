//! Producer side of BlipMQ: asynchronous, disk-buffered delivery.

pub mod alarm;
pub mod client;
pub mod handler;
pub mod registry;
pub mod stats;
pub mod worker;

pub use alarm::{AlarmSink, LogAlarmSink};
pub use client::{FailureAction, FailureCategory, RemoteSendClient, SendError, TimeoutClient};
pub use handler::AsyncHandler;
pub use registry::{ClientFactory, ConfigChangeListener, ProducerRegistry};
pub use stats::{DeliveryStats, DeliveryStatsSnapshot};
pub use worker::{Delivery, DeliveryWorker, DropHook, DroppedPacket};
