mod common;

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use blipmq_producer::core::queue::DurableQueue;
use blipmq_producer::{AsyncHandler, Destination, Packet};
use common::{producer_config, wait_until, RecordingClient};
use tempfile::TempDir;

const TOPIC: &str = "restart";

/// Leaves `count` packets on disk as if the process died before the
/// workers got to them.
fn previous_run(dir: &Path, count: usize) -> Vec<String> {
    let cfg = producer_config(dir, 1, 3);
    let queue = DurableQueue::open(&cfg.queue, TOPIC, false).unwrap();
    let destination = Destination::topic(TOPIC).unwrap();
    let bodies: Vec<String> = (0..count).map(|i| format!("before-crash-{i}")).collect();
    for body in &bodies {
        queue.enqueue(&Packet::new(destination.clone(), body.clone())).unwrap();
    }
    bodies
}

#[tokio::test]
async fn continue_send_replays_every_buffered_packet_once() {
    let dir = TempDir::new().unwrap();
    let expected = previous_run(dir.path(), 20);

    let client = RecordingClient::always_ok();
    let mut cfg = producer_config(dir.path(), 3, 3);
    cfg.continue_send = true;
    let handler = AsyncHandler::new(Destination::topic(TOPIC).unwrap(), &cfg, client.clone()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || client.delivered().len() == 20).await);
    handler.close_and_drain().await;

    let delivered = client.delivered_bodies();
    assert_eq!(delivered.len(), 20);
    let unique: HashSet<_> = delivered.into_iter().collect();
    assert_eq!(unique, expected.into_iter().collect::<HashSet<_>>());
}

#[tokio::test]
async fn replayed_packets_come_before_new_ones() {
    let dir = TempDir::new().unwrap();
    let mut expected = previous_run(dir.path(), 5);

    let client = RecordingClient::always_ok();
    let cfg = producer_config(dir.path(), 1, 3);
    let handler = AsyncHandler::new(Destination::topic(TOPIC).unwrap(), &cfg, client.clone()).unwrap();
    for i in 0..5 {
        let body = format!("after-restart-{i}");
        handler.enqueue(body.clone()).unwrap();
        expected.push(body);
    }

    handler.close_and_drain().await;
    assert_eq!(client.delivered_bodies(), expected);
}

#[tokio::test]
async fn discard_mode_drops_packets_from_previous_run() {
    let dir = TempDir::new().unwrap();
    previous_run(dir.path(), 10);

    let client = RecordingClient::always_ok();
    let mut cfg = producer_config(dir.path(), 2, 3);
    cfg.continue_send = false;
    let handler = AsyncHandler::new(Destination::topic(TOPIC).unwrap(), &cfg, client.clone()).unwrap();
    assert_eq!(handler.pending(), 0);

    handler.enqueue("fresh").unwrap();
    handler.close_and_drain().await;

    assert_eq!(client.delivered_bodies(), vec!["fresh".to_string()]);
}

#[tokio::test]
async fn shutdown_keeps_undelivered_packets_for_next_run() {
    let dir = TempDir::new().unwrap();
    let cfg = producer_config(dir.path(), 1, 3);

    {
        // Broker down: the single worker parks in backoff on the first packet.
        let mut slow = cfg.clone();
        slow.remote_timeout_ms = 60_000;
        let down = RecordingClient::always_fail();
        let handler = AsyncHandler::new(Destination::topic(TOPIC).unwrap(), &slow, down.clone()).unwrap();
        for i in 0..4 {
            handler.enqueue(format!("m{i}")).unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || handler.pending() == 3).await);

        tokio::time::timeout(Duration::from_secs(5), handler.shutdown())
            .await
            .expect("shutdown should interrupt backoff");

        // m0 was mid-retry: it goes back on disk instead of being dropped.
        assert_eq!(down.attempt_count(), 1);
        assert_eq!(handler.pending(), 4);
        let stats = handler.stats();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.dropped, 0);
    }

    let client = RecordingClient::always_ok();
    let handler = AsyncHandler::new(Destination::topic(TOPIC).unwrap(), &cfg, client.clone()).unwrap();
    handler.close_and_drain().await;
    assert_eq!(client.delivered_bodies(), vec!["m1", "m2", "m3", "m0"]);
}
