mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use blipmq_producer::config::QueueConfig;
use blipmq_producer::core::queue::DurableQueue;
use blipmq_producer::{AsyncHandler, Destination, Packet, QueueError};
use common::{body, producer_config, RecordingClient};
use tempfile::TempDir;
use tokio::time::timeout;

fn queue_config(dir: &Path, segment_size_bytes: u64) -> QueueConfig {
    QueueConfig {
        directory: dir.to_path_buf(),
        segment_size_bytes,
        fsync_every_n: Some(1),
    }
}

fn packet(body: String) -> Packet {
    Packet::new(Destination::topic("lifecycle").unwrap(), body)
}

fn segment_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("seg-"))
        .count()
}

#[tokio::test]
async fn closed_queue_drains_pending_then_reports_closed() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(DurableQueue::open(&queue_config(dir.path(), 1 << 20), "lifecycle", false).unwrap());
    for i in 0..3 {
        queue.enqueue(&packet(format!("p{i}"))).unwrap();
    }

    queue.close();
    assert!(queue.is_closed());
    assert!(matches!(queue.enqueue(&packet("late".into())), Err(QueueError::Closed)));

    for i in 0..3 {
        let got = timeout(Duration::from_secs(1), queue.dequeue()).await.unwrap().unwrap();
        assert_eq!(body(&got), format!("p{i}"));
    }
    let after = timeout(Duration::from_secs(1), queue.dequeue()).await.unwrap();
    assert!(matches!(after, Err(QueueError::Closed)));
}

#[tokio::test]
async fn closed_handler_rejects_enqueue() {
    let dir = TempDir::new().unwrap();
    let handler = AsyncHandler::new(
        Destination::topic("closing").unwrap(),
        &producer_config(dir.path(), 1, 3),
        RecordingClient::always_ok(),
    )
    .unwrap();

    handler.close();
    let err = handler.enqueue("too late").unwrap_err();
    assert!(err.is_queue_closed());
}

#[tokio::test]
async fn rollover_creates_segments_and_preserves_order() {
    let dir = TempDir::new().unwrap();
    let queue = DurableQueue::open(&queue_config(dir.path(), 512), "lifecycle", false).unwrap();

    let bodies: Vec<String> = (0..40).map(|i| format!("{i:04}-{}", "x".repeat(40))).collect();
    for b in &bodies {
        queue.enqueue(&packet(b.clone())).unwrap();
    }
    let on_disk = segment_files(queue.directory());
    assert!(on_disk > 1, "expected several segments, found {on_disk}");
    assert_eq!(on_disk, queue.segment_count());

    let mut seen = Vec::new();
    while let Some(p) = queue.try_dequeue().unwrap() {
        seen.push(body(&p));
    }
    assert_eq!(seen, bodies);
    assert_eq!(segment_files(queue.directory()), 1, "drained segments should be deleted");
}

#[tokio::test]
async fn rollover_survives_restart_mid_segment() {
    let dir = TempDir::new().unwrap();
    let bodies: Vec<String> = (0..30).map(|i| format!("restart-{i:03}")).collect();
    {
        let queue = DurableQueue::open(&queue_config(dir.path(), 256), "lifecycle", false).unwrap();
        for b in &bodies {
            queue.enqueue(&packet(b.clone())).unwrap();
        }
        for expected in &bodies[..7] {
            assert_eq!(&body(&queue.try_dequeue().unwrap().unwrap()), expected);
        }
    }

    let queue = DurableQueue::open(&queue_config(dir.path(), 256), "lifecycle", false).unwrap();
    assert_eq!(queue.len(), 23);
    let mut seen = Vec::new();
    while let Some(p) = queue.try_dequeue().unwrap() {
        seen.push(body(&p));
    }
    assert_eq!(seen, bodies[7..].to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_split_the_queue() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(DurableQueue::open(&queue_config(dir.path(), 4096), "lifecycle", false).unwrap());
    for i in 0..300 {
        queue.enqueue(&packet(format!("{i}"))).unwrap();
    }
    queue.close();

    let mut consumers = Vec::new();
    for _ in 0..6 {
        let queue = Arc::clone(&queue);
        consumers.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Ok(p) = queue.dequeue().await {
                got.push(body(&p));
            }
            got
        }));
    }

    let mut all = Vec::new();
    for c in consumers {
        all.extend(c.await.unwrap());
    }
    all.sort_by_key(|s| s.parse::<u32>().unwrap());
    let expected: Vec<String> = (0..300).map(|i| i.to_string()).collect();
    assert_eq!(all, expected);
}
