use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use vodsync_core::config::{RelocationMode, Visibility};
use vodsync_core::delivery::{DeliveryMetadata, DeliveryReceipt, RemoteId};
use vodsync_core::pending::{DrainOptions, PendingDelivery, PendingQueue};
use vodsync_core::shutdown::{shutdown_channel, ShutdownSignal};

fn record(dir: &Path, name: &str, cleanup: bool) -> PendingDelivery {
    let original = dir.join(name);
    PendingDelivery {
        artifact_path: if cleanup {
            dir.join(format!("work/{name}"))
        } else {
            original.clone()
        },
        original_path: original,
        cleanup_path: cleanup.then(|| dir.join(format!("work/{name}"))),
        relocation_target: None,
        relocation_mode: RelocationMode::Move,
        title: "WoW Raid - W1 Foe Pull #1 - September 3 10:16 PM".into(),
        metadata: DeliveryMetadata {
            description: "Raid Upload".into(),
            tags: vec!["WoW".into(), "Raid".into(), "WoW".into()],
            visibility: Visibility::Unlisted,
            collection_id: Some("PL1".into()),
            category_id: "20".into(),
        },
        enqueued_at: None,
        last_error: None,
    }
}

#[tokio::test]
async fn enqueued_record_is_durable_without_a_later_drain() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pending_uploads.json");
    let expected = record(dir.path(), "W1_Foe_Pull1_Sep03_10-16PM.mp4", false);
    {
        let queue = PendingQueue::new(&path);
        queue.enqueue(expected.clone()).await.unwrap();
        // Handle dropped without draining, as after an abrupt stop.
    }
    let raw = std::fs::read_to_string(&path).unwrap();
    let stored: Vec<PendingDelivery> = serde_json::from_str(&raw).unwrap();
    assert_eq!(stored, vec![expected]);
    assert!(!dir.path().join("pending_uploads.json.tmp").exists());
}

#[tokio::test]
async fn stale_temp_file_from_an_interrupted_write_is_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pending_uploads.json");
    let queue = PendingQueue::new(&path);
    let first = record(dir.path(), "a.mp4", false);
    queue.enqueue(first.clone()).await.unwrap();
    std::fs::write(dir.path().join("pending_uploads.json.tmp"), "[{\"trunc").unwrap();

    assert_eq!(queue.load().await.unwrap(), vec![first.clone()]);
    let second = record(dir.path(), "b.mp4", false);
    queue.enqueue(second.clone()).await.unwrap();
    assert_eq!(queue.load().await.unwrap(), vec![first, second]);
}

#[tokio::test]
async fn successful_drain_removes_transcoded_copy_and_keeps_original() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("work")).unwrap();
    let queued = record(dir.path(), "W1_Foe_Pull1_Sep03_10-16PM.mp4", true);
    std::fs::write(&queued.original_path, b"raw").unwrap();
    std::fs::write(&queued.artifact_path, b"encoded").unwrap();
    let queue = PendingQueue::new(dir.path().join("pending_uploads.json"));
    queue.enqueue(queued.clone()).await.unwrap();

    let report = queue
        .drain(
            |record| async move {
                assert_eq!(record.metadata.tags.len(), 3);
                Ok(DeliveryReceipt {
                    remote_id: RemoteId::new("abc"),
                    attempts: 1,
                    collection_attached: Some(true),
                })
            },
            DrainOptions::default(),
            &ShutdownSignal::never(),
        )
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    assert!(!queued.artifact_path.exists());
    assert!(queued.original_path.exists());
    assert!(queue.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_leaves_records_queued() {
    let dir = tempdir().unwrap();
    let queued = record(dir.path(), "a.mp4", false);
    std::fs::write(&queued.artifact_path, b"raw").unwrap();
    let queue = PendingQueue::new(dir.path().join("pending_uploads.json"));
    queue.enqueue(queued.clone()).await.unwrap();

    let (trigger, signal) = shutdown_channel();
    trigger.trigger();
    let mut calls = 0;
    let report = queue
        .drain(
            |_| {
                calls += 1;
                async {
                    Ok(DeliveryReceipt {
                        remote_id: RemoteId::new("never"),
                        attempts: 1,
                        collection_attached: None,
                    })
                }
            },
            DrainOptions::default(),
            &signal,
        )
        .await
        .unwrap();
    assert_eq!(calls, 0);
    assert_eq!(report.attempted, 0);
    assert_eq!(report.retained, 1);
    assert_eq!(queue.load().await.unwrap(), vec![queued]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_are_all_persisted() {
    let dir = tempdir().unwrap();
    let queue = Arc::new(PendingQueue::new(dir.path().join("pending_uploads.json")));
    let mut handles = Vec::new();
    for index in 0..16 {
        let queue = Arc::clone(&queue);
        let queued = record(dir.path(), &format!("clip{index}.mp4"), false);
        handles.push(tokio::spawn(async move { queue.enqueue(queued).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = queue.load().await.unwrap();
    assert_eq!(stored.len(), 16);
    for index in 0..16 {
        let expected = dir.path().join(format!("clip{index}.mp4"));
        assert!(stored.iter().any(|queued| queued.artifact_path == expected));
    }
}

#[tokio::test]
async fn record_enqueued_during_drain_survives_the_rewrite() {
    let dir = tempdir().unwrap();
    let first = record(dir.path(), "a.mp4", false);
    std::fs::write(&first.artifact_path, b"raw").unwrap();
    let queue = Arc::new(PendingQueue::new(dir.path().join("pending_uploads.json")));
    queue.enqueue(first.clone()).await.unwrap();

    let late = record(dir.path(), "b.mp4", false);
    let report = queue
        .drain(
            |_| {
                let queue = Arc::clone(&queue);
                let late = late.clone();
                async move {
                    queue.enqueue(late).await.unwrap();
                    Ok(DeliveryReceipt {
                        remote_id: RemoteId::new("abc"),
                        attempts: 1,
                        collection_attached: None,
                    })
                }
            },
            DrainOptions::default(),
            &ShutdownSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.retained, 1);
    assert_eq!(queue.load().await.unwrap(), vec![late]);
}
