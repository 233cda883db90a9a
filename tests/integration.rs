// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Global Sync
//!
//! Most tests run in-process against in-memory SQLite. Redis-backed origin
//! tests use testcontainers and are `#[ignore]`.
//!
//! # Running Tests
//! ```bash
//! # In-process tests
//! cargo test --test integration
//!
//! # Redis origin tests (requires Docker)
//! cargo test --test integration redis_ -- --ignored
//! ```
//!
//! # Test Organization
//! - `order_*` - origin order preserved in the global log
//! - `scenario_*` - multi-origin conflict scenarios, stepped by hand
//! - `resume_*` - crash/restart and resume-position handling
//! - `node_*` - full nodes with spawned links
//! - `redis_*` - Redis origin streams

mod common;

use common::*;
use global_sync::{
    ConflictStatus, CursorConfig, CursorStore, DocumentStore, EngineState, GlobalApplier,
    GlobalLog, GlobalSyncConfig, GlobalSyncError, GlobalSyncNode, Granularity, LinkState,
    NamespaceConfig, OpKind, OperationRecord, RedisSource, Resolution, ResumeFrom, SourceTailer,
    StoreConfig, TailerConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::clients::Cli;

// =============================================================================
// Origin Order
// =============================================================================

#[tokio::test]
async fn order_origin_writes_reach_log_in_order_without_gaps() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let mut a = TestSite::new("rs-a", &log, &topology).await;

    for i in 0..12 {
        let k = format!("o{}", i % 4);
        match i % 3 {
            0 => {
                a.store
                    .update(&orders(), &key(&k), fields(&[("n", json!(i))]))
                    .await
                    .unwrap();
            }
            1 => {
                a.store
                    .update(&orders(), &key(&k), fields(&[("m", json!(i))]))
                    .await
                    .unwrap();
            }
            _ => {
                a.store.delete(&orders(), &key(&k)).await.unwrap();
            }
        }
    }
    let emitted = a.store.local_head();
    a.publish().await;

    let records = all_records(&log).await;
    let origin_seqs: Vec<u64> = records.iter().map(|r| r.origin_seq).collect();
    assert_eq!(origin_seqs, (1..=emitted).collect::<Vec<_>>());

    let global_seqs: Vec<u64> = records.iter().map(|r| r.global_seq).collect();
    assert_eq!(global_seqs, (1..=emitted).collect::<Vec<_>>());
    assert!(records.iter().all(|r| r.origin_id == "rs-a"));
}

#[tokio::test]
async fn order_interleaved_origins_keep_per_origin_order() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let mut a = TestSite::new("rs-a", &log, &topology).await;
    let mut b = TestSite::new("rs-b", &log, &topology).await;

    for round in 0..5 {
        a.store
            .update(&orders(), &key("a"), fields(&[("n", json!(round))]))
            .await
            .unwrap();
        b.store
            .update(&orders(), &key("b"), fields(&[("n", json!(round))]))
            .await
            .unwrap();
        if round % 2 == 0 {
            a.publish().await;
        } else {
            b.publish().await;
        }
    }
    a.publish().await;
    b.publish().await;

    let records = all_records(&log).await;
    assert_eq!(records.len(), 10);
    for origin in ["rs-a", "rs-b"] {
        let seqs: Vec<u64> = records
            .iter()
            .filter(|r| r.origin_id == origin)
            .map(|r| r.origin_seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5], "origin {}", origin);
    }
}

#[tokio::test]
async fn order_local_namespaces_are_not_published() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let mut a = TestSite::new("rs-a", &log, &topology).await;
    let carts = global_sync::Namespace::new("shop.carts").unwrap();

    a.store
        .insert(&carts, &key("c1"), fields(&[("n", json!(1))]))
        .await
        .unwrap();
    a.store
        .insert(&orders(), &key("o1"), fields(&[("n", json!(1))]))
        .await
        .unwrap();
    a.publish().await;

    let records = all_records(&log).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].origin_seq, 2);
    assert_eq!(log.origin_watermark("rs-a").await, Some(2));
}

// =============================================================================
// Conflict Scenarios
// =============================================================================

/// A inserts {X:a, Y:b}; B, before seeing it, updates {Y:c}.
#[tokio::test]
async fn scenario_concurrent_insert_and_update() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let a = TestSite::new("rs-a", &log, &topology).await;
    let b = TestSite::new("rs-b", &log, &topology).await;
    let c = TestSite::new("rs-c", &log, &topology).await;

    let insert = a
        .store
        .insert(&orders(), &key("1"), fields(&[("X", json!("a")), ("Y", json!("b"))]))
        .await
        .unwrap();
    let update = b
        .store
        .update(&orders(), &key("1"), fields(&[("Y", json!("c"))]))
        .await
        .unwrap();

    let a_stamp = (insert.origin_timestamp, "rs-a");
    let b_stamp = (update.origin_timestamp, "rs-b");
    let expected_y = if b_stamp > a_stamp { "c" } else { "b" };

    let mut sites = [a, b, c];
    quiesce(&mut sites).await;
    let [a, b, c] = sites;

    for site in [&a, &b, &c] {
        let doc = site.doc("1").await.expect("document present");
        assert_eq!(doc.get("X"), Some(&json!("a")), "site {}", site.id);
        assert_eq!(doc.get("Y"), Some(&json!(expected_y)), "site {}", site.id);
    }

    // A applies B's update against its own concurrent insert.
    let at_a = a.store.conflicts().list(&orders()).await.unwrap();
    assert_eq!(at_a.len(), 1);
    assert_eq!(at_a[0].incoming_version.origin_id, "rs-b");
    assert_eq!(at_a[0].destination_id, "rs-a");
    let expected = if expected_y == "c" {
        Resolution::IncomingWins
    } else {
        Resolution::LocalWins
    };
    assert_eq!(at_a[0].resolution, expected);

    // C has no local write but still sees the collision: B's update never
    // observed A's insert, which C applied first.
    let at_c = c.store.conflicts().list(&orders()).await.unwrap();
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].incoming_version.origin_id, "rs-b");

    // The losing value is kept verbatim.
    let loser = if expected_y == "c" { "b" } else { "c" };
    let kept = at_a[0]
        .discarded_local
        .get("Y")
        .or_else(|| at_a[0].discarded_incoming.get("Y"));
    assert_eq!(kept, Some(&json!(loser)));
}

/// A deletes key 2 while B concurrently updates it.
#[tokio::test]
async fn scenario_concurrent_delete_and_update() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let a = TestSite::new("rs-a", &log, &topology).await;
    let b = TestSite::new("rs-b", &log, &topology).await;
    let c = TestSite::new("rs-c", &log, &topology).await;
    let mut sites = [a, b, c];

    sites[0]
        .store
        .insert(&orders(), &key("2"), fields(&[("X", json!(1)), ("Y", json!(1))]))
        .await
        .unwrap();
    quiesce(&mut sites).await;

    let delete = sites[0]
        .store
        .delete(&orders(), &key("2"))
        .await
        .unwrap()
        .expect("delete emitted");
    let update = sites[1]
        .store
        .update(&orders(), &key("2"), fields(&[("Y", json!(2))]))
        .await
        .unwrap();
    quiesce(&mut sites).await;

    let delete_wins = (delete.origin_timestamp, "rs-a") > (update.origin_timestamp, "rs-b");
    for site in sites.iter() {
        let doc = site.doc("2").await;
        if delete_wins {
            assert!(doc.is_none(), "site {}", site.id);
        } else {
            assert_eq!(doc, Some(fields(&[("Y", json!(2))])), "site {}", site.id);
        }
    }

    let expected = if delete_wins {
        Resolution::DeleteWins
    } else {
        Resolution::Resurrection
    };
    for site in sites.iter().take(2) {
        let records = site.store.conflicts().list(&orders()).await.unwrap();
        assert_eq!(records.len(), 1, "site {}", site.id);
        assert_eq!(records[0].resolution, expected, "site {}", site.id);
    }
}

/// Disjoint concurrent field updates merge to the same result everywhere,
/// whichever a destination sees first.
#[tokio::test]
async fn scenario_disjoint_updates_merge_commutatively() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let mut sites = [
        TestSite::new("rs-a", &log, &topology).await,
        TestSite::new("rs-b", &log, &topology).await,
        TestSite::new("rs-c", &log, &topology).await,
        TestSite::new("rs-d", &log, &topology).await,
    ];

    sites[2]
        .store
        .insert(&orders(), &key("m"), fields(&[("X", json!(0)), ("Y", json!(0))]))
        .await
        .unwrap();
    quiesce(&mut sites).await;

    sites[0]
        .store
        .update(&orders(), &key("m"), fields(&[("X", json!("from-a"))]))
        .await
        .unwrap();
    sites[1]
        .store
        .update(&orders(), &key("m"), fields(&[("Y", json!("from-b"))]))
        .await
        .unwrap();

    // B publishes first, then A.
    sites[1].publish().await;
    sites[0].publish().await;
    quiesce(&mut sites).await;

    let expected = fields(&[("X", json!("from-a")), ("Y", json!("from-b"))]);
    for site in sites.iter() {
        assert_eq!(site.doc("m").await, Some(expected.clone()), "site {}", site.id);
    }

    // Each writer logged the other's update as a merge.
    for site in sites.iter().take(2) {
        let records = site.store.conflicts().list(&orders()).await.unwrap();
        assert_eq!(records.len(), 1, "site {}", site.id);
        assert_eq!(records[0].resolution, Resolution::Merge);
        assert_eq!(records[0].local_status, ConflictStatus::Merged);
        assert_eq!(records[0].incoming_status, ConflictStatus::Merged);
    }
}

#[tokio::test]
async fn scenario_field_granularity_merges_without_audit() {
    let log = shared_log().await;
    let topology = topology(Granularity::Field);
    let mut sites = [
        TestSite::new("rs-a", &log, &topology).await,
        TestSite::new("rs-b", &log, &topology).await,
    ];

    sites[0]
        .store
        .insert(&orders(), &key("f"), fields(&[("X", json!(0)), ("Y", json!(0))]))
        .await
        .unwrap();
    quiesce(&mut sites).await;

    sites[0]
        .store
        .update(&orders(), &key("f"), fields(&[("X", json!(1))]))
        .await
        .unwrap();
    sites[1]
        .store
        .update(&orders(), &key("f"), fields(&[("Y", json!(1))]))
        .await
        .unwrap();
    quiesce(&mut sites).await;

    for site in sites.iter() {
        assert_eq!(
            site.doc("f").await,
            Some(fields(&[("X", json!(1)), ("Y", json!(1))]))
        );
        assert_eq!(site.store.conflicts().count(&orders()).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn scenario_many_writers_converge() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let mut sites = [
        TestSite::new("rs-a", &log, &topology).await,
        TestSite::new("rs-b", &log, &topology).await,
        TestSite::new("rs-c", &log, &topology).await,
    ];

    for round in 0..6u64 {
        for (i, site) in sites.iter().enumerate() {
            let k = format!("k{}", (round + i as u64) % 3);
            let value = json!(format!("{}-{}", site.id, round));
            match (round + i as u64) % 4 {
                3 => {
                    site.store.delete(&orders(), &key(&k)).await.unwrap();
                }
                2 => {
                    site.store
                        .update(&orders(), &key(&k), fields(&[("b", value)]))
                        .await
                        .unwrap();
                }
                _ => {
                    site.store
                        .update(&orders(), &key(&k), fields(&[("a", value)]))
                        .await
                        .unwrap();
                }
            }
        }
        // Partial propagation between rounds.
        let idx = (round % 3) as usize;
        sites[idx].publish().await;
        sites[(idx + 1) % 3].catch_up().await;
    }
    quiesce(&mut sites).await;

    let reference = sites[0].contents().await;
    for site in sites.iter().skip(1) {
        assert_eq!(site.contents().await, reference, "site {}", site.id);
    }
}

// =============================================================================
// Resume and Crash Recovery
// =============================================================================

/// A tailer crashes after appending 5 of 10 records, before its cursor
/// commit. The restarted tailer re-derives all 10.
#[tokio::test]
async fn resume_tailer_crash_mid_batch_has_no_net_duplication() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let cursors = Arc::new(CursorStore::new(":memory:").await.unwrap());
    let source = Arc::new(ScriptedSource::with_updates("rs-x", &orders(), 10));

    let mut first = SourceTailer::new(
        source.clone(),
        log.clone(),
        cursors.clone(),
        topology.clone(),
        tailer_config(),
    );
    // First run starts the origin from scratch, committing cursor 0.
    first.start(ResumeFrom::Beginning).await.unwrap();
    // Five appends land, then the process dies.
    for seq in 1..=5 {
        let op = update(seq, &orders(), &format!("k{}", seq));
        log.append(&OperationRecord::from_local("rs-x", op))
            .await
            .unwrap();
    }
    drop(first);
    assert_eq!(cursors.get("rs-x").await, Some(0));

    let mut restarted = SourceTailer::new(
        source,
        log.clone(),
        cursors.clone(),
        topology.clone(),
        TailerConfig {
            batch_size: 10,
            ..tailer_config()
        },
    );
    assert_eq!(restarted.start(ResumeFrom::Checkpoint).await.unwrap(), 0);
    let report = restarted.tail_once().await.unwrap();
    assert_eq!(report.fetched, 10);
    assert_eq!(report.duplicates, 5);
    assert_eq!(report.appended, 5);
    assert_eq!(cursors.get("rs-x").await, Some(10));

    // No applier sees a duplicate.
    let mut dest = TestSite::new("rs-d", &log, &topology).await;
    let replay = dest.catch_up().await;
    assert_eq!(replay.total, 10);
    assert_eq!(replay.applied, 10);
    assert_eq!(dest.store.count(&orders()).await.unwrap(), 10);

    let records = all_records(&log).await;
    let seqs: Vec<u64> = records.iter().map(|r| r.origin_seq).collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
}

/// Replaying records whose checkpoint was lost leaves the state unchanged.
#[tokio::test]
async fn resume_replay_is_idempotent() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let mut a = TestSite::new("rs-a", &log, &topology).await;
    let mut b = TestSite::new("rs-b", &log, &topology).await;

    a.store
        .insert(&orders(), &key("1"), fields(&[("n", json!(1))]))
        .await
        .unwrap();
    a.store
        .update(&orders(), &key("1"), fields(&[("n", json!(2))]))
        .await
        .unwrap();
    a.store
        .insert(&orders(), &key("2"), fields(&[("n", json!(1))]))
        .await
        .unwrap();
    a.store.delete(&orders(), &key("2")).await.unwrap();
    a.publish().await;
    b.catch_up().await;
    let before = b.contents().await;

    // Simulate a crash between effect and checkpoint.
    let records = all_records(&log).await;
    b.store.set_applier_position("rs-b", 0).await.unwrap();
    let report = b
        .store
        .replay_batch("rs-b", &records, &topology)
        .await
        .unwrap();

    assert_eq!(report.total, records.len());
    assert_eq!(report.applied, 0);
    assert_eq!(report.conflicts, 0);
    assert_eq!(b.contents().await, before);
    assert_eq!(b.store.conflicts().count_all().await.unwrap(), 0);
}

#[tokio::test]
async fn resume_gap_is_fatal_and_explicit_resync_recovers() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let cursors = Arc::new(CursorStore::new(":memory:").await.unwrap());
    let source = Arc::new(ScriptedSource::with_updates("rs-x", &orders(), 4));

    let mut tailer = SourceTailer::new(
        source.clone(),
        log.clone(),
        cursors.clone(),
        topology.clone(),
        tailer_config(),
    );
    tailer.start(ResumeFrom::Checkpoint).await.unwrap();
    tailer.tail_once().await.unwrap();

    for seq in 5..=9 {
        source.push(update(seq, &orders(), &format!("k{}", seq)));
    }
    source.trim_through(6);

    let err = tailer.tail_once().await.unwrap_err();
    assert!(matches!(
        err,
        GlobalSyncError::SequenceGap { expected: 5, found: 7, .. }
    ));
    assert!(err.is_fatal());
    assert_eq!(cursors.get("rs-x").await, Some(4));

    // Operator accepts the loss and resumes after the trimmed range.
    let mut resynced = SourceTailer::new(
        source,
        log.clone(),
        cursors.clone(),
        topology,
        tailer_config(),
    );
    resynced.start(ResumeFrom::Position(6)).await.unwrap();
    let report = resynced.tail_once().await.unwrap();
    assert_eq!(report.appended, 3);
    assert_eq!(log.origin_watermark("rs-x").await, Some(9));
}

#[tokio::test]
async fn resume_lost_applier_checkpoint_refuses_to_guess() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let mut a = TestSite::new("rs-a", &log, &topology).await;
    let mut b = TestSite::new("rs-b", &log, &topology).await;

    a.store
        .insert(&orders(), &key("1"), fields(&[("n", json!(1))]))
        .await
        .unwrap();
    a.publish().await;
    b.catch_up().await;

    // B's store is rebuilt empty; the log still remembers B's position.
    let fresh = Arc::new(DocumentStore::open("rs-b", ":memory:", false).await.unwrap());
    let mut applier = GlobalApplier::new(
        "rs-b",
        log.clone(),
        fresh.clone(),
        topology.clone(),
        applier_config(),
    );
    let err = applier.start(ResumeFrom::Checkpoint).await.unwrap_err();
    assert!(matches!(err, GlobalSyncError::ResumePosition { .. }));
    assert!(err.is_fatal());

    applier.start(ResumeFrom::Beginning).await.unwrap();
    applier.apply_once().await.unwrap();
    assert_eq!(
        fresh.get(&orders(), &key("1")).await.unwrap(),
        Some(fields(&[("n", json!(1))]))
    );
}

#[tokio::test]
async fn resume_applier_behind_reclaimed_log_is_fatal() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let mut a = TestSite::new("rs-a", &log, &topology).await;
    let mut b = TestSite::new("rs-b", &log, &topology).await;

    for i in 0..5 {
        a.store
            .update(&orders(), &key(&format!("k{}", i)), fields(&[("n", json!(i))]))
            .await
            .unwrap();
    }
    a.publish().await;
    a.catch_up().await;
    b.catch_up().await;
    log.reclaim().await.unwrap();
    assert_eq!(log.low_water_mark().await.unwrap(), 5);

    // A destination joining after reclaim cannot start from zero.
    let late_store = Arc::new(DocumentStore::open("rs-late", ":memory:", false).await.unwrap());
    let mut late = GlobalApplier::new(
        "rs-late",
        log.clone(),
        late_store,
        topology.clone(),
        applier_config(),
    );
    let err = late.start(ResumeFrom::Checkpoint).await.unwrap_err();
    assert!(matches!(err, GlobalSyncError::LogTrimmed { .. }));
}

#[tokio::test]
async fn resume_retention_waits_for_slowest_destination() {
    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let mut a = TestSite::new("rs-a", &log, &topology).await;
    let mut b = TestSite::new("rs-b", &log, &topology).await;

    for i in 0..4 {
        a.store
            .update(&orders(), &key(&format!("k{}", i)), fields(&[("n", json!(i))]))
            .await
            .unwrap();
    }
    a.publish().await;
    a.catch_up().await;

    assert_eq!(log.reclaim().await.unwrap(), 0);
    assert_eq!(log.len().await.unwrap(), 4);

    b.catch_up().await;
    assert_eq!(log.reclaim().await.unwrap(), 4);
    assert!(log.is_empty().await.unwrap());
}

// =============================================================================
// Full Nodes
// =============================================================================

fn node_config(node_id: &str) -> GlobalSyncConfig {
    let mut config = GlobalSyncConfig::for_testing(node_id);
    config.namespaces.push(NamespaceConfig {
        namespace: "shop.orders".into(),
        is_global: true,
        granularity: Granularity::Document,
    });
    config
}

async fn caught_up(nodes: &[GlobalSyncNode]) -> bool {
    let head = nodes[0].log().head();
    for node in nodes {
        let store = node.store().unwrap();
        let published = node.log().origin_watermark(node.node_id()).await.unwrap_or(0);
        if published < store.local_head() {
            return false;
        }
        let applied = node
            .health_check()
            .links
            .iter()
            .find(|l| l.link.starts_with("applier:"))
            .map(|l| l.position)
            .unwrap_or(0);
        if applied < head {
            return false;
        }
    }
    true
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_three_nodes_converge_over_shared_log() {
    let log = shared_log().await;
    let mut nodes = Vec::new();
    for id in ["rs-a", "rs-b", "rs-c"] {
        let mut node = GlobalSyncNode::new(node_config(id), log.clone()).unwrap();
        node.start().await.unwrap();
        nodes.push(node);
    }
    // Every destination registers before anything can be reclaimed.
    let shared = &log;
    assert!(
        eventually(Duration::from_secs(2), || async move {
            shared.consumers().await.map(|c| c.len() == 3).unwrap_or(false)
        })
        .await
    );

    for round in 0..10 {
        for node in &nodes {
            let store = node.store().unwrap();
            store
                .update(
                    &orders(),
                    &key(&format!("own-{}", node.node_id())),
                    fields(&[("round", json!(round))]),
                )
                .await
                .unwrap();
            store
                .update(
                    &orders(),
                    &key("shared"),
                    fields(&[(node.node_id(), json!(round))]),
                )
                .await
                .unwrap();
        }
    }

    let mut converged = false;
    for _ in 0..500 {
        if caught_up(&nodes).await {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(converged, "nodes did not catch up");

    let reference = nodes[0].store().unwrap().list(&orders()).await.unwrap();
    assert_eq!(reference.len(), 4);
    for node in &nodes[1..] {
        assert_eq!(
            node.store().unwrap().list(&orders()).await.unwrap(),
            reference,
            "node {}",
            node.node_id()
        );
    }
    for node in &nodes {
        assert!(node.health_check().healthy);
    }

    for node in nodes.iter_mut() {
        node.shutdown().await;
        assert_eq!(node.state(), EngineState::Stopped);
    }
}

#[tokio::test]
async fn node_failed_applier_does_not_stop_tailer() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("store.db").to_string_lossy().to_string();

    // Corrupt checkpoint: ahead of anything the log has.
    {
        let store = DocumentStore::open("rs-a", &store_path, true).await.unwrap();
        store.set_applier_position("rs-a", 99).await.unwrap();
        store.close().await;
    }

    let log = shared_log().await;
    let mut config = node_config("rs-a");
    config.store = StoreConfig {
        sqlite_path: store_path,
        wal_mode: true,
    };
    let mut node = GlobalSyncNode::new(config, log.clone()).unwrap();
    node.start().await.unwrap();

    let node_ref = &node;
    let failed = eventually(Duration::from_secs(2), || async move {
        node_ref.health_check()
            .links
            .iter()
            .any(|l| l.link == "applier:rs-a" && l.state.is_failed())
    })
    .await;
    assert!(failed);

    let health = node.health_check();
    assert_eq!(health.state, EngineState::Running);
    assert!(!health.healthy);
    assert_eq!(health.links_failed, 1);
    let tailer = health
        .links
        .iter()
        .find(|l| l.link == "tailer:rs-a")
        .unwrap();
    assert_eq!(tailer.state, LinkState::Running);

    // The tailer still publishes local writes.
    node.store()
        .unwrap()
        .insert(&orders(), &key("1"), fields(&[("n", json!(1))]))
        .await
        .unwrap();
    let log_ref = &log;
    assert!(eventually(Duration::from_secs(2), || async move { log_ref.head() == 1 }).await);

    // Operator resync brings the applier back.
    node.resync_applier(ResumeFrom::Beginning).await.unwrap();
    let node_ref = &node;
    assert!(
        eventually(Duration::from_secs(2), || async move {
            node_ref.health_check().links_failed == 0
        })
        .await
    );

    node.shutdown().await;
}

#[tokio::test]
async fn node_restart_resumes_from_durable_positions() {
    let dir = tempfile::tempdir().unwrap();
    let path = |name: &str| dir.path().join(name).to_string_lossy().to_string();

    let log = Arc::new(GlobalLog::open(&path("gol.db"), 0).await.unwrap());
    let mut writer = GlobalSyncNode::new(node_config("rs-a"), log.clone()).unwrap();
    writer.start().await.unwrap();

    let reader_config = || {
        let mut config = node_config("rs-b");
        config.store = StoreConfig {
            sqlite_path: path("b-store.db"),
            wal_mode: true,
        };
        config.cursor = CursorConfig {
            sqlite_path: path("b-cursors.db"),
        };
        config
    };

    let mut reader = GlobalSyncNode::new(reader_config(), log.clone()).unwrap();
    reader.start().await.unwrap();

    let store = Arc::clone(writer.store().unwrap());
    store
        .insert(&orders(), &key("1"), fields(&[("n", json!(1))]))
        .await
        .unwrap();
    let reader_store = Arc::clone(reader.store().unwrap());
    let rs = &reader_store;
    assert!(
        eventually(Duration::from_secs(2), || async move {
            rs.get(&orders(), &key("1")).await.ok().flatten().is_some()
        })
        .await
    );
    reader.shutdown().await;

    store
        .update(&orders(), &key("1"), fields(&[("n", json!(2))]))
        .await
        .unwrap();
    let log_ref = &log;
    assert!(eventually(Duration::from_secs(2), || async move { log_ref.head() == 2 }).await);

    let mut reader = GlobalSyncNode::new(reader_config(), log.clone()).unwrap();
    reader.start().await.unwrap();
    let reader_store = Arc::clone(reader.store().unwrap());
    let rs = &reader_store;
    assert!(
        eventually(Duration::from_secs(2), || async move {
            rs.get(&orders(), &key("1")).await.ok().flatten() == Some(fields(&[("n", json!(2))]))
        })
        .await
    );
    assert_eq!(reader_store.applier_position("rs-b").await.unwrap(), Some(2));
    assert_eq!(reader_store.conflicts().count_all().await.unwrap(), 0);

    reader.shutdown().await;
    writer.shutdown().await;
}

// =============================================================================
// Redis Origins
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_origin_stream_reaches_log() {
    let docker = Cli::default();
    let origin = TestOrigin::new(&docker, "rs-remote").await;

    for i in 0..5 {
        let op = origin
            .store
            .update(&orders(), &key(&format!("k{}", i)), fields(&[("n", json!(i))]))
            .await
            .unwrap();
        origin.publish(&op).await;
    }
    assert_eq!(origin.stream_len().await.unwrap(), 5);

    let log = shared_log().await;
    let topology = topology(Granularity::Document);
    let cursors = Arc::new(CursorStore::new(":memory:").await.unwrap());
    let source = Arc::new(RedisSource::from_config(&origin.source_config()).unwrap());
    let mut tailer = SourceTailer::new(source, log.clone(), cursors.clone(), topology, tailer_config());
    tailer.start(ResumeFrom::Checkpoint).await.unwrap();

    let report = tailer.tail_once().await.unwrap();
    assert_eq!(report.appended, 5);

    let records = all_records(&log).await;
    assert!(records.iter().all(|r| r.origin_id == "rs-remote"));
    assert!(records.iter().all(|r| r.op_kind == OpKind::Update));
    assert_eq!(cursors.get("rs-remote").await, Some(5));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_trimmed_origin_is_a_gap() {
    let docker = Cli::default();
    let origin = TestOrigin::new(&docker, "rs-remote").await;

    for i in 0..6 {
        let op = origin
            .store
            .update(&orders(), &key(&format!("k{}", i)), fields(&[("n", json!(i))]))
            .await
            .unwrap();
        origin.publish(&op).await;
    }
    origin.stream.trim_before(4).await.unwrap();

    let log = shared_log().await;
    let cursors = Arc::new(CursorStore::new(":memory:").await.unwrap());
    let source = Arc::new(RedisSource::from_config(&origin.source_config()).unwrap());
    let mut tailer = SourceTailer::new(
        source,
        log,
        cursors,
        topology(Granularity::Document),
        tailer_config(),
    );
    tailer.start(ResumeFrom::Checkpoint).await.unwrap();

    let err = tailer.tail_once().await.unwrap_err();
    assert!(matches!(
        err,
        GlobalSyncError::SequenceGap { expected: 1, found: 4, .. }
    ));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_node_replays_remote_origin() {
    let docker = Cli::default();
    let origin = TestOrigin::new(&docker, "rs-remote").await;

    let log = shared_log().await;
    let mut config = node_config("rs-a");
    config.sources.push(origin.source_config());
    let mut node = GlobalSyncNode::new(config, log.clone()).unwrap();
    node.start().await.unwrap();

    let op = origin
        .store
        .insert(&orders(), &key("r1"), fields(&[("from", json!("remote"))]))
        .await
        .unwrap();
    origin.publish(&op).await;

    let store = Arc::clone(node.store().unwrap());
    let store_ref = &store;
    assert!(
        eventually(Duration::from_secs(5), || async move {
            store_ref.get(&orders(), &key("r1")).await.ok().flatten().is_some()
        })
        .await
    );
    assert_eq!(node.health_check().links_total, 3);

    node.shutdown().await;
}
