/* Any copyright is dedicated to the Public Domain.
http://creativecommons.org/publicdomain/zero/1.0/ */

//! End-to-end multi-device scenarios against the in-process mediator.

use serde_json::json;
use sync_test::{comparable, init_logging, TestClient, TestServer};

fn pause() {
    // Server-side change instants have millisecond resolution; keep
    // consecutive cycles on distinct instants.
    std::thread::sleep(std::time::Duration::from_millis(5));
}

#[test]
fn test_insert_locally_sync_observe_remotely() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");
    let b = TestClient::new(&server, "u1", "device-b");

    a.write(
        "tune",
        json!({
            "id": "T1",
            "title": "Silver Spear",
            "genre": "irish",
            "last_modified_at": "2025-01-01T10:00:00.000Z"
        }),
    );
    let result = a.sync_expect_success();
    // The push itself, possibly plus the initial pull echoing it back.
    assert!(result.items_synced >= 1);
    assert_eq!(a.pending_count(), 0);
    let watermark = a.watermark().expect("watermark persisted");

    // The row is live on the server...
    let title: String = server
        .lock()
        .query_row("SELECT title FROM tune WHERE id = 'T1'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(title, "Silver Spear");
    // ...and the watermark covers the commit.
    assert!(!watermark.is_empty());

    // B starts empty: an initial pull materializes the same row.
    let result = b.sync_expect_success();
    assert!(result.items_synced >= 1);
    let on_a = comparable(a.get("tune", json!({"id": "T1"})).unwrap());
    let on_b = comparable(b.get("tune", json!({"id": "T1"})).unwrap());
    assert_eq!(on_a, on_b);

    // Running either cycle again changes nothing (round-trip idempotence).
    pause();
    a.sync_expect_success();
    b.sync_expect_success();
    assert_eq!(
        comparable(b.get("tune", json!({"id": "T1"})).unwrap()),
        on_b
    );
}

#[test]
fn test_concurrent_edit_last_write_wins() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");
    let b = TestClient::new(&server, "u1", "device-b");

    a.write(
        "tune",
        json!({"id": "T1", "title": "original", "last_modified_at": "2025-01-01T09:00:00.000Z"}),
    );
    a.sync_expect_success();
    pause();
    b.sync_expect_success();
    pause();

    // Both edit offline; A at 10:00, B at 10:05.
    a.write(
        "tune",
        json!({"id": "T1", "title": "A-title", "last_modified_at": "2025-01-01T10:00:00.000Z"}),
    );
    b.write(
        "tune",
        json!({"id": "T1", "title": "B-title", "last_modified_at": "2025-01-01T10:05:00.000Z"}),
    );

    // Sync order: A then B, then A again to observe convergence.
    a.sync_expect_success();
    pause();
    b.sync_expect_success();
    pause();
    let result = a.sync();
    assert!(result.success);

    assert_eq!(
        a.get("tune", json!({"id": "T1"})).unwrap().get("title"),
        Some(&json!("B-title"))
    );
    assert_eq!(
        b.get("tune", json!({"id": "T1"})).unwrap().get("title"),
        Some(&json!("B-title"))
    );
}

#[test]
fn test_composite_pk_upsert_converges() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");
    let b = TestClient::new(&server, "u1", "device-b");

    for client in [&a, &b] {
        client.write("tune", json!({"id": "T1", "last_modified_at": "2025-01-01T08:00:00.000Z"}));
        client.write(
            "playlist",
            json!({"playlist_id": "P1", "user_ref": "u1", "last_modified_at": "2025-01-01T08:00:00.000Z"}),
        );
    }
    // The same composite row exists on both sides, B's copy older.
    a.write(
        "playlist_tune",
        json!({
            "playlist_ref": "P1",
            "tune_ref": "T1",
            "learning": 1,
            "last_modified_at": "2025-01-01T10:00:00.000Z"
        }),
    );
    b.write(
        "playlist_tune",
        json!({
            "playlist_ref": "P1",
            "tune_ref": "T1",
            "learning": 0,
            "last_modified_at": "2025-01-01T09:00:00.000Z"
        }),
    );

    a.sync_expect_success();
    pause();
    b.sync_expect_success();

    let on_b = b
        .get("playlist_tune", json!({"playlist_ref": "P1", "tune_ref": "T1"}))
        .unwrap();
    assert_eq!(on_b.get("learning"), Some(&json!(1)));
    assert_eq!(
        on_b.get("last_modified_at"),
        Some(&json!("2025-01-01T10:00:00.000Z"))
    );
}

#[test]
fn test_natural_key_upsert_preserves_local_synthetic_pk() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");
    let b = TestClient::new(&server, "u1", "device-b");

    for client in [&a, &b] {
        client.write("tune", json!({"id": "T1", "last_modified_at": "2025-01-01T08:00:00.000Z"}));
        client.write(
            "playlist",
            json!({"playlist_id": "P1", "user_ref": "u1", "last_modified_at": "2025-01-01T08:00:00.000Z"}),
        );
    }
    // The same practice instant recorded under different synthetic ids.
    a.write(
        "practice_record",
        json!({
            "id": "pr-on-a",
            "tune_ref": "T1",
            "playlist_ref": "P1",
            "practiced": "2025-01-01T09:00:00.000Z",
            "quality": "recalled",
            "last_modified_at": "2025-01-01T10:00:00.000Z"
        }),
    );
    b.write(
        "practice_record",
        json!({
            "id": "pr-on-b",
            "tune_ref": "T1",
            "playlist_ref": "P1",
            "practiced": "2025-01-01T09:00:00.000Z",
            "quality": "struggled",
            "last_modified_at": "2025-01-01T09:30:00.000Z"
        }),
    );

    a.sync_expect_success();
    pause();
    b.sync_expect_success();

    // B converged on A's data under B's own synthetic id.
    let on_b = b.get("practice_record", json!({"id": "pr-on-b"})).unwrap();
    assert_eq!(on_b.get("quality"), Some(&json!("recalled")));
    assert!(b.get("practice_record", json!({"id": "pr-on-a"})).is_none());
}

#[test]
fn test_soft_delete_beats_stale_update() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");
    let b = TestClient::new(&server, "u1", "device-b");

    a.write(
        "note",
        json!({
            "id": "N1",
            "user_ref": "u1",
            "note_text": "work on the roll",
            "last_modified_at": "2025-01-01T10:00:00.000Z"
        }),
    );
    a.sync_expect_success();
    pause();
    b.sync_expect_success();
    pause();

    // A deletes at 11:00; B edits offline at 10:30.
    a.write(
        "note",
        json!({
            "id": "N1",
            "user_ref": "u1",
            "note_text": "work on the roll",
            "deleted": 1,
            "last_modified_at": "2025-01-01T11:00:00.000Z"
        }),
    );
    b.write(
        "note",
        json!({
            "id": "N1",
            "user_ref": "u1",
            "note_text": "stale edit",
            "last_modified_at": "2025-01-01T10:30:00.000Z"
        }),
    );

    a.sync_expect_success();
    pause();
    b.sync_expect_success();
    pause();

    // The deletion is newer, so it wins everywhere.
    let deleted: i64 = server
        .lock()
        .query_row("SELECT deleted FROM note WHERE id = 'N1'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(deleted, 1);
    let on_b = b.get("note", json!({"id": "N1"})).unwrap();
    assert_eq!(on_b.get("deleted"), Some(&json!(1)));
    assert_eq!(on_b.get("note_text"), Some(&json!("work on the roll")));
}

#[test]
fn test_fk_reorder_across_pull_pages() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");

    // B pages one change at a time, so parent/child land on separate pages.
    let b = TestClient::with_config(&server, "u1", "device-b", {
        let mut config = practice_store::SyncEngineConfig::default();
        config.page_size = 1;
        config
    });

    a.write("tune", json!({"id": "T1", "last_modified_at": "2025-01-01T08:00:00.000Z"}));
    a.sync_expect_success();
    pause();
    // B learns about T1 and records a watermark, so later pulls are
    // incremental (ordered by server change instant, not dependency).
    b.sync_expect_success();
    pause();

    // A creates a playlist and its membership row, then touches the playlist
    // again so its change instant lands *after* the membership row's.
    a.write(
        "playlist",
        json!({"playlist_id": "P2", "user_ref": "u1", "name": "v1", "last_modified_at": "2025-01-01T09:00:00.000Z"}),
    );
    a.write(
        "playlist_tune",
        json!({"playlist_ref": "P2", "tune_ref": "T1", "current": 1, "last_modified_at": "2025-01-01T09:00:01.000Z"}),
    );
    a.sync_expect_success();
    pause();
    a.write(
        "playlist",
        json!({"playlist_id": "P2", "user_ref": "u1", "name": "v2", "last_modified_at": "2025-01-01T09:10:00.000Z"}),
    );
    a.sync_expect_success();
    pause();

    // B's incremental pull now yields playlist_tune before playlist across
    // pages; the engine defers the child and settles it when the parent
    // arrives. No errors escape.
    let result = b.sync();
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.items_failed, 0, "errors: {:?}", result.errors);
    assert!(b
        .get("playlist_tune", json!({"playlist_ref": "P2", "tune_ref": "T1"}))
        .is_some());
    let playlist = b.get("playlist", json!({"playlist_id": "P2"})).unwrap();
    assert_eq!(playlist.get("name"), Some(&json!("v2")));
}

#[test]
fn test_concurrent_local_write_is_never_lost() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");
    let b = TestClient::new(&server, "u1", "device-b");

    // Give B something to pull so its cycle has an apply phase.
    for i in 0..50 {
        a.write(
            "tune",
            json!({"id": format!("T{}", i), "last_modified_at": "2025-01-01T08:00:00.000Z"}),
        );
    }
    a.sync_expect_success();
    pause();

    // A user write races B's sync cycle.
    let b = std::sync::Arc::new(b);
    let writer = {
        let b = std::sync::Arc::clone(&b);
        std::thread::spawn(move || {
            b.write("tune", json!({"id": "T-racer", "title": "while syncing"}));
        })
    };
    let result = b.sync();
    writer.join().unwrap();
    assert!(result.success, "errors: {:?}", result.errors);

    // Wherever the write landed relative to the suppression window, it was
    // captured (by trigger or backfill); at worst the next cycle delivers it.
    pause();
    b.sync();
    let on_server: i64 = server
        .lock()
        .query_row("SELECT COUNT(*) FROM tune WHERE id = 'T-racer'", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(on_server, 1);
}

#[test]
fn test_hard_delete_propagates_via_tombstone() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");
    let b = TestClient::new(&server, "u1", "device-b");

    a.write("tune", json!({"id": "T1", "last_modified_at": "2025-01-01T08:00:00.000Z"}));
    a.write(
        "playlist",
        json!({"playlist_id": "P1", "user_ref": "u1", "last_modified_at": "2025-01-01T08:00:00.000Z"}),
    );
    a.write(
        "daily_practice_queue",
        json!({
            "id": "Q1",
            "user_ref": "u1",
            "playlist_ref": "P1",
            "tune_ref": "T1",
            "queue_date": "2025-01-01T00:00:00.000Z",
            "last_modified_at": "2025-01-01T08:00:00.000Z"
        }),
    );
    a.sync_expect_success();
    pause();
    b.sync_expect_success();
    assert!(b.get("daily_practice_queue", json!({"id": "Q1"})).is_some());
    pause();

    // Queue snapshots hard-delete; B reconciles via the synthetic marker.
    a.hard_delete("daily_practice_queue", json!({"id": "Q1"}));
    a.sync_expect_success();
    pause();
    b.sync_expect_success();
    assert!(b.get("daily_practice_queue", json!({"id": "Q1"})).is_none());
    let on_server: i64 = server
        .lock()
        .query_row("SELECT COUNT(*) FROM daily_practice_queue", [], |r| r.get(0))
        .unwrap();
    assert_eq!(on_server, 0);
}

#[test]
fn test_reference_data_arrives_on_first_sync() {
    init_logging();
    let server = TestServer::new();
    server.seed_genre("irish", "Irish");
    server.seed_genre("scottish", "Scottish");
    let a = TestClient::new(&server, "u1", "device-a");
    a.sync_expect_success();
    assert!(a.get("genre", json!({"id": "irish"})).is_some());
    assert!(a.get("genre", json!({"id": "scottish"})).is_some());
}

#[test]
fn test_users_are_isolated() {
    init_logging();
    let server = TestServer::new();
    let alice = TestClient::new(&server, "alice", "device-a");
    let bob = TestClient::new(&server, "bob", "device-b");

    alice.write(
        "playlist",
        json!({"playlist_id": "P-alice", "user_ref": "alice", "last_modified_at": "2025-01-01T08:00:00.000Z"}),
    );
    alice.write(
        "note",
        json!({"id": "N-alice", "user_ref": "alice", "note_text": "private", "last_modified_at": "2025-01-01T08:00:00.000Z"}),
    );
    alice.sync_expect_success();
    pause();

    bob.sync_expect_success();
    assert!(bob.get("playlist", json!({"playlist_id": "P-alice"})).is_none());
    assert!(bob.get("note", json!({"id": "N-alice"})).is_none());

    // And bob cannot push into alice's data; the entry parks as failed
    // after its retries instead of wedging the queue.
    bob.write(
        "playlist",
        json!({"playlist_id": "P-alice", "user_ref": "alice", "last_modified_at": "2025-01-01T09:00:00.000Z"}),
    );
    for _ in 0..3 {
        pause();
        bob.sync();
    }
    let stats = bob.store.lock_db().get_stats().unwrap();
    assert_eq!(stats.failed, 1);
    let name_check: i64 = server
        .lock()
        .query_row(
            "SELECT COUNT(*) FROM playlist WHERE playlistId = 'P-alice' AND userRef = 'alice'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(name_check, 1);
}

#[test]
fn test_watermark_is_monotone() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");
    let mut last = String::new();
    for i in 0..4 {
        a.write(
            "tune",
            json!({"id": format!("T{}", i)}),
        );
        a.sync_expect_success();
        let watermark = a.watermark().expect("watermark");
        assert!(watermark >= last, "{} < {}", watermark, last);
        last = watermark;
        pause();
    }
}
