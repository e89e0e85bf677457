/* Any copyright is dedicated to the Public Domain.
http://creativecommons.org/publicdomain/zero/1.0/ */

//! Property-flavored tests: randomized histories checked against the
//! universal sync properties.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use sync_test::{comparable, init_logging, TestClient, TestServer};

fn pause() {
    std::thread::sleep(std::time::Duration::from_millis(5));
}

/// Every committed local write appends exactly one outbox entry (P1).
#[test]
fn test_outbox_integrity_under_random_writes() {
    init_logging();
    let server = TestServer::new();
    // More history than one default batch, drained over several cycles.
    let client = TestClient::new(&server, "u1", "device-a");
    let mut rng = StdRng::seed_from_u64(0x7475_6e65);

    let mut writes = 0i64;
    for i in 0..200 {
        match rng.gen_range(0..10) {
            // Mostly writes, some updates of existing rows, a few deletes.
            0..=5 => {
                client.write("tune", json!({"id": format!("T{}", rng.gen_range(0..40))}));
                writes += 1;
            }
            6..=7 => {
                client.write(
                    "note",
                    json!({
                        "id": format!("N{}", rng.gen_range(0..20)),
                        "user_ref": "u1",
                        "note_text": format!("note {}", i)
                    }),
                );
                writes += 1;
            }
            8 => {
                let id = format!("T{}", rng.gen_range(0..40));
                if client.get("tune", json!({"id": id})).is_some() {
                    client.soft_delete("tune", json!({"id": id}));
                    writes += 1;
                }
            }
            _ => {
                let id = format!("N{}", rng.gen_range(0..20));
                if client.get("note", json!({"id": id})).is_some() {
                    client.hard_delete("note", json!({"id": id}));
                    writes += 1;
                }
            }
        }
    }
    let stats = client.store.lock_db().get_stats().unwrap();
    assert_eq!(stats.pending, writes);
    assert_eq!(stats.total, writes);

    // And successful cycles drain every one of them, batch by batch.
    for _ in 0..4 {
        let result = client.sync();
        assert!(result.success, "errors: {:?}", result.errors);
        if client.store.lock_db().get_stats().unwrap().total == 0 {
            break;
        }
        pause();
    }
    assert_eq!(client.store.lock_db().get_stats().unwrap().total, 0);
}

/// Interleaved writes on two devices converge to the same rows (P2/P3).
#[test]
fn test_two_devices_converge_under_random_interleaving() {
    init_logging();
    let server = TestServer::new();
    let a = TestClient::new(&server, "u1", "device-a");
    let b = TestClient::new(&server, "u1", "device-b");
    let mut rng = StdRng::seed_from_u64(0x6a69_6773);

    // Distinct, strictly increasing instants so last-write-wins has a
    // deterministic answer.
    let mut clock = 0u64;
    let mut stamp = move || {
        clock += 1;
        format!("2025-01-01T10:00:{:02}.{:03}Z", clock / 1000, clock % 1000)
    };

    for round in 0..8 {
        for _ in 0..10 {
            let id = format!("T{}", rng.gen_range(0..12));
            let title = format!("title-{}", rng.gen_range(0..1000));
            let on_a: bool = rng.gen();
            let device = if on_a { &a } else { &b };
            device.write(
                "tune",
                json!({"id": id, "title": title, "last_modified_at": stamp()}),
            );
        }
        // Random sync order each round.
        let (first, second) = if rng.gen() { (&a, &b) } else { (&b, &a) };
        first.sync_expect_success();
        pause();
        second.sync_expect_success();
        pause();
        log::debug!("round {} complete", round);
    }
    // One more pass so the earlier-syncing device sees the later pushes.
    a.sync_expect_success();
    pause();
    b.sync_expect_success();
    pause();
    a.sync_expect_success();

    for i in 0..12 {
        let id = format!("T{}", i);
        let on_a = a.get("tune", json!({"id": &id})).map(comparable);
        let on_b = b.get("tune", json!({"id": &id})).map(comparable);
        assert_eq!(on_a, on_b, "device divergence on {}", id);
    }
}

/// The watermark never regresses, even across mode changes (P5).
#[test]
fn test_watermark_never_decreases() {
    init_logging();
    let server = TestServer::new();
    let client = TestClient::new(&server, "u1", "device-a");
    let mut rng = StdRng::seed_from_u64(42);
    let mut previous = String::new();
    for _ in 0..6 {
        if rng.gen() {
            client.write("tune", json!({"id": format!("T{}", rng.gen_range(0..5))}));
        }
        let result = client.sync();
        assert!(result.success);
        let watermark = client.watermark().unwrap_or_default();
        assert!(
            watermark >= previous,
            "watermark regressed: {} -> {}",
            previous,
            watermark
        );
        previous = watermark;
        pause();
    }
}
