/* Any copyright is dedicated to the Public Domain.
http://creativecommons.org/publicdomain/zero/1.0/ */

//! Harness for end-to-end sync tests: any number of simulated devices
//! sharing one in-process mediator over a direct transport, so whole
//! multi-device histories run in a single test body with no network.

use parking_lot::{Mutex, MutexGuard};
use practice_store::sync::TransportError;
use practice_store::{
    PracticeStore, SyncCycleResult, SyncEngine, SyncEngineConfig, SyncTransport,
};
use rusqlite::Connection;
use std::sync::Arc;
use sync_mediator::MediatorConfig;
use tunesync::{get_table, JsonMap, SyncRequest, SyncResponse};

pub fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", "warn"),
    )
    .is_test(true)
    .try_init();
}

pub fn obj(value: serde_json::Value) -> JsonMap {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// The central store plus mediator config, shared by every test device.
pub struct TestServer {
    conn: Arc<Mutex<Connection>>,
    config: MediatorConfig,
}

impl TestServer {
    pub fn new() -> Self {
        Self {
            conn: Arc::new(Mutex::new(
                sync_mediator::schema::open_in_memory().expect("central schema"),
            )),
            config: MediatorConfig::new("sync-test-secret"),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn transport_for(&self, user: &str) -> DirectTransport {
        DirectTransport {
            conn: Arc::clone(&self.conn),
            config: self.config.clone(),
            user: user.to_string(),
        }
    }

    /// Seed a reference-data row, the way an operator would.
    pub fn seed_genre(&self, id: &str, name: &str) {
        self.lock()
            .execute(
                "INSERT OR IGNORE INTO genre (id, name) VALUES (?, ?)",
                [id, name],
            )
            .expect("seed genre");
    }
}

impl Default for TestServer {
    fn default() -> Self {
        Self::new()
    }
}

/// A transport that skips HTTP and calls the mediator core directly, as an
/// already-authenticated user.
pub struct DirectTransport {
    conn: Arc<Mutex<Connection>>,
    config: MediatorConfig,
    user: String,
}

impl SyncTransport for DirectTransport {
    fn round_trip(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        let conn = self.conn.lock();
        sync_mediator::apply_sync(&conn, &self.user, request, &self.config)
            .map_err(|e| TransportError::Network(e.to_string()))
    }
}

/// One simulated device: a store plus an engine wired to the shared server.
pub struct TestClient {
    pub store: Arc<PracticeStore>,
    engine: SyncEngine,
    pub user: String,
    pub device: String,
}

impl TestClient {
    pub fn new(server: &TestServer, user: &str, device: &str) -> Self {
        Self::with_config(server, user, device, SyncEngineConfig::default())
    }

    pub fn with_config(
        server: &TestServer,
        user: &str,
        device: &str,
        config: SyncEngineConfig,
    ) -> Self {
        let store = Arc::new(PracticeStore::new_in_memory(device).expect("client store"));
        let engine = SyncEngine::with_config(
            Arc::clone(&store),
            Box::new(server.transport_for(user)),
            user,
            device,
            config,
        );
        Self {
            store,
            engine,
            user: user.to_string(),
            device: device.to_string(),
        }
    }

    pub fn sync(&self) -> SyncCycleResult {
        let result = self.engine.sync();
        log::debug!(
            "{}: synced={} failed={} conflicts={} errors={:?}",
            self.device,
            result.items_synced,
            result.items_failed,
            result.conflicts,
            result.errors
        );
        result
    }

    pub fn sync_expect_success(&self) -> SyncCycleResult {
        let result = self.sync();
        assert!(
            result.success && result.errors.is_empty(),
            "{}: sync cycle reported problems: {:?}",
            self.device,
            result.errors
        );
        result
    }

    pub fn watermark(&self) -> Option<String> {
        self.engine.last_sync_at()
    }

    pub fn write(&self, table: &str, data: serde_json::Value) -> String {
        self.store
            .lock_db()
            .write_row(table, obj(data))
            .expect("local write")
    }

    pub fn soft_delete(&self, table: &str, pk: serde_json::Value) {
        self.store
            .lock_db()
            .soft_delete_row(table, &obj(pk))
            .expect("soft delete")
    }

    pub fn hard_delete(&self, table: &str, pk: serde_json::Value) {
        self.store
            .lock_db()
            .delete_row(table, &obj(pk))
            .expect("hard delete")
    }

    pub fn get(&self, table: &str, pk: serde_json::Value) -> Option<JsonMap> {
        let info = get_table(table).expect("registered table");
        self.store
            .lock_db()
            .get_row(info, &obj(pk))
            .expect("row read")
    }

    pub fn pending_count(&self) -> i64 {
        self.store.lock_db().get_stats().expect("stats").pending
    }
}

/// Strip the columns that legitimately differ between devices before
/// comparing rows for convergence.
pub fn comparable(mut row: JsonMap) -> JsonMap {
    row.remove("sync_version");
    row.remove("device_id");
    row
}
