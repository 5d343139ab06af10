// =============================================================================
// State Store — checksummed single-row persistence with WAL recovery
// =============================================================================
//
// One SQLite database per engine symbol. The engine's entire durable state
// lives in a single row (`id = 1`, enforced by schema): a JSON payload plus a
// SHA-256 checksum computed over the payload bytes. `load_state` recomputes
// the checksum and refuses to return corrupted data — operator intervention,
// never silent repair.
//
// WAL journal mode gives crash-safe recovery on reopen.
//
// The same database hosts the `workflow_steps` table used by the two-leg
// executor and the portfolio controller to checkpoint durable workflows.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::slot::InventorySlot;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS engine_state (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    data          TEXT NOT NULL,
    checksum      TEXT NOT NULL,
    updated_at_ns INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_steps (
    workflow_id     TEXT NOT NULL,
    step            TEXT NOT NULL,
    payload         TEXT NOT NULL,
    completed_at_ns INTEGER NOT NULL,
    PRIMARY KEY (workflow_id, step)
);
"#;

// ---------------------------------------------------------------------------
// Persisted state payload
// ---------------------------------------------------------------------------

/// The engine's complete durable state. The checksum lives in its own table
/// column and is computed over the serialized form of this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Monotonically increasing; a save with a lower version is rejected.
    pub version: u64,
    pub symbol: String,
    pub last_price: Decimal,
    pub last_update_time_ns: i64,
    pub slots: BTreeMap<String, InventorySlot>,
}

impl PersistedState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            version: 0,
            symbol: symbol.into(),
            last_price: Decimal::ZERO,
            last_update_time_ns: 0,
            slots: BTreeMap::new(),
        }
    }
}

/// Hex-encoded SHA-256 of the payload bytes.
fn checksum_of(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Crash-safe store for one engine's [`PersistedState`].
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open state db at {}", path.display()))?;
        Self::init(conn, &path.display().to_string())
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory state db")?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        // WAL survives process crash; NORMAL sync is durable enough with WAL.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous pragma")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply state store schema")?;
        info!(path = %label, "state store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // State persistence
    // -------------------------------------------------------------------------

    /// Atomically overwrite the single state row.
    ///
    /// Rejects version regressions so a stale writer can never clobber newer
    /// durable state.
    pub fn save_state(&self, state: &PersistedState) -> Result<()> {
        let data = serde_json::to_string(state).context("failed to serialize persisted state")?;
        let checksum = checksum_of(&data);
        let now_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .context("failed to begin save transaction")?;

        let existing_version: Option<u64> = tx
            .query_row("SELECT data FROM engine_state WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .map(|raw| {
                serde_json::from_str::<PersistedState>(&raw)
                    .map(|s| s.version)
                    .unwrap_or(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("failed to read existing state version")?;

        if let Some(existing) = existing_version {
            if state.version <= existing {
                anyhow::bail!(
                    "state version regression: attempted {} over existing {}",
                    state.version,
                    existing
                );
            }
        }

        tx.execute(
            "INSERT INTO engine_state (id, data, checksum, updated_at_ns)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET
                 data = excluded.data,
                 checksum = excluded.checksum,
                 updated_at_ns = excluded.updated_at_ns",
            params![data, checksum, now_ns],
        )
        .context("failed to write state row")?;

        tx.commit().context("failed to commit state save")?;

        debug!(
            symbol = %state.symbol,
            version = state.version,
            slots = state.slots.len(),
            "state persisted"
        );
        Ok(())
    }

    /// Load the state row, verifying its checksum.
    ///
    /// Returns `Ok(None)` when no state has ever been saved. A checksum
    /// mismatch is a hard error: the engine must refuse to start.
    pub fn load_state(&self) -> Result<Option<PersistedState>> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT data, checksum FROM engine_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("failed to read state row")?;

        let Some((data, stored_checksum)) = row else {
            return Ok(None);
        };

        let actual = checksum_of(&data);
        if actual != stored_checksum {
            anyhow::bail!(
                "state checksum mismatch — data corruption (stored {stored_checksum}, computed {actual})"
            );
        }

        let state: PersistedState =
            serde_json::from_str(&data).context("failed to deserialize persisted state")?;
        Ok(Some(state))
    }

    // -------------------------------------------------------------------------
    // Workflow checkpoints
    // -------------------------------------------------------------------------

    /// Record completion of a workflow step (idempotent per (id, step)).
    pub fn record_step(
        &self,
        workflow_id: &str,
        step: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let now_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        self.conn
            .lock()
            .execute(
                "INSERT INTO workflow_steps (workflow_id, step, payload, completed_at_ns)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (workflow_id, step) DO UPDATE SET
                     payload = excluded.payload,
                     completed_at_ns = excluded.completed_at_ns",
                params![workflow_id, step, payload.to_string(), now_ns],
            )
            .with_context(|| format!("failed to record workflow step {workflow_id}/{step}"))?;
        Ok(())
    }

    /// Payload of a completed step, if it ran.
    pub fn get_step(&self, workflow_id: &str, step: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload FROM workflow_steps WHERE workflow_id = ?1 AND step = ?2",
                params![workflow_id, step],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("failed to read workflow step")?;

        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).context("failed to parse workflow step payload")?,
            )),
            None => Ok(None),
        }
    }

    /// Delete every checkpoint of a finished workflow.
    pub fn clear_workflow(&self, workflow_id: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM workflow_steps WHERE workflow_id = ?1",
                params![workflow_id],
            )
            .with_context(|| format!("failed to clear workflow {workflow_id}"))?;
        Ok(())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::InventorySlot;
    use rust_decimal_macros::dec;

    fn sample_state(version: u64) -> PersistedState {
        let mut state = PersistedState::new("BTCUSDT");
        state.version = version;
        state.last_price = dec!(45000);
        state.last_update_time_ns = 1_700_000_000_000_000_000;
        let slot = InventorySlot::new(dec!(44990));
        state.slots.insert(slot.key(), slot);
        state
    }

    #[test]
    fn save_load_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.load_state().unwrap().is_none());

        let state = sample_state(1);
        store.save_state(&state).unwrap();

        let loaded = store.load_state().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn save_overwrites_single_row() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_state(&sample_state(1)).unwrap();
        let mut second = sample_state(2);
        second.last_price = dec!(45010);
        store.save_state(&second).unwrap();

        let loaded = store.load_state().unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.last_price, dec!(45010));

        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM engine_state", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn version_regression_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_state(&sample_state(5)).unwrap();
        let err = store.save_state(&sample_state(5)).unwrap_err();
        assert!(err.to_string().contains("version regression"));
        let err = store.save_state(&sample_state(3)).unwrap_err();
        assert!(err.to_string().contains("version regression"));
    }

    #[test]
    fn corrupted_payload_fails_load() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_state(&sample_state(1)).unwrap();

        // Tamper with the payload behind the checksum's back.
        store
            .conn
            .lock()
            .execute(
                "UPDATE engine_state SET data = replace(data, '45000', '99999') WHERE id = 1",
                [],
            )
            .unwrap();

        let err = store.load_state().unwrap_err();
        assert!(err.to_string().contains("data corruption"), "{err}");
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTCUSDT.db");

        {
            let store = StateStore::open(&path).unwrap();
            store.save_state(&sample_state(7)).unwrap();
            // Dropped here — simulates process death after a committed save.
        }

        let store = StateStore::open(&path).unwrap();
        let loaded = store.load_state().unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.slots.len(), 1);
    }

    #[test]
    fn workflow_steps_checkpoint_and_clear() {
        let store = StateStore::open_in_memory().unwrap();
        let wf = "twoleg-abc";

        assert!(store.get_step(wf, "spot_leg").unwrap().is_none());

        let payload = serde_json::json!({ "executed_qty": "0.8" });
        store.record_step(wf, "spot_leg", &payload).unwrap();
        let loaded = store.get_step(wf, "spot_leg").unwrap().unwrap();
        assert_eq!(loaded["executed_qty"], "0.8");

        // Idempotent overwrite.
        store.record_step(wf, "spot_leg", &payload).unwrap();

        store.clear_workflow(wf).unwrap();
        assert!(store.get_step(wf, "spot_leg").unwrap().is_none());
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = checksum_of("payload");
        let b = checksum_of("payload");
        let c = checksum_of("payload!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
