//! Database persistence layer for ForkLedger

use crate::blockchain::TreeNode;
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crate::state_table::{AssetStateTable, TransactionStateTable};
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Tree nodes kept hot by [`Database`]; the frontier and its recent
/// ancestors are read on every append.
const NODE_CACHE_SIZE: usize = 256;

/// Derived state as of the last successfully appended block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedState {
    pub assets: Vec<AssetStateTable>,
    pub fingerprints: TransactionStateTable,
}

/// Abstraction for persistence backends.
///
/// Tree nodes are addressed by `(height, node_id)`. A saved node must be
/// loadable by that key and a deleted node must no longer be listed.
/// `save_committed_state` replaces the previous snapshot atomically.
pub trait Persistence: Send + Sync {
    fn save_node(&self, node: &TreeNode) -> Result<(), ChainError>;
    fn delete_node(&self, height: u64, node_id: u64) -> Result<(), ChainError>;
    fn load_node(&self, height: u64, node_id: u64) -> Result<Option<TreeNode>, ChainError>;
    fn list_node_ids(&self, height: u64) -> Result<Vec<u64>, ChainError>;
    /// Greatest stored height, `None` for an empty store.
    fn max_height(&self) -> Result<Option<u64>, ChainError>;
    fn max_node_id(&self) -> Result<Option<u64>, ChainError>;
    fn save_committed_state(&self, state: &CommittedState) -> Result<(), ChainError>;
    fn load_committed_state(&self) -> Result<Option<CommittedState>, ChainError>;
}

pub struct Database {
    conn: Mutex<Connection>,
    nodes: Mutex<LruCache<(u64, u64), TreeNode>>,
}

fn poisoned<T>(_: T) -> ChainError {
    ChainError::DatabaseError("Mutex poisoned".to_string())
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tree_nodes (
                height INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                node_data TEXT NOT NULL,
                PRIMARY KEY (height, node_id)
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create tree_nodes table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS asset_tables (
                asset_name TEXT PRIMARY KEY,
                table_data TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create asset_tables table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tx_fingerprints (
                hash BLOB PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create tx_fingerprints table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create metadata table: {}", e)))?;

        let capacity = NonZeroUsize::new(NODE_CACHE_SIZE)
            .ok_or_else(|| ChainError::DatabaseError("Node cache size must be non-zero".to_string()))?;

        Ok(Database {
            conn: Mutex::new(conn),
            nodes: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn cache_put(&self, node: &TreeNode) -> Result<(), ChainError> {
        let mut cache = self.nodes.lock().map_err(poisoned)?;
        cache.put((node.height(), node.id), node.clone());
        Ok(())
    }
}

impl Persistence for Database {
    fn save_node(&self, node: &TreeNode) -> Result<(), ChainError> {
        let node_json = serde_json::to_string(node)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to serialize tree node: {}", e)))?;

        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO tree_nodes (height, node_id, node_data) VALUES (?1, ?2, ?3)",
            params![node.height() as i64, node.id as i64, node_json],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save tree node: {}", e)))?;
        drop(conn);

        self.cache_put(node)
    }

    fn delete_node(&self, height: u64, node_id: u64) -> Result<(), ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "DELETE FROM tree_nodes WHERE height = ?1 AND node_id = ?2",
            params![height as i64, node_id as i64],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to delete tree node: {}", e)))?;
        drop(conn);

        let mut cache = self.nodes.lock().map_err(poisoned)?;
        cache.pop(&(height, node_id));
        Ok(())
    }

    fn load_node(&self, height: u64, node_id: u64) -> Result<Option<TreeNode>, ChainError> {
        if let Some(node) = self.nodes.lock().map_err(poisoned)?.get(&(height, node_id)) {
            return Ok(Some(node.clone()));
        }

        let conn = self.conn.lock().map_err(poisoned)?;
        let node_json: Option<String> = conn
            .query_row(
                "SELECT node_data FROM tree_nodes WHERE height = ?1 AND node_id = ?2",
                params![height as i64, node_id as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to load tree node: {}", e)))?;
        drop(conn);

        let Some(node_json) = node_json else {
            return Ok(None);
        };
        let node: TreeNode = serde_json::from_str(&node_json)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to deserialize tree node: {}", e)))?;
        self.cache_put(&node)?;
        Ok(Some(node))
    }

    fn list_node_ids(&self, height: u64) -> Result<Vec<u64>, ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn
            .prepare("SELECT node_id FROM tree_nodes WHERE height = ?1 ORDER BY node_id ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![height as i64], |row| row.get::<_, i64>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query node ids: {}", e)))?;

        let mut ids = Vec::new();
        for row in rows {
            let id = row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            ids.push(id as u64);
        }
        Ok(ids)
    }

    fn max_height(&self) -> Result<Option<u64>, ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let height: Option<i64> = conn
            .query_row("SELECT MAX(height) FROM tree_nodes", [], |row| row.get(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query max height: {}", e)))?;
        Ok(height.map(|h| h as u64))
    }

    fn max_node_id(&self) -> Result<Option<u64>, ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let id: Option<i64> = conn
            .query_row("SELECT MAX(node_id) FROM tree_nodes", [], |row| row.get(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query max node id: {}", e)))?;
        Ok(id.map(|id| id as u64))
    }

    /// Replaces asset tables and fingerprints in one SQLite transaction.
    fn save_committed_state(&self, state: &CommittedState) -> Result<(), ChainError> {
        let conn_guard = self.conn.lock().map_err(poisoned)?;
        let tx = conn_guard.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        tx.execute("DELETE FROM asset_tables", [])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to clear asset_tables: {}", e)))?;
        for table in &state.assets {
            let table_json = serde_json::to_string(table).map_err(|e| {
                ChainError::DatabaseError(format!("Failed to serialize asset table: {}", e))
            })?;
            tx.execute(
                "INSERT INTO asset_tables (asset_name, table_data) VALUES (?1, ?2)",
                params![table.asset_name(), table_json],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save asset table: {}", e)))?;
        }

        tx.execute("DELETE FROM tx_fingerprints", [])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to clear tx_fingerprints: {}", e)))?;
        for hash in state.fingerprints.iter() {
            tx.execute(
                "INSERT INTO tx_fingerprints (hash) VALUES (?1)",
                params![hash.to_vec()],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save fingerprint: {}", e)))?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('committed_state', '1')",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save metadata: {}", e)))?;

        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(())
    }

    fn load_committed_state(&self) -> Result<Option<CommittedState>, ChainError> {
        let conn_guard = self.conn.lock().map_err(poisoned)?;

        let marker: Option<String> = conn_guard
            .query_row(
                "SELECT value FROM metadata WHERE key = 'committed_state'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to read metadata: {}", e)))?;
        if marker.is_none() {
            return Ok(None);
        }

        let mut stmt = conn_guard
            .prepare("SELECT table_data FROM asset_tables ORDER BY asset_name ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query asset tables: {}", e)))?;

        let mut assets = Vec::new();
        for row in rows {
            let table_json =
                row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            let table: AssetStateTable = serde_json::from_str(&table_json).map_err(|e| {
                ChainError::DatabaseError(format!("Failed to deserialize asset table: {}", e))
            })?;
            assets.push(table);
        }

        let mut stmt = conn_guard
            .prepare("SELECT hash FROM tx_fingerprints")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query fingerprints: {}", e)))?;

        let mut hashes = Vec::new();
        for row in rows {
            let bytes = row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            let hash: Sha256Hash = bytes.as_slice().try_into().map_err(|_| {
                ChainError::DatabaseError(format!("Stored fingerprint has {} bytes", bytes.len()))
            })?;
            hashes.push(hash);
        }

        Ok(Some(CommittedState {
            assets,
            fingerprints: TransactionStateTable::from_hashes(hashes),
        }))
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    nodes: Arc<Mutex<BTreeMap<(u64, u64), TreeNode>>>,
    committed: Arc<Mutex<Option<CommittedState>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().map(|nodes| nodes.len()).unwrap_or(0)
    }
}

impl Persistence for InMemoryPersistence {
    fn save_node(&self, node: &TreeNode) -> Result<(), ChainError> {
        let mut nodes = self.nodes.lock().map_err(poisoned)?;
        nodes.insert((node.height(), node.id), node.clone());
        Ok(())
    }

    fn delete_node(&self, height: u64, node_id: u64) -> Result<(), ChainError> {
        let mut nodes = self.nodes.lock().map_err(poisoned)?;
        nodes.remove(&(height, node_id));
        Ok(())
    }

    fn load_node(&self, height: u64, node_id: u64) -> Result<Option<TreeNode>, ChainError> {
        let nodes = self.nodes.lock().map_err(poisoned)?;
        Ok(nodes.get(&(height, node_id)).cloned())
    }

    fn list_node_ids(&self, height: u64) -> Result<Vec<u64>, ChainError> {
        let nodes = self.nodes.lock().map_err(poisoned)?;
        Ok(nodes
            .range((height, 0)..=(height, u64::MAX))
            .map(|((_, id), _)| *id)
            .collect())
    }

    fn max_height(&self) -> Result<Option<u64>, ChainError> {
        let nodes = self.nodes.lock().map_err(poisoned)?;
        Ok(nodes.keys().next_back().map(|(height, _)| *height))
    }

    fn max_node_id(&self) -> Result<Option<u64>, ChainError> {
        let nodes = self.nodes.lock().map_err(poisoned)?;
        Ok(nodes.keys().map(|(_, id)| *id).max())
    }

    fn save_committed_state(&self, state: &CommittedState) -> Result<(), ChainError> {
        let mut committed = self.committed.lock().map_err(poisoned)?;
        *committed = Some(state.clone());
        Ok(())
    }

    fn load_committed_state(&self) -> Result<Option<CommittedState>, ChainError> {
        let committed = self.committed.lock().map_err(poisoned)?;
        Ok(committed.clone())
    }
}
