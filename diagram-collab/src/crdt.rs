//! Replicated diagram document on top of yrs.
//!
//! ## Layout
//!
//! ```text
//! Y.Doc
//! ├── "nodes": Y.Map<element key, JSON string>
//! ├── "edges": Y.Map<element key, JSON string>
//! └── "meta":  Y.Map { "title": string }
//! ```
//!
//! Elements are keyed by their `"id"` field (falling back to `#<index>`), so
//! two clients editing different nodes touch different map entries and merge
//! cleanly. Each entry stores `{"order": i, "value": <element>}`; reading the
//! document sorts by that order to keep the canvas's element ordering stable.
//!
//! Writes go through [`DiagramDoc::apply_snapshot`], which compares the
//! incoming snapshot against the document and only touches entries that
//! actually changed. The returned bytes are the yrs v1 update for exactly
//! those changes.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{json, Value};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update, WriteTxn,
};

use crate::protocol::DiagramSnapshot;

const NODES: &str = "nodes";
const EDGES: &str = "edges";
const META: &str = "meta";
const TITLE: &str = "title";

/// Errors from the replicated document.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabError {
    /// yrs rejected an update or state vector.
    Yrs(String),
    /// An element could not be encoded for storage.
    Serialization(String),
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yrs(e) => write!(f, "CRDT error: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

pub struct DiagramDoc {
    doc: Doc,
}

impl Default for DiagramDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagramDoc {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Write `snapshot` into the document as a minimal set of changes.
    ///
    /// Returns the encoded update, or `None` if the document already matched.
    pub fn apply_snapshot(&self, snapshot: &DiagramSnapshot) -> Result<Option<Vec<u8>>, CollabError> {
        let mut txn = self.doc.transact_mut();
        let nodes = txn.get_or_insert_map(NODES);
        let edges = txn.get_or_insert_map(EDGES);
        let meta = txn.get_or_insert_map(META);

        let mut changed = sync_elements(&mut txn, &nodes, &snapshot.nodes)?;
        changed |= sync_elements(&mut txn, &edges, &snapshot.edges)?;

        let current_title = match meta.get(&txn, TITLE) {
            Some(Out::Any(Any::String(s))) => Some(s.to_string()),
            _ => None,
        };
        if current_title != snapshot.title {
            match &snapshot.title {
                Some(title) => {
                    meta.insert(&mut txn, TITLE, Any::String(title.as_str().into()));
                }
                None => {
                    meta.remove(&mut txn, TITLE);
                }
            }
            changed = true;
        }

        if !changed {
            return Ok(None);
        }
        Ok(Some(txn.encode_update_v1()))
    }

    /// Merge an update produced by another replica.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), CollabError> {
        let update = Update::decode_v1(update).map_err(|e| CollabError::Yrs(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::Yrs(e.to_string()))
    }

    /// Read the document back as a snapshot.
    pub fn snapshot(&self) -> DiagramSnapshot {
        let txn = self.doc.transact();
        let nodes = txn.get_map(NODES).map(|m| read_elements(&txn, &m)).unwrap_or_default();
        let edges = txn.get_map(EDGES).map(|m| read_elements(&txn, &m)).unwrap_or_default();
        let title = txn.get_map(META).and_then(|m| match m.get(&txn, TITLE) {
            Some(Out::Any(Any::String(s))) => Some(s.to_string()),
            _ => None,
        });
        DiagramSnapshot { nodes, edges, title }
    }

    /// Encoded state vector, sent as `SyncStep1`.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything a replica with `state_vector` is missing, sent as `SyncStep2`.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let remote = StateVector::decode_v1(state_vector).map_err(|e| CollabError::Yrs(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }
}

pub(crate) fn element_key(value: &Value, index: usize) -> String {
    match value.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => format!("#{index}"),
    }
}

/// Bring `map` in line with `elements`. Returns `true` if anything changed.
fn sync_elements(
    txn: &mut TransactionMut,
    map: &MapRef,
    elements: &[Value],
) -> Result<bool, CollabError> {
    let mut desired: HashMap<String, String> = HashMap::with_capacity(elements.len());
    for (index, value) in elements.iter().enumerate() {
        let stored = serde_json::to_string(&json!({ "order": index, "value": value }))
            .map_err(|e| CollabError::Serialization(e.to_string()))?;
        desired.insert(element_key(value, index), stored);
    }

    let existing: HashMap<String, Option<String>> = map
        .iter(&*txn)
        .map(|(key, out)| {
            let stored = match out {
                Out::Any(Any::String(s)) => Some(s.to_string()),
                _ => None,
            };
            (key.to_string(), stored)
        })
        .collect();

    let mut changed = false;
    for key in existing.keys() {
        if !desired.contains_key(key) {
            map.remove(txn, key);
            changed = true;
        }
    }
    for (key, stored) in desired {
        if existing.get(&key).and_then(|s| s.as_deref()) == Some(stored.as_str()) {
            continue;
        }
        map.insert(txn, key, Any::String(stored.into()));
        changed = true;
    }
    Ok(changed)
}

fn read_elements<T: ReadTxn>(txn: &T, map: &MapRef) -> Vec<Value> {
    let mut entries: Vec<(u64, String, Value)> = Vec::new();
    for (key, out) in map.iter(txn) {
        let Out::Any(Any::String(stored)) = out else {
            continue;
        };
        match serde_json::from_str::<Value>(&stored) {
            Ok(mut entry) => {
                let order = entry.get("order").and_then(Value::as_u64).unwrap_or(u64::MAX);
                let value = entry.get_mut("value").map(Value::take).unwrap_or(Value::Null);
                entries.push((order, key.to_string(), value));
            }
            Err(e) => log::warn!("Skipping unreadable element {key}: {e}"),
        }
    }
    entries.sort_by(|a, b| match a.0.cmp(&b.0) {
        Ordering::Equal => a.1.cmp(&b.1),
        other => other,
    });
    entries.into_iter().map(|(_, _, value)| value).collect()
}
