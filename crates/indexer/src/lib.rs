//! Per-GVK object/field/event tables and the mutation ops that keep them,
//! the ring, and decoding in lockstep.

#![forbid(unsafe_code)]

mod event;
mod tables;

pub use event::{EventKind, EventRecord};
pub use tables::TableNames;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use serde_json::Value as Json;
use steve_core::{FieldPath, Gvk};
use steve_ring::{Ring, RingReader};
use steve_sql::{Connection, Encoder, KeyRegistry, QueryError, SqlResult};
use tracing::{debug, info};

/// How a GVK's tables should be indexed and protected at rest, decided once
/// at `register` time by the schema/cache-factory layer.
#[derive(Clone)]
pub struct GvkConfig {
    pub ring_capacity: usize,
    /// `(column name in the fields table, path to extract)` — typically the
    /// GVK's declared print columns plus `metadata.labels.*` entries the
    /// query planner needs indexed.
    pub indexed_fields: Vec<(String, FieldPath)>,
    pub encrypt: bool,
}

impl Default for GvkConfig {
    fn default() -> Self {
        Self { ring_capacity: 4096, indexed_fields: Vec::new(), encrypt: false }
    }
}

struct GvkState {
    tables: TableNames,
    ring: Arc<Ring<EventRecord>>,
    config: GvkConfig,
}

/// Owns every per-GVK table set, the shared SQLite connection, and the
/// codec/encryption used to (de)serialize object blobs.
pub struct Indexer {
    conn: Arc<Connection>,
    encoder: Arc<Encoder>,
    keys: Option<Arc<KeyRegistry>>,
    gvks: Mutex<HashMap<Gvk, GvkState>>,
}

impl Indexer {
    pub fn new(conn: Arc<Connection>, encoder: Arc<Encoder>, keys: Option<Arc<KeyRegistry>>) -> Self {
        Self { conn, encoder, keys, gvks: Mutex::new(HashMap::new()) }
    }

    /// Creates the three tables for `gvk` and a fresh event ring. Idempotent
    /// for tables (`CREATE TABLE IF NOT EXISTS`); replaces any prior
    /// in-process ring.
    pub fn register(&self, gvk: Gvk, config: GvkConfig) -> SqlResult<()> {
        let tables = TableNames::for_gvk(&gvk);
        self.conn.with_connection(|c| {
            c.execute_batch(&tables.create_ddl())
                .map_err(|e| QueryError::new("CREATE TABLE", e.to_string()))
        })?;
        let ring = Ring::new(config.ring_capacity);
        info!(gvk = %gvk, "indexer registered tables");
        self.gvks.lock().expect("indexer mutex poisoned").insert(gvk, GvkState { tables, ring, config });
        Ok(())
    }

    pub fn table_names(&self, gvk: &Gvk) -> Option<TableNames> {
        self.gvks.lock().expect("indexer mutex poisoned").get(gvk).map(|s| TableNames {
            objects: s.tables.objects.clone(),
            fields: s.tables.fields.clone(),
            events: s.tables.events.clone(),
        })
    }

    pub fn encoder(&self) -> Arc<Encoder> {
        Arc::clone(&self.encoder)
    }

    pub fn connection(&self) -> Arc<Connection> {
        Arc::clone(&self.conn)
    }

    /// A new reader over `gvk`'s event ring, positioned after `last_seq` (or
    /// at the current head if `None`). Returns `None` if the GVK isn't
    /// registered.
    pub fn ring_reader(&self, gvk: &Gvk, last_seq: Option<u64>) -> Option<RingReader<EventRecord>> {
        let guard = self.gvks.lock().expect("indexer mutex poisoned");
        guard.get(gvk).map(|s| s.ring.reader(last_seq))
    }

    fn with_state<R>(&self, gvk: &Gvk, f: impl FnOnce(&GvkState) -> SqlResult<R>) -> SqlResult<R> {
        let guard = self.gvks.lock().expect("indexer mutex poisoned");
        let state = guard
            .get(gvk)
            .ok_or_else(|| QueryError::new("INDEXER", format!("gvk {gvk} not registered")))?;
        f(state)
    }

    /// Insert-or-replace `obj` under `key`; appends one `add`/`change` event
    /// to `objects`/`fields`/`events` within a single transaction.
    pub fn upsert(&self, gvk: &Gvk, key: &str, obj: &Json) -> SqlResult<EventKind> {
        let started = std::time::Instant::now();
        let kind = self.with_state(gvk, |state| {
            let (blob, nonce, key_id) = self.encode_for_storage(obj, state.config.encrypt)?;
            self.conn.with_transaction(|tx| {
                let prev: Option<Vec<u8>> = tx
                    .query_row(
                        &format!("SELECT value FROM {} WHERE key = ?1", state.tables.objects),
                        [key],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| QueryError::new("SELECT objects", e.to_string()))?;
                let kind = if prev.is_some() { EventKind::Change } else { EventKind::Add };

                tx.execute(
                    &format!(
                        "INSERT INTO {} (key, value, nonce, key_id) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, nonce = excluded.nonce, key_id = excluded.key_id",
                        state.tables.objects
                    ),
                    rusqlite::params![key, blob, nonce, key_id],
                )
                .map_err(|e| QueryError::new("UPSERT objects", e.to_string()))?;

                tx.execute(&format!("DELETE FROM {} WHERE key = ?1", state.tables.fields), [key])
                    .map_err(|e| QueryError::new("DELETE fields", e.to_string()))?;
                let value_tree = steve_core::Value::from(obj.clone());
                for (column, path) in &state.config.indexed_fields {
                    if let Some(scalar) = path.get(&value_tree).and_then(steve_core::Value::scalar_string) {
                        tx.execute(
                            &format!("INSERT INTO {} (key, field, value) VALUES (?1, ?2, ?3)", state.tables.fields),
                            rusqlite::params![key, column, scalar],
                        )
                        .map_err(|e| QueryError::new("INSERT fields", e.to_string()))?;
                    }
                }

                tx.execute(
                    &format!(
                        "INSERT INTO {} (kind, key, value, prev_value, rv) VALUES (?1, ?2, ?3, ?4, ?5)",
                        state.tables.events
                    ),
                    rusqlite::params![kind.as_str(), key, blob, prev, obj.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str())],
                )
                .map_err(|e| QueryError::new("INSERT events", e.to_string()))?;

                Ok(kind)
            })
            .map(|kind| {
                let rv = obj.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str()).map(|s| s.to_string());
                state.ring.write_with(|seq| EventRecord {
                    seq,
                    kind,
                    key: key.to_string(),
                    object: Some(obj.clone()),
                    prev_object: None, // decoded lazily by readers; avoids decoding on the hot write path
                    rv,
                });
                kind
            })
        })?;
        histogram!("steve_indexer_upsert_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("steve_indexer_upsert_total", 1u64);
        Ok(kind)
    }

    /// Deletes `key`; appends one `remove` event carrying the prior value.
    pub fn delete(&self, gvk: &Gvk, key: &str) -> SqlResult<bool> {
        let found = self.with_state(gvk, |state| {
            let row = self.conn.with_transaction(|tx| {
                let prev: Option<(Vec<u8>, Option<Vec<u8>>, Option<u32>)> = tx
                    .query_row(
                        &format!("SELECT value, nonce, key_id FROM {} WHERE key = ?1", state.tables.objects),
                        [key],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()
                    .map_err(|e| QueryError::new("SELECT objects", e.to_string()))?;
                let Some((prev, nonce, key_id)) = prev else { return Ok(None) };

                tx.execute(&format!("DELETE FROM {} WHERE key = ?1", state.tables.objects), [key])
                    .map_err(|e| QueryError::new("DELETE objects", e.to_string()))?;
                tx.execute(
                    &format!("INSERT INTO {} (kind, key, value, prev_value, rv) VALUES ('remove', ?1, NULL, ?2, NULL)", state.tables.events),
                    rusqlite::params![key, prev],
                )
                .map_err(|e| QueryError::new("INSERT events", e.to_string()))?;
                Ok(Some((prev, nonce, key_id)))
            })?;

            let Some((prev, nonce, key_id)) = row else { return Ok(false) };
            let prev_object = self.decode_row(prev, nonce, key_id)?;
            state.ring.write_with(|seq| EventRecord {
                seq,
                kind: EventKind::Remove,
                key: key.to_string(),
                object: None,
                prev_object: Some(prev_object),
                rv: None,
            });
            Ok(true)
        })?;
        counter!("steve_indexer_delete_total", 1u64);
        Ok(found)
    }

    /// Diffs `objects` against the current key set within one transaction:
    /// keys no longer present are removed, the rest are upserted. Used after
    /// a full relist.
    pub fn replace_all(&self, gvk: &Gvk, objects: &HashMap<String, Json>, resource_version: &str) -> SqlResult<()> {
        let existing: Vec<String> = self.with_state(gvk, |state| {
            self.conn.with_connection(|c| {
                let mut stmt = c
                    .prepare(&format!("SELECT key FROM {}", state.tables.objects))
                    .map_err(|e| QueryError::new("PREPARE", e.to_string()))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|e| QueryError::new("SELECT keys", e.to_string()))?;
                rows.collect::<Result<Vec<_>, _>>().map_err(|e| QueryError::new("SELECT keys", e.to_string()))
            })
        })?;

        for key in existing {
            if !objects.contains_key(&key) {
                self.delete(gvk, &key)?;
            }
        }
        for (key, obj) in objects {
            self.upsert(gvk, key, obj)?;
        }
        debug!(gvk = %gvk, rv = resource_version, count = objects.len(), "replace_all complete");
        Ok(())
    }

    /// Streams `(key, value)` rows for an already-compiled, caller-owned SQL
    /// statement against any table (events, or objects when encryption is
    /// never in play). The query planner's declared-field scan uses
    /// [`Indexer::query_objects`] instead, which also carries the encryption
    /// columns.
    pub fn query_rows(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> SqlResult<Vec<(String, Vec<u8>)>> {
        self.conn.with_connection(|c| {
            let mut stmt = c.prepare(sql).map_err(|e| QueryError::new(sql, e.to_string()))?;
            let rows = stmt
                .query_map(params, |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))
                .map_err(|e| QueryError::new(sql, e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| QueryError::new(sql, e.to_string()))
        })
    }

    /// Like [`Indexer::query_rows`] but for a `SELECT o.key, o.value, o.nonce,
    /// o.key_id FROM <objects table> ...` statement — the shape the query
    /// planner's compiled SQL always projects. Returned rows still need
    /// [`Indexer::decode_row`] to become JSON.
    pub fn query_objects(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> SqlResult<Vec<(String, Vec<u8>, Option<Vec<u8>>, Option<u32>)>> {
        self.conn.with_connection(|c| {
            let mut stmt = c.prepare(sql).map_err(|e| QueryError::new(sql, e.to_string()))?;
            let rows = stmt
                .query_map(params, |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                        row.get::<_, Option<u32>>(3)?,
                    ))
                })
                .map_err(|e| QueryError::new(sql, e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| QueryError::new(sql, e.to_string()))
        })
    }

    /// Decrypts (if `nonce`/`key_id` are present) and decodes one stored
    /// blob back into JSON. Requires all three encryption columns together.
    pub fn decode_row(&self, value: Vec<u8>, nonce: Option<Vec<u8>>, key_id: Option<u32>) -> SqlResult<Json> {
        let plaintext = match (nonce, key_id, &self.keys) {
            (Some(nonce), Some(key_id), Some(registry)) => steve_sql::decrypt(registry, &value, &nonce, key_id)?,
            _ => value,
        };
        self.encoder.decode(&plaintext)
    }

    /// Prunes `events` for `gvk`, retaining only the most recent `keep_count`
    /// rows. Event `seq` values are AUTOINCREMENT and never reused, so
    /// readers positioned before the retained window naturally observe
    /// `SlowReader` from the ring rather than from this table.
    pub fn gc(&self, gvk: &Gvk, keep_count: u64) -> SqlResult<u64> {
        let pruned = self.with_state(gvk, |state| {
            self.conn.with_transaction(|tx| {
                let pruned = tx
                    .execute(
                        &format!(
                            "DELETE FROM {events} WHERE seq NOT IN (SELECT seq FROM {events} ORDER BY seq DESC LIMIT ?1)",
                            events = state.tables.events
                        ),
                        [keep_count as i64],
                    )
                    .map_err(|e| QueryError::new("GC events", e.to_string()))?;
                Ok(pruned as u64)
            })
        })?;
        counter!("steve_indexer_gc_pruned_total", pruned);
        Ok(pruned)
    }

    /// Drops every table for `gvk` and closes its ring, signaling
    /// `BufferClosed` to any reader still positioned on it.
    pub fn drop_all(&self, gvk: &Gvk) -> SqlResult<()> {
        let mut guard = self.gvks.lock().expect("indexer mutex poisoned");
        let Some(state) = guard.remove(gvk) else { return Ok(()) };
        self.conn.with_connection(|c| {
            c.execute_batch(&state.tables.drop_ddl())
                .map_err(|e| QueryError::new("DROP TABLE", e.to_string()))
        })?;
        state.ring.close();
        info!(gvk = %gvk, "indexer dropped all tables");
        Ok(())
    }

    fn encode_for_storage(&self, obj: &Json, encrypt: bool) -> SqlResult<(Vec<u8>, Option<Vec<u8>>, Option<u32>)> {
        let blob = self.encoder.encode("CachedObject", obj)?;
        match (encrypt, &self.keys) {
            (true, Some(registry)) => {
                let (data, nonce, key_id) = steve_sql::encrypt(registry, &blob)?;
                Ok((data, Some(nonce), Some(key_id)))
            }
            _ => Ok((blob, None, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steve_core::{parse_field_path, Gvk};
    use steve_sql::{Codec, Encoding};

    fn indexer() -> Indexer {
        let conn = Arc::new(Connection::open_in_memory().unwrap());
        let encoder = Arc::new(Encoder::new(Encoding { codec: Codec::Json, gzip: false }));
        Indexer::new(conn, encoder, None)
    }

    fn pods_gvk() -> Gvk {
        Gvk::new("", "v1", "Pod")
    }

    fn pod(name: &str) -> Json {
        serde_json::json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "resourceVersion": "1"}})
    }

    #[test]
    fn upsert_then_delete_emits_matching_events() {
        let idx = indexer();
        let gvk = pods_gvk();
        idx.register(gvk.clone(), GvkConfig::default()).unwrap();

        let kind = idx.upsert(&gvk, "default/alpha", &pod("alpha")).unwrap();
        assert_eq!(kind, EventKind::Add);
        let kind2 = idx.upsert(&gvk, "default/alpha", &pod("alpha")).unwrap();
        assert_eq!(kind2, EventKind::Change);

        let mut reader = idx.ring_reader(&gvk, None).unwrap();
        reader.jump_to_head();

        let found = idx.delete(&gvk, "default/alpha").unwrap();
        assert!(found);
        assert!(!idx.delete(&gvk, "default/alpha").unwrap());

        let record = reader.read_blocking().unwrap();
        assert_eq!(record.kind, EventKind::Remove);
        assert!(record.object.is_none());
        let prev = record.prev_object.expect("remove event must carry the prior object");
        assert_eq!(prev["metadata"]["name"], "alpha");
    }

    #[test]
    fn indexed_fields_are_queryable_via_fields_table() {
        let idx = indexer();
        let gvk = pods_gvk();
        let config = GvkConfig {
            indexed_fields: vec![("metadata.name".into(), parse_field_path("metadata.name").unwrap())],
            ..Default::default()
        };
        idx.register(gvk.clone(), config).unwrap();
        idx.upsert(&gvk, "default/alpha", &pod("alpha")).unwrap();

        let tables = idx.table_names(&gvk).unwrap();
        let rows = idx
            .query_rows(
                &format!("SELECT o.key, o.value FROM {} o JOIN {} f ON f.key = o.key WHERE f.field = 'metadata.name' AND f.value = 'alpha'", tables.objects, tables.fields),
                &[],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn replace_all_removes_disappearing_keys() {
        let idx = indexer();
        let gvk = pods_gvk();
        idx.register(gvk.clone(), GvkConfig::default()).unwrap();
        idx.upsert(&gvk, "default/alpha", &pod("alpha")).unwrap();
        idx.upsert(&gvk, "default/beta", &pod("beta")).unwrap();

        let mut next = HashMap::new();
        next.insert("default/beta".to_string(), pod("beta"));
        idx.replace_all(&gvk, &next, "99").unwrap();

        let tables = idx.table_names(&gvk).unwrap();
        let rows = idx.query_rows(&format!("SELECT key, value FROM {}", tables.objects), &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "default/beta");
    }

    #[test]
    fn drop_all_closes_ring_for_pending_readers() {
        let idx = indexer();
        let gvk = pods_gvk();
        idx.register(gvk.clone(), GvkConfig::default()).unwrap();
        let mut reader = idx.ring_reader(&gvk, None).unwrap();
        idx.drop_all(&gvk).unwrap();
        let err = reader.read_blocking().unwrap_err();
        assert_eq!(err, steve_ring::RingError::BufferClosed);
    }

    #[test]
    fn gc_prunes_events_but_keeps_objects() {
        let idx = indexer();
        let gvk = pods_gvk();
        idx.register(gvk.clone(), GvkConfig::default()).unwrap();
        for i in 0..5 {
            idx.upsert(&gvk, &format!("default/p{i}"), &pod(&format!("p{i}"))).unwrap();
        }
        let pruned = idx.gc(&gvk, 2).unwrap();
        assert_eq!(pruned, 3);
        let tables = idx.table_names(&gvk).unwrap();
        let remaining = idx.query_rows(&format!("SELECT key, value FROM {}", tables.events), &[]).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn encrypted_gvk_round_trips_through_query_objects_and_decode_row() {
        let conn = Arc::new(Connection::open_in_memory().unwrap());
        let encoder = Arc::new(Encoder::new(Encoding { codec: Codec::Json, gzip: false }));
        let keys = Arc::new(steve_sql::KeyRegistry::new());
        let idx = Indexer::new(conn, encoder, Some(keys));
        let gvk = Gvk::new("", "v1", "Secret");
        idx.register(gvk.clone(), GvkConfig { encrypt: true, ..Default::default() }).unwrap();
        idx.upsert(&gvk, "default/db-creds", &pod("db-creds")).unwrap();

        let tables = idx.table_names(&gvk).unwrap();
        let rows = idx
            .query_objects(&format!("SELECT key, value, nonce, key_id FROM {}", tables.objects), &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        let (_, blob, nonce, key_id) = rows.into_iter().next().unwrap();
        assert!(nonce.is_some(), "encrypted GVK must persist a nonce");
        assert!(key_id.is_some(), "encrypted GVK must persist a key_id");
        let decoded = idx.decode_row(blob, nonce, key_id).unwrap();
        assert_eq!(decoded["metadata"]["name"], "db-creds");
    }

    #[test]
    fn unencrypted_gvk_stores_no_nonce_or_key_id() {
        let conn = Arc::new(Connection::open_in_memory().unwrap());
        let encoder = Arc::new(Encoder::new(Encoding { codec: Codec::Json, gzip: false }));
        let keys = Arc::new(steve_sql::KeyRegistry::new());
        let idx = Indexer::new(conn, encoder, Some(keys));
        let gvk = pods_gvk();
        idx.register(gvk.clone(), GvkConfig::default()).unwrap();
        idx.upsert(&gvk, "default/alpha", &pod("alpha")).unwrap();

        let tables = idx.table_names(&gvk).unwrap();
        let rows = idx
            .query_objects(&format!("SELECT key, value, nonce, key_id FROM {}", tables.objects), &[])
            .unwrap();
        let (_, _, nonce, key_id) = rows.into_iter().next().unwrap();
        assert!(nonce.is_none());
        assert!(key_id.is_none());
    }
}
