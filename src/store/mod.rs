use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::rdb;

pub mod stream;

use stream::{resolve_entry_id, EntryId, IdSpec, RangeBound, StreamEntry, StreamError};

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("ERR no such key '{0}'")]
    StreamNotFound(String),
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// What a key can hold. GET dispatches on the variant at read time.
#[derive(PartialEq, Clone, Debug)]
pub enum Value {
    String(String),
    Integer(i64),
    Stream(Vec<StreamEntry>),
}

#[derive(Default, Clone, Copy, Debug)]
pub struct ValueOptions {
    /// Relative expiry in milliseconds, applied as `now + expiry`.
    pub expiry: Option<u64>,
}

/// Both tables live under one lock so readers always observe the value and
/// its expiry as a consistent pair.
#[derive(Default)]
struct Tables {
    values: HashMap<String, Value>,
    expiries: HashMap<String, u64>,
}

impl Tables {
    fn is_expired(&self, key: &str, now: u64) -> bool {
        matches!(self.expiries.get(key), Some(&at) if now >= at)
    }
}

pub struct KvStore {
    tables: RwLock<Tables>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Looks up a live value. An elapsed expiry is reaped here, under the
    /// write lock, so both tables drop the key together.
    pub async fn get(&self, key: &str) -> Option<Value> {
        {
            let tables = self.tables.read().await;
            if !tables.is_expired(key, current_millis()) {
                return tables.values.get(key).cloned();
            }
        }

        let mut tables = self.tables.write().await;
        if tables.is_expired(key, current_millis()) {
            tables.expiries.remove(key);
            tables.values.remove(key);
            return None;
        }
        tables.values.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: Value, options: ValueOptions) {
        let now = current_millis();
        let mut tables = self.tables.write().await;

        match options.expiry {
            Some(ms) => {
                tables.expiries.insert(key.to_string(), now + ms);
            }
            // an already-elapsed expiry must not outlive the old value
            None if tables.is_expired(key, now) => {
                tables.expiries.remove(key);
            }
            None => {}
        }

        tables.values.insert(key.to_string(), value);
    }

    /// All live keys. The caller's pattern is accepted but not applied.
    pub async fn list(&self, _pattern: &str) -> Vec<String> {
        let tables = self.tables.read().await;
        let now = current_millis();

        tables
            .values
            .keys()
            .filter(|key| !tables.is_expired(key, now))
            .cloned()
            .collect()
    }

    /// Appends one entry to a stream, creating the stream on first use.
    /// Returns the resolved entry ID.
    pub async fn set_stream(
        &self,
        key: &str,
        spec: IdSpec,
        field: &str,
        value: &str,
        _options: ValueOptions,
    ) -> Result<EntryId, StoreError> {
        let now = current_millis();
        let mut tables = self.tables.write().await;

        let slot = tables
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Stream(Vec::new()));

        let Value::Stream(entries) = slot else {
            return Err(StoreError::WrongType);
        };

        let id = resolve_entry_id(spec, entries.last().map(|e| e.id), now)?;
        entries.push(StreamEntry {
            id,
            fields: vec![(field.to_string(), value.to_string())],
        });

        Ok(id)
    }

    /// Entries whose IDs fall in the closed interval `[start, end]`.
    pub async fn get_stream(
        &self,
        key: &str,
        start: RangeBound,
        end: RangeBound,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let tables = self.tables.read().await;
        let entries = stream_entries(&tables, key)?;

        let lo = match start {
            RangeBound::Min => 0,
            RangeBound::Max => entries.len(),
            RangeBound::At(id) => entries.partition_point(|e| e.id < id),
        };
        let hi = match end {
            RangeBound::Min => 0,
            RangeBound::Max => entries.len(),
            RangeBound::At(id) => entries.partition_point(|e| e.id <= id),
        };

        Ok(entries[lo..hi.max(lo)].to_vec())
    }

    /// Entries strictly after `start`, as XREAD wants them.
    pub async fn xread_stream(
        &self,
        key: &str,
        start: EntryId,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let tables = self.tables.read().await;
        let entries = stream_entries(&tables, key)?;

        let lo = entries.partition_point(|e| e.id <= start);
        Ok(entries[lo..].to_vec())
    }

    /// Snapshot of the string-shaped entries and their absolute expiries,
    /// used to serialize a live RDB image for PSYNC.
    pub async fn dump(&self) -> (HashMap<String, String>, HashMap<String, u64>) {
        let tables = self.tables.read().await;
        let now = current_millis();

        let mut keys = HashMap::new();
        let mut expiries = HashMap::new();

        for (key, value) in &tables.values {
            if tables.is_expired(key, now) {
                continue;
            }
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Integer(n) => n.to_string(),
                Value::Stream(_) => continue,
            };
            keys.insert(key.clone(), text);
            if let Some(&at) = tables.expiries.get(key) {
                expiries.insert(key.clone(), at);
            }
        }

        (keys, expiries)
    }

    /// Bulk-loads string keys and absolute expiries, as read from an RDB
    /// database section.
    pub async fn load(&self, keys: HashMap<String, String>, expiries: HashMap<String, u64>) {
        let mut tables = self.tables.write().await;

        for (key, value) in keys {
            tables.values.insert(key, Value::String(value));
        }
        for (key, at) in expiries {
            tables.expiries.insert(key, at);
        }
    }

    /// Seeds the store from an on-disk snapshot. A missing file is normal
    /// (fresh node); any other failure aborts startup.
    pub async fn initialise_from_rdb(&self, dir: &str, filename: &str) -> anyhow::Result<()> {
        let path = Path::new(dir).join(filename);
        log::info!("loading rdb from {}", path.display());

        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no rdb file found, starting with an empty store");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let contents = rdb::parse(&raw)?;
        if contents.databases.is_empty() {
            log::info!("no databases found in rdb file");
            return Ok(());
        }

        anyhow::ensure!(
            contents.databases.len() == 1,
            "only a single database is supported but the rdb file holds {}",
            contents.databases.len()
        );

        let db = contents.databases.into_iter().next().unwrap();
        log::info!(
            "loading db {}: {} keys, {} expiries",
            db.index,
            db.keys.len(),
            db.expiries.len()
        );
        self.load(db.keys, db.expiries).await;

        Ok(())
    }
}

fn stream_entries<'a>(tables: &'a Tables, key: &str) -> Result<&'a [StreamEntry], StoreError> {
    match tables.values.get(key) {
        None => Err(StoreError::StreamNotFound(key.to_string())),
        Some(Value::Stream(entries)) => Ok(entries),
        Some(_) => Err(StoreError::WrongType),
    }
}

pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts_px(ms: u64) -> ValueOptions {
        ValueOptions { expiry: Some(ms) }
    }

    #[tokio::test]
    async fn set_then_get_returns_the_value() {
        let store = KvStore::new();
        store
            .set("k", Value::String("v".into()), ValueOptions::default())
            .await;

        assert_eq!(store.get("k").await, Some(Value::String("v".into())));
        assert_eq!(store.get("missing").await, None);
    }

    #[tokio::test]
    async fn zero_expiry_is_immediately_elapsed() {
        let store = KvStore::new();
        store.set("k", Value::String("v".into()), opts_px(0)).await;

        assert_eq!(store.get("k").await, None);
        // the reap removed the value row too
        assert!(!store.list("*").await.contains(&"k".to_string()));
    }

    #[tokio::test]
    async fn expiry_elapses_with_the_clock() {
        let store = KvStore::new();
        store.set("k", Value::String("v".into()), opts_px(20)).await;

        assert_eq!(store.get("k").await, Some(Value::String("v".into())));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn overwrite_clears_an_elapsed_expiry() {
        let store = KvStore::new();
        store.set("k", Value::String("old".into()), opts_px(0)).await;
        store
            .set("k", Value::String("new".into()), ValueOptions::default())
            .await;

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(store.get("k").await, Some(Value::String("new".into())));
    }

    #[tokio::test]
    async fn list_skips_expired_keys() {
        let store = KvStore::new();
        store
            .set("live", Value::String("a".into()), ValueOptions::default())
            .await;
        store.set("dead", Value::String("b".into()), opts_px(0)).await;

        let keys = store.list("*").await;
        assert_eq!(keys, vec!["live".to_string()]);
    }

    #[tokio::test]
    async fn stream_appends_keep_ids_strictly_increasing() {
        let store = KvStore::new();

        let first = store
            .set_stream("s", "1-1".parse().unwrap(), "f", "a", ValueOptions::default())
            .await
            .unwrap();
        assert_eq!(first, EntryId::new(1, 1));

        // same id again must be rejected and leave the stream untouched
        let err = store
            .set_stream("s", "1-1".parse().unwrap(), "f", "b", ValueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Stream(StreamError::IdNotGreaterThanTop));

        let entries = store
            .get_stream("s", RangeBound::Min, RangeBound::Max)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields, vec![("f".to_string(), "a".to_string())]);

        let second = store
            .set_stream("s", "1-*".parse().unwrap(), "f", "b", ValueOptions::default())
            .await
            .unwrap();
        assert_eq!(second, EntryId::new(1, 2));
    }

    #[tokio::test]
    async fn zero_id_is_rejected() {
        let store = KvStore::new();
        let err = store
            .set_stream("s", "0-0".parse().unwrap(), "f", "v", ValueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Stream(StreamError::IdIsZero));
    }

    #[tokio::test]
    async fn xadd_on_a_string_key_is_a_wrongtype_error() {
        let store = KvStore::new();
        store
            .set("k", Value::String("v".into()), ValueOptions::default())
            .await;

        let err = store
            .set_stream("k", "1-1".parse().unwrap(), "f", "v", ValueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::WrongType);
    }

    async fn seeded_stream(store: &KvStore) {
        for (id, val) in [("1-1", "a"), ("1-2", "b"), ("2-0", "c"), ("3-5", "d")] {
            store
                .set_stream("s", id.parse().unwrap(), "f", val, ValueOptions::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn get_stream_is_inclusive_on_both_ends() {
        let store = KvStore::new();
        seeded_stream(&store).await;

        let entries = store
            .get_stream(
                "s",
                RangeBound::At(EntryId::new(1, 2)),
                RangeBound::At(EntryId::new(2, 0)),
            )
            .await
            .unwrap();
        let ids: Vec<String> = entries.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["1-2", "2-0"]);
    }

    #[tokio::test]
    async fn get_stream_full_range() {
        let store = KvStore::new();
        seeded_stream(&store).await;

        let entries = store
            .get_stream("s", RangeBound::Min, RangeBound::Max)
            .await
            .unwrap();
        assert_eq!(entries.len(), 4);
    }

    #[tokio::test]
    async fn xread_is_exclusive_on_its_start() {
        let store = KvStore::new();
        seeded_stream(&store).await;

        let entries = store.xread_stream("s", EntryId::new(1, 2)).await.unwrap();
        let ids: Vec<String> = entries.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["2-0", "3-5"]);
    }

    #[tokio::test]
    async fn missing_stream_is_an_error() {
        let store = KvStore::new();
        assert_eq!(
            store
                .get_stream("nope", RangeBound::Min, RangeBound::Max)
                .await
                .unwrap_err(),
            StoreError::StreamNotFound("nope".to_string())
        );
        assert_eq!(
            store.xread_stream("nope", EntryId::ZERO).await.unwrap_err(),
            StoreError::StreamNotFound("nope".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_produce_torn_reads() {
        let store = std::sync::Arc::new(KvStore::new());

        let mut writers = Vec::new();
        for i in 0..8u32 {
            let store = store.clone();
            writers.push(tokio::spawn(async move {
                for round in 0..50u32 {
                    let value = format!("{i}:{round}");
                    store
                        .set(&format!("key-{i}"), Value::String(value), ValueOptions::default())
                        .await;
                }
            }));
        }

        // readers only ever observe fully written values for their own key
        for _ in 0..200 {
            for i in 0..8u32 {
                if let Some(Value::String(s)) = store.get(&format!("key-{i}")).await {
                    assert!(
                        s.starts_with(&format!("{i}:")),
                        "key-{i} held a value from another writer: {s}"
                    );
                }
            }
        }

        for writer in writers {
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn dump_snapshots_strings_and_expiries_only() {
        let store = KvStore::new();
        store
            .set("plain", Value::String("v".into()), ValueOptions::default())
            .await;
        store
            .set("counted", Value::Integer(7), ValueOptions::default())
            .await;
        store
            .set("ttl", Value::String("x".into()), opts_px(60_000))
            .await;
        store
            .set_stream("s", "1-1".parse().unwrap(), "f", "v", ValueOptions::default())
            .await
            .unwrap();

        let (keys, expiries) = store.dump().await;
        assert_eq!(keys.len(), 3);
        assert_eq!(keys.get("plain"), Some(&"v".to_string()));
        assert_eq!(keys.get("counted"), Some(&"7".to_string()));
        assert!(keys.contains_key("ttl"));
        assert!(!keys.contains_key("s"));
        assert_eq!(expiries.len(), 1);
        assert!(expiries.contains_key("ttl"));
    }
}
