//! Namespaced KV cache with a TTL, used for de-duplication and HTTP
//! response caching.
//!
//! Two backends: the `cache` table in the primary store, or Redis with keys
//! of the form `"{prefix}:{namespace}:{key}"` and values of the form
//! `"{type}:{epoch_seconds}:{payload}"`.
use crate::{
    activity::Message,
    config::{CacheBackend, CacheConfig},
    store::{
        config::boolean,
        engine::SqlValue,
        Store,
    },
    util::{format_timestamp, now_timestamp, parse_timestamp},
    Error, Result,
};
use chrono::{DateTime, TimeZone, Utc};
use redis::Commands;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// How old a cached HTTP response may be before it is refetched.
pub const RESPONSE_MAX_AGE_HOURS: i64 = 48;

/// Entries older than this are evicted by the periodic cleanup task.
pub const EVICT_AFTER_HOURS: i64 = 14 * 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Str,
    Int,
    Bool,
    Json,
    Message,
}

impl CacheType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Json => "json",
            Self::Message => "message",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "str" => Ok(Self::Str),
            "int" => Ok(Self::Int),
            "bool" => Ok(Self::Bool),
            "json" => Ok(Self::Json),
            "message" => Ok(Self::Message),
            _ => Err(Error::key(format!("unknown cache value type: {name}"))),
        }
    }
}

/// A single cache entry. The value is kept in its serialized form together
/// with its declared type; deserialization is symmetric with serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub namespace: String,
    pub key: String,
    pub value: String,
    pub value_type: CacheType,
    pub updated: DateTime<Utc>,
}

impl Item {
    pub fn older_than(&self, hours: i64) -> bool {
        let delta = Utc::now() - self.updated;
        delta.num_seconds() > hours * 3600
    }

    pub fn as_int(&self) -> Result<i64> {
        self.value
            .parse()
            .map_err(|_| Error::key(format!("cache value is not an int: {}", self.value)))
    }

    pub fn as_bool(&self) -> Result<bool> {
        boolean(&self.value)
    }

    pub fn as_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.value)?)
    }

    pub fn as_message(&self) -> Result<Message> {
        Message::parse(self.value.as_bytes())
    }
}

/// The capability set shared by both backends. Safe for concurrent use from
/// multiple workers.
pub trait Cache: Send + Sync {
    /// `Err(Error::NotFound)` when the entry does not exist.
    fn get(&self, namespace: &str, key: &str) -> Result<Item>;
    fn get_keys(&self, namespace: &str) -> Result<Vec<String>>;
    fn get_namespaces(&self) -> Result<Vec<String>>;
    fn set(&self, namespace: &str, key: &str, value: &str, value_type: CacheType) -> Result<Item>;
    fn delete(&self, namespace: &str, key: &str) -> Result<()>;
    /// Remove every entry older than `hours`. Returns how many were removed.
    fn delete_old(&self, hours: i64) -> Result<usize>;
}

pub fn build(config: &CacheConfig, store: &Store) -> Result<Arc<dyn Cache>> {
    match config.backend {
        CacheBackend::Database => Ok(Arc::new(SqlCache::new(store.clone()))),
        CacheBackend::Redis => Ok(Arc::new(RedisCache::connect(config)?)),
    }
}

/// Cache backend reusing the primary store's `cache` table.
pub struct SqlCache {
    store: Store,
}

impl SqlCache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl Cache for SqlCache {
    fn get(&self, namespace: &str, key: &str) -> Result<Item> {
        let mut session = self.store.session();
        let row = session
            .engine()
            .query_one(
                "SELECT * FROM cache WHERE namespace = $1 AND key = $2",
                &[SqlValue::from(namespace), SqlValue::from(key)],
            )?
            .ok_or_else(|| Error::not_found(format!("cache entry {namespace}:{key}")))?;

        Ok(Item {
            namespace: row.req_text("namespace")?,
            key: row.req_text("key")?,
            value: row.text("value")?.unwrap_or_default(),
            value_type: CacheType::parse(&row.req_text("type")?)?,
            updated: parse_timestamp(&row.req_text("updated")?)?,
        })
    }

    fn get_keys(&self, namespace: &str) -> Result<Vec<String>> {
        let mut session = self.store.session();

        session
            .engine()
            .query(
                "SELECT key FROM cache WHERE namespace = $1 ORDER BY key",
                &[SqlValue::from(namespace)],
            )?
            .iter()
            .map(|row| row.req_text("key"))
            .collect()
    }

    fn get_namespaces(&self) -> Result<Vec<String>> {
        let mut session = self.store.session();

        session
            .engine()
            .query("SELECT DISTINCT namespace FROM cache ORDER BY namespace", &[])?
            .iter()
            .map(|row| row.req_text("namespace"))
            .collect()
    }

    fn set(&self, namespace: &str, key: &str, value: &str, value_type: CacheType) -> Result<Item> {
        let updated = now_timestamp();
        let mut session = self.store.session();

        session.engine().execute(
            "INSERT INTO cache (namespace, key, value, type, updated) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (namespace, key) DO UPDATE SET value = $3, type = $4, updated = $5",
            &[
                SqlValue::from(namespace),
                SqlValue::from(key),
                SqlValue::from(value),
                SqlValue::from(value_type.name()),
                SqlValue::from(updated.as_str()),
            ],
        )?;

        Ok(Item {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            value: value.to_owned(),
            value_type,
            updated: parse_timestamp(&updated)?,
        })
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let mut session = self.store.session();
        session.engine().execute(
            "DELETE FROM cache WHERE namespace = $1 AND key = $2",
            &[SqlValue::from(namespace), SqlValue::from(key)],
        )?;

        Ok(())
    }

    fn delete_old(&self, hours: i64) -> Result<usize> {
        let cutoff = format_timestamp(Utc::now() - chrono::Duration::hours(hours));
        let mut session = self.store.session();

        session.engine().execute(
            "DELETE FROM cache WHERE updated < $1",
            &[SqlValue::from(cutoff)],
        )
    }
}

/// Cache backend over an independent Redis client.
pub struct RedisCache {
    prefix: String,
    conn: Mutex<redis::Connection>,
}

impl RedisCache {
    pub fn connect(config: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url(config))?;
        let conn = client.get_connection()?;

        Ok(Self {
            prefix: config.redis_prefix.clone(),
            conn: Mutex::new(conn),
        })
    }

    fn key_name(&self, namespace: &str, key: &str) -> String {
        redis_key(&self.prefix, namespace, key)
    }
}

fn redis_key(prefix: &str, namespace: &str, key: &str) -> String {
    format!("{prefix}:{namespace}:{key}")
}

/// Parse a stored `"{type}:{epoch_seconds}:{payload}"` entry.
fn parse_redis_entry(namespace: &str, key: &str, raw: &str) -> Result<Item> {
    let mut parts = raw.splitn(3, ':');

    let (ty, epoch, value) = match (parts.next(), parts.next(), parts.next()) {
        (Some(ty), Some(epoch), Some(value)) => (ty, epoch, value),
        _ => {
            return Err(Error::key(format!(
                "malformed cache entry for {namespace}:{key}"
            )))
        }
    };

    let secs: f64 = epoch
        .parse()
        .map_err(|_| Error::key(format!("invalid cache timestamp: {epoch}")))?;
    let updated = Utc
        .timestamp_opt(secs as i64, 0)
        .single()
        .ok_or_else(|| Error::key(format!("invalid cache timestamp: {epoch}")))?;

    Ok(Item {
        namespace: namespace.to_owned(),
        key: key.to_owned(),
        value: value.to_owned(),
        value_type: CacheType::parse(ty)?,
        updated,
    })
}

impl Cache for RedisCache {
    fn get(&self, namespace: &str, key: &str) -> Result<Item> {
        let name = self.key_name(namespace, key);
        let raw: Option<String> = self.conn.lock().unwrap().get(&name)?;

        match raw {
            Some(raw) => parse_redis_entry(namespace, key, &raw),
            None => Err(Error::not_found(format!("cache entry {namespace}:{key}"))),
        }
    }

    fn get_keys(&self, namespace: &str) -> Result<Vec<String>> {
        let pattern = self.key_name(namespace, "*");
        let keys: Vec<String> = self.conn.lock().unwrap().keys(&pattern)?;

        Ok(keys
            .iter()
            .filter_map(|k| k.splitn(3, ':').nth(2).map(str::to_owned))
            .collect())
    }

    fn get_namespaces(&self) -> Result<Vec<String>> {
        let pattern = format!("{}:*", self.prefix);
        let keys: Vec<String> = self.conn.lock().unwrap().keys(&pattern)?;

        let mut namespaces: Vec<String> = keys
            .iter()
            .filter_map(|k| k.splitn(3, ':').nth(1).map(str::to_owned))
            .collect();
        namespaces.sort_unstable();
        namespaces.dedup();

        Ok(namespaces)
    }

    fn set(&self, namespace: &str, key: &str, value: &str, value_type: CacheType) -> Result<Item> {
        let updated = Utc::now();
        let name = self.key_name(namespace, key);
        let entry = format!("{}:{}:{value}", value_type.name(), updated.timestamp());

        self.conn.lock().unwrap().set::<_, _, ()>(&name, entry)?;

        Ok(Item {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            value: value.to_owned(),
            value_type,
            updated: Utc
                .timestamp_opt(updated.timestamp(), 0)
                .single()
                .expect("timestamp to be valid"),
        })
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let name = self.key_name(namespace, key);
        self.conn.lock().unwrap().del::<_, ()>(&name)?;

        Ok(())
    }

    fn delete_old(&self, hours: i64) -> Result<usize> {
        let mut removed = 0;

        for namespace in self.get_namespaces()? {
            for key in self.get_keys(&namespace)? {
                let item = match self.get(&namespace, &key) {
                    Ok(item) => item,
                    Err(_) => continue,
                };

                if item.older_than(hours) {
                    self.delete(&namespace, &key)?;
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

/// Build a redis connection URL, auto-detecting unix sockets when the
/// configured host is an existing filesystem path.
fn redis_url(config: &CacheConfig) -> String {
    let auth = if config.redis_pass.is_empty() {
        String::new()
    } else if config.redis_user.is_empty() {
        format!(":{}@", config.redis_pass)
    } else {
        format!("{}:{}@", config.redis_user, config.redis_pass)
    };

    if std::path::Path::new(&config.redis_host).exists() {
        format!(
            "redis+unix://{}{}?db={}",
            auth, config.redis_host, config.redis_database
        )
    } else {
        format!(
            "redis://{}{}:{}/{}",
            auth, config.redis_host, config.redis_port, config.redis_database
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    fn sql_cache() -> SqlCache {
        SqlCache::new(Store::memory().expect("to create an in-memory store"))
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = sql_cache();
        let written = cache
            .set("handle-relay", "https://a.example/obj/1", "msg-id", CacheType::Str)
            .unwrap();

        let read = cache.get("handle-relay", "https://a.example/obj/1").unwrap();
        assert_eq!(read, written);
    }

    #[test]
    fn missing_entries_are_not_found() {
        let cache = sql_cache();

        assert!(matches!(
            cache.get("ns", "nope"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn set_overwrites_in_place() {
        let cache = sql_cache();
        cache.set("ns", "k", "one", CacheType::Str).unwrap();
        cache.set("ns", "k", "two", CacheType::Str).unwrap();

        assert_eq!(cache.get("ns", "k").unwrap().value, "two");
        assert_eq!(cache.get_keys("ns").unwrap(), vec!["k"]);
    }

    #[test]
    fn namespaces_and_keys_are_listed() {
        let cache = sql_cache();
        cache.set("a", "k1", "v", CacheType::Str).unwrap();
        cache.set("a", "k2", "v", CacheType::Str).unwrap();
        cache.set("b", "k1", "v", CacheType::Str).unwrap();

        assert_eq!(cache.get_namespaces().unwrap(), vec!["a", "b"]);
        assert_eq!(cache.get_keys("a").unwrap(), vec!["k1", "k2"]);
    }

    #[test]
    fn delete_removes_a_single_entry() {
        let cache = sql_cache();
        cache.set("ns", "k1", "v", CacheType::Str).unwrap();
        cache.set("ns", "k2", "v", CacheType::Str).unwrap();

        cache.delete("ns", "k1").unwrap();

        assert!(cache.get("ns", "k1").is_err());
        assert!(cache.get("ns", "k2").is_ok());
    }

    #[test]
    fn delete_old_only_removes_stale_entries() {
        let cache = sql_cache();
        cache.set("ns", "fresh", "v", CacheType::Str).unwrap();

        // backdate an entry past the eviction window
        let stale = format_timestamp(Utc::now() - chrono::Duration::hours(EVICT_AFTER_HOURS + 1));
        let mut session = cache.store.session();
        session
            .engine()
            .execute(
                "INSERT INTO cache (namespace, key, value, type, updated) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    SqlValue::from("ns"),
                    SqlValue::from("stale"),
                    SqlValue::from("v"),
                    SqlValue::from("str"),
                    SqlValue::from(stale),
                ],
            )
            .unwrap();
        drop(session);

        assert_eq!(cache.delete_old(EVICT_AFTER_HOURS).unwrap(), 1);
        assert!(cache.get("ns", "fresh").is_ok());
        assert!(cache.get("ns", "stale").is_err());
    }

    #[test_case(0, false; "just written")]
    #[test_case(47, false; "within the window")]
    #[test_case(49, true; "past the window")]
    #[test]
    fn older_than_compares_against_now(age_hours: i64, expected: bool) {
        let item = Item {
            namespace: "ns".to_owned(),
            key: "k".to_owned(),
            value: "v".to_owned(),
            value_type: CacheType::Str,
            updated: Utc::now() - chrono::Duration::hours(age_hours),
        };

        assert_eq!(item.older_than(RESPONSE_MAX_AGE_HOURS), expected);
    }

    #[test]
    fn typed_values_deserialize() {
        let cache = sql_cache();
        cache.set("ns", "n", "42", CacheType::Int).unwrap();
        cache.set("ns", "b", "true", CacheType::Bool).unwrap();
        cache.set("ns", "j", r#"{"a":1}"#, CacheType::Json).unwrap();

        assert_eq!(cache.get("ns", "n").unwrap().as_int().unwrap(), 42);
        assert!(cache.get("ns", "b").unwrap().as_bool().unwrap());
        assert_eq!(cache.get("ns", "j").unwrap().as_json().unwrap()["a"], 1);
    }

    #[test]
    fn redis_entries_round_trip_through_the_wire_format() {
        let raw = format!("str:{}:https://a.example/activities/1", Utc::now().timestamp());
        let item = parse_redis_entry("handle-relay", "https://a.example/obj/1", &raw).unwrap();

        assert_eq!(item.value_type, CacheType::Str);
        assert_eq!(item.value, "https://a.example/activities/1");
        assert!(!item.older_than(1));

        // the payload may itself contain colons
        assert_eq!(
            redis_key("fedirelay", "request", "https://a.example/actor"),
            "fedirelay:request:https://a.example/actor"
        );
    }

    #[test]
    fn malformed_redis_entries_are_errors() {
        assert!(parse_redis_entry("ns", "k", "no-separators").is_err());
        assert!(parse_redis_entry("ns", "k", "str:not-a-number:v").is_err());
    }

    #[test]
    fn redis_urls_cover_auth_and_plain() {
        let mut config = CacheConfig::default();
        assert_eq!(redis_url(&config), "redis://localhost:6379/0");

        config.redis_pass = "secret".to_owned();
        assert_eq!(redis_url(&config), "redis://:secret@localhost:6379/0");
    }
}
