//! Schema definition and version-numbered migrations.
//!
//! Each migration is idempotent and runs inside a transaction; the
//! `schema-version` config value is bumped after each one succeeds.
use super::engine::Engine;
use crate::Result;

/// The base schema. `IF NOT EXISTS` keeps re-runs harmless.
const BASE_TABLES: &str = "\
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT,
    type TEXT NOT NULL DEFAULT 'str'
);

CREATE TABLE IF NOT EXISTS inboxes (
    domain TEXT PRIMARY KEY,
    actor TEXT UNIQUE,
    inbox TEXT UNIQUE NOT NULL,
    followid TEXT,
    software TEXT,
    accepted BOOLEAN NOT NULL DEFAULT TRUE,
    created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS whitelist (
    domain TEXT PRIMARY KEY,
    created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS domain_bans (
    domain TEXT PRIMARY KEY,
    reason TEXT,
    note TEXT,
    created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS software_bans (
    name TEXT PRIMARY KEY,
    reason TEXT,
    note TEXT,
    created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    handle TEXT,
    created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
    code TEXT PRIMARY KEY,
    \"user\" TEXT NOT NULL,
    created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT,
    type TEXT NOT NULL DEFAULT 'str',
    updated TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);
";

pub type Migration = fn(&mut Engine) -> Result<()>;

/// Migrations in ascending version order. A database at version `v` runs
/// every migration with a version greater than `v`.
pub const MIGRATIONS: &[(i64, Migration)] = &[(20240206, migrate_20240206)];

fn migrate_20240206(engine: &mut Engine) -> Result<()> {
    engine.batch(BASE_TABLES)
}
