//! The persistence layer: instance registry, bans, whitelist, request queue,
//! key material and runtime configuration.
use crate::{
    config::DbConfig,
    logger::LogHandle,
    signer::Signer,
    store::engine::{Engine, Pool, SqlValue, POOL_SIZE},
    Result,
};
use std::sync::{Arc, OnceLock};
use tracing::info;

pub mod config;
pub mod engine;
pub mod schema;
mod session;

pub use config::RelaySettings;
pub use session::{DomainBan, Instance, Session, SoftwareBan, Token, User, WhitelistEntry};

/// Live process handles that `put_config` has to poke when `log-level` or
/// `private-key` change. Installed once after boot.
pub struct StoreRuntime {
    pub signer: Arc<Signer>,
    pub log: LogHandle,
}

#[derive(Clone)]
pub struct Store {
    pool: Arc<Pool>,
    runtime: Arc<OnceLock<StoreRuntime>>,
}

impl Store {
    pub fn connect(config: &DbConfig) -> Result<Self> {
        let mut conns = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            conns.push(Engine::connect(config)?);
        }

        let store = Self {
            pool: Arc::new(Pool::new(conns)),
            runtime: Arc::new(OnceLock::new()),
        };
        store.migrate()?;

        Ok(store)
    }

    /// A store over a single in-memory sqlite connection, for tests.
    #[cfg(test)]
    pub fn memory() -> Result<Self> {
        let store = Self {
            pool: Arc::new(Pool::new(vec![Engine::memory()])),
            runtime: Arc::new(OnceLock::new()),
        };
        store.migrate()?;

        Ok(store)
    }

    pub fn session(&self) -> Session {
        Session::new(self.pool.clone(), self.runtime.clone())
    }

    pub fn set_runtime(&self, runtime: StoreRuntime) {
        let _ = self.runtime.set(runtime);
    }

    fn migrate(&self) -> Result<()> {
        let mut session = self.session();
        let stored = schema_version(&mut session);

        for (version, migration) in schema::MIGRATIONS {
            if *version <= stored {
                continue;
            }

            info!(from = stored, to = version, "migrating database");

            session.transaction(|s| {
                migration(s.engine())?;
                s.put_config_raw("schema-version", &version.to_string())
            })?;
        }

        Ok(())
    }
}

/// The raw stored schema version. A fresh database (no config table yet)
/// reports 0 so that every migration runs.
fn schema_version(session: &mut Session) -> i64 {
    let row = session
        .engine()
        .query_one(
            "SELECT value FROM config WHERE key = $1",
            &[SqlValue::from("schema-version")],
        )
        .ok()
        .flatten();

    row.and_then(|r| r.text("value").ok().flatten())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
