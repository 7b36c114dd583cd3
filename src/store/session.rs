//! A transactional session over the primary store.
use super::{
    config::{coerce, default_value, CONFIG_DEFAULTS},
    engine::{Engine, Pool, SqlRow, SqlValue},
    StoreRuntime,
};
use crate::{
    activity::Message,
    logger,
    util::{host_from_uri, normalize_domain, now_timestamp},
    Error, Result,
};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// A subscribed (or pending) instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub domain: String,
    pub actor: Option<String>,
    pub inbox: String,
    pub followid: Option<String>,
    pub software: Option<String>,
    pub accepted: bool,
    pub created: DateTime<Utc>,
}

impl Instance {
    fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            domain: row.req_text("domain")?,
            actor: row.text("actor")?,
            inbox: row.req_text("inbox")?,
            followid: row.text("followid")?,
            software: row.text("software")?,
            accepted: row.bool("accepted")?,
            created: row.timestamp("created")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainBan {
    pub domain: String,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub created: DateTime<Utc>,
}

impl DomainBan {
    fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            domain: row.req_text("domain")?,
            reason: row.text("reason")?,
            note: row.text("note")?,
            created: row.timestamp("created")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareBan {
    pub name: String,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub created: DateTime<Utc>,
}

impl SoftwareBan {
    fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            name: row.req_text("name")?,
            reason: row.text("reason")?,
            note: row.text("note")?,
            created: row.timestamp("created")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhitelistEntry {
    pub domain: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub username: String,
    pub hash: String,
    pub handle: Option<String>,
    pub created: DateTime<Utc>,
}

impl User {
    fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            username: row.req_text("username")?,
            hash: row.req_text("hash")?,
            handle: row.text("handle")?,
            created: row.timestamp("created")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub code: String,
    pub user: String,
    pub created: DateTime<Utc>,
}

pub struct Session {
    conn: Option<Engine>,
    pool: Arc<Pool>,
    runtime: Arc<OnceLock<StoreRuntime>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

impl Session {
    pub(super) fn new(pool: Arc<Pool>, runtime: Arc<OnceLock<StoreRuntime>>) -> Self {
        let conn = pool.checkout();

        Self {
            conn: Some(conn),
            pool,
            runtime,
        }
    }

    pub(crate) fn engine(&mut self) -> &mut Engine {
        self.conn.as_mut().expect("session connection is live")
    }

    /// Run `f` inside a transaction, rolling back on error.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.engine().batch("BEGIN")?;

        match f(self) {
            Ok(val) => {
                self.engine().batch("COMMIT")?;
                Ok(val)
            }

            Err(e) => {
                let _ = self.engine().batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // instances

    /// Lookup by domain, actor URL or inbox URL.
    pub fn get_inbox(&mut self, value: &str) -> Result<Option<Instance>> {
        let domain = normalize_domain(value)?;
        let row = self.engine().query_one(
            "SELECT * FROM inboxes WHERE domain = $1 OR actor = $2 OR inbox = $2",
            &[SqlValue::from(domain), SqlValue::from(value)],
        )?;

        row.as_ref().map(Instance::from_row).transpose()
    }

    pub fn get_inboxes(&mut self) -> Result<Vec<Instance>> {
        self.engine()
            .query(
                "SELECT * FROM inboxes WHERE accepted = $1 ORDER BY domain",
                &[SqlValue::from(true)],
            )?
            .iter()
            .map(Instance::from_row)
            .collect()
    }

    /// Instances with a pending follow request.
    pub fn get_requests(&mut self) -> Result<Vec<Instance>> {
        self.engine()
            .query(
                "SELECT * FROM inboxes WHERE accepted = $1 ORDER BY domain",
                &[SqlValue::from(false)],
            )?
            .iter()
            .map(Instance::from_row)
            .collect()
    }

    /// Upsert an instance row. When the row already exists only non-null
    /// arguments overwrite; `inbox` is required for a fresh insert.
    #[allow(clippy::too_many_arguments)]
    pub fn put_inbox(
        &mut self,
        domain: &str,
        inbox: Option<&str>,
        actor: Option<&str>,
        followid: Option<&str>,
        software: Option<&str>,
        accepted: Option<bool>,
    ) -> Result<Instance> {
        let domain = normalize_domain(domain)?;

        if self.get_inbox(&domain)?.is_some() {
            let mut sets = Vec::new();
            let mut params = Vec::new();

            for (col, value) in [
                ("inbox", inbox),
                ("actor", actor),
                ("followid", followid),
                ("software", software),
            ] {
                if let Some(v) = value {
                    params.push(SqlValue::from(v));
                    sets.push(format!("{col} = ${}", params.len()));
                }
            }

            if let Some(a) = accepted {
                params.push(SqlValue::from(a));
                sets.push(format!("accepted = ${}", params.len()));
            }

            if !sets.is_empty() {
                params.push(SqlValue::from(domain.as_str()));
                let sql = format!(
                    "UPDATE inboxes SET {} WHERE domain = ${}",
                    sets.join(", "),
                    params.len()
                );
                self.engine().execute(&sql, &params)?;
            }
        } else {
            let inbox = inbox.ok_or_else(|| Error::key("inbox is required for a new instance"))?;

            self.engine().execute(
                "INSERT INTO inboxes (domain, actor, inbox, followid, software, accepted, created) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    SqlValue::from(domain.as_str()),
                    SqlValue::opt_text(actor),
                    SqlValue::from(inbox),
                    SqlValue::opt_text(followid),
                    SqlValue::opt_text(software),
                    SqlValue::from(accepted.unwrap_or(true)),
                    SqlValue::from(now_timestamp()),
                ],
            )?;
        }

        self.get_inbox(&domain)?
            .ok_or_else(|| Error::not_found(format!("instance {domain}")))
    }

    /// Delete by domain, actor URL or inbox URL. At most one row may be
    /// affected.
    pub fn del_inbox(&mut self, value: &str) -> Result<bool> {
        let domain = normalize_domain(value)?;
        let count = self.engine().execute(
            "DELETE FROM inboxes WHERE domain = $1 OR actor = $2 OR inbox = $2",
            &[SqlValue::from(domain), SqlValue::from(value)],
        )?;

        if count > 1 {
            return Err(Error::TooManyRows);
        }

        Ok(count == 1)
    }

    /// Accept or deny a pending follow request. Accepting returns the
    /// updated instance, denying deletes the row.
    pub fn put_request_response(&mut self, domain: &str, accept: bool) -> Result<Option<Instance>> {
        let domain = normalize_domain(domain)?;

        self.transaction(|s| {
            let pending = s
                .get_inbox(&domain)?
                .filter(|i| !i.accepted)
                .ok_or_else(|| Error::not_found(format!("request for {domain}")))?;

            if accept {
                s.engine().execute(
                    "UPDATE inboxes SET accepted = $1 WHERE domain = $2",
                    &[SqlValue::from(true), SqlValue::from(pending.domain.as_str())],
                )?;

                s.get_inbox(&domain)
            } else {
                s.engine().execute(
                    "DELETE FROM inboxes WHERE domain = $1",
                    &[SqlValue::from(pending.domain.as_str())],
                )?;

                Ok(None)
            }
        })
    }

    /// The fan-out set for a message: every accepted instance other than the
    /// sender's and the one hosting the announced object.
    pub fn distill_inboxes(&mut self, message: &Message) -> Result<Vec<Instance>> {
        let mut src_domains = Vec::new();

        if let Ok(domain) = message.domain() {
            src_domains.push(domain);
        }

        if let Some(object_id) = message.object_id() {
            if let Ok(domain) = host_from_uri(object_id) {
                src_domains.push(domain);
            }
        }

        Ok(self
            .get_inboxes()?
            .into_iter()
            .filter(|i| !src_domains.contains(&i.domain))
            .collect())
    }

    // config

    /// The serialized value for `key`, falling back to the declared default
    /// when the key was never written.
    pub fn get_config(&mut self, key: &str) -> Result<String> {
        let default = default_value(key)?;
        let row = self.engine().query_one(
            "SELECT value FROM config WHERE key = $1",
            &[SqlValue::from(key)],
        )?;

        match row {
            Some(row) => Ok(row.text("value")?.unwrap_or_else(|| default.to_owned())),
            None => Ok(default.to_owned()),
        }
    }

    pub fn get_config_all(&mut self) -> Result<super::config::RelaySettings> {
        let mut settings = super::config::RelaySettings::default();
        let rows = self.engine().query("SELECT key, value FROM config", &[])?;

        for row in rows {
            let key = row.req_text("key")?;

            // ignore rows for keys this version no longer knows about
            if !CONFIG_DEFAULTS.iter().any(|(k, _, _)| *k == key) {
                continue;
            }

            if let Some(value) = row.text("value")? {
                settings.apply(&key, &value)?;
            }
        }

        Ok(settings)
    }

    /// Validate, coerce and store a config value. Changing `log-level` or
    /// `private-key` also updates the running process.
    pub fn put_config(&mut self, key: &str, value: &str) -> Result<String> {
        let coerced = coerce(key, value)?;

        if let Some(runtime) = self.runtime.get() {
            match key {
                "log-level" => runtime.log.set_level(logger::parse_level(&coerced)?)?,
                "private-key" => runtime.signer.set_key(&coerced)?,
                _ => (),
            }
        }

        self.put_config_raw(key, &coerced)?;

        Ok(coerced)
    }

    pub(super) fn put_config_raw(&mut self, key: &str, value: &str) -> Result<()> {
        let ty = super::config::default_type(key)?;

        self.engine().execute(
            "INSERT INTO config (key, value, type) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = $2, type = $3",
            &[
                SqlValue::from(key),
                SqlValue::from(value),
                SqlValue::from(ty.name()),
            ],
        )?;

        Ok(())
    }

    // domain bans

    pub fn get_domain_ban(&mut self, domain: &str) -> Result<Option<DomainBan>> {
        let domain = normalize_domain(domain)?;
        let row = self.engine().query_one(
            "SELECT * FROM domain_bans WHERE domain = $1",
            &[SqlValue::from(domain)],
        )?;

        row.as_ref().map(DomainBan::from_row).transpose()
    }

    pub fn get_domain_bans(&mut self) -> Result<Vec<DomainBan>> {
        self.engine()
            .query("SELECT * FROM domain_bans ORDER BY domain", &[])?
            .iter()
            .map(DomainBan::from_row)
            .collect()
    }

    pub fn put_domain_ban(
        &mut self,
        domain: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<DomainBan> {
        let domain = normalize_domain(domain)?;

        if self.get_domain_ban(&domain)?.is_some() {
            return Err(Error::Conflict {
                what: format!("ban for {domain}"),
            });
        }

        self.engine().execute(
            "INSERT INTO domain_bans (domain, reason, note, created) VALUES ($1, $2, $3, $4)",
            &[
                SqlValue::from(domain.as_str()),
                SqlValue::opt_text(reason),
                SqlValue::opt_text(note),
                SqlValue::from(now_timestamp()),
            ],
        )?;

        self.get_domain_ban(&domain)?
            .ok_or_else(|| Error::not_found(format!("ban for {domain}")))
    }

    pub fn update_domain_ban(
        &mut self,
        domain: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<DomainBan> {
        let domain = normalize_domain(domain)?;

        if reason.is_none() && note.is_none() {
            return Err(Error::key("a reason and/or note must be specified"));
        }

        let count = self.update_ban_columns("domain_bans", "domain", &domain, reason, note)?;
        if count > 1 {
            return Err(Error::TooManyRows);
        }

        self.get_domain_ban(&domain)?
            .ok_or_else(|| Error::not_found(format!("ban for {domain}")))
    }

    pub fn del_domain_ban(&mut self, domain: &str) -> Result<bool> {
        let domain = normalize_domain(domain)?;
        let count = self.engine().execute(
            "DELETE FROM domain_bans WHERE domain = $1",
            &[SqlValue::from(domain)],
        )?;

        if count > 1 {
            return Err(Error::TooManyRows);
        }

        Ok(count == 1)
    }

    /// Ban a domain and drop its instance row in a single transaction.
    pub fn ban_domain(
        &mut self,
        domain: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<DomainBan> {
        self.transaction(|s| {
            let ban = s.put_domain_ban(domain, reason, note)?;
            s.del_inbox(domain)?;
            Ok(ban)
        })
    }

    // software bans

    pub fn get_software_ban(&mut self, name: &str) -> Result<Option<SoftwareBan>> {
        let row = self.engine().query_one(
            "SELECT * FROM software_bans WHERE name = $1",
            &[SqlValue::from(name.to_lowercase())],
        )?;

        row.as_ref().map(SoftwareBan::from_row).transpose()
    }

    pub fn get_software_bans(&mut self) -> Result<Vec<SoftwareBan>> {
        self.engine()
            .query("SELECT * FROM software_bans ORDER BY name", &[])?
            .iter()
            .map(SoftwareBan::from_row)
            .collect()
    }

    pub fn put_software_ban(
        &mut self,
        name: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<SoftwareBan> {
        let name = name.to_lowercase();

        if self.get_software_ban(&name)?.is_some() {
            return Err(Error::Conflict {
                what: format!("ban for {name}"),
            });
        }

        self.engine().execute(
            "INSERT INTO software_bans (name, reason, note, created) VALUES ($1, $2, $3, $4)",
            &[
                SqlValue::from(name.as_str()),
                SqlValue::opt_text(reason),
                SqlValue::opt_text(note),
                SqlValue::from(now_timestamp()),
            ],
        )?;

        self.get_software_ban(&name)?
            .ok_or_else(|| Error::not_found(format!("ban for {name}")))
    }

    pub fn update_software_ban(
        &mut self,
        name: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<SoftwareBan> {
        let name = name.to_lowercase();

        if reason.is_none() && note.is_none() {
            return Err(Error::key("a reason and/or note must be specified"));
        }

        let count = self.update_ban_columns("software_bans", "name", &name, reason, note)?;
        if count > 1 {
            return Err(Error::TooManyRows);
        }

        self.get_software_ban(&name)?
            .ok_or_else(|| Error::not_found(format!("ban for {name}")))
    }

    pub fn del_software_ban(&mut self, name: &str) -> Result<bool> {
        let count = self.engine().execute(
            "DELETE FROM software_bans WHERE name = $1",
            &[SqlValue::from(name.to_lowercase())],
        )?;

        if count > 1 {
            return Err(Error::TooManyRows);
        }

        Ok(count == 1)
    }

    fn update_ban_columns(
        &mut self,
        table: &str,
        key_col: &str,
        key: &str,
        reason: Option<&str>,
        note: Option<&str>,
    ) -> Result<usize> {
        let mut sets = Vec::new();
        let mut params = Vec::new();

        for (col, value) in [("reason", reason), ("note", note)] {
            if let Some(v) = value {
                params.push(SqlValue::from(v));
                sets.push(format!("{col} = ${}", params.len()));
            }
        }

        params.push(SqlValue::from(key));
        let sql = format!(
            "UPDATE {table} SET {} WHERE {key_col} = ${}",
            sets.join(", "),
            params.len()
        );

        self.engine().execute(&sql, &params)
    }

    // whitelist

    pub fn get_domain_whitelist(&mut self, domain: &str) -> Result<Option<WhitelistEntry>> {
        let domain = normalize_domain(domain)?;
        let row = self.engine().query_one(
            "SELECT * FROM whitelist WHERE domain = $1",
            &[SqlValue::from(domain)],
        )?;

        Ok(match row {
            Some(row) => Some(WhitelistEntry {
                domain: row.req_text("domain")?,
                created: row.timestamp("created")?,
            }),
            None => None,
        })
    }

    pub fn get_domain_whitelists(&mut self) -> Result<Vec<WhitelistEntry>> {
        self.engine()
            .query("SELECT * FROM whitelist ORDER BY domain", &[])?
            .iter()
            .map(|row| {
                Ok(WhitelistEntry {
                    domain: row.req_text("domain")?,
                    created: row.timestamp("created")?,
                })
            })
            .collect()
    }

    pub fn put_domain_whitelist(&mut self, domain: &str) -> Result<WhitelistEntry> {
        let domain = normalize_domain(domain)?;

        if self.get_domain_whitelist(&domain)?.is_some() {
            return Err(Error::Conflict {
                what: format!("whitelist entry for {domain}"),
            });
        }

        self.engine().execute(
            "INSERT INTO whitelist (domain, created) VALUES ($1, $2)",
            &[
                SqlValue::from(domain.as_str()),
                SqlValue::from(now_timestamp()),
            ],
        )?;

        self.get_domain_whitelist(&domain)?
            .ok_or_else(|| Error::not_found(format!("whitelist entry for {domain}")))
    }

    pub fn del_domain_whitelist(&mut self, domain: &str) -> Result<bool> {
        let domain = normalize_domain(domain)?;
        let count = self.engine().execute(
            "DELETE FROM whitelist WHERE domain = $1",
            &[SqlValue::from(domain)],
        )?;

        if count > 1 {
            return Err(Error::TooManyRows);
        }

        Ok(count == 1)
    }

    // users and tokens, only ever touched by the admin surface

    pub fn get_user(&mut self, username: &str) -> Result<Option<User>> {
        let row = self.engine().query_one(
            "SELECT * FROM users WHERE username = $1",
            &[SqlValue::from(username)],
        )?;

        row.as_ref().map(User::from_row).transpose()
    }

    pub fn get_users(&mut self) -> Result<Vec<User>> {
        self.engine()
            .query("SELECT * FROM users ORDER BY username", &[])?
            .iter()
            .map(User::from_row)
            .collect()
    }

    pub fn get_user_by_token(&mut self, code: &str) -> Result<Option<User>> {
        let row = self.engine().query_one(
            "SELECT u.* FROM users u JOIN tokens t ON t.\"user\" = u.username WHERE t.code = $1",
            &[SqlValue::from(code)],
        )?;

        row.as_ref().map(User::from_row).transpose()
    }

    pub fn put_user(
        &mut self,
        username: &str,
        password: &str,
        handle: Option<&str>,
    ) -> Result<User> {
        if self.get_user(username)?.is_some() {
            return Err(Error::Conflict {
                what: format!("user {username}"),
            });
        }

        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::key(format!("unable to hash password: {e}")))?
            .to_string();

        self.engine().execute(
            "INSERT INTO users (username, hash, handle, created) VALUES ($1, $2, $3, $4)",
            &[
                SqlValue::from(username),
                SqlValue::from(hash),
                SqlValue::opt_text(handle),
                SqlValue::from(now_timestamp()),
            ],
        )?;

        self.get_user(username)?
            .ok_or_else(|| Error::not_found(format!("user {username}")))
    }

    /// Deletes the user and any tokens issued for them.
    pub fn del_user(&mut self, username: &str) -> Result<()> {
        let user = self
            .get_user(username)?
            .ok_or_else(|| Error::not_found(format!("user {username}")))?;

        self.transaction(|s| {
            s.engine().execute(
                "DELETE FROM users WHERE username = $1",
                &[SqlValue::from(user.username.as_str())],
            )?;
            s.engine().execute(
                "DELETE FROM tokens WHERE \"user\" = $1",
                &[SqlValue::from(user.username.as_str())],
            )?;

            Ok(())
        })
    }

    pub fn put_token(&mut self, username: &str) -> Result<Token> {
        let code = Uuid::new_v4().simple().to_string();
        let created = now_timestamp();

        self.engine().execute(
            "INSERT INTO tokens (code, \"user\", created) VALUES ($1, $2, $3)",
            &[
                SqlValue::from(code.as_str()),
                SqlValue::from(username),
                SqlValue::from(created.as_str()),
            ],
        )?;

        Ok(Token {
            code,
            user: username.to_owned(),
            created: Utc::now(),
        })
    }

    pub fn del_token(&mut self, code: &str) -> Result<()> {
        self.engine()
            .execute("DELETE FROM tokens WHERE code = $1", &[SqlValue::from(code)])?;

        Ok(())
    }
}
