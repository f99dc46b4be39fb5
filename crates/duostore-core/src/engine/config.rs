//! Persisted engine configuration.
//!
//! Stored as `storage.*` rows in the `settings` table so that an
//! administrator's choice survives restarts.

use std::fmt;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;

/// Default PostgreSQL port.
pub const DEFAULT_EXTERNAL_PORT: u16 = 5432;

const KEY_PREFIX: &str = "storage.";

/// Which engine serves migratable tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Embedded,
    External,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Embedded => "embedded",
            EngineKind::External => "external",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedded" | "sqlite" => Ok(EngineKind::Embedded),
            "external" | "postgres" | "postgresql" => Ok(EngineKind::External),
            other => Err(Error::InvalidConfig(format!("unknown engine '{other}'"))),
        }
    }
}

/// Engine selection plus external connection details.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Embedded,
            host: String::new(),
            port: DEFAULT_EXTERNAL_PORT,
            user: String::new(),
            password: String::new(),
            database: String::new(),
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("database", &self.database)
            .finish()
    }
}

impl EngineConfig {
    /// Embedded-only configuration.
    pub fn embedded() -> Self {
        Self::default()
    }

    /// External configuration with the default port and no password.
    pub fn external(host: impl Into<String>, user: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            engine: EngineKind::External,
            host: host.into(),
            user: user.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn is_external(&self) -> bool {
        self.engine == EngineKind::External
    }

    /// An external configuration needs a host, user and database.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.is_external() {
            return Ok(());
        }
        let missing: Vec<&str> = [
            ("host", &self.host),
            ("user", &self.user),
            ("database", &self.database),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "external engine requires {}",
                missing.join(", ")
            )));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Load from `settings`. Missing keys fall back to defaults.
    pub fn load(conn: &Connection) -> rusqlite::Result<Self> {
        let mut stmt = conn.prepare("SELECT key, value FROM settings WHERE key LIKE 'storage.%'")?;
        let pairs = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut config = Self::default();
        for (key, value) in pairs {
            let value = value.unwrap_or_default();
            match key.trim_start_matches(KEY_PREFIX) {
                "engine" => match value.parse() {
                    Ok(kind) => config.engine = kind,
                    Err(e) => warn!(error = %e, "ignoring stored engine kind"),
                },
                "host" => config.host = value,
                "port" => match value.trim().parse() {
                    Ok(port) => config.port = port,
                    Err(_) => warn!(port = %value, "ignoring stored port"),
                },
                "user" => config.user = value,
                "password" => config.password = value,
                "database" => config.database = value,
                _ => {}
            }
        }
        Ok(config)
    }

    /// Persist to `settings` in one transaction.
    pub fn save(&self, conn: &mut Connection) -> rusqlite::Result<()> {
        let now = Utc::now().to_rfc3339();
        let port = self.port.to_string();
        let tx = conn.transaction()?;
        for (key, value) in [
            ("engine", self.engine.as_str()),
            ("host", self.host.as_str()),
            ("port", port.as_str()),
            ("user", self.user.as_str()),
            ("password", self.password.as_str()),
            ("database", self.database.as_str()),
        ] {
            tx.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![format!("{KEY_PREFIX}{key}"), value, now],
            )?;
        }
        tx.commit()
    }
}
