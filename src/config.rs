//! Configuration management for the mediator process.
//!
//! Settings are loaded from a TOML file with the `config` crate and
//! deserialized via `serde`. After loading, `validate` performs semantic
//! checks (unique module ids, resolvable historian references) so that a
//! misconfigured process refuses to start instead of failing at runtime.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Transport binding for the client-facing HTTP/WebSocket listener.
    pub listen_host: String,
    pub listen_port: u16,

    /// Logging verbosity ("trace", "debug", "info", "warn", "error").
    pub log_level: String,

    /// Threshold for the historian stale-value warning: incoming values
    /// whose timestamp deviates from wall clock by more than this emit a
    /// warning event but are still appended.
    pub timestamp_check_warning_ms: i64,

    /// A session that has pending outbound traffic and no acknowledgement
    /// for this long is abandoned and purged.
    pub session_idle_seconds: u64,

    /// Interval between periodic variable-file flushes.
    pub variables_flush_interval_ms: u64,

    /// When set, variable updates whose timestamp is strictly older than
    /// the stored value are rejected.
    pub reject_older_timestamps: bool,

    /// When set, the current local time is written to this file once all
    /// modules completed init; the file is deleted on clean shutdown.
    pub start_complete_file: Option<String>,

    pub modules: Vec<ModuleSettings>,
    pub history_dbs: Vec<HistoryDbSettings>,
    pub users: Vec<UserSettings>,
    pub locations: Vec<LocationSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8082,
            log_level: "info".to_string(),
            timestamp_check_warning_ms: 60_000,
            session_idle_seconds: 60,
            variables_flush_interval_ms: 5_000,
            reject_older_timestamps: false,
            start_complete_file: None,
            modules: Vec::new(),
            history_dbs: Vec::new(),
            users: Vec::new(),
            locations: Vec::new(),
        }
    }
}

/// Declaration of one hosted module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSettings {
    /// Stable module id; the `module` component of every object reference.
    pub id: String,
    pub name: String,

    /// Key into the compile-time module factory registry.
    pub impl_class: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Modules with `concurrent_init = false` initialise sequentially in
    /// configuration order before the concurrent remainder.
    #[serde(default)]
    pub concurrent_init: bool,

    /// Password for module loopback logins.
    #[serde(default)]
    pub password: String,

    /// Snapshot file for the module's current variable values.
    #[serde(default)]
    pub variables_file: Option<String>,

    /// Name of the historian database receiving this module's variables.
    #[serde(default)]
    pub history_db: Option<String>,

    /// Free-form module-specific configuration.
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// One time-series database, served by a dedicated historian worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryDbSettings {
    pub name: String,
    pub file: String,
    #[serde(default = "default_true")]
    pub prioritize_reads: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSettings {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
}

impl Settings {
    /// Loads settings from a TOML file and validates them.
    pub fn load(path: &Path) -> Result<Settings> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("failed to read config file {}", path.display()))?
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            bail!("listen_host must not be empty");
        }
        if self.listen_port == 0 {
            bail!("listen_port must not be zero");
        }

        let mut module_ids = HashSet::new();
        for m in &self.modules {
            if m.id.is_empty() {
                bail!("module id must not be empty");
            }
            if m.id.contains(':') || m.id.contains('.') {
                bail!("module id '{}' must not contain ':' or '.'", m.id);
            }
            if !module_ids.insert(&m.id) {
                bail!("duplicate module id '{}'", m.id);
            }
            if m.impl_class.is_empty() {
                bail!("module '{}' has empty impl_class", m.id);
            }
            if let Some(db) = &m.history_db {
                if !self.history_dbs.iter().any(|d| &d.name == db) {
                    bail!("module '{}' references unknown history db '{}'", m.id, db);
                }
            }
        }

        let mut db_names = HashSet::new();
        for db in &self.history_dbs {
            if db.name.is_empty() || db.file.is_empty() {
                bail!("history db name and file must not be empty");
            }
            if !db_names.insert(&db.name) {
                bail!("duplicate history db '{}'", db.name);
            }
        }

        let mut logins = HashSet::new();
        for u in &self.users {
            if u.login.is_empty() {
                bail!("user login must not be empty");
            }
            if !logins.insert(&u.login) {
                bail!("duplicate user login '{}'", u.login);
            }
        }

        for loc in &self.locations {
            if let Some(parent) = &loc.parent {
                if !self.locations.iter().any(|l| &l.id == parent) {
                    bail!("location '{}' references unknown parent '{}'", loc.id, parent);
                }
            }
        }

        Ok(())
    }

    pub fn module(&self, id: &str) -> Option<&ModuleSettings> {
        self.modules.iter().find(|m| m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        Settings {
            modules: vec![ModuleSettings {
                id: "io".to_string(),
                name: "IO".to_string(),
                impl_class: "Simulator".to_string(),
                enabled: true,
                concurrent_init: false,
                password: String::new(),
                variables_file: None,
                history_db: Some("main".to_string()),
                config: HashMap::new(),
            }],
            history_dbs: vec![HistoryDbSettings {
                name: "main".to_string(),
                file: ":memory:".to_string(),
                prioritize_reads: true,
            }],
            ..Settings::default()
        }
    }

    #[test]
    fn valid_settings_pass() {
        base().validate().unwrap();
    }

    #[test]
    fn duplicate_module_id_rejected() {
        let mut s = base();
        s.modules.push(s.modules[0].clone());
        assert!(s.validate().is_err());
    }

    #[test]
    fn unknown_history_db_rejected() {
        let mut s = base();
        s.modules[0].history_db = Some("nope".to_string());
        assert!(s.validate().is_err());
    }

    #[test]
    fn module_id_with_separator_rejected() {
        let mut s = base();
        s.modules[0].id = "io:x".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediator.toml");
        std::fs::write(
            &path,
            r#"
listen_port = 9000

[[modules]]
id = "sim"
name = "Simulator"
impl_class = "Simulator"
history_db = "main"

[modules.config]
period_ms = 250

[[history_dbs]]
name = "main"
file = "history.db"

[[users]]
login = "op"
password = "secret"
roles = ["Operator"]
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.listen_port, 9000);
        assert_eq!(settings.modules.len(), 1);
        assert_eq!(settings.modules[0].config["period_ms"], serde_json::json!(250));
        assert_eq!(settings.users[0].roles, vec!["Operator".to_string()]);
    }
}
