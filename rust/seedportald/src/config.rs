use rusqlite::Connection;
use serde::Serialize;

use crate::db;

pub const DEFAULT_SUBMISSION_PASSWORD: &str = "SEED2025";
pub const DEFAULT_SEMESTER: &str = "FALL 2025";
pub const DEFAULT_DEBRIEF_BATCH_SIZE: usize = 50;

const KEY_SUBMISSION_PASSWORD: &str = "config.submissionPassword";
const KEY_ACTIVE_SEMESTER: &str = "config.activeSemester";
const KEY_DEBRIEF_BATCH_SIZE: &str = "config.debriefBatchSize";

const ENV_SUBMISSION_PASSWORD: &str = "SEEDPORTAL_SUBMISSION_PASSWORD";
const ENV_SEMESTER: &str = "SEEDPORTAL_SEMESTER";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalConfig {
    /// Shared gate for the attendance and client-intake forms.
    #[serde(skip_serializing)]
    pub submission_password: String,
    pub active_semester: String,
    pub debrief_batch_size: usize,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            submission_password: DEFAULT_SUBMISSION_PASSWORD.to_string(),
            active_semester: DEFAULT_SEMESTER.to_string(),
            debrief_batch_size: DEFAULT_DEBRIEF_BATCH_SIZE,
        }
    }
}

impl PortalConfig {
    /// Defaults, then workspace settings, then environment.
    pub fn load(conn: &Connection) -> rusqlite::Result<Self> {
        let mut cfg = PortalConfig::default();

        if let Some(v) = db::settings_get_json(conn, KEY_SUBMISSION_PASSWORD)? {
            if let Some(s) = v.as_str().filter(|s| !s.is_empty()) {
                cfg.submission_password = s.to_string();
            }
        }
        if let Some(v) = db::settings_get_json(conn, KEY_ACTIVE_SEMESTER)? {
            if let Some(s) = v.as_str().filter(|s| !s.trim().is_empty()) {
                cfg.active_semester = s.trim().to_string();
            }
        }
        if let Some(v) = db::settings_get_json(conn, KEY_DEBRIEF_BATCH_SIZE)? {
            if let Some(n) = v.as_u64().filter(|n| *n > 0) {
                cfg.debrief_batch_size = n as usize;
            }
        }

        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(ENV_SUBMISSION_PASSWORD) {
            if !v.is_empty() {
                self.submission_password = v;
            }
        }
        if let Ok(v) = std::env::var(ENV_SEMESTER) {
            if !v.trim().is_empty() {
                self.active_semester = v.trim().to_string();
            }
        }
    }

    /// Validates and persists one setting. Returns the storage key written.
    pub fn store(
        conn: &Connection,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<&'static str, String> {
        let storage_key = match key {
            "submissionPassword" => {
                if value.as_str().map(|s| s.is_empty()).unwrap_or(true) {
                    return Err("submissionPassword must be a non-empty string".to_string());
                }
                KEY_SUBMISSION_PASSWORD
            }
            "activeSemester" => {
                if value.as_str().map(|s| s.trim().is_empty()).unwrap_or(true) {
                    return Err("activeSemester must be a non-empty string".to_string());
                }
                KEY_ACTIVE_SEMESTER
            }
            "debriefBatchSize" => {
                if value.as_u64().filter(|n| *n > 0).is_none() {
                    return Err("debriefBatchSize must be a positive integer".to_string());
                }
                KEY_DEBRIEF_BATCH_SIZE
            }
            other => return Err(format!("unknown config key: {}", other)),
        };
        db::settings_set_json(conn, storage_key, value).map_err(|e| e.to_string())?;
        Ok(storage_key)
    }

    pub fn password_matches(&self, candidate: &str) -> bool {
        candidate == self.submission_password
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stored_settings_override_defaults() {
        let conn = db::open_in_memory().expect("open");
        PortalConfig::store(&conn, "debriefBatchSize", &json!(10)).expect("store");
        PortalConfig::store(&conn, "activeSemester", &json!("SPRING 2026")).expect("store");
        let cfg = PortalConfig::load(&conn).expect("load");
        assert_eq!(cfg.debrief_batch_size, 10);
        if std::env::var(ENV_SEMESTER).is_err() {
            assert_eq!(cfg.active_semester, "SPRING 2026");
        }
    }

    #[test]
    fn store_rejects_bad_values() {
        let conn = db::open_in_memory().expect("open");
        assert!(PortalConfig::store(&conn, "debriefBatchSize", &json!(0)).is_err());
        assert!(PortalConfig::store(&conn, "submissionPassword", &json!("")).is_err());
        assert!(PortalConfig::store(&conn, "nope", &json!(1)).is_err());
    }
}
