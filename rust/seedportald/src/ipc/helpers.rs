use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::error::PortalError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<PortalError> for HandlerErr {
    fn from(e: PortalError) -> Self {
        HandlerErr::new(e.code(), e.to_string())
    }
}

/// Maps a database error to a handler error with the given code.
pub fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string())
}

/// Same as `db_err`, tagging the table the statement touched.
pub fn table_err(code: &'static str, table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table }))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed string; empty strings read as absent.
pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn get_required_bool(params: &serde_json::Value, key: &str) -> Result<bool, HandlerErr> {
    get_optional_bool(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| HandlerErr::bad_params(format!("{} must be a number", key))),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    get_optional_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Positive `limit`, falling back to `default`.
pub fn get_limit(params: &serde_json::Value, default: i64) -> Result<i64, HandlerErr> {
    Ok(get_optional_i64(params, "limit")?
        .filter(|n| *n > 0)
        .unwrap_or(default))
}

pub fn get_required_date(params: &serde_json::Value, key: &str) -> Result<chrono::NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    crate::schedule::parse_any_date(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD or M/D/YYYY", key)))
}

/// Rejects callers whose email does not belong to a director.
pub fn require_director(conn: &Connection, params: &serde_json::Value) -> Result<String, HandlerErr> {
    let email = get_required_str(params, "userEmail")?;
    let found: Option<String> = conn
        .query_row("SELECT id FROM directors WHERE email = ?", [&email], |r| r.get(0))
        .optional()
        .map_err(db_err("db_query_failed"))?;
    found.ok_or_else(|| HandlerErr::new("forbidden", "only directors can perform this action"))
}

/// Runs `f` against the open workspace database.
pub fn with_conn(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

/// Like `with_conn`, for handlers that also read the loaded config or workspace path.
pub fn with_state(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&AppState, &Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(state, conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}
