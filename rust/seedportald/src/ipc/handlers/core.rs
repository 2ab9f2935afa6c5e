use crate::config::PortalConfig;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };
    let config = match PortalConfig::load(&conn) {
        Ok(cfg) => cfg,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    log::info!("workspace selected: {}", path.to_string_lossy());

    state.workspace = Some(path.clone());
    state.db = Some(conn);
    state.config = config;
    ok(
        &req.id,
        json!({
            "workspacePath": path.to_string_lossy(),
            "config": state.config,
        }),
    )
}

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }
    ok(&req.id, json!({ "config": state.config }))
}

fn config_set(conn: &rusqlite::Connection, params: &serde_json::Value) -> Result<PortalConfig, HandlerErr> {
    let key = get_required_str(params, "key")?;
    let Some(value) = params.get("value") else {
        return Err(HandlerErr::bad_params("missing value"));
    };
    PortalConfig::store(conn, &key, value).map_err(HandlerErr::bad_params)?;
    PortalConfig::load(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_config_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match config_set(conn, &req.params) {
        Ok(cfg) => {
            state.config = cfg;
            ok(&req.id, json!({ "config": state.config }))
        }
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "config.get" => Some(handle_config_get(state, req)),
        "config.set" => Some(handle_config_set(state, req)),
        _ => None,
    }
}
