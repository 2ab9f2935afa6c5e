use crate::backup;
use crate::config::PortalConfig;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::get_optional_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(out_path) = get_optional_str(&req.params, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let workspace_path = get_optional_str(&req.params, "workspacePath")
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(FULL)") {
            log::warn!("wal checkpoint before export failed: {}", e);
        }
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256,
        }),
    )
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(in_path) = get_optional_str(&req.params, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let workspace_path = get_optional_str(&req.params, "workspacePath")
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            log::error!("bundle import failed: {:#}", e);
            // Rejected bundles never touch the database file; keep serving it.
            if let Some(current) = state.workspace.clone() {
                match db::open_db(&current) {
                    Ok(conn) => state.db = Some(conn),
                    Err(reopen) => log::error!("reopen after failed import: {:#}", reopen),
                }
            }
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": src.to_string_lossy() })),
            );
        }
    };

    let conn = match db::open_db(&workspace_path) {
        Ok(conn) => conn,
        Err(e) => return err(&req.id, "db_open_failed", e.to_string(), None),
    };
    let config = match PortalConfig::load(&conn) {
        Ok(cfg) => cfg,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    state.workspace = Some(workspace_path.clone());
    state.db = Some(conn);
    state.config = config;
    ok(
        &req.id,
        json!({
            "ok": true,
            "workspacePath": workspace_path.to_string_lossy(),
            "bundleFormat": import.bundle_format,
            "filesRestored": import.files_restored,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "workspace.exportBundle" => Some(handle_export_bundle(state, req)),
        "workspace.importBundle" => Some(handle_import_bundle(state, req)),
        _ => None,
    }
}
