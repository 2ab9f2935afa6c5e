use crate::ipc::helpers::{get_optional_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::seed;
use rusqlite::Connection;
use std::path::PathBuf;

fn seed_import(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let path = get_optional_str(params, "datasetPath").map(PathBuf::from);
    if let Some(p) = &path {
        if !p.is_file() {
            return Err(HandlerErr::new("not_found", "dataset file not found")
                .with_details(serde_json::json!({ "path": p.to_string_lossy() })));
        }
    }
    let data = seed::load_dataset(path.as_deref())?;
    log::info!(
        "seeding {}: {} directors, {} students, {} clients",
        data.semester,
        data.directors.len(),
        data.students.len(),
        data.clients.len()
    );
    Ok(seed::import_seed(conn, &data)?)
}

fn seed_audit(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(seed::audit_mappings(conn)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "seed.import" => Some(with_conn(state, req, seed_import)),
        "seed.audit" => Some(with_conn(state, req, seed_audit)),
        _ => None,
    }
}
