mod assistant;
mod backup;
mod config;
mod db;
mod error;
mod ipc;
mod migrate;
mod notify;
mod schedule;
mod seed;
mod summaries;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
}

fn run_import_seed(workspace: &Path, dataset: Option<&Path>) -> anyhow::Result<serde_json::Value> {
    let conn = db::open_db(workspace)?;
    let data = seed::load_dataset(dataset)?;
    let out = seed::import_seed(&conn, &data)?;
    Ok(out)
}

fn run_migrate_debriefs(workspace: &Path, csv: Option<&Path>) -> anyhow::Result<serde_json::Value> {
    let conn = db::open_db(workspace)?;
    let cfg = config::PortalConfig::load(&conn)?;
    let text = match csv {
        Some(p) => std::fs::read_to_string(p)
            .with_context(|| format!("failed to read {}", p.to_string_lossy()))?,
        None => migrate::DEFAULT_DEBRIEFS_CSV.to_string(),
    };
    let report = migrate::migrate_debriefs(
        &conn,
        &text,
        migrate::DEFAULT_MIGRATION_SEMESTER,
        cfg.debrief_batch_size,
    )?;
    Ok(serde_json::to_value(report)?)
}

/// `seedportald import-seed <workspace> [dataset.json]` and
/// `seedportald migrate-debriefs <workspace> [debriefs.csv]` run once and exit.
fn run_one_shot(args: &[String]) -> Option<i32> {
    let command = args.first()?.as_str();
    if command != "import-seed" && command != "migrate-debriefs" {
        return None;
    }
    let Some(workspace) = args.get(1).map(PathBuf::from) else {
        eprintln!("usage: seedportald {} <workspace> [input]", command);
        return Some(2);
    };
    let input = args.get(2).map(PathBuf::from);

    let result = if command == "import-seed" {
        run_import_seed(&workspace, input.as_deref())
    } else {
        run_migrate_debriefs(&workspace, input.as_deref())
    };
    match result {
        Ok(out) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&out).unwrap_or_else(|_| out.to_string())
            );
            Some(0)
        }
        Err(e) => {
            log::error!("{} failed: {:#}", command, e);
            Some(1)
        }
    }
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(code) = run_one_shot(&args) {
        std::process::exit(code);
    }

    let mut state = ipc::AppState::default();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                log::warn!("dropping malformed request: {}", e);
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
