use crate::ipc::helpers::{
    db_err, get_optional_bool, get_optional_str, get_required_date, get_required_i64,
    get_required_str, with_conn, with_state, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, WeekInput};
use rusqlite::Connection;
use serde_json::json;

fn schedule_upsert_week(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input = WeekInput {
        semester: get_required_str(params, "semester")?,
        week_number: get_required_i64(params, "weekNumber")?,
        week_label: get_optional_str(params, "weekLabel"),
        week_start: get_required_date(params, "weekStart")?,
        week_end: get_required_date(params, "weekEnd")?,
        is_break: get_optional_bool(params, "isBreak")?.unwrap_or(false),
        session_focus: get_optional_str(params, "sessionFocus"),
        notes: get_optional_str(params, "notes"),
    };
    let week_id = schedule::upsert_week(conn, &input)?;
    let semester_id = schedule::semester_id_by_label(conn, &input.semester).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "weekId": week_id, "semesterId": semester_id }))
}

/// Explicit id, then semester label, then the active semester.
fn resolve_semester_id(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<Option<String>, HandlerErr> {
    if let Some(id) = get_optional_str(params, "semesterId") {
        return Ok(Some(id));
    }
    if let Some(label) = get_optional_str(params, "semester") {
        return schedule::semester_id_by_label(conn, &label).map_err(db_err("db_query_failed"));
    }
    if let Some(id) = schedule::active_semester_id(conn).map_err(db_err("db_query_failed"))? {
        return Ok(Some(id));
    }
    schedule::semester_id_by_label(conn, &state.config.active_semester).map_err(db_err("db_query_failed"))
}

fn schedule_list(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let include_all = get_optional_bool(params, "includeAll")?.unwrap_or(false);
    let semester_id = if include_all {
        None
    } else {
        resolve_semester_id(state, conn, params)?
    };
    let today = match get_optional_str(params, "today") {
        Some(raw) => schedule::parse_any_date(&raw)
            .ok_or_else(|| HandlerErr::bad_params("today must be YYYY-MM-DD"))?,
        None => chrono::Local::now().date_naive(),
    };

    let mut weeks = if include_all || semester_id.is_some() {
        schedule::load_weeks(conn, semester_id.as_deref()).map_err(db_err("db_query_failed"))?
    } else {
        Vec::new()
    };
    let metadata = schedule::schedule_metadata(&weeks, today);
    weeks.sort_by_key(|w| w.week_number);
    Ok(json!({
        "semesterId": semester_id,
        "schedule": weeks,
        "metadata": metadata,
    }))
}

fn schedule_find_week(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_date(params, "date")?;
    let weeks = match get_optional_str(params, "semesterId") {
        Some(id) => schedule::load_weeks(conn, Some(&id)),
        None => schedule::weeks_for_lookup(conn, Some(&state.config.active_semester)),
    }
    .map_err(db_err("db_query_failed"))?;
    match schedule::find_week(&weeks, date) {
        Some(info) => Ok(json!(info)),
        None => Ok(json!({ "weekNumber": null, "weekEnding": null, "matched": null })),
    }
}

fn semesters_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.semester, s.is_active,
                    (SELECT COUNT(*) FROM semester_schedule w WHERE w.semester_id = s.id),
                    (SELECT MIN(week_start) FROM semester_schedule w WHERE w.semester_id = s.id),
                    (SELECT MAX(week_end) FROM semester_schedule w WHERE w.semester_id = s.id)
             FROM semester_config s
             ORDER BY s.semester",
        )
        .map_err(db_err("db_query_failed"))?;
    let semesters = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "semester": r.get::<_, String>(1)?,
                "isActive": r.get::<_, i64>(2)? != 0,
                "weekCount": r.get::<_, i64>(3)?,
                "startDate": r.get::<_, Option<String>>(4)?,
                "endDate": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "semesters": semesters }))
}

fn semesters_activate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_str(params, "semesterId")?;
    schedule::activate_semester(conn, &semester_id)?;
    log::info!("semester {} activated", semester_id);
    Ok(json!({ "ok": true, "semesterId": semester_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schedule.upsertWeek" => Some(with_conn(state, req, schedule_upsert_week)),
        "schedule.list" => Some(with_state(state, req, schedule_list)),
        "schedule.findWeek" => Some(with_state(state, req, schedule_find_week)),
        "semesters.list" => Some(with_conn(state, req, semesters_list)),
        "semesters.activate" => Some(with_conn(state, req, semesters_activate)),
        _ => None,
    }
}
