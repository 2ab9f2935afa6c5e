use crate::db;
use crate::ipc::helpers::{
    db_err, get_optional_i64, get_optional_str, get_required_bool, get_required_date,
    get_required_i64, get_required_str, require_director, table_err, with_conn, with_state,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, NotificationType};
use crate::schedule;
use chrono::{Datelike, Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// Week numbers are 1-based and capped at a year.
const MAX_WEEK_NUMBER: i64 = 53;

fn week_password(conn: &Connection, semester_id: &str, week_number: i64) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT password FROM attendance_passwords WHERE semester_id = ? AND week_number = ?",
        (semester_id, week_number),
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err("db_query_failed"))
}

fn attendance_submit(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let password = get_required_str(params, "password")?;
    let student_name = get_required_str(params, "studentName")?;
    let student_email = get_required_str(params, "studentEmail")?;
    let clinic = get_required_str(params, "clinic")?;
    let week_number = get_required_i64(params, "weekNumber")?;
    let class_date = get_required_date(params, "classDate")?;

    let semester_id = schedule::active_semester_id(conn).map_err(db_err("db_query_failed"))?;
    let expected = match &semester_id {
        Some(sid) => week_password(conn, sid, week_number)?,
        None => None,
    };
    let accepted = match &expected {
        Some(p) => *p == password,
        None => state.config.password_matches(&password),
    };
    if !accepted {
        log::warn!("attendance password rejected for week {}", week_number);
        return Err(HandlerErr::new("forbidden", "incorrect attendance password")
            .with_details(json!({ "weekNumber": week_number })));
    }

    let student_id = match get_optional_str(params, "studentId") {
        Some(id) => Some(id),
        None => conn
            .query_row("SELECT id FROM students WHERE email = ?", [&student_email], |r| r.get(0))
            .optional()
            .map_err(db_err("db_query_failed"))?,
    };

    let duplicate = conn
        .query_row(
            "SELECT id FROM attendance
             WHERE student_email = ? COLLATE NOCASE AND week_number = ?
               AND semester_id IS ?",
            rusqlite::params![student_email, week_number, semester_id],
            |r| r.get::<_, String>(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(existing) = duplicate {
        return Err(HandlerErr::new("conflict", "attendance already recorded for this week")
            .with_details(json!({ "attendanceId": existing })));
    }

    let weeks = match &semester_id {
        Some(sid) => schedule::load_weeks(conn, Some(sid)),
        None => schedule::load_weeks(conn, None),
    }
    .map_err(db_err("db_query_failed"))?;
    let week_ending = schedule::find_week(&weeks, class_date)
        .map(|w| w.week_ending)
        .unwrap_or_else(|| schedule::sunday_week_ending(class_date));

    let id = db::new_id();
    conn.execute(
        "INSERT INTO attendance(
            id, student_id, student_name, student_email, clinic, semester_id,
            week_number, week_ending, class_date, is_present, is_excused, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 0, ?)",
        rusqlite::params![
            id,
            student_id,
            student_name,
            student_email,
            clinic,
            semester_id,
            week_number,
            week_ending.to_string(),
            class_date.to_string(),
            db::now_rfc3339(),
        ],
    )
    .map_err(table_err("db_insert_failed", "attendance"))?;
    Ok(json!({ "attendanceId": id, "weekEnding": week_ending.to_string() }))
}

fn attendance_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let clinic = get_optional_str(params, "clinic").filter(|c| c != "all");
    let week_ending = get_optional_str(params, "weekEnding");
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, student_name, student_email, clinic, semester_id,
                    week_number, week_ending, class_date, is_present, is_excused
             FROM attendance
             WHERE (?1 IS NULL OR clinic = ?1)
               AND (?2 IS NULL OR week_ending = ?2)
             ORDER BY class_date DESC, student_name",
        )
        .map_err(db_err("db_query_failed"))?;
    let records = stmt
        .query_map([clinic, week_ending], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, Option<String>>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "studentEmail": r.get::<_, String>(3)?,
                "clinic": r.get::<_, String>(4)?,
                "semesterId": r.get::<_, Option<String>>(5)?,
                "weekNumber": r.get::<_, i64>(6)?,
                "weekEnding": r.get::<_, Option<String>>(7)?,
                "classDate": r.get::<_, String>(8)?,
                "isPresent": r.get::<_, i64>(9)? != 0,
                "isExcused": r.get::<_, i64>(10)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "records": records }))
}

/// Week `n` of a semester without a scheduled row: Monday of the first
/// week plus `n - 1` weeks, running through Sunday.
fn default_week_range(
    conn: &Connection,
    semester_id: &str,
    week_number: i64,
) -> Result<(NaiveDate, NaiveDate), HandlerErr> {
    let weeks = schedule::load_weeks(conn, Some(semester_id)).map_err(db_err("db_query_failed"))?;
    if let Some(w) = weeks.iter().find(|w| w.week_number == week_number) {
        return Ok((w.week_start, w.week_end));
    }
    let Some(first) = weeks.first() else {
        return Err(HandlerErr::bad_params(
            "weekStart and weekEnd are required when the semester has no schedule",
        ));
    };
    let out_of_range = || {
        HandlerErr::bad_params("weekNumber is outside the semester").with_details(json!({
            "weekNumber": week_number,
            "maxWeekNumber": MAX_WEEK_NUMBER,
        }))
    };
    let monday = first.week_start - Duration::days(first.week_start.weekday().num_days_from_monday() as i64);
    let start = week_number
        .checked_sub(first.week_number)
        .and_then(|weeks| weeks.checked_mul(7))
        .and_then(Duration::try_days)
        .and_then(|offset| monday.checked_add_signed(offset))
        .ok_or_else(out_of_range)?;
    let end = start
        .checked_add_signed(Duration::days(6))
        .ok_or_else(out_of_range)?;
    Ok((start, end))
}

fn passwords_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_str(params, "semesterId")?;
    let week_number = get_required_i64(params, "weekNumber")?;
    let password = get_required_str(params, "password")?;
    let director_id = require_director(conn, params)?;
    if !(1..=MAX_WEEK_NUMBER).contains(&week_number) {
        return Err(HandlerErr::bad_params(format!(
            "weekNumber must be between 1 and {}",
            MAX_WEEK_NUMBER
        )));
    }
    let semester: Option<String> = conn
        .query_row(
            "SELECT semester FROM semester_config WHERE id = ?",
            [&semester_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(semester) = semester else {
        return Err(HandlerErr::new("not_found", "semester not found"));
    };

    let (week_start, week_end) = match (
        get_optional_str(params, "weekStart").and_then(|s| schedule::parse_any_date(&s)),
        get_optional_str(params, "weekEnd").and_then(|s| schedule::parse_any_date(&s)),
    ) {
        (Some(s), Some(e)) => (s, e),
        (start, end) => {
            let (ds, de) = default_week_range(conn, &semester_id, week_number)?;
            (start.unwrap_or(ds), end.unwrap_or(de))
        }
    };
    if week_end < week_start {
        return Err(HandlerErr::bad_params("weekEnd is before weekStart").with_details(json!({
            "weekStart": week_start.to_string(),
            "weekEnd": week_end.to_string(),
        })));
    }
    let created_by = match get_optional_str(params, "createdByName") {
        Some(name) => name,
        None => conn
            .query_row("SELECT full_name FROM directors WHERE id = ?", [&director_id], |r| r.get(0))
            .map_err(db_err("db_query_failed"))?,
    };

    conn.execute(
        "INSERT INTO attendance_passwords(
            id, semester_id, week_number, password, week_start, week_end, created_by_name, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(semester_id, week_number) DO UPDATE SET
            password = excluded.password,
            week_start = excluded.week_start,
            week_end = excluded.week_end,
            created_by_name = excluded.created_by_name,
            updated_at = excluded.updated_at",
        rusqlite::params![
            db::new_id(),
            semester_id,
            week_number,
            password,
            week_start.to_string(),
            week_end.to_string(),
            created_by,
            db::now_rfc3339(),
        ],
    )
    .map_err(table_err("db_update_failed", "attendance_passwords"))?;
    log::info!("attendance password saved for week {} ({})", week_number, semester);

    let fan_out = notify::bulk_student_notifications(
        conn,
        NotificationType::Attendance,
        "Attendance Open",
        &format!(
            "Attendance for Week {} is now open. Submit it with this week's class password.",
            week_number
        ),
        Some(&semester),
    )?;

    Ok(json!({
        "ok": true,
        "weekNumber": week_number,
        "weekStart": week_start.to_string(),
        "weekEnd": week_end.to_string(),
        "notified": fan_out.count,
    }))
}

fn passwords_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_optional_str(params, "semesterId");
    let week_number = get_optional_i64(params, "weekNumber")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, semester_id, week_number, password, week_start, week_end, created_by_name, updated_at
             FROM attendance_passwords
             WHERE (?1 IS NULL OR semester_id = ?1)
               AND (?2 IS NULL OR week_number = ?2)
             ORDER BY week_number",
        )
        .map_err(db_err("db_query_failed"))?;
    let passwords = stmt
        .query_map(rusqlite::params![semester_id, week_number], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "semesterId": r.get::<_, String>(1)?,
                "weekNumber": r.get::<_, i64>(2)?,
                "password": r.get::<_, String>(3)?,
                "weekStart": r.get::<_, String>(4)?,
                "weekEnd": r.get::<_, String>(5)?,
                "createdByName": r.get::<_, Option<String>>(6)?,
                "updatedAt": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "passwords": passwords }))
}

fn passwords_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "passwordId")?;
    require_director(conn, params)?;
    let removed = conn
        .execute("DELETE FROM attendance_passwords WHERE id = ?", [&id])
        .map_err(table_err("db_delete_failed", "attendance_passwords"))?;
    if removed == 0 {
        return Err(HandlerErr::new("not_found", "attendance password not found"));
    }
    Ok(json!({ "ok": true }))
}

fn update_status(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let attendance_id = get_required_str(params, "attendanceId")?;
    let is_present = get_required_bool(params, "isPresent")?;
    require_director(conn, params)?;
    let changed = conn
        .execute(
            "UPDATE attendance SET is_present = ? WHERE id = ?",
            (is_present as i64, &attendance_id),
        )
        .map_err(table_err("db_update_failed", "attendance"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "attendance record not found"));
    }
    Ok(json!({ "ok": true, "attendanceId": attendance_id, "isPresent": is_present }))
}

fn mark_excused(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class_date = get_required_date(params, "classDate")?;
    let is_excused = get_required_bool(params, "isExcused")?;
    let semester_id = get_optional_str(params, "semesterId");
    require_director(conn, params)?;
    let changed = conn
        .execute(
            "UPDATE attendance SET is_excused = ?
             WHERE student_id = ? AND class_date = ? AND (?4 IS NULL OR semester_id = ?4)",
            rusqlite::params![is_excused as i64, student_id, class_date.to_string(), semester_id],
        )
        .map_err(table_err("db_update_failed", "attendance"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "attendance record not found"));
    }
    Ok(json!({ "ok": true, "updated": changed, "isExcused": is_excused }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.submit" => Some(with_state(state, req, attendance_submit)),
        "attendance.list" => Some(with_conn(state, req, attendance_list)),
        "attendance.passwords.set" => Some(with_conn(state, req, passwords_set)),
        "attendance.passwords.list" => Some(with_conn(state, req, passwords_list)),
        "attendance.passwords.delete" => Some(with_conn(state, req, passwords_delete)),
        "attendance.updateStatus" => Some(with_conn(state, req, update_status)),
        "attendance.markExcused" => Some(with_conn(state, req, mark_excused)),
        _ => None,
    }
}
