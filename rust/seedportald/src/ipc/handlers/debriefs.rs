use crate::db;
use crate::ipc::helpers::{
    db_err, get_limit, get_optional_f64, get_optional_i64, get_optional_str, get_required_date,
    get_required_str, table_err, with_conn, with_state, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::migrate;
use crate::notify::{self, NotificationType, StudentRef};
use crate::schedule;
use crate::summaries;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

const DEBRIEF_STATUSES: [&str; 3] = ["submitted", "reviewed", "needs_revision"];

struct ResolvedStudent {
    id: String,
    email: String,
    clinic_id: Option<String>,
}

fn resolved_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<ResolvedStudent> {
    Ok(ResolvedStudent {
        id: r.get(0)?,
        email: r.get(1)?,
        clinic_id: r.get(2)?,
    })
}

fn resolve_student(
    conn: &Connection,
    student_id: Option<&str>,
    student_name: &str,
) -> Result<Option<ResolvedStudent>, HandlerErr> {
    let found = match student_id {
        Some(id) => conn
            .query_row("SELECT id, email, clinic_id FROM students WHERE id = ?", [id], resolved_student)
            .optional(),
        None => conn
            .query_row(
                "SELECT id, email, clinic_id FROM students
                 WHERE lower(trim(full_name)) = lower(trim(?))
                 ORDER BY rowid LIMIT 1",
                [student_name],
                resolved_student,
            )
            .optional(),
    };
    found.map_err(db_err("db_query_failed"))
}

fn debriefs_submit(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_name = get_required_str(params, "studentName")?;
    let client_name = get_required_str(params, "clientName")?;
    let clinic_label = get_required_str(params, "clinic")?;
    let work_summary = get_required_str(params, "workSummary")?;
    let hours = get_optional_f64(params, "hoursWorked")?.unwrap_or(0.0);
    if hours < 0.0 {
        return Err(HandlerErr::bad_params("hoursWorked must not be negative"));
    }
    let date = get_required_date(params, "date")?;
    let questions = get_optional_str(params, "questions");
    let action_items = get_optional_str(params, "actionItems");

    let student = resolve_student(conn, get_optional_str(params, "studentId").as_deref(), &student_name)?;
    let client_id: Option<String> = conn
        .query_row("SELECT id FROM clients WHERE name = ?", [&client_name], |r| r.get(0))
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let weeks = schedule::weeks_for_lookup(conn, Some(&state.config.active_semester))
        .map_err(db_err("db_query_failed"))?;
    let week = schedule::find_week(&weeks, date);
    let clinic = migrate::canonical_clinic(&clinic_label);

    let id = db::new_id();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO debriefs(
            id, student_id, student_name, student_email, client_id, client_name,
            clinic, hours_worked, work_summary, questions, action_items,
            week_number, week_ending, date_submitted, status, semester,
            created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'submitted', ?, ?, ?)",
        rusqlite::params![
            id,
            student.as_ref().map(|s| s.id.clone()),
            student_name,
            student.as_ref().map(|s| s.email.clone()),
            client_id,
            client_name,
            clinic,
            hours,
            work_summary,
            questions,
            action_items,
            week.as_ref().map(|w| w.week_number),
            week.as_ref().map(|w| w.week_ending.to_string()),
            date.to_string(),
            state.config.active_semester,
            now,
            now,
        ],
    )
    .map_err(table_err("db_insert_failed", "debriefs"))?;

    let clinic_id = match student.as_ref().and_then(|s| s.clinic_id.clone()) {
        Some(id) => Some(id),
        None => notify::clinic_id_for_name(conn, &clinic_label).unwrap_or_else(|e| {
            log::warn!("clinic lookup for debrief {} failed: {}", id, e);
            None
        }),
    };
    let mut notified = 0;
    if let Some(clinic_id) = clinic_id {
        let who = StudentRef {
            student_id: student.as_ref().map(|s| s.id.clone()),
            student_name: Some(student_name.clone()),
            student_email: student.as_ref().map(|s| s.email.clone()),
        };
        if let Some(q) = &questions {
            notified += notify::sent_or_logged(
                notify::notify_clinic_directors(
                    conn,
                    NotificationType::Question,
                    &format!("Question from {}", student_name),
                    q,
                    &clinic_id,
                    &who,
                    Some(&id),
                ),
                "debrief question",
            );
        }
        notified += notify::sent_or_logged(
            notify::notify_clinic_directors(
                conn,
                NotificationType::Debrief,
                &format!("New debrief from {}", student_name),
                &format!("{} logged {} hours for {}", student_name, hours, client_name),
                &clinic_id,
                &who,
                Some(&id),
            ),
            "debrief",
        );
    } else {
        log::warn!("no clinic found for debrief label {:?}; directors not notified", clinic_label);
    }

    Ok(json!({
        "debriefId": id,
        "studentId": student.map(|s| s.id),
        "clientId": client_id,
        "clinic": clinic,
        "weekNumber": week.as_ref().map(|w| w.week_number),
        "weekEnding": week.as_ref().map(|w| w.week_ending.to_string()),
        "notified": notified,
    }))
}

fn debriefs_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId");
    let client_id = get_optional_str(params, "clientId");
    let week_number = get_optional_i64(params, "weekNumber")?;
    let limit = get_limit(params, 200)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, student_name, student_email, client_id, client_name, clinic,
                    hours_worked, work_summary, questions, action_items, week_number, week_ending,
                    date_submitted, status, semester, reviewed_by, review_comment
             FROM debriefs
             WHERE (?1 IS NULL OR student_id = ?1)
               AND (?2 IS NULL OR client_id = ?2)
               AND (?3 IS NULL OR week_number = ?3)
             ORDER BY date_submitted DESC, created_at DESC
             LIMIT ?4",
        )
        .map_err(db_err("db_query_failed"))?;
    let debriefs = stmt
        .query_map(rusqlite::params![student_id, client_id, week_number, limit], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, Option<String>>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "studentEmail": r.get::<_, Option<String>>(3)?,
                "clientId": r.get::<_, Option<String>>(4)?,
                "clientName": r.get::<_, String>(5)?,
                "clinic": r.get::<_, String>(6)?,
                "hoursWorked": r.get::<_, f64>(7)?,
                "workSummary": r.get::<_, String>(8)?,
                "questions": r.get::<_, Option<String>>(9)?,
                "actionItems": r.get::<_, Option<String>>(10)?,
                "weekNumber": r.get::<_, Option<i64>>(11)?,
                "weekEnding": r.get::<_, Option<String>>(12)?,
                "dateSubmitted": r.get::<_, String>(13)?,
                "status": r.get::<_, String>(14)?,
                "semester": r.get::<_, Option<String>>(15)?,
                "reviewedBy": r.get::<_, Option<String>>(16)?,
                "reviewComment": r.get::<_, Option<String>>(17)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "debriefs": debriefs }))
}

fn debriefs_review(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let debrief_id = get_required_str(params, "debriefId")?;
    let reviewed_by = get_required_str(params, "reviewedBy")?;
    let status = get_optional_str(params, "status").unwrap_or_else(|| "reviewed".to_string());
    if !DEBRIEF_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::bad_params(format!("unknown status: {}", status))
            .with_details(json!({ "allowed": DEBRIEF_STATUSES })));
    }
    let changed = conn
        .execute(
            "UPDATE debriefs
             SET status = ?, reviewed_by = ?, review_comment = ?, updated_at = ?
             WHERE id = ?",
            rusqlite::params![
                status,
                reviewed_by,
                get_optional_str(params, "comment"),
                db::now_rfc3339(),
                debrief_id,
            ],
        )
        .map_err(table_err("db_update_failed", "debriefs"))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "debrief not found"));
    }
    Ok(json!({ "ok": true, "debriefId": debrief_id, "status": status }))
}

fn debriefs_migrate(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let csv_text = match (get_optional_str(params, "csvText"), get_optional_str(params, "csvPath")) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(PathBuf::from(&path)).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": path }))
        })?,
        (None, None) => migrate::DEFAULT_DEBRIEFS_CSV.to_string(),
    };
    let semester =
        get_optional_str(params, "semester").unwrap_or_else(|| migrate::DEFAULT_MIGRATION_SEMESTER.to_string());
    let report = migrate::migrate_debriefs(conn, &csv_text, &semester, state.config.debrief_batch_size)?;
    Ok(json!(report))
}

fn summaries_rebuild(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester = get_optional_str(params, "semester");
    let report = summaries::rebuild_weekly_summaries(conn, semester.as_deref())?;
    Ok(json!(report))
}

fn summaries_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let clinic = get_optional_str(params, "clinic").filter(|c| c != "all");
    let mut stmt = conn
        .prepare(
            "SELECT id, week_ending, clinic, client_name, total_hours, student_count,
                    activity_count, summary, semester
             FROM weekly_summaries
             WHERE (?1 IS NULL OR clinic = ?1 COLLATE NOCASE)
             ORDER BY week_ending DESC, clinic, client_name",
        )
        .map_err(db_err("db_query_failed"))?;
    let records = stmt
        .query_map([clinic], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "weekEnding": r.get::<_, String>(1)?,
                "clinic": r.get::<_, String>(2)?,
                "clientName": r.get::<_, String>(3)?,
                "totalHours": r.get::<_, f64>(4)?,
                "studentCount": r.get::<_, i64>(5)?,
                "activityCount": r.get::<_, i64>(6)?,
                "summary": r.get::<_, String>(7)?,
                "semester": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "totalRecords": records.len(), "records": records }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "debriefs.submit" => Some(with_state(state, req, debriefs_submit)),
        "debriefs.list" => Some(with_conn(state, req, debriefs_list)),
        "debriefs.review" => Some(with_conn(state, req, debriefs_review)),
        "debriefs.migrate" => Some(with_state(state, req, debriefs_migrate)),
        "weeklySummaries.rebuild" => Some(with_conn(state, req, summaries_rebuild)),
        "weeklySummaries.list" => Some(with_conn(state, req, summaries_list)),
        _ => None,
    }
}
