use crate::db;
use crate::ipc::helpers::{
    db_err, get_optional_bool, get_optional_str, get_required_str, table_err, with_conn,
    with_state, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn clinics_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name,
                    (SELECT COUNT(*) FROM directors d WHERE d.clinic_id = c.id),
                    (SELECT COUNT(*) FROM students s WHERE s.clinic_id = c.id)
             FROM clinics c
             ORDER BY c.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let clinics = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "directorCount": r.get::<_, i64>(2)?,
                "studentCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "clinics": clinics }))
}

fn directors_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let clinic = get_optional_str(params, "clinic");
    let mut stmt = conn
        .prepare(
            "SELECT id, full_name, email, clinic, clinic_id, role, semester
             FROM directors
             WHERE (?1 IS NULL OR clinic = ?1 COLLATE NOCASE)
             ORDER BY full_name",
        )
        .map_err(db_err("db_query_failed"))?;
    let directors = stmt
        .query_map([clinic], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "clinic": r.get::<_, String>(3)?,
                "clinicId": r.get::<_, Option<String>>(4)?,
                "role": r.get::<_, String>(5)?,
                "semester": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "directors": directors }))
}

fn email_taken(conn: &Connection, table: &str, email: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE email = ?", table),
        [email],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err("db_query_failed"))
}

fn directors_create(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let first = get_required_str(params, "firstName")?;
    let last = get_required_str(params, "lastName")?;
    let email = get_required_str(params, "email")?;
    let clinic = get_required_str(params, "clinic")?;
    let role = get_optional_str(params, "role").unwrap_or_else(|| "Clinic Director".to_string());
    let semester =
        get_optional_str(params, "semester").unwrap_or_else(|| state.config.active_semester.clone());
    if email_taken(conn, "directors", &email)? {
        return Err(HandlerErr::new("conflict", "a director with this email already exists")
            .with_details(json!({ "email": email })));
    }

    let clinic_id = db::ensure_clinic(conn, &clinic).map_err(table_err("db_insert_failed", "clinics"))?;
    let id = db::new_id();
    conn.execute(
        "INSERT INTO directors(id, first_name, last_name, full_name, email, clinic, clinic_id, role, semester, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            first,
            last,
            format!("{} {}", first, last),
            email,
            clinic,
            clinic_id,
            role,
            semester,
            db::now_rfc3339(),
        ],
    )
    .map_err(table_err("db_insert_failed", "directors"))?;
    Ok(json!({ "directorId": id, "clinicId": clinic_id }))
}

fn student_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "firstName": r.get::<_, String>(1)?,
        "lastName": r.get::<_, String>(2)?,
        "fullName": r.get::<_, String>(3)?,
        "email": r.get::<_, String>(4)?,
        "clinic": r.get::<_, String>(5)?,
        "clinicId": r.get::<_, Option<String>>(6)?,
        "clientTeam": r.get::<_, Option<String>>(7)?,
        "isTeamLeader": r.get::<_, i64>(8)? != 0,
        "academicLevel": r.get::<_, Option<String>>(9)?,
        "universityId": r.get::<_, Option<String>>(10)?,
        "semester": r.get::<_, Option<String>>(11)?,
        "status": r.get::<_, String>(12)?,
    }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let clinic = get_optional_str(params, "clinic");
    let client_id = get_optional_str(params, "clientId");
    let semester = get_optional_str(params, "semester");
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.first_name, s.last_name, s.full_name, s.email, s.clinic, s.clinic_id,
                    s.client_team, s.is_team_leader, s.academic_level, s.university_id,
                    s.semester, s.status
             FROM students s
             WHERE (?1 IS NULL OR s.clinic = ?1 COLLATE NOCASE)
               AND (?2 IS NULL OR EXISTS(
                     SELECT 1 FROM client_assignments ca
                     WHERE ca.student_id = s.id AND ca.client_id = ?2))
               AND (?3 IS NULL OR s.semester = ?3 COLLATE NOCASE)
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(db_err("db_query_failed"))?;
    let students = stmt
        .query_map(rusqlite::params![clinic, client_id, semester], student_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "students": students }))
}

fn students_create(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let first = get_required_str(params, "firstName")?;
    let last = get_required_str(params, "lastName")?;
    let email = get_required_str(params, "email")?;
    let clinic = get_required_str(params, "clinic")?;
    let is_team_leader = get_optional_bool(params, "isTeamLeader")?.unwrap_or(false);
    let semester =
        get_optional_str(params, "semester").unwrap_or_else(|| state.config.active_semester.clone());
    if email_taken(conn, "students", &email)? {
        return Err(HandlerErr::new("conflict", "a student with this email already exists")
            .with_details(json!({ "email": email })));
    }

    let clinic_id = db::ensure_clinic(conn, &clinic).map_err(table_err("db_insert_failed", "clinics"))?;
    let id = db::new_id();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO students(
            id, first_name, last_name, full_name, email, clinic, clinic_id,
            client_team, is_team_leader, academic_level, university_id,
            semester, status, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)",
        rusqlite::params![
            id,
            first,
            last,
            format!("{} {}", first, last),
            email,
            clinic,
            clinic_id,
            get_optional_str(params, "clientTeam"),
            is_team_leader as i64,
            get_optional_str(params, "academicLevel"),
            get_optional_str(params, "universityId"),
            semester,
            now,
            now,
        ],
    )
    .map_err(table_err("db_insert_failed", "students"))?;
    Ok(json!({ "studentId": id }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    let current: Option<(String, String)> = conn
        .query_row(
            "SELECT first_name, last_name FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((mut first, mut last)) = current else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (key, value) in patch {
        match key.as_str() {
            "firstName" | "lastName" => {
                let Some(s) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(HandlerErr::bad_params(format!("patch.{} must be a non-empty string", key)));
                };
                if key == "firstName" {
                    first = s.to_string();
                    sets.push("first_name = ?");
                } else {
                    last = s.to_string();
                    sets.push("last_name = ?");
                }
                values.push(rusqlite::types::Value::Text(s.to_string()));
            }
            "academicLevel" | "universityId" | "clientTeam" => {
                let v = match value {
                    serde_json::Value::Null => rusqlite::types::Value::Null,
                    serde_json::Value::String(s) if s.trim().is_empty() => rusqlite::types::Value::Null,
                    serde_json::Value::String(s) => rusqlite::types::Value::Text(s.trim().to_string()),
                    _ => {
                        return Err(HandlerErr::bad_params(format!(
                            "patch.{} must be a string or null",
                            key
                        )))
                    }
                };
                sets.push(match key.as_str() {
                    "academicLevel" => "academic_level = ?",
                    "universityId" => "university_id = ?",
                    _ => "client_team = ?",
                });
                values.push(v);
            }
            "isTeamLeader" => {
                let Some(b) = value.as_bool() else {
                    return Err(HandlerErr::bad_params("patch.isTeamLeader must be a boolean"));
                };
                sets.push("is_team_leader = ?");
                values.push(rusqlite::types::Value::Integer(b as i64));
            }
            "status" => {
                let Some(s) = value.as_str().filter(|s| matches!(*s, "active" | "inactive")) else {
                    return Err(HandlerErr::bad_params("patch.status must be active or inactive"));
                };
                sets.push("status = ?");
                values.push(rusqlite::types::Value::Text(s.to_string()));
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown patch field: {}", other)));
            }
        }
    }
    if sets.is_empty() {
        return Ok(json!({ "ok": true, "changed": 0 }));
    }

    sets.push("full_name = ?");
    values.push(rusqlite::types::Value::Text(format!("{} {}", first, last)));
    sets.push("updated_at = ?");
    values.push(rusqlite::types::Value::Text(db::now_rfc3339()));
    values.push(rusqlite::types::Value::Text(student_id));

    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(values))
        .map_err(table_err("db_update_failed", "students"))?;
    Ok(json!({ "ok": true, "changed": changed }))
}

fn clients_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let director_id = get_optional_str(params, "directorId");
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.website, c.contact_name, c.email, c.industry,
                    c.primary_director_id, d.full_name, c.semester, c.status,
                    (SELECT COUNT(*) FROM client_assignments ca WHERE ca.client_id = c.id)
             FROM clients c
             LEFT JOIN directors d ON d.id = c.primary_director_id
             WHERE (?1 IS NULL OR c.primary_director_id = ?1
                    OR EXISTS(SELECT 1 FROM client_directors cd
                              WHERE cd.client_id = c.id AND cd.director_id = ?1))
             ORDER BY c.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let clients = stmt
        .query_map([director_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "website": r.get::<_, Option<String>>(2)?,
                "contactName": r.get::<_, Option<String>>(3)?,
                "email": r.get::<_, Option<String>>(4)?,
                "industry": r.get::<_, Option<String>>(5)?,
                "primaryDirectorId": r.get::<_, Option<String>>(6)?,
                "primaryDirectorName": r.get::<_, Option<String>>(7)?,
                "semester": r.get::<_, Option<String>>(8)?,
                "status": r.get::<_, String>(9)?,
                "studentCount": r.get::<_, i64>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "clients": clients }))
}

fn clients_create(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let exists = conn
        .query_row("SELECT 1 FROM clients WHERE name = ?", [&name], |r| r.get::<_, i64>(0))
        .optional()
        .map_err(db_err("db_query_failed"))?
        .is_some();
    if exists {
        return Err(HandlerErr::new("conflict", "a client with this name already exists")
            .with_details(json!({ "name": name })));
    }
    let primary_director_id = get_optional_str(params, "primaryDirectorId");
    if let Some(did) = &primary_director_id {
        require_row(conn, "directors", did, "director")?;
    }
    let semester =
        get_optional_str(params, "semester").unwrap_or_else(|| state.config.active_semester.clone());

    let id = db::new_id();
    conn.execute(
        "INSERT INTO clients(id, name, website, contact_name, email, industry, primary_director_id, semester, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)",
        rusqlite::params![
            id,
            name,
            get_optional_str(params, "website"),
            get_optional_str(params, "contactName"),
            get_optional_str(params, "email"),
            get_optional_str(params, "industry"),
            primary_director_id,
            semester,
            db::now_rfc3339(),
        ],
    )
    .map_err(table_err("db_insert_failed", "clients"))?;
    Ok(json!({ "clientId": id }))
}

fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    let found = conn
        .query_row(&format!("SELECT 1 FROM {} WHERE id = ?", table), [id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(db_err("db_query_failed"))?
        .is_some();
    if !found {
        return Err(HandlerErr::new("not_found", format!("{} not found", what)));
    }
    Ok(())
}

fn clients_assign_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let client_id = get_required_str(params, "clientId")?;
    let student_id = get_required_str(params, "studentId")?;
    require_row(conn, "clients", &client_id, "client")?;
    let student: Option<(String, i64)> = conn
        .query_row(
            "SELECT clinic, is_team_leader FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((student_clinic, leader)) = student else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    let clinic = get_optional_str(params, "clinic").unwrap_or(student_clinic);
    let default_role = if leader != 0 { "Team Leader" } else { "Member" };
    let role = get_optional_str(params, "role").unwrap_or_else(|| default_role.to_string());

    let inserted = conn
        .execute(
            "INSERT INTO client_assignments(id, student_id, client_id, clinic, role)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, client_id) DO NOTHING",
            (db::new_id(), &student_id, &client_id, &clinic, &role),
        )
        .map_err(table_err("db_insert_failed", "client_assignments"))?;
    Ok(json!({ "inserted": inserted, "skipped": 1 - inserted }))
}

fn clients_assign_director(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let client_id = get_required_str(params, "clientId")?;
    let director_id = get_required_str(params, "directorId")?;
    let is_primary = get_optional_bool(params, "isPrimary")?.unwrap_or(false);
    require_row(conn, "clients", &client_id, "client")?;
    require_row(conn, "directors", &director_id, "director")?;

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    let inserted = tx
        .execute(
            "INSERT INTO client_directors(id, client_id, director_id, is_primary)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(client_id, director_id) DO NOTHING",
            (db::new_id(), &client_id, &director_id, is_primary as i64),
        )
        .map_err(table_err("db_insert_failed", "client_directors"))?;
    if is_primary {
        tx.execute(
            "UPDATE client_directors SET is_primary = (director_id = ?) WHERE client_id = ?",
            (&director_id, &client_id),
        )
        .map_err(table_err("db_update_failed", "client_directors"))?;
        tx.execute(
            "UPDATE clients SET primary_director_id = ? WHERE id = ?",
            (&director_id, &client_id),
        )
        .map_err(table_err("db_update_failed", "clients"))?;
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;
    Ok(json!({ "inserted": inserted, "skipped": 1 - inserted }))
}

fn intake_submit(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let password = get_required_str(params, "password")?;
    if !state.config.password_matches(&password) {
        return Err(HandlerErr::new("forbidden", "invalid password"));
    }
    let client_name = get_required_str(params, "clientName")?;
    let primary_clinic = get_required_str(params, "primaryClinic")?;
    let secondary: Vec<String> = match params.get("secondaryClinics") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(_) => return Err(HandlerErr::bad_params("secondaryClinics must be an array")),
    };
    let semester =
        get_optional_str(params, "semester").unwrap_or_else(|| state.config.active_semester.clone());

    let id = db::new_id();
    conn.execute(
        "INSERT INTO client_intake(
            id, client_name, client_email, client_phone, client_website,
            business_description, industry, primary_clinic, secondary_clinics_json,
            lead_consultant, semester, notes, created_by, status, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        rusqlite::params![
            id,
            client_name,
            get_optional_str(params, "clientEmail"),
            get_optional_str(params, "clientPhone"),
            get_optional_str(params, "clientWebsite"),
            get_optional_str(params, "businessDescription"),
            get_optional_str(params, "industry"),
            primary_clinic,
            json!(secondary).to_string(),
            get_optional_str(params, "leadConsultant"),
            semester,
            get_optional_str(params, "notes"),
            get_optional_str(params, "createdBy"),
            db::now_rfc3339(),
        ],
    )
    .map_err(table_err("db_insert_failed", "client_intake"))?;
    log::info!("client intake recorded for {}", client_name);
    Ok(json!({ "intakeId": id }))
}

fn intake_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let status = get_optional_str(params, "status");
    let mut stmt = conn
        .prepare(
            "SELECT id, client_name, client_email, primary_clinic, secondary_clinics_json,
                    lead_consultant, semester, notes, status, created_at
             FROM client_intake
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([status], |r| {
            let secondary: String = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "clientName": r.get::<_, String>(1)?,
                "clientEmail": r.get::<_, Option<String>>(2)?,
                "primaryClinic": r.get::<_, String>(3)?,
                "secondaryClinics": serde_json::from_str::<serde_json::Value>(&secondary)
                    .unwrap_or_else(|_| json!([])),
                "leadConsultant": r.get::<_, Option<String>>(5)?,
                "semester": r.get::<_, Option<String>>(6)?,
                "notes": r.get::<_, Option<String>>(7)?,
                "status": r.get::<_, String>(8)?,
                "createdAt": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "intakes": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "clinics.list" => Some(with_conn(state, req, clinics_list)),
        "directors.list" => Some(with_conn(state, req, directors_list)),
        "directors.create" => Some(with_state(state, req, directors_create)),
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_state(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "clients.list" => Some(with_conn(state, req, clients_list)),
        "clients.create" => Some(with_state(state, req, clients_create)),
        "clients.assignStudent" => Some(with_conn(state, req, clients_assign_student)),
        "clients.assignDirector" => Some(with_conn(state, req, clients_assign_director)),
        "clients.intake.submit" => Some(with_state(state, req, intake_submit)),
        "clients.intake.list" => Some(with_conn(state, req, intake_list)),
        _ => None,
    }
}
