use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db;
use crate::error::{PortalError, PortalResult};

/// Directors, students and clients of the Fall 2025 cohort.
pub const DEFAULT_SEED_JSON: &str = include_str!("../data/seed_fall2025.json");

pub const CORE_CLINICS: [&str; 4] = ["Accounting", "Consulting", "Marketing", "Resource Acquisition"];

/// Clients that are not staffed from every core clinic.
const PARTIAL_STAFFING_CLIENTS: [&str; 2] = ["Muffy White", "Future Masters of Chess Academy"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedDirector {
    #[serde(default)]
    pub semester: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub clinic: String,
    #[serde(default = "default_director_role")]
    pub role: String,
    pub email: String,
}

fn default_director_role() -> String {
    "Clinic Director".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedStudent {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub clinic: String,
    #[serde(default)]
    pub client_team: Option<String>,
    #[serde(default)]
    pub is_team_leader: bool,
    #[serde(default)]
    pub academic_level: Option<String>,
    #[serde(default)]
    pub university_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedClient {
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub director_lead: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedDataset {
    pub semester: String,
    pub directors: Vec<SeedDirector>,
    pub students: Vec<SeedStudent>,
    pub clients: Vec<SeedClient>,
}

impl SeedDataset {
    pub fn embedded() -> PortalResult<Self> {
        Ok(serde_json::from_str(DEFAULT_SEED_JSON)?)
    }

    pub fn from_path(path: &Path) -> PortalResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepAudit {
    pub inserted: usize,
    pub skipped: usize,
    pub errors: usize,
    pub details: Vec<String>,
}

impl StepAudit {
    fn summary(&self, label: &str) {
        log::info!(
            "{}: {} inserted, {} skipped, {} errors",
            label,
            self.inserted,
            self.skipped,
            self.errors
        );
    }

    fn error(&mut self, detail: String) {
        log::warn!("{}", detail);
        self.errors += 1;
        self.details.push(detail);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedAudit {
    pub directors: StepAudit,
    pub students: StepAudit,
    pub clients: StepAudit,
    pub client_directors: StepAudit,
    pub client_assignments: StepAudit,
}

fn key(s: &str) -> String {
    s.trim().to_lowercase()
}

fn lookup_id(conn: &Connection, sql: &str, value: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(sql, [value], |r| r.get(0)).optional()
}

fn import_directors(
    conn: &Connection,
    data: &SeedDataset,
    audit: &mut StepAudit,
) -> HashMap<String, String> {
    let mut by_name = HashMap::new();
    for dir in &data.directors {
        let full_name = format!("{} {}", dir.first_name.trim(), dir.last_name.trim());
        match lookup_id(conn, "SELECT id FROM directors WHERE email = ?", dir.email.trim()) {
            Ok(Some(id)) => {
                by_name.insert(key(&full_name), id);
                audit.skipped += 1;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                audit.error(format!("Error: {} - {}", full_name, e));
                continue;
            }
        }

        let id = db::new_id();
        let semester = dir.semester.clone().unwrap_or_else(|| data.semester.clone());
        let res = db::ensure_clinic(conn, dir.clinic.trim()).and_then(|clinic_id| {
            conn.execute(
                "INSERT INTO directors(id, first_name, last_name, full_name, email, clinic, clinic_id, role, semester, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    id,
                    dir.first_name.trim(),
                    dir.last_name.trim(),
                    full_name,
                    dir.email.trim(),
                    dir.clinic.trim(),
                    clinic_id,
                    dir.role,
                    semester,
                    db::now_rfc3339(),
                ],
            )
        });
        match res {
            Ok(_) => {
                by_name.insert(key(&full_name), id);
                audit.inserted += 1;
            }
            Err(e) => audit.error(format!("Error: {} - {}", full_name, e)),
        }
    }
    audit.summary("directors");
    by_name
}

fn import_students(
    conn: &Connection,
    data: &SeedDataset,
    audit: &mut StepAudit,
) -> HashMap<String, String> {
    let mut by_email = HashMap::new();
    for stu in &data.students {
        let full_name = format!("{} {}", stu.first_name.trim(), stu.last_name.trim());
        match lookup_id(conn, "SELECT id FROM students WHERE email = ?", stu.email.trim()) {
            Ok(Some(id)) => {
                by_email.insert(key(&stu.email), id);
                audit.skipped += 1;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                audit.error(format!("Error: {} - {}", full_name, e));
                continue;
            }
        }

        let id = db::new_id();
        let now = db::now_rfc3339();
        let res = db::ensure_clinic(conn, stu.clinic.trim()).and_then(|clinic_id| {
            conn.execute(
                "INSERT INTO students(
                    id, first_name, last_name, full_name, email, clinic, clinic_id,
                    client_team, is_team_leader, academic_level, university_id,
                    semester, status, created_at, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)",
                rusqlite::params![
                    id,
                    stu.first_name.trim(),
                    stu.last_name.trim(),
                    full_name,
                    stu.email.trim(),
                    stu.clinic.trim(),
                    clinic_id,
                    stu.client_team,
                    stu.is_team_leader as i64,
                    stu.academic_level,
                    stu.university_id,
                    data.semester,
                    now,
                    now,
                ],
            )
        });
        match res {
            Ok(_) => {
                by_email.insert(key(&stu.email), id);
                audit.inserted += 1;
            }
            Err(e) => audit.error(format!("Error: {} - {}", full_name, e)),
        }
    }
    audit.summary("students");
    by_email
}

fn import_clients(
    conn: &Connection,
    data: &SeedDataset,
    directors: &HashMap<String, String>,
    audit: &mut StepAudit,
) -> HashMap<String, String> {
    let mut by_name = HashMap::new();
    for client in &data.clients {
        match lookup_id(conn, "SELECT id FROM clients WHERE name = ?", client.name.trim()) {
            Ok(Some(id)) => {
                by_name.insert(key(&client.name), id);
                audit.skipped += 1;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                audit.error(format!("Error: {} - {}", client.name, e));
                continue;
            }
        }

        let director_id = client
            .director_lead
            .as_deref()
            .and_then(|lead| directors.get(&key(lead)))
            .cloned();
        let id = db::new_id();
        let res = conn.execute(
            "INSERT INTO clients(id, name, website, contact_name, email, primary_director_id, semester, status, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, 'active', ?)",
            rusqlite::params![
                id,
                client.name.trim(),
                client.website,
                client.contact_name,
                client.email,
                director_id,
                data.semester,
                db::now_rfc3339(),
            ],
        );
        match res {
            Ok(_) => {
                by_name.insert(key(&client.name), id);
                audit.inserted += 1;
            }
            Err(e) => audit.error(format!("Error: {} - {}", client.name, e)),
        }
    }
    audit.summary("clients");
    by_name
}

fn import_client_directors(
    conn: &Connection,
    data: &SeedDataset,
    clients: &HashMap<String, String>,
    directors: &HashMap<String, String>,
    audit: &mut StepAudit,
) {
    for client in &data.clients {
        let Some(client_id) = clients.get(&key(&client.name)) else {
            continue;
        };
        let Some(director_id) = client
            .director_lead
            .as_deref()
            .and_then(|lead| directors.get(&key(lead)))
        else {
            continue;
        };

        let existing = conn
            .query_row(
                "SELECT 1 FROM client_directors WHERE client_id = ? AND director_id = ?",
                (client_id, director_id),
                |r| r.get::<_, i64>(0),
            )
            .optional();
        match existing {
            Ok(Some(_)) => {
                audit.skipped += 1;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                audit.error(format!("Error: {} - {}", client.name, e));
                continue;
            }
        }

        match conn.execute(
            "INSERT INTO client_directors(id, client_id, director_id, is_primary) VALUES(?, ?, ?, 1)",
            (db::new_id(), client_id, director_id),
        ) {
            Ok(_) => audit.inserted += 1,
            Err(e) => audit.error(format!("Error: {} - {}", client.name, e)),
        }
    }
    audit.summary("client-director mappings");
}

fn import_client_assignments(
    conn: &Connection,
    data: &SeedDataset,
    students: &HashMap<String, String>,
    clients: &HashMap<String, String>,
    audit: &mut StepAudit,
) {
    for stu in &data.students {
        let full_name = format!("{} {}", stu.first_name.trim(), stu.last_name.trim());
        let team = stu.client_team.as_deref().unwrap_or("");
        let (Some(student_id), Some(client_id)) =
            (students.get(&key(&stu.email)), clients.get(&key(team)))
        else {
            let detail = format!(
                "Skipped: {} - missing student or client ID (client: {})",
                full_name, team
            );
            log::info!("{}", detail);
            audit.details.push(detail);
            continue;
        };

        let existing = conn
            .query_row(
                "SELECT 1 FROM client_assignments WHERE student_id = ? AND client_id = ?",
                (student_id, client_id),
                |r| r.get::<_, i64>(0),
            )
            .optional();
        match existing {
            Ok(Some(_)) => {
                audit.skipped += 1;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                audit.error(format!("Error: {} - {}", full_name, e));
                continue;
            }
        }

        let role = if stu.is_team_leader { "Team Leader" } else { "Member" };
        match conn.execute(
            "INSERT INTO client_assignments(id, student_id, client_id, clinic, role) VALUES(?, ?, ?, ?, ?)",
            (db::new_id(), student_id, client_id, stu.clinic.trim(), role),
        ) {
            Ok(_) => audit.inserted += 1,
            Err(e) => audit.error(format!("Error: {} - {}", full_name, e)),
        }
    }
    audit.summary("client-student assignments");
}

/// Loads the dataset step by step. Rows already present (by email for people,
/// by name for clients) are skipped but still feed the id maps, so the
/// junction steps resolve on re-runs too.
pub fn import_seed(conn: &Connection, data: &SeedDataset) -> PortalResult<serde_json::Value> {
    let mut audit = SeedAudit::default();

    log::info!("step 1: importing directors");
    let directors = import_directors(conn, data, &mut audit.directors);
    log::info!("step 2: importing students");
    let students = import_students(conn, data, &mut audit.students);
    log::info!("step 3: importing clients");
    let clients = import_clients(conn, data, &directors, &mut audit.clients);
    log::info!("step 4: creating client-director mappings");
    import_client_directors(conn, data, &clients, &directors, &mut audit.client_directors);
    log::info!("step 5: creating client-student assignments");
    import_client_assignments(conn, data, &students, &clients, &mut audit.client_assignments);

    Ok(json!({
        "audit": audit,
        "tableCounts": table_counts(conn)?,
        "clinicDirectors": clinic_directors(conn)?,
        "studentsByClinic": students_by_clinic(conn)?,
    }))
}

pub fn table_counts(conn: &Connection) -> PortalResult<serde_json::Value> {
    Ok(json!({
        "directors": db::count_rows(conn, "directors")?,
        "students": db::count_rows(conn, "students")?,
        "clients": db::count_rows(conn, "clients")?,
        "clientAssignments": db::count_rows(conn, "client_assignments")?,
        "clientDirectors": db::count_rows(conn, "client_directors")?,
    }))
}

fn clinic_directors(conn: &Connection) -> PortalResult<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT full_name, clinic, role FROM directors
         WHERE role = 'Clinic Director' AND clinic IN (?, ?, ?, ?)
         ORDER BY clinic, full_name",
    )?;
    let rows = stmt
        .query_map(CORE_CLINICS, |r| {
            Ok(json!({
                "fullName": r.get::<_, String>(0)?,
                "clinic": r.get::<_, String>(1)?,
                "role": r.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn students_by_clinic(conn: &Connection) -> PortalResult<BTreeMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT clinic, COUNT(*) FROM students GROUP BY clinic")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

/// Cross-checks the loaded mappings. Every client other than the partially
/// staffed ones needs a student from each core clinic, and every Consulting
/// student leads a team.
pub fn audit_mappings(conn: &Connection) -> PortalResult<serde_json::Value> {
    let mut issues: Vec<String> = Vec::new();

    let mut stmt = conn.prepare("SELECT id, name FROM clients ORDER BY name")?;
    let clients = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut clinic_stmt =
        conn.prepare("SELECT DISTINCT clinic FROM client_assignments WHERE client_id = ?")?;
    for (client_id, name) in &clients {
        if PARTIAL_STAFFING_CLIENTS.contains(&name.as_str()) {
            continue;
        }
        let clinics = clinic_stmt
            .query_map([client_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for core in CORE_CLINICS {
            if !clinics.iter().any(|c| c == core) {
                issues.push(format!("{} missing {} student", name, core));
            }
        }
    }

    let mut lead_stmt = conn.prepare(
        "SELECT full_name FROM students WHERE clinic = 'Consulting' AND is_team_leader = 0 ORDER BY full_name",
    )?;
    let non_leaders = lead_stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for name in non_leaders {
        issues.push(format!("Consulting student {} should be team leader", name));
    }

    Ok(json!({
        "mappingIssues": issues,
        "summary": {
            "directorCount": db::count_rows(conn, "directors")?,
            "studentCount": db::count_rows(conn, "students")?,
            "clientCount": db::count_rows(conn, "clients")?,
            "assignmentCount": db::count_rows(conn, "client_assignments")?,
        },
    }))
}

pub fn load_dataset(path: Option<&Path>) -> PortalResult<SeedDataset> {
    let data = match path {
        Some(p) => SeedDataset::from_path(p)?,
        None => SeedDataset::embedded()?,
    };
    if data.semester.trim().is_empty() {
        return Err(PortalError::Invalid("dataset semester must not be empty".to_string()));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_dataset_deserializes() {
        let data = SeedDataset::embedded().expect("embedded");
        assert_eq!(data.directors.len(), 11);
        assert_eq!(data.students.len(), 45);
        assert_eq!(data.clients.len(), 11);
        assert!(data.clients.iter().any(|c| c.name == "Marabou Café"));
    }

    #[test]
    fn second_run_inserts_nothing() {
        let conn = db::open_in_memory().expect("open");
        let data = SeedDataset::embedded().expect("embedded");

        let first = import_seed(&conn, &data).expect("first");
        assert_eq!(first["audit"]["directors"]["inserted"], 11);
        assert_eq!(first["audit"]["students"]["inserted"], 45);
        assert_eq!(first["audit"]["clients"]["inserted"], 11);
        let assignments = first["audit"]["clientAssignments"]["inserted"]
            .as_u64()
            .expect("n");
        assert!(assignments > 0);

        let second = import_seed(&conn, &data).expect("second");
        for step in ["directors", "students", "clients", "clientDirectors", "clientAssignments"] {
            assert_eq!(second["audit"][step]["inserted"], 0, "{}", step);
            assert_eq!(second["audit"][step]["errors"], 0, "{}", step);
        }
        assert_eq!(second["audit"]["clientAssignments"]["skipped"].as_u64(), Some(assignments));
        assert_eq!(first["tableCounts"], second["tableCounts"]);
    }

    #[test]
    fn unknown_client_team_is_reported_not_fatal() {
        let conn = db::open_in_memory().expect("open");
        let data = SeedDataset::embedded().expect("embedded");
        let out = import_seed(&conn, &data).expect("import");
        // "Marabou" does not match the client "Marabou Café".
        let details = out["audit"]["clientAssignments"]["details"]
            .as_array()
            .expect("details");
        assert!(details
            .iter()
            .any(|d| d.as_str().unwrap_or("").contains("(client: Marabou)")));
    }

    #[test]
    fn director_lead_resolution_is_case_insensitive() {
        let conn = db::open_in_memory().expect("open");
        let data: SeedDataset = serde_json::from_value(json!({
            "semester": "FALL 2025",
            "directors": [{"firstName": "Ken", "lastName": "Mooney", "clinic": "Resource Acquisition", "email": "k@x.edu"}],
            "students": [],
            "clients": [{"name": "SEED", "directorLead": "KEN MOONEY"}]
        }))
        .expect("dataset");
        let out = import_seed(&conn, &data).expect("import");
        assert_eq!(out["audit"]["clientDirectors"]["inserted"], 1);
        let primary: Option<String> = conn
            .query_row("SELECT primary_director_id FROM clients", [], |r| r.get(0))
            .expect("row");
        assert!(primary.is_some());
    }
}
