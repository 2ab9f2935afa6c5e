use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;

use crate::db;
use crate::error::PortalResult;
use crate::schedule::{self, SemesterWeek};

/// The Fall 2025 debrief export shipped with the portal.
pub const DEFAULT_DEBRIEFS_CSV: &str = include_str!("../data/debriefs_fall2025.csv");
pub const DEFAULT_MIGRATION_SEMESTER: &str = "Fall 2025";

#[derive(Debug, Clone, PartialEq)]
pub struct DebriefRecord {
    pub line_no: usize,
    pub date: String,
    pub clinic: String,
    pub client: String,
    pub hours_worked: f64,
    pub summary: String,
    pub student_name: String,
    pub questions: String,
    pub action_items: String,
}

/// Splits one CSV line. Quoted fields may contain commas; `""` inside a
/// quoted field is a literal quote. Fields are trimmed.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    cur.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                cur.push(c);
            }
            continue;
        }
        match c {
            ',' => {
                fields.push(cur.trim().to_string());
                cur.clear();
            }
            '"' if cur.trim().is_empty() => {
                cur.clear();
                in_quotes = true;
            }
            _ => cur.push(c),
        }
    }
    fields.push(cur.trim().to_string());
    fields
}

/// Header line is skipped. Rows with fewer than six fields are dropped.
pub fn parse_debrief_csv(text: &str) -> Vec<DebriefRecord> {
    let mut out = Vec::new();
    for (idx, raw) in text.trim().lines().enumerate().skip(1) {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        if fields.len() < 6 {
            continue;
        }
        let get = |i: usize| fields.get(i).cloned().unwrap_or_default();
        out.push(DebriefRecord {
            line_no: idx + 1,
            date: get(0),
            clinic: get(1),
            client: get(2),
            hours_worked: get(3).parse::<f64>().unwrap_or(0.0),
            summary: get(4),
            student_name: get(5),
            questions: get(6),
            action_items: get(7),
        });
    }
    out
}

/// Maps a sheet clinic label to the canonical clinic label.
pub fn canonical_clinic(label: &str) -> String {
    match label.trim() {
        "Accounting" => "Accounting Clinic".to_string(),
        "Consulting" => "Consulting Clinic".to_string(),
        "Marketing" => "Marketing Clinic".to_string(),
        "Funding" | "Resource Acquisition" => "Funding Clinic".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct StudentKey {
    pub id: String,
    pub email: String,
}

/// Lowercased full name → student. First row wins on collisions.
pub fn student_lookup(conn: &Connection) -> rusqlite::Result<HashMap<String, StudentKey>> {
    let mut stmt = conn.prepare("SELECT id, full_name, email FROM students ORDER BY rowid")?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut map = HashMap::new();
    for (id, name, email) in rows {
        map.entry(name.trim().to_lowercase())
            .or_insert(StudentKey { id, email });
    }
    Ok(map)
}

/// Lowercased client name → client id.
pub fn client_lookup(conn: &Connection) -> rusqlite::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT id, name FROM clients ORDER BY rowid")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut map = HashMap::new();
    for (id, name) in rows {
        map.entry(name.trim().to_lowercase()).or_insert(id);
    }
    Ok(map)
}

#[derive(Debug, Clone)]
struct PreparedDebrief {
    student_id: Option<String>,
    student_name: String,
    student_email: Option<String>,
    client_id: Option<String>,
    client_name: String,
    clinic: String,
    hours_worked: f64,
    work_summary: String,
    questions: Option<String>,
    action_items: Option<String>,
    week_number: Option<i64>,
    week_ending: Option<NaiveDate>,
    date_submitted: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRow {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchError {
    pub batch: usize,
    pub rows: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub parsed: usize,
    pub inserted: usize,
    pub batches: usize,
    pub weeks_loaded: usize,
    pub batch_errors: Vec<BatchError>,
    pub invalid_rows: Vec<InvalidRow>,
    pub unmatched_students: Vec<String>,
    pub unmatched_clients: Vec<String>,
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn prepare_records(
    records: &[DebriefRecord],
    students: &HashMap<String, StudentKey>,
    clients: &HashMap<String, String>,
    weeks: &[SemesterWeek],
    report: &mut MigrationReport,
) -> Vec<PreparedDebrief> {
    let mut unmatched_students = BTreeSet::new();
    let mut unmatched_clients = BTreeSet::new();
    let mut out = Vec::with_capacity(records.len());

    for rec in records {
        let Some(date) = schedule::parse_us_date(&rec.date) else {
            report.invalid_rows.push(InvalidRow {
                line: rec.line_no,
                reason: format!("unparseable date: {:?}", rec.date),
            });
            continue;
        };

        let student = students.get(&rec.student_name.trim().to_lowercase());
        if student.is_none() {
            unmatched_students.insert(rec.student_name.clone());
        }
        let client_id = clients.get(&rec.client.trim().to_lowercase()).cloned();
        if client_id.is_none() {
            unmatched_clients.insert(rec.client.clone());
        }
        let week = schedule::find_week(weeks, date);

        out.push(PreparedDebrief {
            student_id: student.map(|s| s.id.clone()),
            student_name: rec.student_name.clone(),
            student_email: student.map(|s| s.email.clone()),
            client_id,
            client_name: rec.client.clone(),
            clinic: canonical_clinic(&rec.clinic),
            hours_worked: rec.hours_worked,
            work_summary: rec.summary.clone(),
            questions: non_empty(&rec.questions),
            action_items: non_empty(&rec.action_items),
            week_number: week.as_ref().map(|w| w.week_number),
            week_ending: week.as_ref().map(|w| w.week_ending),
            date_submitted: date,
        });
    }

    report.unmatched_students = unmatched_students.into_iter().collect();
    report.unmatched_clients = unmatched_clients.into_iter().collect();
    out
}

fn insert_batch(conn: &Connection, batch: &[PreparedDebrief], semester: &str) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO debriefs(
                id, student_id, student_name, student_email, client_id, client_name,
                clinic, hours_worked, work_summary, questions, action_items,
                week_number, week_ending, date_submitted, status, semester,
                created_at, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'submitted', ?, ?, ?)",
        )?;
        let now = db::now_rfc3339();
        for d in batch {
            stmt.execute(rusqlite::params![
                db::new_id(),
                d.student_id,
                d.student_name,
                d.student_email,
                d.client_id,
                d.client_name,
                d.clinic,
                d.hours_worked,
                d.work_summary,
                d.questions,
                d.action_items,
                d.week_number,
                d.week_ending.map(|w| w.to_string()),
                d.date_submitted.to_string(),
                semester,
                now,
                now,
            ])?;
        }
    }
    tx.commit()
}

/// Loads debrief rows from CSV text, linking each to a student, a client and
/// a semester week. Batches that fail are rolled back and reported; the run
/// continues with the next batch.
pub fn migrate_debriefs(
    conn: &Connection,
    csv_text: &str,
    semester: &str,
    batch_size: usize,
) -> PortalResult<MigrationReport> {
    let mut report = MigrationReport::default();
    let records = parse_debrief_csv(csv_text);
    report.parsed = records.len();
    log::info!("parsed {} debrief records", records.len());

    let students = student_lookup(conn)?;
    let clients = client_lookup(conn)?;
    let weeks = schedule::weeks_for_lookup(conn, Some(semester))?;
    report.weeks_loaded = weeks.len();
    log::info!(
        "lookup tables: {} students, {} clients, {} weeks",
        students.len(),
        clients.len(),
        weeks.len()
    );
    if weeks.is_empty() {
        log::warn!("no semester weeks on file; debriefs will have no week");
    }

    let prepared = prepare_records(&records, &students, &clients, &weeks, &mut report);
    if !report.unmatched_students.is_empty() {
        log::warn!("unmatched students: {:?}", report.unmatched_students);
    }
    if !report.unmatched_clients.is_empty() {
        log::warn!("unmatched clients: {:?}", report.unmatched_clients);
    }

    let size = batch_size.max(1);
    for (i, batch) in prepared.chunks(size).enumerate() {
        report.batches += 1;
        match insert_batch(conn, batch, semester) {
            Ok(()) => {
                report.inserted += batch.len();
                log::info!("inserted batch {}: {} records", i + 1, batch.len());
            }
            Err(e) => {
                log::warn!("error inserting batch {}: {}", i + 1, e);
                report.batch_errors.push(BatchError {
                    batch: i + 1,
                    rows: batch.len(),
                    message: e.to_string(),
                });
            }
        }
    }

    log::info!("migration complete: {} debriefs inserted", report.inserted);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_handles_quotes_and_escapes() {
        let f = split_csv_line(r#"12/5/2025,Consulting,Sawyer Parks,12,"built prezy, prepped ""final"" changes",Adam Calnan,,Also rehearsals"#);
        assert_eq!(f.len(), 8);
        assert_eq!(f[4], r#"built prezy, prepped "final" changes"#);
        assert_eq!(f[5], "Adam Calnan");
        assert_eq!(f[6], "");
        assert_eq!(f[7], "Also rehearsals");
    }

    #[test]
    fn splitter_keeps_apostrophes_and_trailing_empty_fields() {
        let f = split_csv_line("11/30/2025,Consulting,Marabou Café,12.9,Work,Marian O'Brien,,");
        assert_eq!(f.len(), 8);
        assert_eq!(f[2], "Marabou Café");
        assert_eq!(f[5], "Marian O'Brien");
        assert_eq!(f[7], "");
    }

    #[test]
    fn parser_skips_header_and_short_rows() {
        let text = "Date,Clinic,Client,Hours Worked,Summary of work,Student Name,Questions,Action Items\n\
                    12/4/2025,Funding,Crown Legends,6,Final deck,Mason Holt,,\n\
                    broken,row\n\
                    12/4/2025,Funding,City of Malden,abc,Guide,Muskan Kapoor\n";
        let rows = parse_debrief_csv(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hours_worked, 6.0);
        assert_eq!(rows[0].line_no, 2);
        assert_eq!(rows[1].hours_worked, 0.0);
        assert_eq!(rows[1].questions, "");
    }

    #[test]
    fn clinic_labels_map_to_canonical_names() {
        assert_eq!(canonical_clinic("Funding"), "Funding Clinic");
        assert_eq!(canonical_clinic("Resource Acquisition"), "Funding Clinic");
        assert_eq!(canonical_clinic("Accounting"), "Accounting Clinic");
        assert_eq!(canonical_clinic("Legal"), "Legal");
    }

    #[test]
    fn embedded_export_parses_every_row() {
        let rows = parse_debrief_csv(DEFAULT_DEBRIEFS_CSV);
        assert_eq!(rows.len(), 120);
        assert!(rows.iter().all(|r| schedule::parse_us_date(&r.date).is_some()));
    }

    #[test]
    fn migration_batches_and_reports_unmatched() {
        let conn = db::open_in_memory().expect("open");
        conn.execute(
            "INSERT INTO students(id, first_name, last_name, full_name, email, clinic, created_at)
             VALUES('s1', 'Mason', 'Holt', 'Mason Holt', 'mason@x.edu', 'Resource Acquisition', 'now')",
            [],
        )
        .expect("student");
        conn.execute(
            "INSERT INTO clients(id, name, created_at) VALUES('c1', 'Crown Legends', 'now')",
            [],
        )
        .expect("client");

        let text = "h\n\
                    12/4/2025,Funding,crown legends,6,a,MASON HOLT,,\n\
                    12/4/2025,Funding,Nobody Inc,3,b,Ghost Student,,\n\
                    13/40/2025,Funding,Crown Legends,3,c,Mason Holt,,\n";
        let report = migrate_debriefs(&conn, text, "Fall 2025", 1).expect("migrate");
        assert_eq!(report.parsed, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.batches, 2);
        assert_eq!(report.invalid_rows.len(), 1);
        assert_eq!(report.unmatched_students, vec!["Ghost Student".to_string()]);
        assert_eq!(report.unmatched_clients, vec!["Nobody Inc".to_string()]);

        let (sid, cid, clinic): (Option<String>, Option<String>, String) = conn
            .query_row(
                "SELECT student_id, client_id, clinic FROM debriefs WHERE work_summary = 'a'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .expect("row");
        assert_eq!(sid.as_deref(), Some("s1"));
        assert_eq!(cid.as_deref(), Some("c1"));
        assert_eq!(clinic, "Funding Clinic");
    }
}
