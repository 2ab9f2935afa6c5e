use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::db;
use crate::error::PortalResult;
use crate::schedule;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryReport {
    pub total_records: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub errors: Vec<String>,
    pub final_count: i64,
}

struct DebriefRow {
    student_name: String,
    client_name: String,
    clinic: String,
    hours_worked: f64,
    work_summary: String,
    week_ending: Option<String>,
    date_submitted: String,
    semester: Option<String>,
}

#[derive(Default)]
struct Group {
    total_hours: f64,
    students: BTreeSet<String>,
    lines: Vec<String>,
    semester: Option<String>,
}

fn load_debriefs(conn: &Connection, semester: Option<&str>) -> rusqlite::Result<Vec<DebriefRow>> {
    let mut stmt = conn.prepare(
        "SELECT student_name, client_name, clinic, hours_worked, work_summary,
                week_ending, date_submitted, semester
         FROM debriefs
         WHERE (?1 IS NULL OR semester = ?1 COLLATE NOCASE)
         ORDER BY date_submitted, created_at",
    )?;
    let rows = stmt
        .query_map([semester], |r| {
            Ok(DebriefRow {
                student_name: r.get(0)?,
                client_name: r.get(1)?,
                clinic: r.get(2)?,
                hours_worked: r.get(3)?,
                work_summary: r.get(4)?,
                week_ending: r.get(5)?,
                date_submitted: r.get(6)?,
                semester: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Debriefs without a scheduled week fall into the week ending the next Sunday.
fn week_ending_for(row: &DebriefRow) -> Option<String> {
    if let Some(we) = row.week_ending.as_deref().filter(|s| !s.is_empty()) {
        return Some(we.to_string());
    }
    schedule::parse_any_date(&row.date_submitted).map(|d| schedule::sunday_week_ending(d).to_string())
}

/// Aggregates debriefs per (week ending, clinic, client). Groups already on
/// file are counted as duplicates and left untouched.
pub fn rebuild_weekly_summaries(conn: &Connection, semester: Option<&str>) -> PortalResult<SummaryReport> {
    let rows = load_debriefs(conn, semester)?;
    let mut report = SummaryReport {
        total_records: rows.len(),
        ..Default::default()
    };

    let mut groups: BTreeMap<(String, String, String), Group> = BTreeMap::new();
    for row in rows {
        let Some(week_ending) = week_ending_for(&row) else {
            report
                .errors
                .push(format!("unparseable date for {}: {}", row.student_name, row.date_submitted));
            continue;
        };
        let group = groups
            .entry((week_ending, row.clinic.clone(), row.client_name.clone()))
            .or_default();
        group.total_hours += row.hours_worked;
        group.students.insert(row.student_name.clone());
        group.lines.push(format!("{}: {}", row.student_name, row.work_summary));
        if group.semester.is_none() {
            group.semester = row.semester.clone();
        }
    }

    for ((week_ending, clinic, client_name), group) in groups {
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM weekly_summaries WHERE week_ending = ? AND clinic = ? AND client_name = ?",
                (&week_ending, &clinic, &client_name),
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            report.duplicates += 1;
            continue;
        }
        let res = conn.execute(
            "INSERT INTO weekly_summaries(
                id, week_ending, clinic, client_name, total_hours,
                student_count, activity_count, summary, semester
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                db::new_id(),
                week_ending,
                clinic,
                client_name,
                group.total_hours,
                group.students.len() as i64,
                group.lines.len() as i64,
                group.lines.join("\n\n"),
                semester.map(str::to_string).or(group.semester),
            ],
        );
        match res {
            Ok(_) => report.inserted += 1,
            Err(e) => {
                let detail = format!("Error inserting {}|{}|{}: {}", week_ending, clinic, client_name, e);
                log::warn!("{}", detail);
                report.errors.push(detail);
            }
        }
    }

    report.final_count = db::count_rows(conn, "weekly_summaries")?;
    log::info!(
        "weekly summaries: {} inserted, {} duplicates skipped, {} errors",
        report.inserted,
        report.duplicates,
        report.errors.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_debrief(conn: &Connection, student: &str, client: &str, hours: f64, date: &str) {
        conn.execute(
            "INSERT INTO debriefs(id, student_name, client_name, clinic, hours_worked, work_summary,
                                  date_submitted, semester, created_at, updated_at)
             VALUES(?, ?, ?, 'Consulting Clinic', ?, 'did things', ?, 'Fall 2025', 'x', 'x')",
            rusqlite::params![db::new_id(), student, client, hours, date],
        )
        .expect("insert debrief");
    }

    #[test]
    fn groups_by_week_clinic_and_client() {
        let conn = db::open_in_memory().expect("open");
        // 2025-11-27 is a Thursday; both land in the week ending 2025-11-30.
        add_debrief(&conn, "Ann Lee", "SEED", 2.0, "2025-11-27");
        add_debrief(&conn, "Ann Lee", "SEED", 1.5, "2025-11-29");
        add_debrief(&conn, "Bo Chen", "SEED", 3.0, "2025-11-28");
        add_debrief(&conn, "Bo Chen", "REWRITE", 4.0, "2025-11-28");

        let report = rebuild_weekly_summaries(&conn, None).expect("rebuild");
        assert_eq!(report.total_records, 4);
        assert_eq!(report.inserted, 2);

        let (hours, students, activities, summary): (f64, i64, i64, String) = conn
            .query_row(
                "SELECT total_hours, student_count, activity_count, summary
                 FROM weekly_summaries WHERE client_name = 'SEED'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .expect("row");
        assert_eq!(hours, 6.5);
        assert_eq!(students, 2);
        assert_eq!(activities, 3);
        assert!(summary.starts_with("Ann Lee: did things\n\n"));

        let week: String = conn
            .query_row("SELECT week_ending FROM weekly_summaries LIMIT 1", [], |r| r.get(0))
            .expect("week");
        assert_eq!(week, "2025-11-30");
    }

    #[test]
    fn rerun_counts_duplicates() {
        let conn = db::open_in_memory().expect("open");
        add_debrief(&conn, "Ann Lee", "SEED", 2.0, "2025-11-27");
        rebuild_weekly_summaries(&conn, None).expect("first");
        let second = rebuild_weekly_summaries(&conn, None).expect("second");
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.final_count, 1);
    }
}
