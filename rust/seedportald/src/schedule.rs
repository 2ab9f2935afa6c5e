use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use crate::db;
use crate::error::{PortalError, PortalResult};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterWeek {
    pub id: String,
    pub semester_id: String,
    pub week_number: i64,
    pub week_label: String,
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub is_break: bool,
    pub session_focus: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekMatch {
    Contained,
    Nearest,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekInfo {
    pub week_number: i64,
    pub week_ending: NaiveDate,
    pub matched: WeekMatch,
}

pub fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    let t = s.trim();
    // Accept full timestamps too; only the date part matters.
    let day = t.get(..10).unwrap_or(t);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// `M/D/YYYY`, the form used by the exported debrief sheets.
pub fn parse_us_date(s: &str) -> Option<NaiveDate> {
    let mut parts = s.trim().split('/');
    let month = parts.next()?.trim().parse::<u32>().ok()?;
    let day = parts.next()?.trim().parse::<u32>().ok()?;
    let year = parts.next()?.trim().parse::<i32>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Either `YYYY-MM-DD` or `M/D/YYYY`.
pub fn parse_any_date(s: &str) -> Option<NaiveDate> {
    parse_iso_date(s).or_else(|| parse_us_date(s))
}

/// Picks the week containing `date`; on a miss, the week whose end is
/// closest to `date`. Ties keep the earlier week in slice order.
pub fn find_week(weeks: &[SemesterWeek], date: NaiveDate) -> Option<WeekInfo> {
    if let Some(w) = weeks
        .iter()
        .find(|w| date >= w.week_start && date <= w.week_end)
    {
        return Some(WeekInfo {
            week_number: w.week_number,
            week_ending: w.week_end,
            matched: WeekMatch::Contained,
        });
    }

    let mut closest: Option<(&SemesterWeek, i64)> = None;
    for w in weeks {
        let diff = (date - w.week_end).num_days().abs();
        if closest.map(|(_, d)| diff < d).unwrap_or(true) {
            closest = Some((w, diff));
        }
    }
    closest.map(|(w, _)| WeekInfo {
        week_number: w.week_number,
        week_ending: w.week_end,
        matched: WeekMatch::Nearest,
    })
}

/// Next Sunday on or after `date`.
pub fn sunday_week_ending(date: NaiveDate) -> NaiveDate {
    let from_monday = date.weekday().num_days_from_monday() as i64;
    let until_sunday = (Weekday::Sun.num_days_from_monday() as i64) - from_monday;
    date + Duration::days(until_sunday)
}

pub fn current_week<'a>(weeks: &'a [SemesterWeek], today: NaiveDate) -> Option<&'a SemesterWeek> {
    weeks
        .iter()
        .find(|w| w.week_start <= today && w.week_end >= today)
}

pub fn schedule_metadata(weeks: &[SemesterWeek], today: NaiveDate) -> serde_json::Value {
    let total_class_weeks = weeks.iter().filter(|w| !w.is_break).count();
    let elapsed_class_weeks = weeks
        .iter()
        .filter(|w| !w.is_break && w.week_end < today)
        .count();
    let current = current_week(weeks, today);
    json!({
        "totalWeeks": weeks.len(),
        "totalClassWeeks": total_class_weeks,
        "elapsedClassWeeks": elapsed_class_weeks,
        "currentWeekNumber": current.map(|w| w.week_number),
        "currentWeekId": current.map(|w| w.id.clone()),
    })
}

pub fn semester_id_by_label(conn: &Connection, semester: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM semester_config WHERE semester = ?",
        [semester],
        |r| r.get(0),
    )
    .optional()
}

pub fn active_semester_id(conn: &Connection) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM semester_config WHERE is_active = 1 ORDER BY semester LIMIT 1",
        [],
        |r| r.get(0),
    )
    .optional()
}

/// Returns the semester id for `semester`, creating the row on first use.
/// The first semester ever created becomes the active one.
pub fn ensure_semester(conn: &Connection, semester: &str) -> rusqlite::Result<String> {
    if let Some(id) = semester_id_by_label(conn, semester)? {
        return Ok(id);
    }
    let any_active = active_semester_id(conn)?.is_some();
    let id = db::new_id();
    conn.execute(
        "INSERT INTO semester_config(id, semester, is_active) VALUES(?, ?, ?)",
        (&id, semester, if any_active { 0 } else { 1 }),
    )?;
    Ok(id)
}

pub fn activate_semester(conn: &Connection, semester_id: &str) -> PortalResult<()> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM semester_config WHERE id = ?",
            [semester_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !exists {
        return Err(PortalError::NotFound("semester".to_string()));
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute("UPDATE semester_config SET is_active = 0", [])?;
    tx.execute(
        "UPDATE semester_config SET is_active = 1 WHERE id = ?",
        [semester_id],
    )?;
    tx.commit()?;
    Ok(())
}

fn week_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SemesterWeek> {
    let start: String = r.get(4)?;
    let end: String = r.get(5)?;
    let bad_date = |idx: usize, s: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid date: {}", s).into(),
        )
    };
    Ok(SemesterWeek {
        id: r.get(0)?,
        semester_id: r.get(1)?,
        week_number: r.get(2)?,
        week_label: r.get(3)?,
        week_start: parse_iso_date(&start).ok_or_else(|| bad_date(4, &start))?,
        week_end: parse_iso_date(&end).ok_or_else(|| bad_date(5, &end))?,
        is_break: r.get::<_, i64>(6)? != 0,
        session_focus: r.get(7)?,
        notes: r.get(8)?,
    })
}

const WEEK_COLUMNS: &str = "id, semester_id, week_number, week_label, week_start, week_end, is_break, session_focus, notes";

/// Weeks ordered by start date. `None` loads every semester.
pub fn load_weeks(conn: &Connection, semester_id: Option<&str>) -> rusqlite::Result<Vec<SemesterWeek>> {
    match semester_id {
        Some(sid) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM semester_schedule WHERE semester_id = ? ORDER BY week_start, week_number",
                WEEK_COLUMNS
            ))?;
            let rows = stmt
                .query_map([sid], week_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM semester_schedule ORDER BY week_start, week_number",
                WEEK_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], week_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }
    }
}

/// Weeks of the named semester if it exists, else the active semester,
/// else all weeks on file.
pub fn weeks_for_lookup(conn: &Connection, semester: Option<&str>) -> rusqlite::Result<Vec<SemesterWeek>> {
    if let Some(label) = semester {
        if let Some(sid) = semester_id_by_label(conn, label)? {
            return load_weeks(conn, Some(&sid));
        }
    }
    if let Some(sid) = active_semester_id(conn)? {
        return load_weeks(conn, Some(&sid));
    }
    load_weeks(conn, None)
}

pub struct WeekInput {
    pub semester: String,
    pub week_number: i64,
    pub week_label: Option<String>,
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub is_break: bool,
    pub session_focus: Option<String>,
    pub notes: Option<String>,
}

pub fn upsert_week(conn: &Connection, input: &WeekInput) -> PortalResult<String> {
    if input.week_number <= 0 {
        return Err(PortalError::Invalid("weekNumber must be positive".to_string()));
    }
    if input.week_end < input.week_start {
        return Err(PortalError::Invalid("weekEnd must not precede weekStart".to_string()));
    }
    let semester_id = ensure_semester(conn, &input.semester)?;
    let label = input
        .week_label
        .clone()
        .unwrap_or_else(|| format!("Week {}", input.week_number));
    let new_id = db::new_id();
    conn.execute(
        "INSERT INTO semester_schedule(
            id, semester_id, week_number, week_label, week_start, week_end,
            is_break, session_focus, notes
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(semester_id, week_number) DO UPDATE SET
            week_label = excluded.week_label,
            week_start = excluded.week_start,
            week_end = excluded.week_end,
            is_break = excluded.is_break,
            session_focus = excluded.session_focus,
            notes = excluded.notes",
        rusqlite::params![
            new_id,
            semester_id,
            input.week_number,
            label,
            input.week_start.to_string(),
            input.week_end.to_string(),
            input.is_break as i64,
            input.session_focus,
            input.notes,
        ],
    )?;
    let id: String = conn.query_row(
        "SELECT id FROM semester_schedule WHERE semester_id = ? AND week_number = ?",
        (&semester_id, input.week_number),
        |r| r.get(0),
    )?;
    Ok(id)
}
