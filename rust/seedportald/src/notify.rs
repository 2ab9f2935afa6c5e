//! Notification rows for students and directors.
//!
//! Every helper writes plain rows into `notifications`; fan-out helpers write
//! one row per recipient inside a single transaction so a failed insert
//! leaves no partial batch behind.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::db;
use crate::error::{PortalError, PortalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    DocumentUpload,
    Question,
    MeetingRequest,
    Announcement,
    Debrief,
    Attendance,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::DocumentUpload => "document_upload",
            NotificationType::Question => "question",
            NotificationType::MeetingRequest => "meeting_request",
            NotificationType::Announcement => "announcement",
            NotificationType::Debrief => "debrief",
            NotificationType::Attendance => "attendance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document_upload" => Some(NotificationType::DocumentUpload),
            "question" => Some(NotificationType::Question),
            "meeting_request" => Some(NotificationType::MeetingRequest),
            "announcement" => Some(NotificationType::Announcement),
            "debrief" => Some(NotificationType::Debrief),
            "attendance" => Some(NotificationType::Attendance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Students,
    Directors,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Audience::Students => "students",
            Audience::Directors => "directors",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "students" => Some(Audience::Students),
            "directors" => Some(Audience::Directors),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub audience: Audience,
    pub student_id: Option<String>,
    pub student_name: Option<String>,
    pub student_email: Option<String>,
    pub clinic_id: Option<String>,
    pub director_id: Option<String>,
    pub related_id: Option<String>,
    pub created_by_user_id: Option<String>,
}

impl NewNotification {
    pub fn new(kind: NotificationType, title: &str, message: &str, audience: Audience) -> Self {
        Self {
            kind,
            title: title.to_string(),
            message: message.to_string(),
            audience,
            student_id: None,
            student_name: None,
            student_email: None,
            clinic_id: None,
            director_id: None,
            related_id: None,
            created_by_user_id: None,
        }
    }
}

/// The student a director-facing notification is about.
#[derive(Debug, Clone, Default)]
pub struct StudentRef {
    pub student_id: Option<String>,
    pub student_name: Option<String>,
    pub student_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanOutResult {
    pub count: usize,
}

fn insert_row(conn: &Connection, n: &NewNotification) -> rusqlite::Result<String> {
    let id = db::new_id();
    conn.execute(
        "INSERT INTO notifications(
            id, type, title, message, student_id, student_name, student_email,
            clinic_id, director_id, target_audience, related_id, created_by_user_id,
            is_read, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        rusqlite::params![
            id,
            n.kind.as_str(),
            n.title,
            n.message,
            n.student_id,
            n.student_name,
            n.student_email,
            n.clinic_id,
            n.director_id,
            n.audience.as_str(),
            n.related_id,
            n.created_by_user_id,
            db::now_rfc3339(),
        ],
    )?;
    Ok(id)
}

pub fn create_notification(conn: &Connection, n: &NewNotification) -> PortalResult<String> {
    if n.title.trim().is_empty() || n.message.trim().is_empty() {
        return Err(PortalError::Invalid("title and message are required".to_string()));
    }
    if n.audience == Audience::Students && n.student_id.is_none() && n.kind != NotificationType::Announcement {
        return Err(PortalError::Invalid(
            "student notifications need a student id".to_string(),
        ));
    }
    let id = insert_row(conn, n)?;
    log::debug!("notification {} created ({})", id, n.kind.as_str());
    Ok(id)
}

/// One row per active student, optionally limited to a semester label.
pub fn bulk_student_notifications(
    conn: &Connection,
    kind: NotificationType,
    title: &str,
    message: &str,
    semester: Option<&str>,
) -> PortalResult<FanOutResult> {
    let mut stmt = conn.prepare(
        "SELECT id, full_name, email, clinic_id
         FROM students
         WHERE status = 'active' AND (?1 IS NULL OR semester = ?1 COLLATE NOCASE)
         ORDER BY full_name",
    )?;
    let students = stmt
        .query_map([semester], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if students.is_empty() {
        return Ok(FanOutResult { count: 0 });
    }

    let tx = conn.unchecked_transaction()?;
    for (id, name, email, clinic_id) in &students {
        let mut n = NewNotification::new(kind, title, message, Audience::Students);
        n.student_id = Some(id.clone());
        n.student_name = Some(name.clone());
        n.student_email = Some(email.clone());
        n.clinic_id = clinic_id.clone();
        insert_row(&tx, &n)?;
    }
    tx.commit()?;

    log::info!("created {} notifications for students", students.len());
    Ok(FanOutResult {
        count: students.len(),
    })
}

/// One row per director of the clinic. A clinic without directors falls back
/// to a single arbitrary director so the message is not lost.
pub fn notify_clinic_directors(
    conn: &Connection,
    kind: NotificationType,
    title: &str,
    message: &str,
    clinic_id: &str,
    student: &StudentRef,
    related_id: Option<&str>,
) -> PortalResult<FanOutResult> {
    let mut stmt = conn.prepare("SELECT id FROM directors WHERE clinic_id = ? ORDER BY full_name")?;
    let mut director_ids = stmt
        .query_map([clinic_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    if director_ids.is_empty() {
        let any: Option<String> = conn
            .query_row("SELECT id FROM directors ORDER BY rowid LIMIT 1", [], |r| r.get(0))
            .optional()?;
        if let Some(id) = any {
            log::warn!("clinic {} has no directors; notifying {} instead", clinic_id, id);
            director_ids.push(id);
        }
    }
    if director_ids.is_empty() {
        return Ok(FanOutResult { count: 0 });
    }

    let tx = conn.unchecked_transaction()?;
    for director_id in &director_ids {
        let mut n = NewNotification::new(kind, title, message, Audience::Directors);
        n.student_id = student.student_id.clone();
        n.student_name = student.student_name.clone();
        n.student_email = student.student_email.clone();
        n.clinic_id = Some(clinic_id.to_string());
        n.director_id = Some(director_id.clone());
        n.related_id = related_id.map(|s| s.to_string());
        insert_row(&tx, &n)?;
    }
    tx.commit()?;

    Ok(FanOutResult {
        count: director_ids.len(),
    })
}

/// Director fan-out for a row the caller has already stored. A failure is
/// logged and counts as zero notifications; the stored row stands.
pub fn sent_or_logged(result: PortalResult<FanOutResult>, what: &str) -> usize {
    match result {
        Ok(r) => r.count,
        Err(e) => {
            log::warn!("{} saved but directors were not notified: {}", what, e);
            0
        }
    }
}

pub fn mark_read(conn: &Connection, notification_id: &str, is_read: bool) -> PortalResult<()> {
    let changed = conn.execute(
        "UPDATE notifications SET is_read = ? WHERE id = ?",
        (is_read as i64, notification_id),
    )?;
    if changed == 0 {
        return Err(PortalError::NotFound("notification".to_string()));
    }
    Ok(())
}

pub fn mark_all_read(conn: &Connection, student_id: &str) -> PortalResult<usize> {
    let changed = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE student_id = ? AND is_read = 0",
        [student_id],
    )?;
    Ok(changed)
}

pub fn unread_count(conn: &Connection, student_id: &str) -> PortalResult<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM notifications
         WHERE student_id = ? AND is_read = 0 AND target_audience = 'students'",
        [student_id],
        |r| r.get(0),
    )?;
    Ok(n)
}

/// Case-insensitive substring match on the clinic name.
pub fn clinic_id_for_name(conn: &Connection, clinic_name: &str) -> PortalResult<Option<String>> {
    let needle = clinic_name.trim();
    if needle.is_empty() {
        return Ok(None);
    }
    let pattern = format!("%{}%", needle);
    let id = conn
        .query_row(
            "SELECT id FROM clinics WHERE name LIKE ? ORDER BY length(name), name LIMIT 1",
            [&pattern],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn student_clinic_id(conn: &Connection, student_id: &str) -> PortalResult<Option<String>> {
    let id: Option<Option<String>> = conn
        .query_row("SELECT clinic_id FROM students WHERE id = ?", [student_id], |r| r.get(0))
        .optional()?;
    Ok(id.flatten())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_director(conn: &Connection, name: &str, email: &str, clinic: &str) -> String {
        let clinic_id = db::ensure_clinic(conn, clinic).expect("clinic");
        let id = db::new_id();
        conn.execute(
            "INSERT INTO directors(id, first_name, last_name, full_name, email, clinic, clinic_id, role, created_at)
             VALUES(?, '', '', ?, ?, ?, ?, 'Clinic Director', ?)",
            rusqlite::params![id, name, email, clinic, clinic_id, db::now_rfc3339()],
        )
        .expect("insert director");
        id
    }

    fn add_student(conn: &Connection, name: &str, email: &str, clinic: &str, semester: &str) -> String {
        let clinic_id = db::ensure_clinic(conn, clinic).expect("clinic");
        let id = db::new_id();
        conn.execute(
            "INSERT INTO students(id, first_name, last_name, full_name, email, clinic, clinic_id, semester, created_at)
             VALUES(?, '', '', ?, ?, ?, ?, ?, ?)",
            rusqlite::params![id, name, email, clinic, clinic_id, semester, db::now_rfc3339()],
        )
        .expect("insert student");
        id
    }

    #[test]
    fn bulk_fans_out_one_row_per_student_in_semester() {
        let conn = db::open_in_memory().expect("open");
        let a = add_student(&conn, "Ann A", "a@x.edu", "Accounting", "FALL 2025");
        add_student(&conn, "Bo B", "b@x.edu", "Marketing", "FALL 2025");
        add_student(&conn, "Cy C", "c@x.edu", "Marketing", "SPRING 2026");

        let r = bulk_student_notifications(
            &conn,
            NotificationType::Announcement,
            "Attendance Open",
            "Week 5 is open",
            Some("fall 2025"),
        )
        .expect("bulk");
        assert_eq!(r.count, 2);
        assert_eq!(unread_count(&conn, &a).expect("count"), 1);
        assert_eq!(mark_all_read(&conn, &a).expect("mark"), 1);
        assert_eq!(unread_count(&conn, &a).expect("count"), 0);
    }

    #[test]
    fn directors_fallback_when_clinic_has_none() {
        let conn = db::open_in_memory().expect("open");
        let d = add_director(&conn, "Mark Dwyer", "m@x.edu", "Accounting");
        let legal = db::ensure_clinic(&conn, "Legal").expect("clinic");

        let r = notify_clinic_directors(
            &conn,
            NotificationType::Question,
            "Question",
            "How?",
            &legal,
            &StudentRef::default(),
            None,
        )
        .expect("notify");
        assert_eq!(r.count, 1);
        let target: String = conn
            .query_row("SELECT director_id FROM notifications", [], |r| r.get(0))
            .expect("row");
        assert_eq!(target, d);
    }

    #[test]
    fn no_directors_at_all_is_a_noop() {
        let conn = db::open_in_memory().expect("open");
        let legal = db::ensure_clinic(&conn, "Legal").expect("clinic");
        let r = notify_clinic_directors(
            &conn,
            NotificationType::Debrief,
            "t",
            "m",
            &legal,
            &StudentRef::default(),
            None,
        )
        .expect("notify");
        assert_eq!(r.count, 0);
    }

    #[test]
    fn clinic_lookup_is_substring_and_case_insensitive() {
        let conn = db::open_in_memory().expect("open");
        let id = db::ensure_clinic(&conn, "Resource Acquisition").expect("clinic");
        assert_eq!(clinic_id_for_name(&conn, "resource").expect("lookup"), Some(id));
        assert_eq!(clinic_id_for_name(&conn, "Legal").expect("lookup"), None);
    }

    #[test]
    fn student_notification_requires_student() {
        let conn = db::open_in_memory().expect("open");
        let n = NewNotification::new(NotificationType::Debrief, "t", "m", Audience::Students);
        assert!(matches!(create_notification(&conn, &n), Err(PortalError::Invalid(_))));
    }
}
