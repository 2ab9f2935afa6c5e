use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "portal.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema.
#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semester_config(
            id TEXT PRIMARY KEY,
            semester TEXT NOT NULL UNIQUE COLLATE NOCASE,
            is_active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS semester_schedule(
            id TEXT PRIMARY KEY,
            semester_id TEXT NOT NULL,
            week_number INTEGER NOT NULL,
            week_label TEXT NOT NULL,
            week_start TEXT NOT NULL,
            week_end TEXT NOT NULL,
            is_break INTEGER NOT NULL DEFAULT 0,
            session_focus TEXT,
            notes TEXT,
            FOREIGN KEY(semester_id) REFERENCES semester_config(id),
            UNIQUE(semester_id, week_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semester_schedule_semester ON semester_schedule(semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS clinics(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS directors(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE COLLATE NOCASE,
            clinic TEXT NOT NULL,
            clinic_id TEXT,
            role TEXT NOT NULL,
            semester TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(clinic_id) REFERENCES clinics(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_directors_clinic ON directors(clinic_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE COLLATE NOCASE,
            clinic TEXT NOT NULL,
            clinic_id TEXT,
            client_team TEXT,
            is_team_leader INTEGER NOT NULL DEFAULT 0,
            academic_level TEXT,
            university_id TEXT,
            semester TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            FOREIGN KEY(clinic_id) REFERENCES clinics(id)
        )",
        [],
    )?;
    ensure_students_updated_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_clinic ON students(clinic_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS clients(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE,
            website TEXT,
            contact_name TEXT,
            email TEXT,
            industry TEXT,
            primary_director_id TEXT,
            semester TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            FOREIGN KEY(primary_director_id) REFERENCES directors(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS client_directors(
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            director_id TEXT NOT NULL,
            is_primary INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(client_id) REFERENCES clients(id),
            FOREIGN KEY(director_id) REFERENCES directors(id),
            UNIQUE(client_id, director_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS client_assignments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            clinic TEXT NOT NULL,
            role TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(client_id) REFERENCES clients(id),
            UNIQUE(student_id, client_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_client_assignments_client ON client_assignments(client_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS client_intake(
            id TEXT PRIMARY KEY,
            client_name TEXT NOT NULL,
            client_email TEXT,
            client_phone TEXT,
            client_website TEXT,
            business_description TEXT,
            industry TEXT,
            primary_clinic TEXT NOT NULL,
            secondary_clinics_json TEXT NOT NULL DEFAULT '[]',
            lead_consultant TEXT,
            semester TEXT,
            notes TEXT,
            created_by TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS debriefs(
            id TEXT PRIMARY KEY,
            student_id TEXT,
            student_name TEXT NOT NULL,
            student_email TEXT,
            client_id TEXT,
            client_name TEXT NOT NULL,
            clinic TEXT NOT NULL,
            hours_worked REAL NOT NULL DEFAULT 0,
            work_summary TEXT NOT NULL,
            questions TEXT,
            action_items TEXT,
            week_number INTEGER,
            week_ending TEXT,
            date_submitted TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'submitted',
            semester TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(client_id) REFERENCES clients(id)
        )",
        [],
    )?;
    ensure_debriefs_review_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_debriefs_student ON debriefs(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_debriefs_client ON debriefs(client_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS weekly_summaries(
            id TEXT PRIMARY KEY,
            week_ending TEXT NOT NULL,
            clinic TEXT NOT NULL,
            client_name TEXT NOT NULL,
            total_hours REAL NOT NULL,
            student_count INTEGER NOT NULL,
            activity_count INTEGER NOT NULL,
            summary TEXT NOT NULL,
            semester TEXT,
            UNIQUE(week_ending, clinic, client_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT,
            student_name TEXT NOT NULL,
            student_email TEXT NOT NULL,
            clinic TEXT NOT NULL,
            semester_id TEXT,
            week_number INTEGER NOT NULL,
            week_ending TEXT,
            class_date TEXT NOT NULL,
            is_present INTEGER NOT NULL DEFAULT 1,
            is_excused INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_passwords(
            id TEXT PRIMARY KEY,
            semester_id TEXT NOT NULL,
            week_number INTEGER NOT NULL,
            password TEXT NOT NULL,
            week_start TEXT NOT NULL,
            week_end TEXT NOT NULL,
            created_by_name TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(semester_id, week_number)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents(
            id TEXT PRIMARY KEY,
            student_id TEXT,
            student_name TEXT NOT NULL,
            client_id TEXT,
            client_name TEXT NOT NULL,
            clinic TEXT NOT NULL DEFAULT '',
            file_url TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_type TEXT NOT NULL,
            document_type TEXT NOT NULL DEFAULT 'other',
            description TEXT NOT NULL DEFAULT '',
            uploaded_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(client_id) REFERENCES clients(id)
        )",
        [],
    )?;
    ensure_documents_sha256(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_client ON documents(client_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS document_reviews(
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            director_name TEXT NOT NULL,
            comment TEXT NOT NULL DEFAULT '',
            grade TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            FOREIGN KEY(document_id) REFERENCES documents(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL CHECK(type IN (
                'document_upload', 'question', 'meeting_request',
                'announcement', 'debrief', 'attendance'
            )),
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            student_id TEXT,
            student_name TEXT,
            student_email TEXT,
            clinic_id TEXT,
            director_id TEXT,
            target_audience TEXT NOT NULL CHECK(target_audience IN ('students', 'directors')),
            related_id TEXT,
            created_by_user_id TEXT,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_student ON notifications(student_id, is_read)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_director ON notifications(director_id)",
        [],
    )?;

    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_debriefs_review_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "debriefs", "reviewed_by")? {
        conn.execute("ALTER TABLE debriefs ADD COLUMN reviewed_by TEXT", [])?;
    }
    if !table_has_column(conn, "debriefs", "review_comment")? {
        conn.execute("ALTER TABLE debriefs ADD COLUMN review_comment TEXT", [])?;
    }
    Ok(())
}

fn ensure_documents_sha256(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "documents", "sha256")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE documents ADD COLUMN sha256 TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

pub fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| {
        r.get(0)
    })
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Returns the clinic id for `name`, inserting the clinic on first use.
pub fn ensure_clinic(conn: &Connection, name: &str) -> rusqlite::Result<String> {
    let existing: Option<String> = conn
        .query_row("SELECT id FROM clinics WHERE name = ?", [name], |r| r.get(0))
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = new_id();
    conn.execute("INSERT INTO clinics(id, name) VALUES(?, ?)", (&id, name))?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_reentrant() {
        let conn = open_in_memory().expect("open");
        init_schema(&conn).expect("second init");
        assert!(table_has_column(&conn, "documents", "sha256").expect("pragma"));
        assert!(table_has_column(&conn, "debriefs", "review_comment").expect("pragma"));
    }

    #[test]
    fn ensure_clinic_matches_case_insensitively() {
        let conn = open_in_memory().expect("open");
        let a = ensure_clinic(&conn, "Accounting").expect("insert");
        let b = ensure_clinic(&conn, "accounting").expect("lookup");
        assert_eq!(a, b);
        assert_eq!(count_rows(&conn, "clinics").expect("count"), 1);
    }

    #[test]
    fn settings_roundtrip_through_json() {
        let conn = open_in_memory().expect("open");
        assert!(settings_get_json(&conn, "missing").expect("get").is_none());
        settings_set_json(&conn, "k", &serde_json::json!({"a": 1})).expect("set");
        settings_set_json(&conn, "k", &serde_json::json!({"a": 2})).expect("overwrite");
        let v = settings_get_json(&conn, "k").expect("get").expect("value");
        assert_eq!(v["a"], 2);
    }
}
