use crate::backup;
use crate::db;
use crate::ipc::helpers::{
    db_err, get_limit, get_optional_str, get_required_str, table_err, with_conn, with_state,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, NotificationType, StudentRef};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};

const DOCUMENT_TYPES: [&str; 6] = ["sow", "midterm", "final", "presentation", "deliverable", "other"];

fn file_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

struct NewDocument {
    student_name: String,
    client_name: String,
    clinic: Option<String>,
    file_url: String,
    file_name: String,
    file_type: String,
    document_type: String,
    description: String,
    sha256: Option<String>,
}

fn document_fields(params: &serde_json::Value) -> Result<(String, String, Option<String>, String, String), HandlerErr> {
    let student_name = get_required_str(params, "studentName")?;
    let client_name = get_required_str(params, "clientName")?;
    let clinic = get_optional_str(params, "clinic");
    let document_type = get_optional_str(params, "documentType")
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "other".to_string());
    if !DOCUMENT_TYPES.contains(&document_type.as_str()) {
        return Err(HandlerErr::bad_params(format!("unknown documentType: {}", document_type))
            .with_details(json!({ "allowed": DOCUMENT_TYPES })));
    }
    let description = get_optional_str(params, "description").unwrap_or_default();
    Ok((student_name, client_name, clinic, document_type, description))
}

/// Inserts the row and tells the clinic's directors about it.
fn insert_document(conn: &Connection, doc: NewDocument) -> Result<serde_json::Value, HandlerErr> {
    let student: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT id, clinic_id FROM students WHERE lower(trim(full_name)) = lower(trim(?)) ORDER BY rowid LIMIT 1",
            [&doc.student_name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let client_id: Option<String> = conn
        .query_row("SELECT id FROM clients WHERE name = ?", [&doc.client_name], |r| r.get(0))
        .optional()
        .map_err(db_err("db_query_failed"))?;

    let id = db::new_id();
    conn.execute(
        "INSERT INTO documents(
            id, student_id, student_name, client_id, client_name, clinic,
            file_url, file_name, file_type, document_type, description, sha256, uploaded_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            student.as_ref().map(|s| s.0.clone()),
            doc.student_name,
            client_id,
            doc.client_name,
            doc.clinic.clone().unwrap_or_default(),
            doc.file_url,
            doc.file_name,
            doc.file_type,
            doc.document_type,
            doc.description,
            doc.sha256,
            db::now_rfc3339(),
        ],
    )
    .map_err(table_err("db_insert_failed", "documents"))?;

    let clinic_id = match &doc.clinic {
        Some(label) => notify::clinic_id_for_name(conn, label).unwrap_or_else(|e| {
            log::warn!("clinic lookup for document {} failed: {}", id, e);
            None
        }),
        None => None,
    }
    .or_else(|| student.as_ref().and_then(|s| s.1.clone()));
    let notified = match clinic_id {
        Some(clinic_id) => notify::sent_or_logged(
            notify::notify_clinic_directors(
                conn,
                NotificationType::DocumentUpload,
                "New document uploaded",
                &format!(
                    "{} uploaded {} for {}",
                    doc.student_name, doc.file_name, doc.client_name
                ),
                &clinic_id,
                &StudentRef {
                    student_id: student.as_ref().map(|s| s.0.clone()),
                    student_name: Some(doc.student_name.clone()),
                    student_email: None,
                },
                Some(&id),
            ),
            "document",
        ),
        None => 0,
    };

    Ok(json!({
        "documentId": id,
        "clientId": client_id,
        "notified": notified,
        "deduplicated": false,
    }))
}

fn documents_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (student_name, client_name, clinic, document_type, description) = document_fields(params)?;
    let file_url = get_required_str(params, "fileUrl")?;
    let file_name = get_required_str(params, "fileName")?;
    let file_type = get_optional_str(params, "fileType").unwrap_or_else(|| file_type_for(&file_name).to_string());
    insert_document(
        conn,
        NewDocument {
            student_name,
            client_name,
            clinic,
            file_url,
            file_name,
            file_type,
            document_type,
            description,
            sha256: None,
        },
    )
}

/// Copies a local file into `<workspace>/files/<sha prefix>/` and records it.
/// The same bytes uploaded again for the same client return the first row.
fn documents_upload(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(workspace) = state.workspace.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let (student_name, client_name, clinic, document_type, description) = document_fields(params)?;
    let source = PathBuf::from(get_required_str(params, "sourcePath")?);
    if !source.is_file() {
        return Err(HandlerErr::new("not_found", "source file not found")
            .with_details(json!({ "path": source.to_string_lossy() })));
    }
    let file_name = match get_optional_str(params, "fileName") {
        Some(name) => Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| HandlerErr::bad_params("fileName must name a file"))?,
        None => source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| HandlerErr::bad_params("sourcePath must name a file"))?,
    };

    let sha = backup::sha256_file(&source)
        .map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM documents WHERE client_name = ? COLLATE NOCASE AND sha256 = ?",
            (&client_name, &sha),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(id) = existing {
        log::info!("document {} already uploaded for {}", file_name, client_name);
        return Ok(json!({ "documentId": id, "deduplicated": true, "sha256": sha }));
    }

    let prefix = &sha[..12];
    let rel = format!("files/{}/{}", prefix, file_name);
    let dest_dir = workspace.join("files").join(prefix);
    std::fs::create_dir_all(&dest_dir).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": dest_dir.to_string_lossy() }))
    })?;
    let dest = dest_dir.join(&file_name);
    std::fs::copy(&source, &dest).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": dest.to_string_lossy() }))
    })?;

    let file_type = file_type_for(&file_name).to_string();
    let mut out = insert_document(
        conn,
        NewDocument {
            student_name,
            client_name,
            clinic,
            file_url: rel.clone(),
            file_name,
            file_type,
            document_type,
            description,
            sha256: Some(sha.clone()),
        },
    )?;
    out["fileUrl"] = json!(rel);
    out["sha256"] = json!(sha);
    Ok(out)
}

fn documents_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let client = get_optional_str(params, "client").filter(|c| c != "all");
    let document_type = get_optional_str(params, "documentType");
    let limit = get_limit(params, 100)?;
    let mut stmt = conn
        .prepare(
            "SELECT d.id, d.student_id, d.student_name, d.client_id, d.client_name, d.clinic,
                    d.file_url, d.file_name, d.file_type, d.document_type, d.description,
                    d.sha256, d.uploaded_at,
                    (SELECT COUNT(*) FROM document_reviews r WHERE r.document_id = d.id)
             FROM documents d
             WHERE (?1 IS NULL OR d.client_name = ?1 COLLATE NOCASE OR d.client_id = ?1)
               AND (?2 IS NULL OR d.document_type = ?2)
             ORDER BY d.uploaded_at DESC
             LIMIT ?3",
        )
        .map_err(db_err("db_query_failed"))?;
    let documents = stmt
        .query_map(rusqlite::params![client, document_type, limit], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, Option<String>>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "clientId": r.get::<_, Option<String>>(3)?,
                "clientName": r.get::<_, String>(4)?,
                "clinic": r.get::<_, String>(5)?,
                "fileUrl": r.get::<_, String>(6)?,
                "fileName": r.get::<_, String>(7)?,
                "fileType": r.get::<_, String>(8)?,
                "documentType": r.get::<_, String>(9)?,
                "description": r.get::<_, String>(10)?,
                "sha256": r.get::<_, Option<String>>(11)?,
                "uploadedAt": r.get::<_, String>(12)?,
                "reviewCount": r.get::<_, i64>(13)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "documents": documents }))
}

fn reviews_add(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let document_id = get_required_str(params, "documentId")?;
    let director_name = get_required_str(params, "directorName")?;
    let comment = get_optional_str(params, "comment").unwrap_or_default();
    let grade = get_optional_str(params, "grade").unwrap_or_default();
    if comment.is_empty() && grade.is_empty() {
        return Err(HandlerErr::bad_params("a review needs a comment or a grade"));
    }
    let exists = conn
        .query_row("SELECT 1 FROM documents WHERE id = ?", [&document_id], |r| r.get::<_, i64>(0))
        .optional()
        .map_err(db_err("db_query_failed"))?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "document not found"));
    }

    let id = db::new_id();
    conn.execute(
        "INSERT INTO document_reviews(id, document_id, director_name, comment, grade, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &document_id, &director_name, &comment, &grade, db::now_rfc3339()),
    )
    .map_err(table_err("db_insert_failed", "document_reviews"))?;
    Ok(json!({ "reviewId": id }))
}

fn reviews_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let document_id = get_required_str(params, "documentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, director_name, comment, grade, created_at
             FROM document_reviews
             WHERE document_id = ?
             ORDER BY created_at DESC",
        )
        .map_err(db_err("db_query_failed"))?;
    let reviews = stmt
        .query_map([&document_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "directorName": r.get::<_, String>(1)?,
                "comment": r.get::<_, String>(2)?,
                "grade": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "reviews": reviews }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "documents.create" => Some(with_conn(state, req, documents_create)),
        "documents.upload" => Some(with_state(state, req, documents_upload)),
        "documents.list" => Some(with_conn(state, req, documents_list)),
        "documents.reviews.add" => Some(with_conn(state, req, reviews_add)),
        "documents.reviews.list" => Some(with_conn(state, req, reviews_list)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_document_survives_failed_fan_out() {
        let conn = db::open_in_memory().expect("open");
        let clinic_id = db::ensure_clinic(&conn, "Consulting").expect("clinic");
        conn.execute(
            "INSERT INTO directors(id, first_name, last_name, full_name, email, clinic, clinic_id, role, created_at)
             VALUES(?, 'Nick', 'Vadala', 'Nick Vadala', 'nvadala@suffolk.edu', 'Consulting', ?, 'Clinic Director', ?)",
            rusqlite::params![db::new_id(), clinic_id, db::now_rfc3339()],
        )
        .expect("insert director");
        conn.execute_batch("DROP TABLE notifications").expect("drop notifications");

        let params = json!({
            "studentName": "Adam Calnan",
            "clientName": "Crown Legends",
            "clinic": "Consulting",
            "documentType": "sow",
            "fileUrl": "files/abc/sow.pdf",
            "fileName": "sow.pdf",
        });
        let out = documents_create(&conn, &params).expect("create");
        assert_eq!(out["notified"].as_u64(), Some(0));
        assert!(out["documentId"].is_string());
        let stored: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))
            .expect("count");
        assert_eq!(stored, 1);
    }
}
