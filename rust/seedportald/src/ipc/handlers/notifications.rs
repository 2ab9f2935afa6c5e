use crate::ipc::helpers::{
    db_err, get_limit, get_optional_bool, get_optional_str, get_required_str, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, Audience, NewNotification, NotificationType, StudentRef};
use rusqlite::Connection;
use serde_json::json;

const ANNOUNCEMENT_LIMIT: i64 = 50;

fn notification_type(params: &serde_json::Value) -> Result<NotificationType, HandlerErr> {
    let raw = get_required_str(params, "type")?;
    NotificationType::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params(format!("unknown notification type: {}", raw)).with_details(json!({
            "allowed": ["document_upload", "question", "meeting_request", "announcement", "debrief", "attendance"]
        }))
    })
}

fn audience(params: &serde_json::Value) -> Result<Option<Audience>, HandlerErr> {
    match get_optional_str(params, "audience") {
        Some(raw) => Audience::parse(&raw)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params("audience must be students or directors")),
        None => Ok(None),
    }
}

fn student_ref(params: &serde_json::Value) -> StudentRef {
    StudentRef {
        student_id: get_optional_str(params, "studentId"),
        student_name: get_optional_str(params, "studentName"),
        student_email: get_optional_str(params, "studentEmail"),
    }
}

fn notifications_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let kind = notification_type(params)?;
    let audience = audience(params)?.unwrap_or(Audience::Students);
    let who = student_ref(params);
    let mut n = NewNotification::new(
        kind,
        &get_required_str(params, "title")?,
        &get_required_str(params, "message")?,
        audience,
    );
    n.student_id = who.student_id;
    n.student_name = who.student_name;
    n.student_email = who.student_email;
    n.clinic_id = get_optional_str(params, "clinicId");
    n.director_id = get_optional_str(params, "directorId");
    n.related_id = get_optional_str(params, "relatedId");
    n.created_by_user_id = get_optional_str(params, "createdBy");
    let id = notify::create_notification(conn, &n)?;
    Ok(json!({ "notificationId": id }))
}

fn notifications_bulk_students(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let kind = notification_type(params)?;
    let title = get_required_str(params, "title")?;
    let message = get_required_str(params, "message")?;
    let semester = get_optional_str(params, "semester");
    let r = notify::bulk_student_notifications(conn, kind, &title, &message, semester.as_deref())?;
    Ok(json!({ "count": r.count }))
}

fn notifications_notify_directors(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let kind = notification_type(params)?;
    let title = get_required_str(params, "title")?;
    let message = get_required_str(params, "message")?;
    let who = student_ref(params);

    let clinic_id = match get_optional_str(params, "clinicId") {
        Some(id) => Some(id),
        None => match get_optional_str(params, "clinic") {
            Some(label) => notify::clinic_id_for_name(conn, &label)?,
            None => match who.student_id.as_deref() {
                Some(student_id) => notify::student_clinic_id(conn, student_id)?,
                None => None,
            },
        },
    };
    let Some(clinic_id) = clinic_id else {
        return Err(HandlerErr::new("not_found", "no clinic to notify")
            .with_details(json!({ "hint": "pass clinicId, clinic, or studentId" })));
    };

    let related_id = get_optional_str(params, "relatedId");
    let r = notify::notify_clinic_directors(
        conn,
        kind,
        &title,
        &message,
        &clinic_id,
        &who,
        related_id.as_deref(),
    )?;
    Ok(json!({ "count": r.count, "clinicId": clinic_id }))
}

fn notifications_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let clinic_id = get_optional_str(params, "clinicId");
    let audience = audience(params)?.map(Audience::as_str);
    let student_id = get_optional_str(params, "studentId");
    let director_id = get_optional_str(params, "directorId");
    let limit = get_limit(params, 100)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, type, title, message, student_id, student_name, student_email,
                    clinic_id, director_id, target_audience, related_id, is_read, created_at
             FROM notifications
             WHERE (?1 IS NULL OR clinic_id = ?1)
               AND (?2 IS NULL OR target_audience = ?2)
               AND (?3 IS NULL OR student_id = ?3)
               AND (?4 IS NULL OR director_id = ?4)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?5",
        )
        .map_err(db_err("db_query_failed"))?;
    let notifications = stmt
        .query_map(
            rusqlite::params![clinic_id, audience, student_id, director_id, limit],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "type": r.get::<_, String>(1)?,
                    "title": r.get::<_, String>(2)?,
                    "message": r.get::<_, String>(3)?,
                    "studentId": r.get::<_, Option<String>>(4)?,
                    "studentName": r.get::<_, Option<String>>(5)?,
                    "studentEmail": r.get::<_, Option<String>>(6)?,
                    "clinicId": r.get::<_, Option<String>>(7)?,
                    "directorId": r.get::<_, Option<String>>(8)?,
                    "targetAudience": r.get::<_, String>(9)?,
                    "relatedId": r.get::<_, Option<String>>(10)?,
                    "isRead": r.get::<_, i64>(11)? != 0,
                    "createdAt": r.get::<_, String>(12)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "notifications": notifications }))
}

fn notifications_mark_read(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "notificationId")?;
    let is_read = get_optional_bool(params, "isRead")?.unwrap_or(true);
    notify::mark_read(conn, &id, is_read)?;
    Ok(json!({ "ok": true }))
}

fn notifications_mark_all_read(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let updated = notify::mark_all_read(conn, &student_id)?;
    Ok(json!({ "updated": updated }))
}

fn notifications_unread_count(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let count = notify::unread_count(conn, &student_id)?;
    Ok(json!({ "count": count }))
}

/// Announcements are student-audience notification rows of type `announcement`.
fn announcements_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let content = get_required_str(params, "content")?;
    let priority = get_optional_str(params, "priority")
        .map(|p| p.to_lowercase())
        .unwrap_or_else(|| "normal".to_string());
    let title = if priority == "high" && !title.starts_with("[Important] ") {
        format!("[Important] {}", title)
    } else {
        title
    };

    let mut n = NewNotification::new(NotificationType::Announcement, &title, &content, Audience::Students);
    n.clinic_id = get_optional_str(params, "clinicId");
    n.created_by_user_id = get_optional_str(params, "postedBy");
    let id = notify::create_notification(conn, &n)?;
    log::info!("announcement posted: {}", title);
    Ok(json!({ "announcementId": id, "title": title }))
}

fn announcements_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, message, clinic_id, created_by_user_id, created_at
             FROM notifications
             WHERE type = 'announcement' AND target_audience = 'students'
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?",
        )
        .map_err(db_err("db_query_failed"))?;
    let announcements = stmt
        .query_map([ANNOUNCEMENT_LIMIT], |r| {
            let title: String = r.get(1)?;
            let priority = if title.to_lowercase().contains("important") {
                "high"
            } else {
                "normal"
            };
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": title,
                "content": r.get::<_, String>(2)?,
                "clinicId": r.get::<_, Option<String>>(3)?,
                "postedBy": r.get::<_, Option<String>>(4)?,
                "createdAt": r.get::<_, String>(5)?,
                "priority": priority,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "announcements": announcements }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.create" => Some(with_conn(state, req, notifications_create)),
        "notifications.bulkStudents" => Some(with_conn(state, req, notifications_bulk_students)),
        "notifications.notifyDirectors" => Some(with_conn(state, req, notifications_notify_directors)),
        "notifications.list" => Some(with_conn(state, req, notifications_list)),
        "notifications.markRead" => Some(with_conn(state, req, notifications_mark_read)),
        "notifications.markAllRead" => Some(with_conn(state, req, notifications_mark_all_read)),
        "notifications.unreadCount" => Some(with_conn(state, req, notifications_unread_count)),
        "announcements.create" => Some(with_conn(state, req, announcements_create)),
        "announcements.list" => Some(with_conn(state, req, announcements_list)),
        _ => None,
    }
}
