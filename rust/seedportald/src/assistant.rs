//! Read-only query tools and the system prompt for the SHIN assistant.
//!
//! The host owns the model call. It fetches the catalogue with
//! `assistant.tools.list`, forwards tool calls through `assistant.tools.call`
//! and composes the system prompt with `assistant.prompt`.

use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{PortalError, PortalResult};

const DEFAULT_LIMIT: i64 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

fn limit_schema() -> Value {
    json!({ "type": "number", "default": DEFAULT_LIMIT, "description": "Max number of results" })
}

pub fn tool_catalogue() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "getStudents",
            description: "Get information about students in the SEED program. Can filter by clinic, client, or get all students.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "clinicId": { "type": "string", "description": "Filter by clinic id" },
                    "clientId": { "type": "string", "description": "Filter by client id" },
                    "limit": limit_schema(),
                }
            }),
        },
        ToolSpec {
            name: "getClients",
            description: "Get information about clients (companies/organizations) in the SEED program.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "directorId": { "type": "string", "description": "Filter by director id" },
                    "limit": limit_schema(),
                }
            }),
        },
        ToolSpec {
            name: "getDebriefs",
            description: "Get debrief submissions from students. Can filter by student, client, or week.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "studentId": { "type": "string", "description": "Filter by student id" },
                    "clientName": { "type": "string", "description": "Filter by client name" },
                    "weekNumber": { "type": "number", "description": "Filter by specific week number" },
                    "limit": limit_schema(),
                }
            }),
        },
        ToolSpec {
            name: "getSemesterSchedule",
            description: "Get the semester schedule including class dates, topics, and deadlines.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "semesterId": { "type": "string", "description": "Filter by semester id" },
                }
            }),
        },
        ToolSpec {
            name: "getDirectors",
            description: "Get information about clinic directors.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "clinicId": { "type": "string", "description": "Filter by clinic id" },
                }
            }),
        },
        ToolSpec {
            name: "getDocuments",
            description: "Get documents uploaded to the SEED program including SOW, presentations, and other materials.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "clientId": { "type": "string", "description": "Filter by client id" },
                    "documentType": { "type": "string", "description": "Filter by document type (sow, midterm, final, etc.)" },
                    "limit": limit_schema(),
                }
            }),
        },
        ToolSpec {
            name: "getProgramStats",
            description: "Get overall statistics about the SEED program including total students, clients, hours logged, etc.",
            parameters: json!({ "type": "object", "properties": {} }),
        },
        ToolSpec {
            name: "getGradingInfo",
            description: "Get information about the SEED program grading structure and requirements.",
            parameters: json!({ "type": "object", "properties": {} }),
        },
        ToolSpec {
            name: "searchKnowledgeBase",
            description: "Search for information about SEED, Suffolk University, or program-specific questions.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The search query" },
                },
                "required": ["query"]
            }),
        },
    ]
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn arg_limit(args: &Value) -> i64 {
    args.get("limit")
        .and_then(|v| v.as_i64())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_LIMIT)
}

/// Runs one tool by name. Unknown names are `bad_params`.
pub fn call_tool(conn: &Connection, name: &str, args: &Value) -> PortalResult<Value> {
    log::debug!("assistant tool {}", name);
    match name {
        "getStudents" => get_students(conn, args),
        "getClients" => get_clients(conn, args),
        "getDebriefs" => get_debriefs(conn, args),
        "getSemesterSchedule" => get_semester_schedule(conn, args),
        "getDirectors" => get_directors(conn, args),
        "getDocuments" => get_documents(conn, args),
        "getProgramStats" => get_program_stats(conn),
        "getGradingInfo" => Ok(grading_info()),
        "searchKnowledgeBase" => {
            let query = arg_str(args, "query")
                .ok_or_else(|| PortalError::Invalid("missing query".to_string()))?;
            Ok(search_knowledge_base(query))
        }
        other => Err(PortalError::Invalid(format!("unknown tool: {}", other))),
    }
}

fn get_students(conn: &Connection, args: &Value) -> PortalResult<Value> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.full_name, s.email, c.name, s.clinic,
                (SELECT d.full_name FROM directors d
                  WHERE d.clinic_id = s.clinic_id AND d.role = 'Clinic Director'
                  ORDER BY d.full_name LIMIT 1)
         FROM students s
         LEFT JOIN client_assignments ca ON ca.student_id = s.id
         LEFT JOIN clients c ON c.id = ca.client_id
         WHERE (?1 IS NULL OR s.clinic_id = ?1)
           AND (?2 IS NULL OR ca.client_id = ?2)
         ORDER BY s.full_name
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![arg_str(args, "clinicId"), arg_str(args, "clientId"), arg_limit(args)],
            |r| {
                Ok(json!({
                    "studentId": r.get::<_, String>(0)?,
                    "studentName": r.get::<_, String>(1)?,
                    "studentEmail": r.get::<_, String>(2)?,
                    "clientName": r.get::<_, Option<String>>(3)?,
                    "clinicName": r.get::<_, String>(4)?,
                    "clinicDirectorName": r.get::<_, Option<String>>(5)?,
                }))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "count": rows.len(), "students": rows }))
}

fn get_clients(conn: &Connection, args: &Value) -> PortalResult<Value> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.industry, c.status, d.full_name
         FROM clients c
         LEFT JOIN directors d ON d.id = c.primary_director_id
         WHERE (?1 IS NULL OR c.primary_director_id = ?1)
         ORDER BY c.name
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![arg_str(args, "directorId"), arg_limit(args)],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "industry": r.get::<_, Option<String>>(2)?,
                    "status": r.get::<_, String>(3)?,
                    "primaryDirector": r.get::<_, Option<String>>(4)?,
                }))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "count": rows.len(), "clients": rows }))
}

fn get_debriefs(conn: &Connection, args: &Value) -> PortalResult<Value> {
    let client_pattern = arg_str(args, "clientName").map(|s| format!("%{}%", s));
    let week = args.get("weekNumber").and_then(|v| v.as_i64());
    let mut stmt = conn.prepare(
        "SELECT id, student_name, client_name, week_number, hours_worked,
                work_summary, questions, date_submitted, status
         FROM debriefs
         WHERE (?1 IS NULL OR student_id = ?1)
           AND (?2 IS NULL OR client_name LIKE ?2)
           AND (?3 IS NULL OR week_number = ?3)
         ORDER BY date_submitted DESC, created_at DESC
         LIMIT ?4",
    )?;
    let mut total_hours = 0.0;
    let rows = stmt
        .query_map(
            rusqlite::params![arg_str(args, "studentId"), client_pattern, week, arg_limit(args)],
            |r| {
                let hours: f64 = r.get(4)?;
                Ok((
                    hours,
                    json!({
                        "id": r.get::<_, String>(0)?,
                        "studentName": r.get::<_, String>(1)?,
                        "clientName": r.get::<_, String>(2)?,
                        "weekNumber": r.get::<_, Option<i64>>(3)?,
                        "hoursWorked": hours,
                        "workSummary": r.get::<_, String>(5)?,
                        "questions": r.get::<_, Option<String>>(6)?,
                        "dateSubmitted": r.get::<_, String>(7)?,
                        "status": r.get::<_, String>(8)?,
                    }),
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(hours, row)| {
            total_hours += hours;
            row
        })
        .collect::<Vec<_>>();
    Ok(json!({ "count": rows.len(), "totalHours": total_hours, "debriefs": rows }))
}

fn get_semester_schedule(conn: &Connection, args: &Value) -> PortalResult<Value> {
    let mut weeks = crate::schedule::load_weeks(conn, arg_str(args, "semesterId"))?;
    weeks.sort_by_key(|w| w.week_number);
    Ok(json!({ "totalWeeks": weeks.len(), "schedule": weeks }))
}

fn get_directors(conn: &Connection, args: &Value) -> PortalResult<Value> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.full_name, d.email, COALESCE(c.name, d.clinic)
         FROM directors d
         LEFT JOIN clinics c ON c.id = d.clinic_id
         WHERE (?1 IS NULL OR d.clinic_id = ?1)
         ORDER BY d.full_name",
    )?;
    let rows = stmt
        .query_map([arg_str(args, "clinicId")], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "clinic": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "count": rows.len(), "directors": rows }))
}

fn get_documents(conn: &Connection, args: &Value) -> PortalResult<Value> {
    let mut stmt = conn.prepare(
        "SELECT id, file_name, file_type, document_type, student_name, uploaded_at, client_name
         FROM documents
         WHERE (?1 IS NULL OR client_id = ?1)
           AND (?2 IS NULL OR document_type = ?2)
         ORDER BY uploaded_at DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![arg_str(args, "clientId"), arg_str(args, "documentType"), arg_limit(args)],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "fileName": r.get::<_, String>(1)?,
                    "fileType": r.get::<_, String>(2)?,
                    "documentType": r.get::<_, String>(3)?,
                    "uploadedBy": r.get::<_, String>(4)?,
                    "uploadedAt": r.get::<_, String>(5)?,
                    "clientName": r.get::<_, String>(6)?,
                }))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "count": rows.len(), "documents": rows }))
}

fn get_program_stats(conn: &Connection) -> PortalResult<Value> {
    let (debriefs, hours): (i64, f64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(hours_worked), 0) FROM debriefs",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(json!({
        "totalStudents": crate::db::count_rows(conn, "students")?,
        "totalClients": crate::db::count_rows(conn, "clients")?,
        "totalDebriefs": debriefs,
        "totalHoursLogged": hours,
        "totalDocuments": crate::db::count_rows(conn, "documents")?,
    }))
}

pub fn grading_info() -> Value {
    json!({
        "gradingBreakdown": {
            "attendance": { "weight": "15%", "description": "Weekly attendance and debrief submissions" },
            "statementOfWork": { "weight": "20%", "description": "SOW document with project scope and deliverables" },
            "midtermPresentation": { "weight": "30%", "description": "Mid-semester client presentation" },
            "finalPresentation": { "weight": "35%", "description": "Final project presentation and deliverables" },
        },
        "majorDeliverables": [
            { "name": "Statement of Work (SOW)", "dueWeek": 4, "weight": "20%" },
            { "name": "Mid-Term Presentation", "dueWeek": 8, "weight": "30%" },
            { "name": "Final Presentation", "dueWeek": 15, "weight": "35%" },
        ],
        "weeklyRequirements": [
            "Submit weekly attendance with class password",
            "Complete weekly debrief form with hours and work summary",
            "Attend clinic team meetings",
        ],
    })
}

const KNOWLEDGE: [(&str, &str); 8] = [
    ("seed", "SEED (Suffolk Experiential Education & Development) is a program at Suffolk University that connects students with real-world client projects. Students work in teams under clinic directors to deliver professional consulting services to actual businesses."),
    ("suffolk", "Suffolk University is a private university located in Boston, Massachusetts. The SEED program is part of Suffolk's experiential learning initiatives, providing students with hands-on business consulting experience."),
    ("clinic", "A clinic in SEED is a team of students led by a clinic director. Each clinic works with multiple clients throughout the semester, providing business consulting services."),
    ("director", "Clinic directors are faculty members or industry professionals who oversee student teams. They guide students through client engagements and evaluate their work."),
    ("client", "Clients are real businesses and organizations that partner with SEED to receive consulting services from student teams. Students help clients with various business challenges."),
    ("debrief", "Weekly debriefs are required submissions where students report their hours worked, summarize their activities, and ask any questions. This counts toward the 15% attendance grade."),
    ("sow", "Statement of Work (SOW) is a key deliverable worth 20% of the grade. It outlines the project scope, deliverables, timeline, and team responsibilities for the client engagement."),
    ("presentation", "Students deliver two major presentations: Mid-Term (30%) and Final (35%). These showcase progress and final deliverables to clients and faculty."),
];

const NO_MATCH: &str = "I don't have specific information about that topic. Try asking about SEED, clinics, directors, clients, debriefs, SOW, or presentations.";

/// A topic matches when the query contains its key or the key contains the
/// query. `matchedTopics` only lists keys found inside the query.
pub fn search_knowledge_base(query: &str) -> Value {
    let q = query.trim().to_lowercase();
    let results: Vec<&str> = KNOWLEDGE
        .iter()
        .filter(|(k, _)| q.contains(k) || (!q.is_empty() && k.contains(q.as_str())))
        .map(|(_, v)| *v)
        .collect();
    let matched: Vec<&str> = KNOWLEDGE
        .iter()
        .filter(|(k, _)| q.contains(k))
        .map(|(k, _)| *k)
        .collect();
    json!({
        "results": if results.is_empty() { vec![NO_MATCH] } else { results },
        "matchedTopics": matched,
    })
}

#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub user_type: String,
    pub user_name: String,
    pub user_email: String,
    pub clinic_id: Option<String>,
    pub client_id: Option<String>,
    pub student_id: Option<String>,
}

pub fn system_prompt(ctx: &PromptContext) -> String {
    let mut context = format!(
        "- User Type: {}\n- User Name: {}\n- User Email: {}\n",
        ctx.user_type, ctx.user_name, ctx.user_email
    );
    if let Some(id) = &ctx.clinic_id {
        context.push_str(&format!("- Clinic ID: {}\n", id));
    }
    if let Some(id) = &ctx.client_id {
        context.push_str(&format!("- Client ID: {}\n", id));
    }
    if let Some(id) = &ctx.student_id {
        context.push_str(&format!("- Student ID: {}\n", id));
    }

    format!(
        "You are SHIN (SEED Hub Intelligence Navigator), a helpful AI assistant for the SEED program at Suffolk University. \
You are friendly, professional, and knowledgeable about all aspects of the SEED program.

Your personality:
- Warm and supportive, like a knowledgeable teaching assistant
- Professional but approachable
- Clear and concise in explanations

Current user context:
{context}
You have access to tools to query the SEED database for:
- Student information and assignments
- Client details and engagements
- Debrief submissions and hours
- Semester schedule and deadlines
- Documents and deliverables
- Program statistics
- Grading information

When answering questions:
1. Use the appropriate tools to fetch real data
2. Present information clearly and helpfully
3. Offer relevant follow-up suggestions

For questions about grading, assignments, or program structure, use the getGradingInfo tool.
For general SEED/Suffolk questions, use the searchKnowledgeBase tool."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn knowledge_base_matches_both_directions() {
        let out = search_knowledge_base("When is the SOW due?");
        assert_eq!(out["matchedTopics"], json!(["sow"]));
        assert_eq!(out["results"].as_array().map(|a| a.len()), Some(1));

        // "dir" is contained in the key "director" but is not a matched topic.
        let partial = search_knowledge_base("dir");
        assert_eq!(partial["results"].as_array().map(|a| a.len()), Some(1));
        assert_eq!(partial["matchedTopics"], json!([]));
    }

    #[test]
    fn knowledge_base_falls_back_to_topic_hint() {
        let out = search_knowledge_base("parking permits");
        assert_eq!(out["results"][0], NO_MATCH);
    }

    #[test]
    fn catalogue_names_are_unique() {
        let tools = tool_catalogue();
        assert_eq!(tools.len(), 9);
        let mut names: Vec<_> = tools.iter().map(|t| t.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn debrief_tool_sums_hours() {
        let conn = db::open_in_memory().expect("open");
        for hours in [1.5, 2.0] {
            conn.execute(
                "INSERT INTO debriefs(id, student_name, client_name, clinic, hours_worked, work_summary, date_submitted, created_at, updated_at)
                 VALUES(?, 'A B', 'SEED', 'Consulting Clinic', ?, 'work', '2025-09-10', 'x', 'x')",
                rusqlite::params![db::new_id(), hours],
            )
            .expect("insert");
        }
        let out = call_tool(&conn, "getDebriefs", &json!({ "clientName": "see" })).expect("call");
        assert_eq!(out["count"], 2);
        assert_eq!(out["totalHours"], 3.5);
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let conn = db::open_in_memory().expect("open");
        let e = call_tool(&conn, "dropTables", &json!({})).unwrap_err();
        assert_eq!(e.code(), "bad_params");
    }

    #[test]
    fn prompt_includes_optional_context_lines() {
        let prompt = system_prompt(&PromptContext {
            user_type: "student".into(),
            user_name: "Ada".into(),
            user_email: "ada@x.edu".into(),
            student_id: Some("s-1".into()),
            ..Default::default()
        });
        assert!(prompt.contains("- Student ID: s-1"));
        assert!(!prompt.contains("Clinic ID"));
    }
}
