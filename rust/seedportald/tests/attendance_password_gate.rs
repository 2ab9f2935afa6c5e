use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn fixture_path(rel: &str) -> PathBuf {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join("../../").join(rel)
}

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_seedportald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn seedportald");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(true), "{} failed: {}", method, value);
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}


#[test]
fn weekly_password_gates_attendance_and_rejects_duplicates() {
    let workspace = temp_dir("seedportal-attendance");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "seed.import",
        json!({ "datasetPath": fixture_path("fixtures/seed/small_cohort.json").to_string_lossy() }),
    );
    for (id, n, start, end) in [
        ("3", 1, "2025-09-10", "2025-09-14"),
        ("4", 2, "2025-09-15", "2025-09-21"),
    ] {
        request_ok(
            &mut stdin,
            &mut reader,
            id,
            "schedule.upsertWeek",
            json!({ "semester": "FALL 2025", "weekNumber": n, "weekStart": start, "weekEnd": end }),
        );
    }
    let semesters = request_ok(&mut stdin, &mut reader, "5", "semesters.list", json!({}));
    let semester_id = semesters["semesters"][0]["id"].as_str().expect("semester id").to_string();

    // No password stored for week 1: the workspace submission password applies.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.submit",
        json!({
            "password": "SEED2025",
            "studentName": "Stuti Adhikari",
            "studentEmail": "stuti.adhikari@su.suffolk.edu",
            "clinic": "Accounting",
            "weekNumber": 1,
            "classDate": "2025-09-11",
        }),
    );
    assert_eq!(first["weekEnding"].as_str(), Some("2025-09-14"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.passwords.set",
        json!({
            "semesterId": semester_id,
            "weekNumber": 2,
            "password": "owl",
            "userEmail": "stuti.adhikari@su.suffolk.edu",
        }),
    );
    assert_eq!(code, "forbidden");

    let set = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.passwords.set",
        json!({
            "semesterId": semester_id,
            "weekNumber": 2,
            "password": "owl",
            "userEmail": "mark.dwyer@suffolk.edu",
        }),
    );
    assert_eq!(set["weekStart"].as_str(), Some("2025-09-15"));
    assert_eq!(set["weekEnd"].as_str(), Some("2025-09-21"));
    assert_eq!(set["notified"].as_u64(), Some(3));

    // Unscheduled week: Monday of week 1 plus four weeks.
    let later = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.passwords.set",
        json!({
            "semesterId": semester_id,
            "weekNumber": 5,
            "password": "hawk",
            "userEmail": "mark.dwyer@suffolk.edu",
        }),
    );
    assert_eq!(later["weekStart"].as_str(), Some("2025-10-06"));
    assert_eq!(later["weekEnd"].as_str(), Some("2025-10-12"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "9a",
        "attendance.passwords.set",
        json!({
            "semesterId": semester_id,
            "weekNumber": 100_000_000_000_000i64,
            "password": "p",
            "userEmail": "mark.dwyer@suffolk.edu",
        }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "9b",
        "attendance.passwords.set",
        json!({
            "semesterId": semester_id,
            "weekNumber": 6,
            "password": "p",
            "weekStart": "2025-10-19",
            "weekEnd": "2025-10-13",
            "userEmail": "mark.dwyer@suffolk.edu",
        }),
    );
    assert_eq!(code, "bad_params");
    // The sidecar survived both rejections.
    let health = request_ok(&mut stdin, &mut reader, "9c", "health", json!({}));
    assert!(health.is_object());

    let submit = |pw: &str| {
        json!({
            "password": pw,
            "studentName": "Adam Calnan",
            "studentEmail": "adam.calnan@su.suffolk.edu",
            "clinic": "Consulting",
            "weekNumber": 2,
            "classDate": "2025-09-17",
        })
    };
    let code = request_err(&mut stdin, &mut reader, "10", "attendance.submit", submit("SEED2025"));
    assert_eq!(code, "forbidden");
    let ok = request_ok(&mut stdin, &mut reader, "11", "attendance.submit", submit("owl"));
    let attendance_id = ok["attendanceId"].as_str().expect("attendance id").to_string();
    let code = request_err(&mut stdin, &mut reader, "12", "attendance.submit", submit("owl"));
    assert_eq!(code, "conflict");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.list",
        json!({ "clinic": "all", "weekEnding": "2025-09-21" }),
    );
    let records = listed["records"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert!(records[0]["studentId"].is_string());

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.updateStatus",
        json!({ "attendanceId": attendance_id, "isPresent": false, "userEmail": "nvadala@suffolk.edu" }),
    );
    assert_eq!(updated["isPresent"].as_bool(), Some(false));

    let student_id = records[0]["studentId"].as_str().expect("student id").to_string();
    let excused = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "attendance.markExcused",
        json!({
            "studentId": student_id,
            "classDate": "2025-09-17",
            "isExcused": true,
            "userEmail": "nvadala@suffolk.edu",
        }),
    );
    assert_eq!(excused["updated"].as_u64(), Some(1));

    let passwords = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "attendance.passwords.list",
        json!({ "semesterId": semester_id }),
    );
    let rows = passwords["passwords"].as_array().expect("passwords");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["createdByName"].as_str(), Some("Mark Dwyer"));
    let password_id = rows[1]["id"].as_str().expect("password id").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "attendance.passwords.delete",
        json!({ "passwordId": password_id, "userEmail": "mark.dwyer@suffolk.edu" }),
    );
    let passwords = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "attendance.passwords.list",
        json!({ "semesterId": semester_id }),
    );
    assert_eq!(passwords["passwords"].as_array().map(|a| a.len()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false), "{} should fail", method);
    value["error"]["code"].as_str().unwrap_or("").to_string()
}
