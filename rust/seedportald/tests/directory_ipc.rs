use rusqlite::Connection;
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


fn select_and_seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &std::path::Path) {
    request_ok(
        stdin,
        reader,
        "select",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "seed",
        "seed.import",
        json!({ "datasetPath": fixture_path("fixtures/seed/small_cohort.json").to_string_lossy() }),
    );
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

fn id_where(list: &serde_json::Value, key: &str, field: &str, value: &str) -> String {
    list[key]
        .as_array()
        .expect("list")
        .iter()
        .find(|row| row[field].as_str() == Some(value))
        .and_then(|row| row["id"].as_str())
        .unwrap_or_else(|| panic!("no {} with {} = {}", key, field, value))
        .to_string()
}

#[test]
fn intake_requires_submission_password() {
    let workspace = temp_dir("seedportal-intake");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_and_seed(&mut stdin, &mut reader, &workspace);

    let intake = |password: &str| {
        json!({
            "password": password,
            "clientName": "Harbor Bakery",
            "clientEmail": "owner@harborbakery.example",
            "primaryClinic": "Marketing",
            "secondaryClinics": ["Accounting", " ", "Funding"],
            "leadConsultant": "Nick Vadala",
        })
    };
    let code = request_err(&mut stdin, &mut reader, "10", "clients.intake.submit", intake("wrong"));
    assert_eq!(code, "forbidden");
    let empty = request_ok(&mut stdin, &mut reader, "11", "clients.intake.list", json!({}));
    assert_eq!(empty["intakes"].as_array().map(|a| a.len()), Some(0));

    let saved = request_ok(&mut stdin, &mut reader, "12", "clients.intake.submit", intake("SEED2025"));
    assert!(saved["intakeId"].is_string());

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "clients.intake.list",
        json!({ "status": "pending" }),
    );
    let rows = listed["intakes"].as_array().expect("intakes");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["clientName"].as_str(), Some("Harbor Bakery"));
    assert_eq!(rows[0]["secondaryClinics"], json!(["Accounting", "Funding"]));
    assert_eq!(rows[0]["semester"].as_str(), Some("FALL 2025"));

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "clients.intake.list",
        json!({ "status": "approved" }),
    );
    assert_eq!(other["intakes"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_patch_recomputes_full_name_and_validates_fields() {
    let workspace = temp_dir("seedportal-student-patch");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_and_seed(&mut stdin, &mut reader, &workspace);

    let students = request_ok(&mut stdin, &mut reader, "10", "students.list", json!({}));
    let mason = id_where(&students, "students", "fullName", "Mason Holt");

    let patched = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.update",
        json!({
            "studentId": mason,
            "patch": { "lastName": "Holt-Reyes", "academicLevel": "Graduate", "clientTeam": "" },
        }),
    );
    assert_eq!(patched["changed"].as_u64(), Some(1));

    for (id, patch) in [
        ("12", json!({ "nickname": "Mace" })),
        ("13", json!({ "status": "graduated" })),
        ("14", json!({ "firstName": "  " })),
        ("15", json!({ "isTeamLeader": "yes" })),
    ] {
        let code = request_err(
            &mut stdin,
            &mut reader,
            id,
            "students.update",
            json!({ "studentId": mason, "patch": patch.clone() }),
        );
        assert_eq!(code, "bad_params", "patch {}", patch);
    }

    request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "students.update",
        json!({ "studentId": mason, "patch": { "status": "inactive" } }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "17",
        "students.update",
        json!({ "studentId": "missing", "patch": { "status": "active" } }),
    );
    assert_eq!(code, "not_found");

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "students.list",
        json!({ "clinic": "marketing" }),
    );
    let rows = students["students"].as_array().expect("students");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["fullName"].as_str(), Some("Mason Holt-Reyes"));
    assert_eq!(rows[0]["lastName"].as_str(), Some("Holt-Reyes"));
    assert_eq!(rows[0]["academicLevel"].as_str(), Some("Graduate"));
    assert!(rows[0]["clientTeam"].is_null());
    assert_eq!(rows[0]["status"].as_str(), Some("inactive"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn primary_director_moves_and_repeat_assignments_are_skipped() {
    let workspace = temp_dir("seedportal-assignments");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_and_seed(&mut stdin, &mut reader, &workspace);

    let directors = request_ok(&mut stdin, &mut reader, "10", "directors.list", json!({}));
    let mark = id_where(&directors, "directors", "fullName", "Mark Dwyer");
    let nick = id_where(&directors, "directors", "fullName", "Nick Vadala");
    let clients = request_ok(&mut stdin, &mut reader, "11", "clients.list", json!({}));
    let crown = id_where(&clients, "clients", "name", "Crown Legends");
    let serene = id_where(&clients, "clients", "name", "Serene Cycle");
    let students = request_ok(&mut stdin, &mut reader, "12", "students.list", json!({}));
    let adam = id_where(&students, "students", "fullName", "Adam Calnan");
    let mason = id_where(&students, "students", "fullName", "Mason Holt");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "clients.assignDirector",
        json!({ "clientId": crown, "directorId": mark, "isPrimary": true }),
    );
    assert_eq!(first["inserted"].as_u64(), Some(1));
    assert_eq!(first["skipped"].as_u64(), Some(0));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "clients.assignDirector",
        json!({ "clientId": crown, "directorId": mark, "isPrimary": true }),
    );
    assert_eq!(again["inserted"].as_u64(), Some(0));
    assert_eq!(again["skipped"].as_u64(), Some(1));

    let clients = request_ok(&mut stdin, &mut reader, "15", "clients.list", json!({}));
    let crown_row = clients["clients"]
        .as_array()
        .expect("clients")
        .iter()
        .find(|c| c["id"].as_str() == Some(crown.as_str()))
        .cloned()
        .expect("crown legends");
    assert_eq!(crown_row["primaryDirectorId"].as_str(), Some(mark.as_str()));
    assert_eq!(crown_row["primaryDirectorName"].as_str(), Some("Mark Dwyer"));

    // Nick still sees the client through the junction row.
    let nicks = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "clients.list",
        json!({ "directorId": nick }),
    );
    assert!(nicks["clients"]
        .as_array()
        .expect("clients")
        .iter()
        .any(|c| c["id"].as_str() == Some(crown.as_str())));

    // Seeded team membership already links Adam to Crown Legends.
    let existing = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "clients.assignStudent",
        json!({ "clientId": crown, "studentId": adam }),
    );
    assert_eq!(existing["skipped"].as_u64(), Some(1));
    let added = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "clients.assignStudent",
        json!({ "clientId": serene, "studentId": mason }),
    );
    assert_eq!(added["inserted"].as_u64(), Some(1));
    let repeat = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "clients.assignStudent",
        json!({ "clientId": serene, "studentId": mason }),
    );
    assert_eq!(repeat["inserted"].as_u64(), Some(0));
    assert_eq!(repeat["skipped"].as_u64(), Some(1));

    drop(stdin);
    let _ = child.wait();

    let conn = Connection::open(workspace.join("portal.sqlite3")).expect("open db");
    let mut stmt = conn
        .prepare(
            "SELECT d.full_name, cd.is_primary FROM client_directors cd
             JOIN directors d ON d.id = cd.director_id
             WHERE cd.client_id = ? ORDER BY d.full_name",
        )
        .expect("prepare");
    let rows: Vec<(String, i64)> = stmt
        .query_map([&crown], |r| Ok((r.get(0)?, r.get(1)?)))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows");
    assert_eq!(
        rows,
        vec![("Mark Dwyer".to_string(), 1), ("Nick Vadala".to_string(), 0)]
    );
    drop(stmt);
    drop(conn);
    let _ = std::fs::remove_dir_all(workspace);
}
