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
fn upload_copies_into_workspace_and_dedupes_by_digest() {
    let workspace = temp_dir("seedportal-documents");
    let source = fixture_path("fixtures/documents/sow_crown_legends.txt");
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

    let uploaded = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "documents.upload",
        json!({
            "sourcePath": source.to_string_lossy(),
            "studentName": "Adam Calnan",
            "clientName": "Crown Legends",
            "clinic": "Consulting",
            "documentType": "sow",
            "description": "Signed scope of work",
        }),
    );
    assert_eq!(uploaded["deduplicated"].as_bool(), Some(false));
    assert_eq!(uploaded["notified"].as_u64(), Some(1));
    let sha = uploaded["sha256"].as_str().expect("sha256").to_string();
    assert_eq!(sha.len(), 64);
    let rel = uploaded["fileUrl"].as_str().expect("fileUrl").to_string();
    assert_eq!(rel, format!("files/{}/sow_crown_legends.txt", &sha[..12]));
    let copied = std::fs::read(workspace.join(&rel)).expect("read copied document");
    assert_eq!(copied, std::fs::read(&source).expect("read source"));

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "documents.upload",
        json!({
            "sourcePath": source.to_string_lossy(),
            "studentName": "Stuti Adhikari",
            "clientName": "crown legends",
        }),
    );
    assert_eq!(again["deduplicated"].as_bool(), Some(true));
    assert_eq!(again["documentId"], uploaded["documentId"]);

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "documents.create",
        json!({
            "studentName": "Stuti Adhikari",
            "clientName": "Crown Legends",
            "fileUrl": "https://drive.example/midterm.pdf",
            "fileName": "midterm.pdf",
            "documentType": "midterm",
        }),
    );

    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "documents.create",
        json!({
            "studentName": "Stuti Adhikari",
            "clientName": "Crown Legends",
            "fileUrl": "x",
            "fileName": "x.pdf",
            "documentType": "essay",
        }),
    );
    assert_eq!(code, "bad_params");

    let all = request_ok(&mut stdin, &mut reader, "7", "documents.list", json!({ "client": "Crown Legends" }));
    assert_eq!(all["documents"].as_array().map(|a| a.len()), Some(2));
    let sows = request_ok(&mut stdin, &mut reader, "8", "documents.list", json!({ "documentType": "sow" }));
    let sows = sows["documents"].as_array().expect("documents");
    assert_eq!(sows.len(), 1);
    assert_eq!(sows[0]["fileType"].as_str(), Some("text/plain"));

    let document_id = uploaded["documentId"].as_str().expect("document id").to_string();
    let code = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "documents.reviews.add",
        json!({ "documentId": document_id, "directorName": "Nick Vadala" }),
    );
    assert_eq!(code, "bad_params");
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "documents.reviews.add",
        json!({
            "documentId": document_id,
            "directorName": "Nick Vadala",
            "comment": "Scope reads well; add the pricing study milestone.",
            "grade": "A-",
        }),
    );
    let reviews = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "documents.reviews.list",
        json!({ "documentId": document_id }),
    );
    assert_eq!(reviews["reviews"][0]["grade"].as_str(), Some("A-"));
    let listed = request_ok(&mut stdin, &mut reader, "12", "documents.list", json!({ "documentType": "sow" }));
    assert_eq!(listed["documents"][0]["reviewCount"].as_i64(), Some(1));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "13",
        "documents.reviews.add",
        json!({ "documentId": "missing", "directorName": "Nick Vadala", "grade": "B" }),
    );
    assert_eq!(code, "not_found");

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
