use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

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
    let exe = env!("CARGO_BIN_EXE_marksheetd");
    let mut child = Command::new(exe)
        .env_remove("MARKSHEETD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn marksheetd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed-students",
        "students.upsert",
        json!({ "students": [
            { "studentId": "s1", "rollNo": "R01", "name": "Aarav", "year": "SE", "division": "A" },
            { "studentId": "s2", "rollNo": "R02", "name": "Bela", "year": "SE", "division": "A" },
            { "studentId": "s9", "rollNo": "R01", "name": "Dev", "year": "TE", "division": "B" }
        ]}),
    );
    for (i, (teacher_id, subject)) in [("t1", "Maths"), ("t2", "Physics")].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-teacher-{}", i),
            "teachers.upsert",
            json!({ "teacher": {
                "teacherId": teacher_id,
                "name": format!("Teacher {}", teacher_id),
                "subjects": [{ "name": subject, "year": "SE", "division": "A" }]
            }}),
        );
    }
}

fn item(student: &str, exam: &str, subject: &str, teacher: &str, scores: serde_json::Value) -> serde_json::Value {
    json!({
        "studentId": student,
        "examType": exam,
        "year": "SE",
        "subjectName": subject,
        "teacherId": teacher,
        "scores": scores,
    })
}

#[test]
fn batch_reports_per_item_outcomes_without_aborting() {
    let workspace = temp_dir("marksheetd-partial");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "submit",
        "marks.submit",
        json!({
            "principal": { "id": "t1", "role": "teacher" },
            "items": [
                item("s1", "unit1", "Maths", "t1", json!({ "q1": 5, "q2": 5, "q3": 4, "q4": 4 })),
                item("s1", "quiz", "Maths", "t1", json!({ "q1": 1, "q2": 1, "q3": 1, "q4": 1 })),
                item("s2", "unit1", "Maths", "t1", json!({ "q1": 31, "q2": 0, "q3": 0, "q4": 0 })),
                item("s2", "unit1", "Physics", "t2", json!({ "q1": 1, "q2": 1, "q3": 1, "q4": 1 })),
                item("nobody", "unit1", "Maths", "t1", json!("ABSENT")),
                item("s2", "unit1", "Maths", "t1", json!("absent")),
                { "studentId": "s2" }
            ]
        }),
    );

    assert_eq!(result["succeeded"], json!(2));
    assert_eq!(result["failed"], json!(5));
    let items = result["items"].as_array().expect("items");
    assert_eq!(items.len(), 7);
    let codes: Vec<Option<&str>> = items
        .iter()
        .map(|i| i.get("error").and_then(|e| e.get("code")).and_then(|c| c.as_str()))
        .collect();
    assert_eq!(
        codes,
        vec![
            None,
            Some("validation_error"),
            Some("validation_error"),
            Some("unauthorized"),
            Some("not_found"),
            None,
            Some("validation_error"),
        ]
    );

    let first = &items[0]["result"];
    assert_eq!(first["action"], json!("created"));
    assert_eq!(first["entry"]["total"], json!(18));
    assert_eq!(first["entry"]["status"], json!("Pass"));
    assert_eq!(first["entry"]["percentage"], json!(60));

    let absent = &items[5]["result"]["entry"];
    assert_eq!(absent["status"], json!("Absent"));
    assert_eq!(absent["total"], json!(-1));
    assert_eq!(absent["scores"]["q3"], json!(-1));
    assert!(absent["percentage"].is_null());

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "query",
        "marks.query",
        json!({ "filter": { "examType": "unit1" } }),
    );
    let records = stored["records"].as_array().expect("records");
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r["entries"].as_array().map(|e| e.len()) == Some(1)));
}

#[test]
fn resubmission_is_idempotent_and_edits_round_trip() {
    let workspace = temp_dir("marksheetd-edits");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);
    let principal = json!({ "id": "t1", "role": "teacher" });

    let submit = |stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str| {
        request_ok(
            stdin,
            reader,
            id,
            "marks.submit",
            json!({
                "principal": principal,
                "items": [item("s1", "unit1", "Maths", "t1", json!({ "q1": 3, "q2": 3, "q3": 3, "q4": 2 }))]
            }),
        )
    };
    let a = submit(&mut stdin, &mut reader, "a");
    let b = submit(&mut stdin, &mut reader, "b");
    let record_id = a["items"][0]["result"]["recordId"]
        .as_str()
        .expect("recordId")
        .to_string();
    assert_eq!(b["items"][0]["result"]["recordId"], json!(record_id));
    assert_eq!(b["items"][0]["result"]["entry"]["total"], json!(11));
    assert_eq!(b["items"][0]["result"]["entry"]["status"], json!("Fail"));

    let query = request_ok(
        &mut stdin,
        &mut reader,
        "q1",
        "marks.query",
        json!({ "filter": { "studentId": "s1" } }),
    );
    assert_eq!(query["records"][0]["entries"].as_array().map(|e| e.len()), Some(1));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "upd",
        "marks.updateEntry",
        json!({
            "principal": principal,
            "recordId": record_id,
            "subjectName": "Maths",
            "teacherId": "t1",
            "scores": "ABSENT"
        }),
    );
    assert_eq!(updated["action"], json!("updated"));
    assert_eq!(updated["entry"]["status"], json!("Absent"));

    let same = request_ok(
        &mut stdin,
        &mut reader,
        "upd-again",
        "marks.updateEntry",
        json!({
            "principal": principal,
            "recordId": record_id,
            "subjectName": "Maths",
            "teacherId": "t1",
            "scores": "ABSENT"
        }),
    );
    assert_eq!(same["action"], json!("unchanged"));

    let stranger = request(
        &mut stdin,
        &mut reader,
        "rm-other",
        "marks.removeEntry",
        json!({
            "principal": { "id": "t2", "role": "teacher" },
            "recordId": record_id,
            "subjectName": "Maths",
            "teacherId": "t1"
        }),
    );
    assert_eq!(stranger["error"]["code"], json!("unauthorized"));

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "rm",
        "marks.removeEntry",
        json!({
            "principal": principal,
            "recordId": record_id,
            "subjectName": "Maths",
            "teacherId": "t1"
        }),
    );
    assert_eq!(removed["action"], json!("recordDeleted"));

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "q2",
        "marks.query",
        json!({ "filter": { "studentId": "s1" } }),
    );
    assert_eq!(after["records"], json!([]));

    let gone = request(
        &mut stdin,
        &mut reader,
        "rm-gone",
        "marks.removeEntry",
        json!({
            "principal": principal,
            "recordId": record_id,
            "subjectName": "Maths",
            "teacherId": "t1"
        }),
    );
    assert_eq!(gone["error"]["code"], json!("not_found"));
}

#[test]
fn mutations_require_a_principal_and_respect_limits() {
    let workspace = temp_dir("marksheetd-limits");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let anonymous = request(
        &mut stdin,
        &mut reader,
        "anon",
        "marks.submit",
        json!({ "items": [] }),
    );
    assert_eq!(anonymous["error"]["code"], json!("unauthorized"));

    let items: Vec<serde_json::Value> = (0..5001)
        .map(|_| item("s1", "unit1", "Maths", "t1", json!("ABSENT")))
        .collect();
    let over = request_ok(
        &mut stdin,
        &mut reader,
        "over",
        "marks.submit",
        json!({ "principal": { "id": "office", "role": "admin" }, "items": items }),
    );
    assert_eq!(over["succeeded"], json!(0));
    assert_eq!(over["limitExceeded"], json!(true));
    assert_eq!(over["failed"], json!(5001));
    assert_eq!(over["items"], json!([]));
    assert_eq!(over["batchError"]["code"], json!("too_many_items"));

    let conflict = request_ok(
        &mut stdin,
        &mut reader,
        "create-twice",
        "marks.submit",
        json!({
            "principal": { "id": "office", "role": "admin" },
            "mode": "create",
            "items": [
                item("s2", "term", "Physics", "t2", json!({ "q1": 10, "q2": 10, "q3": 5, "q4": 5 })),
                item("s2", "term", "Physics", "t2", json!({ "q1": 10, "q2": 10, "q3": 5, "q4": 5 }))
            ]
        }),
    );
    assert_eq!(conflict["items"][0]["result"]["entry"]["status"], json!("Pass"));
    assert_eq!(conflict["items"][1]["error"]["code"], json!("conflict"));
}
