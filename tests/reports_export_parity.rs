use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
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

fn spawn_sidecar(envs: &[(&str, String)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_marksheetd");
    let mut cmd = Command::new(exe);
    cmd.env_remove("MARKSHEETD_WORKSPACE")
        .env_remove("MARKSHEETD_PAGE_ROWS");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let mut child = cmd
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

fn seed_marks(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let students: Vec<serde_json::Value> = (1..=6)
        .map(|i| {
            json!({
                "studentId": format!("s{}", i),
                "rollNo": format!("R{:02}", i),
                "name": format!("Student ({})", i),
                "year": "SE",
                "division": "A"
            })
        })
        .collect();
    let _ = request_ok(stdin, reader, "students", "students.upsert", json!({ "students": students }));
    for (teacher_id, subject) in [("t1", "Maths"), ("t2", "Physics")] {
        let _ = request_ok(
            stdin,
            reader,
            &format!("teacher-{}", teacher_id),
            "teachers.upsert",
            json!({ "teacher": {
                "teacherId": teacher_id,
                "name": teacher_id,
                "subjects": [{ "name": subject, "year": "SE", "division": "A" }]
            }}),
        );
    }

    let mut items = Vec::new();
    for i in 1..=6i64 {
        let maths = if i == 4 {
            json!("ABSENT")
        } else {
            json!({ "q1": i, "q2": 7, "q3": 2, "q4": (i % 3) })
        };
        items.push(json!({
            "studentId": format!("s{}", i), "examType": "unit1", "year": "SE",
            "subjectName": "Maths", "teacherId": "t1", "scores": maths
        }));
        if i != 6 {
            items.push(json!({
                "studentId": format!("s{}", i), "examType": "unit1", "year": "SE",
                "subjectName": "Physics", "teacherId": "t2",
                "scores": { "q1": 3, "q2": 3, "q3": i, "q4": 1 }
            }));
        }
    }
    let res = request_ok(
        stdin,
        reader,
        "marks",
        "marks.submit",
        json!({ "principal": { "id": "office", "role": "admin" }, "items": items }),
    );
    assert_eq!(res["failed"], json!(0), "{}", res);
}

fn pdf_strings(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = Vec::new();
    for line in text.lines() {
        let (Some(start), Some(end)) = (line.find(" Td ("), line.rfind(") Tj ET")) else {
            continue;
        };
        let mut s = String::new();
        let mut chars = line[start + 5..end].chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(n) = chars.next() {
                    s.push(n);
                }
            } else {
                s.push(c);
            }
        }
        out.push(s);
    }
    out
}

fn xlsx_entry(path: &Path, name: &str) -> String {
    let file = std::fs::File::open(path).expect("open xlsx");
    let mut archive = zip::ZipArchive::new(file).expect("read xlsx zip");
    let mut entry = archive.by_name(name).expect("xlsx entry");
    let mut s = String::new();
    entry.read_to_string(&mut s).expect("read entry");
    s
}

fn sheet_numbers(sheet: &str) -> Vec<String> {
    sheet
        .split("<v>")
        .skip(1)
        .filter_map(|chunk| chunk.split("</v>").next())
        .map(str::to_string)
        .collect()
}

#[test]
fn document_and_spreadsheet_carry_identical_numbers() {
    let workspace = temp_dir("marksheetd-parity");
    let (_child, mut stdin, mut reader) = spawn_sidecar(&[]);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_marks(&mut stdin, &mut reader);

    for (kind, subject) in [("class", None), ("subject", Some("Maths"))] {
        let filter = json!({ "year": "SE", "division": "A", "examType": "unit1", "subjectName": subject });
        let model = request_ok(
            &mut stdin,
            &mut reader,
            &format!("model-{}", kind),
            "reports.model",
            json!({ "kind": kind, "filter": filter }),
        );
        let digest = model["digest"].as_str().expect("digest").to_string();

        let pdf_path = workspace.join(format!("{}.pdf", kind));
        let xlsx_path = workspace.join(format!("{}.xlsx", kind));
        let pdf = request_ok(
            &mut stdin,
            &mut reader,
            &format!("pdf-{}", kind),
            "reports.export",
            json!({ "kind": kind, "format": "document", "filter": filter, "outPath": pdf_path.to_string_lossy() }),
        );
        let xlsx = request_ok(
            &mut stdin,
            &mut reader,
            &format!("xlsx-{}", kind),
            "reports.export",
            json!({ "kind": kind, "format": "spreadsheet", "filter": filter, "outPath": xlsx_path.to_string_lossy() }),
        );
        assert_eq!(pdf["digest"], json!(digest));
        assert_eq!(xlsx["digest"], json!(digest));
        assert_eq!(pdf["rows"], xlsx["rows"]);
        assert_eq!(pdf["rows"], json!(8));

        let pdf_bytes = std::fs::read(&pdf_path).expect("read pdf");
        assert!(pdf_bytes.starts_with(b"%PDF-1.4"));
        let from_pdf: Vec<String> = pdf_strings(&pdf_bytes)
            .into_iter()
            .filter(|s| s.parse::<f64>().is_ok())
            .collect();
        let from_sheet = sheet_numbers(&xlsx_entry(&xlsx_path, "xl/worksheets/sheet1.xml"));
        assert!(!from_sheet.is_empty());
        assert_eq!(from_pdf, from_sheet, "{} report numbers differ", kind);

        assert!(String::from_utf8_lossy(&pdf_bytes).contains(&digest));
        assert!(xlsx_entry(&xlsx_path, "docProps/core.xml").contains(&digest));
        assert!(!workspace.join(format!("{}.pdf.partial", kind)).exists());
    }
}

#[test]
fn page_rows_setting_paginates_without_splitting_rows() {
    let workspace = temp_dir("marksheetd-paging");
    let (_child, mut stdin, mut reader) = spawn_sidecar(&[
        ("MARKSHEETD_WORKSPACE", workspace.to_string_lossy().to_string()),
        ("MARKSHEETD_PAGE_ROWS", "3".to_string()),
    ]);

    let health = request_ok(&mut stdin, &mut reader, "health", "health", json!({}));
    assert_eq!(health["workspacePath"], json!(workspace.to_string_lossy()));
    seed_marks(&mut stdin, &mut reader);

    let out = workspace.join("reports").join("class.pdf");
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "export",
        "reports.export",
        json!({
            "kind": "class",
            "format": "pdf",
            "filter": { "year": "SE", "division": "A", "examType": "unit1" },
            "outPath": out.to_string_lossy()
        }),
    );
    // 6 students and 2 summary rows at 3 rows per page.
    assert_eq!(res["pages"], json!(3));

    let strings = pdf_strings(&std::fs::read(&out).expect("read pdf"));
    assert_eq!(strings.iter().filter(|s| *s == "Grand Total").count(), 3);
    assert!(strings.contains(&"Student (6)".to_string()));

    let missing = request(
        &mut stdin,
        &mut reader,
        "no-subject",
        "reports.export",
        json!({
            "kind": "subject",
            "format": "xlsx",
            "filter": { "year": "SE", "division": "A", "examType": "unit1" },
            "outPath": workspace.join("x.xlsx").to_string_lossy()
        }),
    );
    assert_eq!(missing["error"]["code"], json!("validation_error"));
    assert!(!workspace.join("x.xlsx").exists());
}
