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
    let exe = env!("CARGO_BIN_EXE_marksd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn marksd");
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

fn error_code(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

struct Fixture {
    course_id: String,
    student_ids: Vec<String>,
}

/// Selects `workspace` and creates one course with `n` students.
fn setup_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
    n: usize,
) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        stdin,
        reader,
        "course",
        "courses.create",
        json!({ "name": "Statistics 101", "code": "STAT101" }),
    );
    let course_id = str_field(&course, "courseId");
    let mut student_ids = Vec::new();
    for i in 0..n {
        let s = request_ok(
            stdin,
            reader,
            &format!("student-{}", i),
            "students.create",
            json!({ "courseId": course_id, "name": format!("Student {}", i) }),
        );
        student_ids.push(str_field(&s, "studentId"));
    }
    Fixture {
        course_id,
        student_ids,
    }
}

fn create_exam(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    course_id: &str,
    total_marks: f64,
) -> String {
    let exam = request_ok(
        stdin,
        reader,
        "exam",
        "exams.create",
        json!({
            "courseId": course_id,
            "displayName": "Midterm",
            "totalMarks": total_marks,
            "weightage": 30
        }),
    );
    str_field(&exam, "examId")
}

fn set_marks(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    exam_id: &str,
    student_ids: &[String],
    marks: &[f64],
) {
    for (sid, mark) in student_ids.iter().zip(marks) {
        let _ = request_ok(
            stdin,
            reader,
            "mark",
            "marks.set",
            json!({ "examId": exam_id, "studentId": sid, "rawMark": mark }),
        );
    }
}

fn scaled_marks(result: &serde_json::Value) -> Vec<Option<f64>> {
    result
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .iter()
        .map(|r| r.get("scaledMark").and_then(|v| v.as_f64()))
        .collect()
}

fn rounded_marks(result: &serde_json::Value) -> Vec<Option<f64>> {
    result
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .iter()
        .map(|r| r.get("roundedMark").and_then(|v| v.as_f64()))
        .collect()
}

#[test]
fn percentile_spreads_cohort_across_target() {
    let workspace = temp_dir("marksd-scaling-percentile");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup_course(&mut stdin, &mut reader, &workspace, 3);
    let exam_id = create_exam(&mut stdin, &mut reader, &fx.course_id, 100.0);
    set_marks(
        &mut stdin,
        &mut reader,
        &exam_id,
        &fx.student_ids,
        &[90.0, 40.0, 70.0],
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "apply",
        "scaling.apply",
        json!({ "examId": exam_id, "method": "percentile", "applyRound": false }),
    );
    // Rows come back in roster order.
    assert_eq!(
        scaled_marks(&result),
        vec![Some(100.0), Some(0.0), Some(50.0)]
    );
    assert_eq!(rounded_marks(&result), vec![None, None, None]);
    assert_eq!(result["method"], json!("percentile"));
    assert_eq!(result["effectiveTarget"].as_f64(), Some(100.0));
    assert_eq!(result["scaledCount"].as_u64(), Some(3));

    let exams = request_ok(
        &mut stdin,
        &mut reader,
        "exams",
        "exams.list",
        json!({ "courseId": fx.course_id }),
    );
    let exam = &exams["exams"][0];
    assert_eq!(exam["scalingMethod"], json!("percentile"));
    assert_eq!(exam["scalingEnabled"], json!(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn linear_normalization_maps_onto_requested_target() {
    let workspace = temp_dir("marksd-scaling-linear");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup_course(&mut stdin, &mut reader, &workspace, 1);
    let exam_id = create_exam(&mut stdin, &mut reader, &fx.course_id, 100.0);
    set_marks(&mut stdin, &mut reader, &exam_id, &fx.student_ids, &[80.0]);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "apply",
        "scaling.apply",
        json!({
            "examId": exam_id,
            "method": "linearNormalization",
            "scalingTarget": 90,
            "applyRound": true
        }),
    );
    assert_eq!(scaled_marks(&result), vec![Some(72.0)]);
    assert_eq!(rounded_marks(&result), vec![Some(72.0)]);
    assert_eq!(result["scalingTarget"].as_f64(), Some(90.0));

    // The target sticks to the exam and is reused without an override.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "apply-again",
        "scaling.apply",
        json!({ "examId": exam_id, "method": "linearNormalization" }),
    );
    assert_eq!(again["effectiveTarget"].as_f64(), Some(90.0));
    assert_eq!(scaled_marks(&again), vec![Some(72.0)]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn identical_marks_land_on_midpoint() {
    let workspace = temp_dir("marksd-scaling-degenerate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup_course(&mut stdin, &mut reader, &workspace, 3);

    // 33.3 is not exactly representable, so the cohort mean drifts.
    for raw in [70.0, 33.3] {
        let exam_id = create_exam(&mut stdin, &mut reader, &fx.course_id, 100.0);
        set_marks(
            &mut stdin,
            &mut reader,
            &exam_id,
            &fx.student_ids,
            &[raw, raw, raw],
        );

        for method in ["bellCurve", "minMaxNormalization"] {
            let result = request_ok(
                &mut stdin,
                &mut reader,
                method,
                "scaling.apply",
                json!({ "examId": exam_id, "method": method }),
            );
            assert_eq!(
                scaled_marks(&result),
                vec![Some(50.0), Some(50.0), Some(50.0)],
                "{} on {}",
                method,
                raw
            );
        }
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn round_half_up_flag_decides_exact_halves() {
    let workspace = temp_dir("marksd-scaling-halves");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup_course(&mut stdin, &mut reader, &workspace, 1);
    let exam_id = create_exam(&mut stdin, &mut reader, &fx.course_id, 100.0);
    set_marks(&mut stdin, &mut reader, &exam_id, &fx.student_ids, &[70.0]);

    let up = request_ok(
        &mut stdin,
        &mut reader,
        "up",
        "scaling.apply",
        json!({
            "examId": exam_id,
            "method": "linearNormalization",
            "scalingTarget": 45,
            "applyRound": true,
            "roundHalfUp": true
        }),
    );
    assert_eq!(scaled_marks(&up), vec![Some(31.5)]);
    assert_eq!(rounded_marks(&up), vec![Some(32.0)]);

    let down = request_ok(
        &mut stdin,
        &mut reader,
        "down",
        "scaling.apply",
        json!({
            "examId": exam_id,
            "method": "linearNormalization",
            "applyRound": true,
            "roundHalfUp": false
        }),
    );
    assert_eq!(scaled_marks(&down), vec![Some(31.5)]);
    assert_eq!(rounded_marks(&down), vec![Some(31.0)]);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "marks.list",
        json!({ "examId": exam_id }),
    );
    assert_eq!(listed["marks"][0]["roundedMark"].as_f64(), Some(31.0));
    assert_eq!(listed["marks"][0]["effectiveMark"].as_f64(), Some(31.5));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn apply_rejects_missing_marks_and_unknown_methods() {
    let workspace = temp_dir("marksd-scaling-errors");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup_course(&mut stdin, &mut reader, &workspace, 2);
    let exam_id = create_exam(&mut stdin, &mut reader, &fx.course_id, 50.0);

    let empty = request(
        &mut stdin,
        &mut reader,
        "empty",
        "scaling.apply",
        json!({ "examId": exam_id, "method": "bellCurve" }),
    );
    assert_eq!(error_code(&empty), "not_found");
    assert_eq!(
        empty["error"]["message"],
        json!("no marks found for this exam")
    );

    set_marks(
        &mut stdin,
        &mut reader,
        &exam_id,
        &fx.student_ids,
        &[10.0, 20.0],
    );
    let unknown = request(
        &mut stdin,
        &mut reader,
        "unknown",
        "scaling.apply",
        json!({ "examId": exam_id, "method": "zScore" }),
    );
    assert_eq!(error_code(&unknown), "unsupported_method");
    assert!(unknown["error"]["details"]["supported"]
        .as_array()
        .map(|a| a.len() == 4)
        .unwrap_or(false));

    let bad_target = request(
        &mut stdin,
        &mut reader,
        "target",
        "scaling.apply",
        json!({ "examId": exam_id, "method": "bellCurve", "scalingTarget": -5 }),
    );
    assert_eq!(error_code(&bad_target), "bad_params");

    let missing_exam = request(
        &mut stdin,
        &mut reader,
        "missing",
        "scaling.apply",
        json!({ "examId": "does-not-exist", "method": "bellCurve" }),
    );
    assert_eq!(error_code(&missing_exam), "not_found");

    // Nothing above touched the stored marks.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "marks.list",
        json!({ "examId": exam_id }),
    );
    for row in listed["marks"].as_array().expect("marks") {
        assert!(row["scaledMark"].is_null());
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn preview_scales_without_a_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "preview",
        "scaling.preview",
        json!({
            "method": "minMaxNormalization",
            "totalMarks": 50,
            "scalingTarget": 100,
            "applyRound": true,
            "cohort": [
                { "studentId": "a", "rawMark": 10 },
                { "studentId": "b", "rawMark": null },
                { "studentId": "c", "rawMark": 30 },
                { "studentId": "d", "rawMark": 20 }
            ]
        }),
    );
    let scaled = result["scaled"].as_array().expect("scaled");
    assert_eq!(scaled.len(), 3);
    assert_eq!(scaled[0]["studentId"], json!("a"));
    assert_eq!(scaled[0]["scaledMark"].as_f64(), Some(0.0));
    assert_eq!(scaled[1]["studentId"], json!("c"));
    assert_eq!(scaled[1]["scaledMark"].as_f64(), Some(100.0));
    assert_eq!(scaled[2]["scaledMark"].as_f64(), Some(50.0));
    assert_eq!(result["excludedCount"].as_u64(), Some(1));
    assert_eq!(result["rounded"].as_array().map(|a| a.len()), Some(3));

    let bad = request(
        &mut stdin,
        &mut reader,
        "bad",
        "scaling.preview",
        json!({ "method": "percentile", "totalMarks": 0, "cohort": [] }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    let malformed = request(
        &mut stdin,
        &mut reader,
        "malformed",
        "scaling.preview",
        json!({
            "method": "percentile",
            "totalMarks": 10,
            "cohort": [{ "studentId": "a", "rawMark": "seven" }]
        }),
    );
    assert_eq!(error_code(&malformed), "bad_params");

    let absent = request_ok(
        &mut stdin,
        &mut reader,
        "absent",
        "scaling.preview",
        json!({
            "method": "bellCurve",
            "totalMarks": 10,
            "cohort": [
                { "studentId": "a" },
                { "studentId": "b", "rawMark": 4.4 },
                { "studentId": "c", "rawMark": 4.4 }
            ]
        }),
    );
    assert_eq!(absent["excludedCount"].as_u64(), Some(1));
    let scaled = absent["scaled"].as_array().expect("scaled");
    assert!(scaled.iter().all(|s| s["scaledMark"].as_f64() == Some(5.0)));

    drop(stdin);
    let _ = child.wait();
}
