use crate::db;
use crate::exam_scaling::{load_exam, ExamRecord};
use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::require_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const MARKS_BULK_SET_MAX_EDITS: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn as_edit_error(&self, student_id: &str) -> serde_json::Value {
        json!({
            "studentId": student_id,
            "code": self.code,
            "message": self.message,
        })
    }
}

fn validate_raw_mark(value: Option<f64>, total_marks: f64) -> Result<f64, HandlerErr> {
    let Some(v) = value else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "rawMark must be a number".to_string(),
            details: None,
        });
    };
    if !v.is_finite() || v < 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "negative marks are not allowed".to_string(),
            details: Some(json!({ "rawMark": v })),
        });
    }
    if v > total_marks {
        return Err(HandlerErr {
            code: "bad_params",
            message: "rawMark cannot exceed totalMarks".to_string(),
            details: Some(json!({ "rawMark": v, "totalMarks": total_marks })),
        });
    }
    Ok(v)
}

fn resolve_exam(conn: &Connection, exam_id: &str) -> Result<ExamRecord, HandlerErr> {
    match load_exam(conn, exam_id) {
        Ok(Some(exam)) => Ok(exam),
        Ok(None) => Err(HandlerErr {
            code: "not_found",
            message: "exam not found".to_string(),
            details: Some(json!({ "examId": exam_id })),
        }),
        Err(e) => Err(HandlerErr {
            code: "db_query_failed",
            message: e.message,
            details: None,
        }),
    }
}

fn ensure_student_in_course(
    conn: &Connection,
    course_id: &str,
    student_id: &str,
) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND course_id = ?",
            (student_id, course_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    found.map(|_| ()).ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "student not found in this course".to_string(),
        details: Some(json!({ "studentId": student_id })),
    })
}

/// A new raw mark invalidates whatever scaling was stored for the record.
fn upsert_raw_mark(
    conn: &Connection,
    exam: &ExamRecord,
    student_id: &str,
    raw_mark: f64,
) -> Result<(), HandlerErr> {
    let mark_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO marks(id, student_id, exam_id, course_id, raw_mark, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, exam_id) DO UPDATE SET
           raw_mark = excluded.raw_mark,
           scaled_mark = NULL,
           rounded_mark = NULL,
           updated_at = excluded.updated_at",
        (
            &mark_id,
            student_id,
            &exam.id,
            &exam.course_id,
            raw_mark,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "marks" })),
    })?;
    Ok(())
}

fn set_one(
    conn: &Connection,
    exam: &ExamRecord,
    student_id: &str,
    raw_value: Option<f64>,
) -> Result<f64, HandlerErr> {
    let raw_mark = validate_raw_mark(raw_value, exam.total_marks)?;
    ensure_student_in_course(conn, &exam.course_id, student_id)?;
    upsert_raw_mark(conn, exam, student_id, raw_mark)?;
    Ok(raw_mark)
}

fn handle_marks_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match require_str(req, "examId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match require_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let raw_value = req.params.get("rawMark").and_then(|v| v.as_f64());

    let exam = match resolve_exam(conn, &exam_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match set_one(conn, &exam, &student_id, raw_value) {
        Ok(raw_mark) => ok(
            &req.id,
            json!({ "studentId": student_id, "examId": exam_id, "rawMark": raw_mark }),
        ),
        Err(e) => e.response(&req.id),
    }
}

fn handle_marks_bulk_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match require_str(req, "examId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };

    if edits_arr.len() > MARKS_BULK_SET_MAX_EDITS {
        let rejected = edits_arr.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "studentId": null,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max edits: {} > {}",
                        rejected, MARKS_BULK_SET_MAX_EDITS
                    )
                }]
            }),
        );
    }

    let exam = match resolve_exam(conn, &exam_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let Some(obj) = edit.as_object() else {
            errors.push(json!({
                "studentId": null,
                "code": "bad_params",
                "message": format!("edit at index {} must be an object", i),
            }));
            continue;
        };
        let Some(student_id) = obj.get("studentId").and_then(|v| v.as_str()) else {
            errors.push(json!({
                "studentId": null,
                "code": "bad_params",
                "message": format!("edit at index {} missing studentId", i),
            }));
            continue;
        };
        let raw_value = obj.get("rawMark").and_then(|v| v.as_f64());

        match set_one(conn, &exam, student_id, raw_value) {
            Ok(_) => updated += 1,
            Err(e) => errors.push(e.as_edit_error(student_id)),
        }
    }

    let rejected = errors.len();
    if rejected > 0 {
        tracing::warn!(exam_id = %exam_id, updated, rejected, "bulk mark edits rejected");
    }
    let mut result = json!({ "ok": true, "updated": updated });
    if rejected > 0 {
        result["rejected"] = json!(rejected);
        result["errors"] = json!(errors);
    }
    ok(&req.id, result)
}

/// Scaled mark when scaling is switched on and present, raw mark otherwise.
fn effective_mark(exam: &ExamRecord, raw: Option<f64>, scaled: Option<f64>) -> Option<(f64, f64)> {
    if exam.scaling_enabled {
        if let Some(s) = scaled {
            return Some((s, exam.scaling_config().target()));
        }
    }
    raw.map(|r| (r, exam.total_marks))
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match require_str(req, "examId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let exam = match resolve_exam(conn, &exam_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let grading_scale: Option<String> = match conn
        .query_row(
            "SELECT grading_scale FROM courses WHERE id = ?",
            [&exam.course_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v.flatten(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT m.student_id, s.name, s.roll_no, m.raw_mark, m.scaled_mark, m.rounded_mark, m.updated_at
         FROM marks m
         LEFT JOIN students s ON s.id = m.student_id
         WHERE m.exam_id = ?
         ORDER BY COALESCE(s.sort_order, 0), m.student_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&exam_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<f64>>(3)?,
                r.get::<_, Option<f64>>(4)?,
                r.get::<_, Option<f64>>(5)?,
                r.get::<_, String>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut effective_values: Vec<f64> = Vec::new();
    let marks: Vec<serde_json::Value> = rows
        .into_iter()
        .map(
            |(student_id, name, roll_no, raw_mark, scaled_mark, rounded_mark, updated_at)| {
                let effective = effective_mark(&exam, raw_mark, scaled_mark);
                let (effective_mark, letter) = match effective {
                    Some((value, out_of)) if out_of > 0.0 => {
                        effective_values.push(value);
                        let grade =
                            grading::letter_grade(100.0 * value / out_of, grading_scale.as_deref());
                        (Some(value), Some(grade))
                    }
                    Some((value, _)) => {
                        effective_values.push(value);
                        (Some(value), None)
                    }
                    None => (None, None),
                };
                json!({
                    "studentId": student_id,
                    "name": name,
                    "rollNo": roll_no,
                    "rawMark": raw_mark,
                    "scaledMark": scaled_mark,
                    "roundedMark": rounded_mark,
                    "effectiveMark": effective_mark,
                    "letterGrade": letter,
                    "updatedAt": updated_at
                })
            },
        )
        .collect();

    let stats = if effective_values.is_empty() {
        json!({ "average": 0.0, "highest": 0.0, "lowest": 0.0, "count": 0 })
    } else {
        let n = effective_values.len() as f64;
        json!({
            "average": effective_values.iter().sum::<f64>() / n,
            "highest": effective_values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            "lowest": effective_values.iter().copied().fold(f64::INFINITY, f64::min),
            "count": effective_values.len()
        })
    };

    ok(
        &req.id,
        json!({ "exam": exam, "marks": marks, "stats": stats }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.list" => Some(handle_marks_list(state, req)),
        "marks.set" => Some(handle_marks_set(state, req)),
        "marks.bulkSet" => Some(handle_marks_bulk_set(state, req)),
        _ => None,
    }
}
