use crate::db;
use crate::exam_scaling::{disable_exam_scaling, load_exam, ExamRecord};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::students::course_exists;
use crate::ipc::helpers::{optional_bool, optional_f64, optional_str, require_f64, require_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn check_total_marks(req: &Request, v: f64) -> Result<(), serde_json::Value> {
    if !v.is_finite() || v <= 0.0 {
        return Err(err(
            &req.id,
            "bad_params",
            "totalMarks must be greater than 0",
            Some(json!({ "totalMarks": v })),
        ));
    }
    Ok(())
}

fn check_weightage(req: &Request, v: f64) -> Result<(), serde_json::Value> {
    if !(0.0..=100.0).contains(&v) {
        return Err(err(
            &req.id,
            "bad_params",
            "weightage must be between 0 and 100",
            Some(json!({ "weightage": v })),
        ));
    }
    Ok(())
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match require_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.course_id, e.display_name, e.total_marks, e.weightage,
                e.scaling_enabled, e.scaling_method, e.scaling_target,
                (SELECT COUNT(*) FROM marks m WHERE m.exam_id = e.id) AS mark_count
         FROM exams e
         WHERE e.course_id = ?
         ORDER BY e.created_at, e.display_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&course_id], |r| {
            let exam = ExamRecord {
                id: r.get(0)?,
                course_id: r.get(1)?,
                display_name: r.get(2)?,
                total_marks: r.get(3)?,
                weightage: r.get(4)?,
                scaling_enabled: r.get::<_, i64>(5)? != 0,
                scaling_method: r.get(6)?,
                scaling_target: r.get(7)?,
            };
            let mark_count: i64 = r.get(8)?;
            Ok((exam, mark_count))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(rows) => {
            let exams: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|(exam, mark_count)| {
                    let mut v = json!(exam);
                    v["markCount"] = json!(mark_count);
                    v
                })
                .collect();
            ok(&req.id, json!({ "exams": exams }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match require_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let display_name = match require_str(req, "displayName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let total_marks = match require_f64(req, "totalMarks") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let weightage = match require_f64(req, "weightage") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_total_marks(req, total_marks) {
        return resp;
    }
    if let Err(resp) = check_weightage(req, weightage) {
        return resp;
    }

    match course_exists(conn, &course_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let exam_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO exams(id, course_id, display_name, total_marks, weightage,
                           scaling_enabled, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 0, ?, ?)",
        (
            &exam_id,
            &course_id,
            &display_name,
            total_marks,
            weightage,
            &now,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }

    tracing::info!(exam_id = %exam_id, course_id = %course_id, "exam created");
    ok(&req.id, json!({ "examId": exam_id }))
}

fn handle_exams_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match require_str(req, "examId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let display_name = match optional_str(req, "displayName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let total_marks = match optional_f64(req, "totalMarks") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let weightage = match optional_f64(req, "weightage") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let scaling_enabled = match optional_bool(req, "scalingEnabled") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    // Present-but-null clears the target; absent leaves it alone.
    let scaling_target_given = req.params.get("scalingTarget").is_some();
    let scaling_target = match optional_f64(req, "scalingTarget") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Some(v) = total_marks {
        if let Err(resp) = check_total_marks(req, v) {
            return resp;
        }
    }
    if let Some(v) = weightage {
        if let Err(resp) = check_weightage(req, v) {
            return resp;
        }
    }
    if let Some(t) = scaling_target {
        if !t.is_finite() || t < 0.0 {
            return err(
                &req.id,
                "bad_params",
                "scalingTarget must be a number >= 0",
                Some(json!({ "scalingTarget": t })),
            );
        }
    }

    let current = match load_exam(conn, &exam_id) {
        Ok(Some(exam)) => exam,
        Ok(None) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    // Stored raw marks must still fit under a new total.
    let total_changed = total_marks.is_some_and(|v| v != current.total_marks);
    if let Some(v) = total_marks.filter(|_| total_changed) {
        let max_raw: Option<f64> = match conn.query_row(
            "SELECT MAX(raw_mark) FROM marks WHERE exam_id = ?",
            [&exam_id],
            |r| r.get(0),
        ) {
            Ok(m) => m,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if let Some(max_raw) = max_raw.filter(|m| *m > v) {
            return err(
                &req.id,
                "bad_params",
                "totalMarks cannot be lower than an existing raw mark",
                Some(json!({ "totalMarks": v, "maxRawMark": max_raw })),
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = db::now_rfc3339();
    let mut updates: Vec<(&str, rusqlite::types::Value)> = Vec::new();
    if let Some(v) = &display_name {
        updates.push(("display_name", v.clone().into()));
    }
    if let Some(v) = total_marks {
        updates.push(("total_marks", v.into()));
    }
    if let Some(v) = weightage {
        updates.push(("weightage", v.into()));
    }
    if scaling_target_given {
        updates.push(("scaling_target", scaling_target.into()));
    }
    if scaling_enabled == Some(true) {
        updates.push(("scaling_enabled", 1_i64.into()));
    }
    for (column, value) in updates {
        let sql = format!("UPDATE exams SET {} = ?, updated_at = ? WHERE id = ?", column);
        if let Err(e) = tx.execute(&sql, (value, &now, &exam_id)) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "column": column })),
            );
        }
    }
    // Scaled marks were computed against the old total.
    let mut cleared = None;
    if total_changed {
        match tx.execute(
            "UPDATE marks SET scaled_mark = NULL, rounded_mark = NULL, updated_at = ?
             WHERE exam_id = ? AND (scaled_mark IS NOT NULL OR rounded_mark IS NOT NULL)",
            (&now, &exam_id),
        ) {
            Ok(n) => cleared = Some(n),
            Err(e) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_update_failed",
                    e.to_string(),
                    Some(json!({ "table": "marks" })),
                );
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    if scaling_enabled == Some(false) {
        match disable_exam_scaling(conn, &exam_id) {
            Ok(outcome) => cleared = Some(cleared.unwrap_or(0) + outcome.cleared_count),
            Err(e) => return err(&req.id, &e.code, e.message, e.details),
        }
    }

    match load_exam(conn, &exam_id) {
        Ok(Some(exam)) => ok(
            &req.id,
            json!({ "exam": exam, "clearedCount": cleared }),
        ),
        Ok(None) => err(&req.id, "not_found", "exam not found", None),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(handle_exams_list(state, req)),
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.update" => Some(handle_exams_update(state, req)),
        _ => None,
    }
}
