use crate::grading::{self, GradeThreshold};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{optional_str, require_f64};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_grading_letter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let percentage = match require_f64(req, "percentage") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !percentage.is_finite() {
        return err(&req.id, "bad_params", "percentage must be finite", None);
    }
    let course_id = match optional_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let explicit_scale = match optional_str(req, "gradingScale") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // An explicit scale wins; otherwise the course's stored scale.
    let scale = match (explicit_scale, course_id) {
        (Some(s), _) => Some(s),
        (None, Some(course_id)) => {
            let Some(conn) = state.db.as_ref() else {
                return err(&req.id, "no_workspace", "select a workspace first", None);
            };
            let stored: Option<Option<String>> = match conn
                .query_row(
                    "SELECT grading_scale FROM courses WHERE id = ?",
                    [&course_id],
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            match stored {
                Some(v) => v,
                None => return err(&req.id, "not_found", "course not found", None),
            }
        }
        (None, None) => None,
    };

    let grade = grading::letter_grade(percentage, scale.as_deref());
    ok(&req.id, json!(grade))
}

fn handle_grading_validate(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(grades_raw) = req.params.get("grades") else {
        return err(&req.id, "bad_params", "missing grades[]", None);
    };
    let grades: Vec<GradeThreshold> = match serde_json::from_value(grades_raw.clone()) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("grades must be an array of {{threshold, letter, modifier}}: {}", e),
                None,
            )
        }
    };

    match grading::validate_grading_scale(&grades) {
        Some(msg) => ok(&req.id, json!({ "valid": false, "error": msg })),
        None => ok(
            &req.id,
            json!({ "valid": true, "encoded": grading::encode_grading_scale(&grades) }),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.letter" => Some(handle_grading_letter(state, req)),
        "grading.validate" => Some(handle_grading_validate(state, req)),
        _ => None,
    }
}
