use crate::db;
use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{optional_str, require_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.code,
           c.grading_scale,
           (SELECT COUNT(*) FROM students s WHERE s.course_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM exams e WHERE e.course_id = c.id) AS exam_count
         FROM courses c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let code: Option<String> = row.get(2)?;
            let grading_scale: Option<String> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            let exam_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "code": code,
                "gradingScale": grading_scale,
                "studentCount": student_count,
                "examCount": exam_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match require_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let code = match optional_str(req, "code") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let grading_scale = match optional_str(req, "gradingScale") {
        Ok(Some(raw)) => {
            let grades = grading::decode_grading_scale(Some(&raw));
            if let Some(msg) = grading::validate_grading_scale(&grades) {
                return err(
                    &req.id,
                    "bad_params",
                    msg,
                    Some(json!({ "gradingScale": raw })),
                );
            }
            grading::encode_grading_scale(&grades)
        }
        Ok(None) => match crate::ipc::handlers::setup::default_grading_scale(conn) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(resp) => return resp,
    };

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, name, code, grading_scale, created_at) VALUES(?, ?, ?, ?, ?)",
        (&course_id, &name, &code, &grading_scale, db::now_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    tracing::info!(course_id = %course_id, "course created");
    ok(
        &req.id,
        json!({ "courseId": course_id, "name": name, "gradingScale": grading_scale }),
    )
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match require_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (table, sql) in [
        ("marks", "DELETE FROM marks WHERE course_id = ?"),
        ("exams", "DELETE FROM exams WHERE course_id = ?"),
        ("students", "DELETE FROM students WHERE course_id = ?"),
        ("courses", "DELETE FROM courses WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&course_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(course_id = %course_id, "course deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        _ => None,
    }
}
