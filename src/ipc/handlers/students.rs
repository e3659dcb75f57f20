use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{optional_str, require_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub(crate) fn course_exists(conn: &Connection, course_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match require_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, roll_no, sort_order
         FROM students
         WHERE course_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&course_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let roll_no: Option<String> = row.get(2)?;
            let sort_order: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "rollNo": roll_no,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match require_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match require_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let roll_no = match optional_str(req, "rollNo") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match course_exists(conn, &course_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE course_id = ?",
        [&course_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, course_id, name, roll_no, sort_order, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &course_id,
            &name,
            &roll_no,
            sort_order,
            db::now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "sortOrder": sort_order }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        _ => None,
    }
}
