use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "marks.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT,
            grading_scale TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            roll_no TEXT,
            sort_order INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_course_sort ON students(course_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            total_marks REAL NOT NULL,
            weightage REAL NOT NULL,
            scaling_enabled INTEGER NOT NULL DEFAULT 0,
            scaling_method TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    // Workspaces created before per-exam targets existed lack this column.
    ensure_exams_scaling_target(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_course ON exams(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            exam_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            raw_mark REAL,
            scaled_mark REAL,
            rounded_mark REAL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(student_id, exam_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_exam ON marks(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_course ON marks(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(
            serde_json::from_str(&text).with_context(|| format!("corrupt setting {}", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_exams_scaling_target(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exams", "scaling_target")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE exams ADD COLUMN scaling_target REAL", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
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

    #[test]
    fn open_db_is_idempotent_and_has_target_column() {
        let ws = temp_dir("marksd-db-open");
        drop(open_db(&ws).expect("first open"));
        let conn = open_db(&ws).expect("second open");
        assert!(table_has_column(&conn, "exams", "scaling_target").expect("pragma"));
        assert!(table_has_column(&conn, "marks", "rounded_mark").expect("pragma"));
        drop(conn);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn settings_roundtrip_and_overwrite() {
        let ws = temp_dir("marksd-db-settings");
        let conn = open_db(&ws).expect("open");
        assert_eq!(settings_get_json(&conn, "setup.scaling").expect("get"), None);
        settings_set_json(&conn, "setup.scaling", &json!({ "roundHalfUp": false })).expect("set");
        settings_set_json(&conn, "setup.scaling", &json!({ "roundHalfUp": true })).expect("set");
        assert_eq!(
            settings_get_json(&conn, "setup.scaling").expect("get"),
            Some(json!({ "roundHalfUp": true }))
        );
        drop(conn);
        let _ = std::fs::remove_dir_all(ws);
    }
}
