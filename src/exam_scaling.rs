use crate::db;
use crate::rounding::round_marks;
use crate::scaling::{scale, CohortEntry, ScalingConfig, ScalingError, ScalingMethod};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ScalingRunError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ScalingRunError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ScalingError> for ScalingRunError {
    fn from(e: ScalingError) -> Self {
        ScalingRunError::new(e.code(), e.to_string())
    }
}

fn query_failed(e: rusqlite::Error) -> ScalingRunError {
    ScalingRunError::new("db_query_failed", e.to_string())
}

fn update_failed(e: rusqlite::Error) -> ScalingRunError {
    ScalingRunError::new("db_update_failed", e.to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRecord {
    pub id: String,
    pub course_id: String,
    pub display_name: String,
    pub total_marks: f64,
    pub weightage: f64,
    pub scaling_enabled: bool,
    pub scaling_method: Option<String>,
    pub scaling_target: Option<f64>,
}

impl ExamRecord {
    pub fn scaling_config(&self) -> ScalingConfig {
        ScalingConfig {
            total_marks: self.total_marks,
            scaling_target: self.scaling_target,
        }
    }
}

pub fn load_exam(conn: &Connection, exam_id: &str) -> Result<Option<ExamRecord>, ScalingRunError> {
    conn.query_row(
        "SELECT id, course_id, display_name, total_marks, weightage,
                scaling_enabled, scaling_method, scaling_target
         FROM exams
         WHERE id = ?",
        [exam_id],
        |r| {
            Ok(ExamRecord {
                id: r.get(0)?,
                course_id: r.get(1)?,
                display_name: r.get(2)?,
                total_marks: r.get(3)?,
                weightage: r.get(4)?,
                scaling_enabled: r.get::<_, i64>(5)? != 0,
                scaling_method: r.get(6)?,
                scaling_target: r.get(7)?,
            })
        },
    )
    .optional()
    .map_err(query_failed)
}

#[derive(Debug, Clone)]
struct MarkRow {
    id: String,
    student_id: String,
    raw_mark: Option<f64>,
}

/// All mark records of an exam in roster order; this order is also the
/// percentile tie-break order.
fn load_mark_rows(conn: &Connection, exam_id: &str) -> Result<Vec<MarkRow>, ScalingRunError> {
    let mut stmt = conn
        .prepare(
            "SELECT m.id, m.student_id, m.raw_mark
             FROM marks m
             LEFT JOIN students s ON s.id = m.student_id
             WHERE m.exam_id = ?
             ORDER BY COALESCE(s.sort_order, 0), m.student_id",
        )
        .map_err(query_failed)?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(MarkRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                raw_mark: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingRequest<'a> {
    pub exam_id: &'a str,
    pub method: ScalingMethod,
    pub apply_round: bool,
    pub round_half_up: bool,
    /// Overrides and replaces the exam's stored target when present.
    pub scaling_target: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaledStudentRow {
    pub student_id: String,
    pub raw_mark: Option<f64>,
    pub scaled_mark: Option<f64>,
    pub rounded_mark: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingOutcome {
    pub exam_id: String,
    pub method: ScalingMethod,
    pub total_marks: f64,
    pub scaling_target: Option<f64>,
    pub effective_target: f64,
    pub rounding_applied: bool,
    pub round_half_up: bool,
    pub record_count: usize,
    pub scaled_count: usize,
    pub excluded_count: usize,
    pub rows: Vec<ScaledStudentRow>,
}

/// Scale the cohort of one exam and persist the scaled (and optionally
/// rounded) marks plus the exam's scaling metadata.
pub fn apply_exam_scaling(
    conn: &Connection,
    req: &ScalingRequest<'_>,
) -> Result<ScalingOutcome, ScalingRunError> {
    let Some(exam) = load_exam(conn, req.exam_id)? else {
        return Err(ScalingRunError::new("not_found", "exam not found")
            .with_details(json!({ "examId": req.exam_id })));
    };

    if let Some(t) = req.scaling_target {
        if !t.is_finite() || t < 0.0 {
            return Err(
                ScalingRunError::new("bad_params", "scalingTarget must be a number >= 0")
                    .with_details(json!({ "scalingTarget": t })),
            );
        }
    }

    let rows = load_mark_rows(conn, req.exam_id)?;
    if rows.is_empty() {
        return Err(ScalingRunError::new("not_found", "no marks found for this exam")
            .with_details(json!({ "examId": req.exam_id })));
    }

    let config = ScalingConfig {
        total_marks: exam.total_marks,
        scaling_target: req.scaling_target.or(exam.scaling_target),
    };
    let cohort: Vec<CohortEntry> = rows
        .iter()
        .map(|r| CohortEntry::new(r.student_id.clone(), r.raw_mark))
        .collect();

    let scaled = scale(&cohort, &config, req.method);
    let rounded = if req.apply_round {
        round_marks(&scaled, req.round_half_up)
    } else {
        Vec::new()
    };

    let scaled_by_student: HashMap<&str, f64> = scaled
        .iter()
        .map(|s| (s.student_id.as_str(), s.scaled_mark))
        .collect();
    let rounded_by_student: HashMap<&str, f64> = rounded
        .iter()
        .map(|r| (r.student_id.as_str(), r.rounded_mark))
        .collect();

    let excluded_count = rows.len() - scaled.len();
    if excluded_count > 0 {
        tracing::debug!(
            exam_id = req.exam_id,
            excluded = excluded_count,
            "marks without a usable raw value were left unscaled"
        );
    }

    let now = db::now_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| ScalingRunError::new("db_tx_failed", e.to_string()))?;

    let mut out_rows: Vec<ScaledStudentRow> = Vec::with_capacity(rows.len());
    {
        let mut update = tx
            .prepare(
                "UPDATE marks SET scaled_mark = ?, rounded_mark = ?, updated_at = ? WHERE id = ?",
            )
            .map_err(update_failed)?;
        for row in &rows {
            let scaled_mark = scaled_by_student.get(row.student_id.as_str()).copied();
            let rounded_mark = rounded_by_student.get(row.student_id.as_str()).copied();
            update
                .execute((scaled_mark, rounded_mark, &now, &row.id))
                .map_err(|e| {
                    update_failed(e).with_details(json!({ "studentId": row.student_id }))
                })?;
            out_rows.push(ScaledStudentRow {
                student_id: row.student_id.clone(),
                raw_mark: row.raw_mark,
                scaled_mark,
                rounded_mark,
            });
        }
    }

    tx.execute(
        "UPDATE exams
         SET scaling_method = ?, scaling_target = ?, scaling_enabled = 1, updated_at = ?
         WHERE id = ?",
        (req.method.as_str(), config.scaling_target, &now, req.exam_id),
    )
    .map_err(update_failed)?;

    tx.commit()
        .map_err(|e| ScalingRunError::new("db_tx_failed", e.to_string()))?;

    tracing::info!(
        exam_id = req.exam_id,
        method = %req.method,
        target = config.target(),
        scaled = scaled.len(),
        rounded = req.apply_round,
        "exam scaling applied"
    );

    Ok(ScalingOutcome {
        exam_id: req.exam_id.to_string(),
        method: req.method,
        total_marks: exam.total_marks,
        scaling_target: config.scaling_target,
        effective_target: config.target(),
        rounding_applied: req.apply_round,
        round_half_up: req.round_half_up,
        record_count: rows.len(),
        scaled_count: scaled.len(),
        excluded_count,
        rows: out_rows,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisableOutcome {
    pub exam_id: String,
    pub cleared_count: usize,
}

/// Drop every scaled and rounded mark of the exam and forget the exam's
/// scaling method and target.
pub fn disable_exam_scaling(
    conn: &Connection,
    exam_id: &str,
) -> Result<DisableOutcome, ScalingRunError> {
    if load_exam(conn, exam_id)?.is_none() {
        return Err(ScalingRunError::new("not_found", "exam not found")
            .with_details(json!({ "examId": exam_id })));
    }

    let now = db::now_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| ScalingRunError::new("db_tx_failed", e.to_string()))?;
    let cleared_count = tx
        .execute(
            "UPDATE marks SET scaled_mark = NULL, rounded_mark = NULL, updated_at = ?
             WHERE exam_id = ? AND (scaled_mark IS NOT NULL OR rounded_mark IS NOT NULL)",
            (&now, exam_id),
        )
        .map_err(update_failed)?;
    tx.execute(
        "UPDATE exams
         SET scaling_enabled = 0, scaling_method = NULL, scaling_target = NULL, updated_at = ?
         WHERE id = ?",
        (&now, exam_id),
    )
    .map_err(update_failed)?;
    tx.commit()
        .map_err(|e| ScalingRunError::new("db_tx_failed", e.to_string()))?;

    tracing::info!(exam_id, cleared = cleared_count, "exam scaling disabled");
    Ok(DisableOutcome {
        exam_id: exam_id.to_string(),
        cleared_count,
    })
}
