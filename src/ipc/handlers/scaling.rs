use crate::exam_scaling::{apply_exam_scaling, disable_exam_scaling, ScalingRequest};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::{scaling_defaults, ScalingDefaults};
use crate::ipc::helpers::{optional_bool, optional_f64, optional_str, require_f64, require_str};
use crate::ipc::types::{AppState, Request};
use crate::rounding::round_marks;
use crate::scaling::{scale_by_name, CohortEntry, ScalingConfig, ScalingError, ScalingMethod};
use serde_json::json;

/// Max cohort size accepted by `scaling.preview`.
const PREVIEW_MAX_ENTRIES: usize = 5000;

fn unsupported(req: &Request, raw: &str, e: ScalingError) -> serde_json::Value {
    err(
        &req.id,
        e.code(),
        e.to_string(),
        Some(json!({
            "method": raw,
            "supported": ScalingMethod::ALL.iter().map(|m| m.as_str()).collect::<Vec<_>>()
        })),
    )
}

fn check_target(req: &Request, target: Option<f64>) -> Result<(), serde_json::Value> {
    match target {
        Some(t) if !t.is_finite() || t < 0.0 => Err(err(
            &req.id,
            "bad_params",
            "scalingTarget must be a number >= 0",
            Some(json!({ "scalingTarget": t })),
        )),
        _ => Ok(()),
    }
}

fn handle_scaling_apply(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match require_str(req, "examId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let method_raw = match optional_str(req, "method") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let apply_round = match optional_bool(req, "applyRound") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let round_half_up = match optional_bool(req, "roundHalfUp") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let scaling_target = match optional_f64(req, "scalingTarget") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_target(req, scaling_target) {
        return resp;
    }

    let defaults: ScalingDefaults = match scaling_defaults(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let method = match method_raw.as_deref() {
        Some(raw) => match ScalingMethod::parse(raw) {
            Ok(m) => m,
            Err(e) => return unsupported(req, raw, e),
        },
        None => defaults.method,
    };

    let request = ScalingRequest {
        exam_id: &exam_id,
        method,
        apply_round: apply_round.unwrap_or(defaults.apply_round),
        round_half_up: round_half_up.unwrap_or(defaults.round_half_up),
        scaling_target,
    };
    match apply_exam_scaling(conn, &request) {
        Ok(outcome) => ok(&req.id, json!(outcome)),
        Err(e) => {
            tracing::warn!(exam_id = %exam_id, code = %e.code, "scaling not applied");
            err(&req.id, &e.code, e.message, e.details)
        }
    }
}

fn handle_scaling_disable(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let exam_id = match require_str(req, "examId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match disable_exam_scaling(conn, &exam_id) {
        Ok(outcome) => ok(&req.id, json!(outcome)),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

/// Runs the engine over a caller-supplied cohort. Nothing is read from or
/// written to the workspace, so no workspace is required.
fn handle_scaling_preview(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let method_raw = match require_str(req, "method") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let total_marks = match require_f64(req, "totalMarks") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !total_marks.is_finite() || total_marks <= 0.0 {
        return err(
            &req.id,
            "bad_params",
            "totalMarks must be greater than 0",
            Some(json!({ "totalMarks": total_marks })),
        );
    }
    let scaling_target = match optional_f64(req, "scalingTarget") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_target(req, scaling_target) {
        return resp;
    }
    let apply_round = match optional_bool(req, "applyRound") {
        Ok(v) => v.unwrap_or(false),
        Err(resp) => return resp,
    };
    let round_half_up = match optional_bool(req, "roundHalfUp") {
        Ok(v) => v.unwrap_or(true),
        Err(resp) => return resp,
    };

    let Some(cohort_raw) = req.params.get("cohort").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing cohort[]", None);
    };
    if cohort_raw.len() > PREVIEW_MAX_ENTRIES {
        return err(
            &req.id,
            "bad_params",
            format!(
                "cohort exceeds max entries: {} > {}",
                cohort_raw.len(),
                PREVIEW_MAX_ENTRIES
            ),
            None,
        );
    }
    // A null or absent rawMark is a missing mark.
    let cohort: Vec<CohortEntry> = match serde_json::from_value(serde_json::Value::Array(
        cohort_raw.clone(),
    )) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("cohort must be an array of {{studentId, rawMark}}: {}", e),
                None,
            )
        }
    };

    let config = ScalingConfig {
        total_marks,
        scaling_target,
    };
    let scaled = match scale_by_name(&cohort, &config, &method_raw) {
        Ok(v) => v,
        Err(e) => return unsupported(req, &method_raw, e),
    };
    let rounded = if apply_round {
        round_marks(&scaled, round_half_up)
    } else {
        Vec::new()
    };

    ok(
        &req.id,
        json!({
            "method": method_raw,
            "effectiveTarget": config.target(),
            "excludedCount": cohort.len() - scaled.len(),
            "scaled": scaled,
            "rounded": if apply_round { json!(rounded) } else { serde_json::Value::Null }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scaling.apply" => Some(handle_scaling_apply(state, req)),
        "scaling.disable" => Some(handle_scaling_disable(state, req)),
        "scaling.preview" => Some(handle_scaling_preview(state, req)),
        _ => None,
    }
}
