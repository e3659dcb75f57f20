use crate::db;
use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scaling::ScalingMethod;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Scaling,
    Grading,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "scaling" => Some(Self::Scaling),
            "grading" => Some(Self::Grading),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Scaling => "setup.scaling",
            Self::Grading => "setup.grading",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Scaling => json!({
            "defaultMethod": "bellCurve",
            "applyRoundByDefault": false,
            "roundHalfUp": true
        }),
        SetupSection::Grading => json!({
            "defaultGradingScale": grading::encode_grading_scale(&grading::default_grading_scale())
        }),
    }
}

/// Workspace defaults consulted when a scaling request leaves them out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingDefaults {
    pub method: ScalingMethod,
    pub apply_round: bool,
    pub round_half_up: bool,
}

pub fn scaling_defaults(conn: &rusqlite::Connection) -> anyhow::Result<ScalingDefaults> {
    let section = load_section(conn, SetupSection::Scaling)?;
    let method = section
        .get("defaultMethod")
        .and_then(|v| v.as_str())
        .and_then(|s| ScalingMethod::parse(s).ok())
        .unwrap_or(ScalingMethod::BellCurve);
    Ok(ScalingDefaults {
        method,
        apply_round: section
            .get("applyRoundByDefault")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        round_half_up: section
            .get("roundHalfUp")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    })
}

pub fn default_grading_scale(conn: &rusqlite::Connection) -> anyhow::Result<String> {
    let section = load_section(conn, SetupSection::Grading)?;
    Ok(section
        .get("defaultGradingScale")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| grading::encode_grading_scale(&grading::default_grading_scale())))
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Scaling => match k.as_str() {
                "defaultMethod" => {
                    let s = parse_string_max(v, k, 32)?;
                    let method = ScalingMethod::parse(&s).map_err(|_| {
                        "defaultMethod must be one of: bellCurve, linearNormalization, minMaxNormalization, percentile".to_string()
                    })?;
                    obj.insert(k.clone(), Value::String(method.as_str().to_string()));
                }
                "applyRoundByDefault" | "roundHalfUp" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown scaling field: {}", k)),
            },
            SetupSection::Grading => match k.as_str() {
                "defaultGradingScale" => {
                    let s = parse_string_max(v, k, 1000)?;
                    let grades = grading::decode_grading_scale(Some(&s));
                    if let Some(msg) = grading::validate_grading_scale(&grades) {
                        return Err(msg);
                    }
                    obj.insert(
                        k.clone(),
                        Value::String(grading::encode_grading_scale(&grades)),
                    );
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(
    conn: &rusqlite::Connection,
    section: SetupSection,
) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values keep their defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let scaling = match load_section(conn, SetupSection::Scaling) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grading = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "scaling": scaling,
            "grading": grading
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.key(), "setup section updated");
    ok(&req.id, json!({ "ok": true, "section": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
