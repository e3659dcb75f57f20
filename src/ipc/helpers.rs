use crate::ipc::error::err;
use crate::ipc::types::Request;
use serde_json::Value;

/// Trimmed, non-empty string param, or a ready `bad_params` response.
pub fn require_str(req: &Request, key: &str) -> Result<String, Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        )),
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(other) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a string", key),
            Some(serde_json::json!({ key: other })),
        )),
    }
}

pub fn require_f64(req: &Request, key: &str) -> Result<f64, Value> {
    match optional_f64(req, key)? {
        Some(v) => Ok(v),
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) => Ok(Some(n)),
            None => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be a number", key),
                Some(serde_json::json!({ key: v })),
            )),
        },
    }
}

pub fn optional_bool(req: &Request, key: &str) -> Result<Option<bool>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be boolean", key),
            Some(serde_json::json!({ key: other })),
        )),
    }
}
