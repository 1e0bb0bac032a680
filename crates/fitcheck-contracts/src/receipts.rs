use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::tryon::{VariantOutcome, VariantResult};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Builds the diagnostic receipt for one variant. Everything caller-supplied
/// passes through `sanitize_payload`, so embedded base64 bodies and
/// credential headers never reach disk.
pub fn build_variant_receipt(
    session_id: &str,
    model: &str,
    provider: &str,
    request_summary: &Map<String, Value>,
    result: &VariantResult,
    receipt_path: &Path,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "session_id".to_string(),
        Value::String(session_id.to_string()),
    );
    root.insert("model".to_string(), Value::String(model.to_string()));
    root.insert("provider".to_string(), Value::String(provider.to_string()));
    root.insert(
        "variant_index".to_string(),
        Value::Number(result.variant_index.into()),
    );
    root.insert(
        "seed".to_string(),
        result
            .seed
            .map(|seed| Value::Number(seed.into()))
            .unwrap_or(Value::Null),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&Value::Object(request_summary.clone())),
    );
    root.insert(
        "attempts".to_string(),
        Value::Array(
            result
                .attempts
                .iter()
                .map(|attempt| attempt.to_value())
                .collect(),
        ),
    );

    let mut outcome = Map::new();
    match &result.outcome {
        VariantOutcome::Success(reference) => {
            outcome.insert("status".to_string(), Value::String("success".to_string()));
            outcome.insert("result".to_string(), Value::String(reference.describe()));
        }
        VariantOutcome::Failure {
            stage,
            kind,
            detail,
        } => {
            outcome.insert(
                "status".to_string(),
                Value::String(kind.as_str().to_string()),
            );
            outcome.insert(
                "stage".to_string(),
                Value::String(stage.as_str().to_string()),
            );
            outcome.insert("detail".to_string(), Value::String(detail.clone()));
        }
    }
    root.insert("outcome".to_string(), Value::Object(outcome));

    root.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    root.insert("created_at".to_string(), Value::String(now_utc_iso()));
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image" | "image_bytes" | "data"
                ) || lowered.ends_with("_b64")
                    || lowered.ends_with("_image")
                    || matches!(
                        lowered.as_str(),
                        "authorization" | "api_key" | "x-api-key" | "token"
                    )
                {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
