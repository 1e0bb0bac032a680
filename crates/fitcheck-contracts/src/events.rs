use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type TracePayload = Map<String, Value>;

/// Append-only writer for `trace.jsonl`.
///
/// One compact JSON object per line. Default fields are `event`,
/// `session_id`, `ts`; the caller payload is merged last and can
/// override any of them.
#[derive(Debug, Clone)]
pub struct TraceWriter {
    inner: Arc<TraceWriterInner>,
}

#[derive(Debug)]
struct TraceWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl TraceWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TraceWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, event: &str, payload: TracePayload) -> anyhow::Result<Value> {
        let mut entry = Map::new();
        entry.insert("event".to_string(), Value::String(event.to_string()));
        entry.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        entry.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            entry.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&entry)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("trace writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(entry))
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn record_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("trace.jsonl");
        let writer = TraceWriter::new(&path, "session-123");

        let mut payload = TracePayload::new();
        payload.insert("model".to_string(), Value::String("idm-vton".to_string()));
        let recorded = writer.record("session_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, recorded);
        assert_eq!(parsed["event"], Value::String("session_started".to_string()));
        assert_eq!(parsed["session_id"], Value::String("session-123".to_string()));
        assert_eq!(parsed["model"], Value::String("idm-vton".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("trace.jsonl");
        let writer = TraceWriter::new(&path, "session-123");

        let mut payload = TracePayload::new();
        payload.insert("event".to_string(), Value::String("override".to_string()));
        payload.insert(
            "session_id".to_string(),
            Value::String("other-session".to_string()),
        );
        let recorded = writer.record("session_started", payload)?;

        assert_eq!(recorded["event"], Value::String("override".to_string()));
        assert_eq!(
            recorded["session_id"],
            Value::String("other-session".to_string())
        );
        Ok(())
    }

    #[test]
    fn record_appends_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("trace.jsonl");
        let writer = TraceWriter::new(&path, "session-123");

        writer.record("variant_preparing", TracePayload::new())?;
        writer.record("variant_invoking", TracePayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["event"], Value::String("variant_preparing".to_string()));
        assert_eq!(second["event"], Value::String("variant_invoking".to_string()));
        Ok(())
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }
}
