use crate::calc::CalcError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
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

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub fn db_query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn db_write_err(table: &str) -> impl Fn(rusqlite::Error) -> HandlerErr + '_ {
    move |e| HandlerErr::new("db_update_failed", e.to_string()).with_details(json!({ "table": table }))
}

pub fn respond(req: &Request, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be a number", key)))
}

/// `null`/absent is `None`; anything else must be a number.
pub fn optional_f64(value: Option<&serde_json::Value>, key: &str) -> Result<Option<f64>, HandlerErr> {
    match value {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be a number or null", key))),
    }
}

pub fn section_exists(conn: &Connection, section_id: &str) -> Result<(), HandlerErr> {
    let found: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sections WHERE id = ?",
            [section_id],
            |r| r.get(0),
        )
        .map_err(db_query_err)?;
    if found == 0 {
        return Err(HandlerErr::new("not_found", "section not found")
            .with_details(json!({ "sectionId": section_id })));
    }
    Ok(())
}
